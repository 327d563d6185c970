//! Searching the registry namespace for keys by path pattern.
//!
//! A [`FindSpec`] describes the key paths to look for as a literal path, a
//! glob or a regular expression. The [`RegistrySearcher`] walks the
//! namespace from the root keys down and only descends into a key while at
//! least one find specification can still match below it.
//!
//! # Examples
//!
//! ```rust
//! use reg_vfs::fake::{FakeFile, FakeKey};
//! use reg_vfs::{FindSpec, Registry, RegistryOptions, RegistrySearcher};
//! use std::rc::Rc;
//!
//! # fn main() -> reg_vfs::Result<()> {
//! let system = FakeFile::new();
//! system.add_key_by_path("\\", FakeKey::new("ControlSet001"))?;
//! system.add_key_by_path("\\", FakeKey::new("ControlSet002"))?;
//!
//! let registry = Registry::new(RegistryOptions::default(), None)?;
//! registry.map_file("HKEY_LOCAL_MACHINE\\System", Rc::new(system))?;
//!
//! let find_spec = FindSpec::builder()
//!     .key_path_glob("HKEY_LOCAL_MACHINE\\System\\ControlSet*")
//!     .build()?;
//! let searcher = RegistrySearcher::new(&registry);
//! let key_paths: Vec<String> = searcher.find(vec![find_spec]).collect();
//! assert_eq!(key_paths.len(), 2);
//! # Ok(())
//! # }
//! ```

use crate::error::{RegistryError, Result};
use crate::glob::glob_to_regex;
use crate::key::{Key, RegistryKey};
use crate::key_path::{split_key_path, split_key_path_with, KEY_PATH_SEPARATOR};
use crate::registry::Registry;
use regex::{Regex, RegexBuilder};
use std::cell::OnceCell;
use std::rc::Rc;
use tracing::{debug, warn};

/// Separator of regular expression key paths: an escaped backslash.
const REGEX_KEY_PATH_SEPARATOR: &str = "\\\\";

/// A key path pattern given as a whole path or as individual segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternSource {
    /// A path, split into segments on the key path separator.
    Path(String),

    /// Pre-split segments.
    Segments(Vec<String>),
}

impl From<&str> for PatternSource {
    fn from(path: &str) -> Self {
        PatternSource::Path(path.to_string())
    }
}

impl From<String> for PatternSource {
    fn from(path: String) -> Self {
        PatternSource::Path(path)
    }
}

impl From<Vec<String>> for PatternSource {
    fn from(segments: Vec<String>) -> Self {
        PatternSource::Segments(segments)
    }
}

impl From<Vec<&str>> for PatternSource {
    fn from(segments: Vec<&str>) -> Self {
        PatternSource::Segments(segments.into_iter().map(str::to_string).collect())
    }
}

impl From<&[&str]> for PatternSource {
    fn from(segments: &[&str]) -> Self {
        PatternSource::Segments(segments.iter().map(|segment| segment.to_string()).collect())
    }
}

/// Matcher of a single key path segment.
#[derive(Debug, Clone)]
enum SegmentMatcher {
    /// Lower case key name.
    Literal(String),

    /// Regular expression, compiled on first use.
    Regex {
        pattern: String,
        compiled: OnceCell<Option<Regex>>,
    },
}

impl SegmentMatcher {
    fn literal(segment: &str) -> Self {
        SegmentMatcher::Literal(segment.to_lowercase())
    }

    fn regex(pattern: String) -> Self {
        SegmentMatcher::Regex {
            pattern,
            compiled: OnceCell::new(),
        }
    }

    fn is_match(&self, name: &str) -> bool {
        match self {
            SegmentMatcher::Literal(segment) => *segment == name.to_lowercase(),
            SegmentMatcher::Regex { pattern, compiled } => compiled
                .get_or_init(|| compile_segment(pattern))
                .as_ref()
                .map_or(false, |regex| regex.is_match(name)),
        }
    }
}

fn compile_segment(pattern: &str) -> Option<Regex> {
    RegexBuilder::new(&format!("^(?:{})$", pattern))
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .map_err(|error| {
            warn!(pattern, error = %error, "Invalid key path segment regex, it will never match");
        })
        .ok()
}

/// Find specification: the key paths a search should yield.
#[derive(Debug, Clone, Default)]
pub struct FindSpec {
    /// Per-segment matchers; `None` matches every key.
    segments: Option<Vec<SegmentMatcher>>,
}

impl FindSpec {
    /// Returns a builder for a find specification.
    pub fn builder() -> FindSpecBuilder {
        FindSpecBuilder::default()
    }

    /// Returns the number of key path segments, or `None` if unconstrained.
    pub fn number_of_segments(&self) -> Option<usize> {
        self.segments.as_ref().map(Vec::len)
    }

    /// Compares a key name with the segment at `index`, counted from zero.
    ///
    /// Literal segments compare ignoring case, regular expression segments
    /// must match the whole name. An unconstrained find specification matches
    /// every name.
    pub fn compare_segment(&self, name: &str, index: usize) -> bool {
        match &self.segments {
            None => true,
            Some(segments) => segments
                .get(index)
                .map_or(false, |segment| segment.is_match(name)),
        }
    }

    /// Determines if the key at `depth` matches the find specification.
    ///
    /// The depth of a root key is 1. The key matches if its path has exactly
    /// as many segments as the find specification and every segment compares
    /// equal.
    pub fn matches(&self, key: &impl RegistryKey, depth: usize) -> bool {
        let Some(segments) = &self.segments else {
            return true;
        };
        if depth == 0 || depth != segments.len() {
            return false;
        }

        let key_path = key.path();
        let names = split_key_path(&key_path);
        names.len() == depth
            && names
                .iter()
                .enumerate()
                .all(|(index, name)| self.compare_segment(name, index))
    }

    /// Returns true if no key below `depth` can match.
    pub fn at_maximum_depth(&self, depth: usize) -> bool {
        self.segments
            .as_ref()
            .map_or(false, |segments| depth >= segments.len())
    }

    fn compare_at_depth(&self, name: &str, depth: usize) -> bool {
        match self.segments {
            None => true,
            Some(_) => depth > 0 && self.compare_segment(name, depth - 1),
        }
    }
}

/// Builder for [`FindSpec`].
///
/// At most one of key path, key path glob and key path regex can be set.
#[derive(Debug, Default)]
pub struct FindSpecBuilder {
    key_path: Option<PatternSource>,
    key_path_glob: Option<PatternSource>,
    key_path_regex: Option<PatternSource>,
}

impl FindSpecBuilder {
    /// Matches key paths literally, ignoring case.
    pub fn key_path(mut self, key_path: impl Into<PatternSource>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    /// Matches key paths against a glob, per segment.
    pub fn key_path_glob(mut self, key_path_glob: impl Into<PatternSource>) -> Self {
        self.key_path_glob = Some(key_path_glob.into());
        self
    }

    /// Matches key paths against regular expressions, per segment.
    ///
    /// A regular expression path separates segments with an escaped
    /// backslash, for example `HKEY_LOCAL_MACHINE\\\\System\\\\ControlSet.*`
    /// as a Rust string literal.
    pub fn key_path_regex(mut self, key_path_regex: impl Into<PatternSource>) -> Self {
        self.key_path_regex = Some(key_path_regex.into());
        self
    }

    /// Builds the find specification.
    ///
    /// # Errors
    ///
    /// - `RegistryError::ConflictingPattern` if more than one pattern is set.
    /// - `RegistryError::InvalidPatternType` if a literal segment is empty or
    ///   contains a separator.
    /// - `RegistryError::InvalidPattern` if a glob is empty.
    pub fn build(self) -> Result<FindSpec> {
        let FindSpecBuilder {
            key_path,
            key_path_glob,
            key_path_regex,
        } = self;

        let patterns = [&key_path, &key_path_glob, &key_path_regex];
        if patterns.iter().filter(|pattern| pattern.is_some()).count() > 1 {
            return Err(RegistryError::ConflictingPattern);
        }

        let segments = match (key_path, key_path_glob, key_path_regex) {
            (Some(key_path), _, _) => Some(literal_segments(key_path)?),
            (_, Some(key_path_glob), _) => Some(glob_segments(key_path_glob)?),
            (_, _, Some(key_path_regex)) => Some(regex_segments(key_path_regex)),
            (None, None, None) => None,
        };
        Ok(FindSpec { segments })
    }
}

fn literal_segments(key_path: PatternSource) -> Result<Vec<SegmentMatcher>> {
    match key_path {
        PatternSource::Path(path) => Ok(split_key_path(&path)
            .into_iter()
            .map(SegmentMatcher::literal)
            .collect()),
        PatternSource::Segments(segments) => segments
            .iter()
            .map(|segment| {
                if segment.is_empty() || segment.contains(KEY_PATH_SEPARATOR) {
                    return Err(RegistryError::InvalidPatternType(format!(
                        "key path segment {:?} is empty or contains a separator",
                        segment
                    )));
                }
                Ok(SegmentMatcher::literal(segment))
            })
            .collect(),
    }
}

fn glob_segments(key_path_glob: PatternSource) -> Result<Vec<SegmentMatcher>> {
    let globs: Vec<String> = match key_path_glob {
        PatternSource::Path(path) => {
            if path.is_empty() {
                return Err(RegistryError::InvalidPattern("missing glob pattern".to_string()));
            }
            split_key_path(&path).into_iter().map(str::to_string).collect()
        }
        PatternSource::Segments(segments) => segments,
    };

    globs
        .iter()
        .map(|glob| glob_to_regex(glob).map(SegmentMatcher::regex))
        .collect()
}

fn regex_segments(key_path_regex: PatternSource) -> Vec<SegmentMatcher> {
    match key_path_regex {
        PatternSource::Path(path) => split_key_path_with(&path, REGEX_KEY_PATH_SEPARATOR)
            .into_iter()
            .map(|segment| SegmentMatcher::regex(segment.to_string()))
            .collect(),
        PatternSource::Segments(segments) => segments.into_iter().map(SegmentMatcher::regex).collect(),
    }
}

/// Searcher for keys within a registry.
pub struct RegistrySearcher<'a> {
    registry: &'a Registry,
}

impl<'a> RegistrySearcher<'a> {
    /// Creates a searcher over `registry`.
    pub fn new(registry: &'a Registry) -> Self {
        Self { registry }
    }

    /// Searches for keys matching any of the find specifications.
    ///
    /// Yields the path of every matching key once, parents before children.
    /// The root key itself is never yielded. Without find specifications
    /// every key is yielded.
    pub fn find(&self, find_specs: Vec<FindSpec>) -> Find {
        let find_specs = if find_specs.is_empty() {
            vec![FindSpec::default()]
        } else {
            find_specs
        };
        debug!(find_specs = find_specs.len(), "Searching registry");

        let live: Rc<[usize]> = (0..find_specs.len()).collect();
        let root_key = self.registry.get_root_key();
        Find {
            find_specs,
            stack: vec![FindFrame {
                subkeys: root_key.get_subkeys(),
                depth: 1,
                live,
            }],
        }
    }

    /// Retrieves a key by its absolute path.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Registry::get_key_by_path`].
    pub fn get_key_by_path(&self, key_path: &str) -> Result<Option<Key>> {
        self.registry.get_key_by_path(key_path)
    }

    /// Splits a key path into its segments.
    pub fn split_key_path<'p>(&self, key_path: &'p str) -> Vec<&'p str> {
        self.registry.split_key_path(key_path)
    }
}

/// Iterator over the paths of matching keys, created by [`RegistrySearcher::find`].
pub struct Find {
    find_specs: Vec<FindSpec>,
    stack: Vec<FindFrame>,
}

struct FindFrame {
    subkeys: Box<dyn Iterator<Item = Key>>,
    depth: usize,

    /// Indices of the find specifications that can still match.
    live: Rc<[usize]>,
}

impl Iterator for Find {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            let frame = self.stack.last_mut()?;
            let Some(key) = frame.subkeys.next() else {
                self.stack.pop();
                continue;
            };
            let depth = frame.depth;
            let live = Rc::clone(&frame.live);

            let mut matched = false;
            let mut sub_live = Vec::new();
            for &index in live.iter() {
                let find_spec = &self.find_specs[index];
                if !find_spec.compare_at_depth(key.name(), depth) {
                    continue;
                }
                if find_spec.matches(&key, depth) {
                    matched = true;
                }
                if !find_spec.at_maximum_depth(depth) {
                    sub_live.push(index);
                }
            }

            let key_path = matched.then(|| key.path());
            if !sub_live.is_empty() {
                self.stack.push(FindFrame {
                    subkeys: key.get_subkeys(),
                    depth: depth + 1,
                    live: sub_live.into(),
                });
            }
            if key_path.is_some() {
                return key_path;
            }
        }
    }
}
