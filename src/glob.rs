//! Glob to regular expression conversion.
//!
//! Supported glob syntax:
//!
//! ```text
//! *       matches everything
//! ?       matches any single character
//! [seq]   matches any character in seq
//! [!seq]  matches any character not in seq
//! ```
//!
//! The result is an unanchored regular expression fragment; callers anchor
//! it as needed.

use crate::error::{RegistryError, Result};

/// Characters outside bracket expressions that must be escaped.
const REGEX_SPECIAL_CHARACTERS: &[char] = &['.', '^', '$', '+', '{', '}', '|', '(', ')', ']'];

/// A maximal run of the glob pattern.
#[derive(Debug, PartialEq, Eq)]
enum GlobToken<'a> {
    /// Text without any `[`.
    Text(&'a str),
    /// A bracket expression `[...]` with at least one character inside.
    Bracket(&'a str),
    /// A `[` that does not open a bracket expression.
    LoneBracket,
}

/// Splits a glob pattern into tokens in a single left-to-right pass.
fn tokenize(glob_pattern: &str) -> Vec<GlobToken<'_>> {
    let mut tokens = Vec::new();
    let mut remainder = glob_pattern;

    while !remainder.is_empty() {
        if let Some(after_bracket) = remainder.strip_prefix('[') {
            // A bracket expression needs at least one character before the closing ']'.
            match after_bracket.find(']') {
                Some(end) if end > 0 => {
                    let (bracket, rest) = remainder.split_at(end + 2);
                    tokens.push(GlobToken::Bracket(bracket));
                    remainder = rest;
                }
                _ => {
                    tokens.push(GlobToken::LoneBracket);
                    remainder = after_bracket;
                }
            }
        } else {
            let end = remainder.find('[').unwrap_or(remainder.len());
            let (text, rest) = remainder.split_at(end);
            tokens.push(GlobToken::Text(text));
            remainder = rest;
        }
    }

    tokens
}

/// Converts a glob pattern into a regular expression fragment.
///
/// # Errors
///
/// Returns `RegistryError::InvalidPattern` if the glob pattern is empty.
///
/// # Examples
///
/// ```rust
/// use reg_vfs::glob::glob_to_regex;
///
/// assert_eq!(glob_to_regex("*.txt").unwrap(), ".*\\.txt");
/// assert_eq!(glob_to_regex("[!abc]").unwrap(), "[^abc]");
/// ```
pub fn glob_to_regex(glob_pattern: &str) -> Result<String> {
    if glob_pattern.is_empty() {
        return Err(RegistryError::InvalidPattern("missing glob pattern".to_string()));
    }

    let mut regex_pattern = String::with_capacity(glob_pattern.len() * 2);

    for token in tokenize(glob_pattern) {
        match token {
            GlobToken::Text(text) => {
                for character in text.chars() {
                    match character {
                        '*' => regex_pattern.push_str(".*"),
                        '?' => regex_pattern.push('.'),
                        '\\' => regex_pattern.push_str("\\\\"),
                        c if REGEX_SPECIAL_CHARACTERS.contains(&c) => {
                            regex_pattern.push('\\');
                            regex_pattern.push(c);
                        }
                        c => regex_pattern.push(c),
                    }
                }
            }
            GlobToken::LoneBracket => regex_pattern.push_str("\\["),
            GlobToken::Bracket(bracket) => {
                let bracket = bracket.replace('\\', "\\\\");
                match bracket.strip_prefix("[!") {
                    Some(negated) => {
                        regex_pattern.push_str("[^");
                        regex_pattern.push_str(negated);
                    }
                    None => regex_pattern.push_str(&bracket),
                }
            }
        }
    }

    Ok(regex_pattern)
}
