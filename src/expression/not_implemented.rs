//! "Not implemented" sentinels.
//!
//! Many devices fill registers they do not support with a fixed pattern such
//! as `0x8000` or `0xFFFF 0xFFFF`. A decoder that sees one of its declared
//! sentinels returns an absent value instead of a misleading number.

use std::fmt;

use super::problem::{check_fatal, combine, Problem};
use crate::utils::{bytes_to_words, words_to_hex_string};

/// The sentinel patterns of one decoder. Each pattern is a list of registers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NotImplemented {
    patterns: Vec<Vec<u16>>,
}

impl NotImplemented {
    /// Creates the sentinel set.
    pub fn new(patterns: Vec<Vec<u16>>) -> Self {
        Self { patterns }
    }

    /// No sentinels.
    pub fn none() -> Self {
        Self::default()
    }

    /// The declared patterns.
    pub fn patterns(&self) -> &[Vec<u16>] {
        &self.patterns
    }

    /// Returns `true` if `bytes` equal one of the patterns.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        if self.patterns.is_empty() || bytes.len() % 2 != 0 {
            return false;
        }
        let words = bytes_to_words(bytes);
        self.patterns.iter().any(|pattern| *pattern == words)
    }

    /// Every pattern must be as wide as the value it guards.
    pub(crate) fn problems(&self, expected_registers: usize) -> Vec<Problem> {
        combine(
            "NotImplemented",
            self.patterns.iter().map(|pattern| {
                check_fatal(pattern.len() == expected_registers, || {
                    format!(
                        "Wrong number of registers: Got {}, need {expected_registers}",
                        pattern.len()
                    )
                })
            }),
        )
    }
}

/// Renders ` ; 0xFFFF 0xFFFF ; 0x8000 0x0000`, or nothing without patterns.
impl fmt::Display for NotImplemented {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for pattern in &self.patterns {
            write!(f, " ; {}", words_to_hex_string(pattern))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches() {
        let sentinels = NotImplemented::new(vec![vec![0xFFFF, 0xFFFF], vec![0x8000, 0x0000]]);
        assert!(sentinels.matches(&[0xFF, 0xFF, 0xFF, 0xFF]));
        assert!(sentinels.matches(&[0x80, 0x00, 0x00, 0x00]));
        assert!(!sentinels.matches(&[0x80, 0x00, 0x00, 0x01]));
        assert!(!sentinels.matches(&[0xFF, 0xFF]));
        assert!(!NotImplemented::none().matches(&[0xFF, 0xFF]));
    }

    #[test]
    fn test_problems() {
        let sentinels = NotImplemented::new(vec![vec![0xFFFF], vec![0x8000, 0x0000]]);
        assert!(sentinels.problems(2).len() == 1);
        assert_eq!(
            sentinels.problems(2)[0].explain(),
            "NotImplemented(Wrong number of registers: Got 1, need 2)"
        );
        assert!(sentinels.problems(2)[0].is_fatal());
        assert!(NotImplemented::none().problems(4).is_empty());
    }

    #[test]
    fn test_display() {
        let sentinels = NotImplemented::new(vec![vec![0xDEAD, 0xDEAD], vec![0x0001, 0x0002]]);
        assert_eq!(sentinels.to_string(), " ; 0xDEAD 0xDEAD ; 0x0001 0x0002");
        assert_eq!(NotImplemented::none().to_string(), "");
    }
}
