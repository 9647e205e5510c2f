//! Validation findings attached to expressions.

use std::fmt;

/// How bad a [`Problem`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Severity {
    /// The expression still works, possibly with absent values.
    Warning,
    /// The expression can never produce a value.
    Fatal,
}

/// One defect found while validating an expression.
///
/// Problems are data, not errors: a schema reports all of them in one pass.
/// The explanation of a nested problem is wrapped in the names of the
/// enclosing expressions, for example `int32(Wrong number of registers: Got 1, need 2)`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Problem {
    severity: Severity,
    explain: String,
}

impl Problem {
    /// Creates a warning.
    pub fn warning(explain: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            explain: explain.into(),
        }
    }

    /// Creates a fatal problem.
    pub fn fatal(explain: impl Into<String>) -> Self {
        Self {
            severity: Severity::Fatal,
            explain: explain.into(),
        }
    }

    /// The severity.
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Returns `true` for [`Severity::Fatal`].
    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }

    /// The explanation, including the names of the enclosing expressions.
    pub fn explain(&self) -> &str {
        &self.explain
    }

    fn wrapped(&self, function: &str) -> Self {
        Self {
            severity: self.severity,
            explain: format!("{function}({})", self.explain),
        }
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.explain)
    }
}

/// A warning unless `condition` holds.
pub(crate) fn check(condition: bool, explain: impl FnOnce() -> String) -> Vec<Problem> {
    if condition {
        Vec::new()
    } else {
        vec![Problem::warning(explain())]
    }
}

/// A fatal problem unless `condition` holds.
pub(crate) fn check_fatal(condition: bool, explain: impl FnOnce() -> String) -> Vec<Problem> {
    if condition {
        Vec::new()
    } else {
        vec![Problem::fatal(explain())]
    }
}

/// Flattens `groups` and wraps every explanation as `function(explain)`.
pub(crate) fn combine<I>(function: &str, groups: I) -> Vec<Problem>
where
    I: IntoIterator<Item = Vec<Problem>>,
{
    groups
        .into_iter()
        .flatten()
        .map(|problem| problem.wrapped(function))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checks() {
        assert!(check(true, || "never".to_string()).is_empty());
        let warning = check(false, || "odd".to_string());
        assert_eq!(warning, vec![Problem::warning("odd")]);
        assert!(!warning[0].is_fatal());
        let fatal = check_fatal(false, || "broken".to_string());
        assert!(fatal[0].is_fatal());
        assert_eq!(fatal[0].to_string(), "broken");
    }

    #[test]
    fn test_combine_wraps_and_keeps_severity() {
        let inner = combine(
            "swapbytes",
            [vec![Problem::fatal("Need exactly 1 register")], Vec::new()],
        );
        let outer = combine("int16", [inner, vec![Problem::warning("w")]]);
        assert_eq!(outer.len(), 2);
        assert_eq!(outer[0].explain(), "int16(swapbytes(Need exactly 1 register))");
        assert_eq!(outer[0].severity(), Severity::Fatal);
        assert_eq!(outer[1].explain(), "int16(w)");
        assert_eq!(outer[1].severity(), Severity::Warning);
    }
}
