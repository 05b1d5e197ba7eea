//! Per-client ignore filter
//!
//! Each client sends a comma-separated list of substring patterns at
//! handshake time. A relative path is ignored for that client when any
//! pattern occurs anywhere in it (case-sensitive, no globbing, no anchoring).

/// Parsed, immutable set of ignore patterns for one client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreSpec {
    patterns: Vec<String>,
}

impl IgnoreSpec {
    /// Build from already-split patterns, dropping empty entries
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(Into::into)
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Parse a handshake line such as `log,tmp,.git`
    pub fn parse(line: &str) -> Self {
        Self::new(line.trim_end_matches(['\r', '\n']).split(','))
    }

    /// Parse the contents of an ignore-list file: every non-empty line
    /// contributes comma-separated patterns.
    pub fn parse_file_contents(contents: &str) -> Self {
        Self::new(contents.lines().flat_map(|line| line.split(',')))
    }

    /// Whether `relative_path` must be withheld from this client
    pub fn matches(&self, relative_path: &str) -> bool {
        matches(&self.patterns, relative_path)
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Encode as a handshake line (without the trailing newline)
    pub fn to_line(&self) -> String {
        self.patterns.join(",")
    }
}

/// A path is ignored iff any pattern is a substring of it.
pub fn matches<S: AsRef<str>>(patterns: &[S], relative_path: &str) -> bool {
    patterns
        .iter()
        .any(|pattern| relative_path.contains(pattern.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_list_matches_nothing() {
        let spec = IgnoreSpec::parse("");
        assert!(spec.is_empty());
        assert!(!spec.matches("a.txt"));
        assert!(!spec.matches(""));
    }

    #[test]
    fn test_substring_anywhere() {
        let spec = IgnoreSpec::parse("log,tmp\n");
        assert!(spec.matches("b.log"));
        assert!(spec.matches("logs/today.txt"));
        assert!(spec.matches("deep/tmpdir/x"));
        assert!(!spec.matches("a.txt"));
    }

    #[test]
    fn test_case_sensitive() {
        let spec = IgnoreSpec::parse("LOG");
        assert!(!spec.matches("b.log"));
        assert!(spec.matches("B.LOG"));
    }

    #[test]
    fn test_empty_tokens_are_dropped() {
        let spec = IgnoreSpec::parse(",log,, tmp ,");
        assert_eq!(spec.patterns(), &["log".to_string(), "tmp".to_string()]);
        assert_eq!(spec.to_line(), "log,tmp");
    }

    #[test]
    fn test_file_contents_multiple_lines() {
        let spec = IgnoreSpec::parse_file_contents("log,tmp\n\n.git\n");
        assert_eq!(spec.patterns().len(), 3);
        assert!(spec.matches(".git/HEAD"));
    }

    #[test]
    fn test_free_function_matches() {
        assert!(matches(&["x"], "a/x/b"));
        assert!(!matches::<&str>(&[], "a/x/b"));
    }
}
