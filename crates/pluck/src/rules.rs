//! Match rules for selecting archive entries.
//!
//! A [`MatchRule`] names a source directory inside the image and a
//! shell-style glob for the entry's base name. An entry matches when its
//! path sits under the directory and the first path segment after the
//! directory matches the glob; the directory prefix is stripped from the
//! matched path so the entry lands at the destination root.
//!
//! Matching is pure string work: no filesystem access, nothing cached
//! between calls. The glob is compiled once, at rule construction, so a
//! malformed pattern surfaces as an error to the caller instead of being
//! treated as "no match".

use glob::Pattern;

use crate::{Error, Result};

/// One artifact to extract: source directory plus base-name glob.
#[derive(Debug, Clone)]
pub struct MatchRule {
    /// Normalized directory prefix, either empty or ending in '/'.
    directory: String,
    pattern: Pattern,
}

impl MatchRule {
    /// Build a rule from a directory path and a glob pattern.
    ///
    /// The directory is taken literally (no glob interpretation); leading
    /// `/` or `./` and trailing `/` are insignificant. The pattern supports
    /// `*`, `?` and character classes.
    pub fn new(directory: &str, pattern: &str) -> Result<Self> {
        let pattern = Pattern::new(pattern).map_err(|source| Error::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;

        let dir = normalize(directory).trim_end_matches('/').to_string();
        let directory = if dir.is_empty() {
            dir
        } else {
            format!("{dir}/")
        };

        Ok(MatchRule { directory, pattern })
    }

    /// Build a rule matching a single in-image path: the directory is the
    /// path's parent and the pattern its base name (which may itself use
    /// glob syntax, e.g. `/data/widget-*.bin`).
    pub fn for_path(target: &str) -> Result<Self> {
        let target = normalize(target);
        match target.rsplit_once('/') {
            Some((dir, base)) => MatchRule::new(dir, base),
            None => MatchRule::new("", target),
        }
    }

    /// The normalized directory prefix this rule looks under.
    pub fn directory(&self) -> &str {
        &self.directory
    }

    /// The base-name glob as supplied by the caller.
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Evaluate an archive entry path against this rule.
    ///
    /// Returns the rewritten path (the entry path with the directory prefix
    /// stripped) when the entry matches, `None` otherwise. Only the first
    /// path segment after the directory is compared against the glob, so a
    /// rule can select a file or an immediate child directory, but a
    /// wildcard never spans `/`.
    pub fn matches(&self, entry_path: &str) -> Option<String> {
        let path = normalize(entry_path);
        let rest = path.strip_prefix(&self.directory)?;
        if rest.is_empty() {
            // The directory itself, not something inside it.
            return None;
        }
        let segment = rest.split('/').next().unwrap_or(rest);
        if self.pattern.matches(segment) {
            Some(rest.to_string())
        } else {
            None
        }
    }
}

/// Archive entries are recorded with or without a leading `./` or `/`
/// depending on how the layer was built; rules see them uniformly.
fn normalize(path: &str) -> &str {
    let mut path = path;
    loop {
        let trimmed = path.trim_start_matches('/');
        let trimmed = trimmed.strip_prefix("./").unwrap_or(trimmed);
        if trimmed.len() == path.len() {
            return path;
        }
        path = trimmed;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_matches_file_in_directory() {
        let rule = MatchRule::new("/data", "widget-*.bin").unwrap();
        assert_eq!(
            rule.matches("data/widget-x86_64.bin"),
            Some("widget-x86_64.bin".to_string())
        );
    }

    #[test]
    fn test_never_matches_outside_directory() {
        let rule = MatchRule::new("/data", "*").unwrap();
        assert_eq!(rule.matches("other/widget.bin"), None);
        assert_eq!(rule.matches("widget.bin"), None);
        // Prefix must end on a component boundary.
        assert_eq!(rule.matches("database/widget.bin"), None);
        // The directory entry itself is not a match.
        assert_eq!(rule.matches("data"), None);
        assert_eq!(rule.matches("data/"), None);
    }

    #[test]
    fn test_entry_path_spellings() {
        let rule = MatchRule::new("data", "widget.bin").unwrap();
        for spelling in ["data/widget.bin", "./data/widget.bin", "/data/widget.bin"] {
            assert_eq!(rule.matches(spelling), Some("widget.bin".to_string()));
        }
    }

    #[test]
    fn test_glob_only_covers_first_segment() {
        let rule = MatchRule::new("/data", "*").unwrap();
        // An immediate child directory matches, and keeps its subtree path.
        assert_eq!(
            rule.matches("data/nested/deep.bin"),
            Some("nested/deep.bin".to_string())
        );

        // But a glob on the base name never reaches into subdirectories.
        let rule = MatchRule::new("/data", "*.bin").unwrap();
        assert_eq!(rule.matches("data/nested/deep.bin"), None);
    }

    #[test]
    fn test_glob_classes() {
        let rule = MatchRule::new("/data", "widget-?.b[io]n").unwrap();
        assert!(rule.matches("data/widget-a.bin").is_some());
        assert!(rule.matches("data/widget-a.bon").is_some());
        assert!(rule.matches("data/widget-ab.bin").is_none());
    }

    #[test]
    fn test_malformed_pattern_is_surfaced() {
        assert!(matches!(
            MatchRule::new("/data", "widget-[.bin"),
            Err(Error::Pattern { .. })
        ));
    }

    #[test]
    fn test_for_path() {
        let rule = MatchRule::for_path("/coreos/coreos-x86_64.iso.sha256").unwrap();
        assert_eq!(rule.directory(), "coreos/");
        assert_eq!(rule.pattern(), "coreos-x86_64.iso.sha256");
        assert_eq!(
            rule.matches("coreos/coreos-x86_64.iso.sha256"),
            Some("coreos-x86_64.iso.sha256".to_string())
        );
    }

    #[test]
    fn test_for_path_without_directory() {
        let rule = MatchRule::for_path("widget.bin").unwrap();
        assert_eq!(rule.directory(), "");
        assert_eq!(rule.matches("widget.bin"), Some("widget.bin".to_string()));
        assert_eq!(rule.matches("data/widget.bin"), None);
    }
}
