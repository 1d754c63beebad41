//! Request path resolution
//!
//! The request path is normalized (empty and `.` segments dropped, `..`
//! removes the previous segment and never climbs above the root). The last
//! segment is the cache key; everything before it must equal the
//! configured prefix exactly.

/// Normalize a request path into its segments
pub fn normalize_path(path: &str) -> Vec<&str> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }
    segments
}

/// Configured path prefix cache keys live under
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerPrefix {
    segments: Vec<String>,
}

impl ServerPrefix {
    pub fn new(prefix: Option<&str>) -> Self {
        Self {
            segments: prefix
                .map(|prefix| normalize_path(prefix).into_iter().map(str::to_owned).collect())
                .unwrap_or_default(),
        }
    }

    /// Key addressed by `path`, or `None` when the path is outside the prefix
    pub fn resolve_key(&self, path: &str) -> Option<String> {
        let segments = normalize_path(path);
        let (key, parent) = segments.split_last()?;
        if parent.len() != self.segments.len()
            || parent.iter().zip(&self.segments).any(|(a, b)| *a != b.as_str())
        {
            return None;
        }
        Some((*key).to_owned())
    }
}

impl std::fmt::Display for ServerPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_path("/a/./b//c/"), vec!["a", "b", "c"]);
        assert_eq!(normalize_path("/a/../b"), vec!["b"]);
        assert_eq!(normalize_path("/../../etc/passwd"), vec!["etc", "passwd"]);
        assert!(normalize_path("/").is_empty());
    }

    #[test]
    fn test_resolve_under_prefix() {
        let prefix = ServerPrefix::new(Some("/cache"));
        assert_eq!(prefix.resolve_key("/cache/abc123").as_deref(), Some("abc123"));
        assert_eq!(prefix.resolve_key("/cache/./abc").as_deref(), Some("abc"));
        assert_eq!(prefix.resolve_key("/cache/x/../abc").as_deref(), Some("abc"));
        assert_eq!(prefix.resolve_key("/cache/../etc/passwd"), None);
        assert_eq!(prefix.resolve_key("/cache/a/b"), None);
        assert_eq!(prefix.resolve_key("/cache"), None);
        assert_eq!(prefix.resolve_key("/other/abc"), None);
    }

    #[test]
    fn test_resolve_without_prefix() {
        let prefix = ServerPrefix::new(None);
        assert_eq!(prefix.resolve_key("/abc").as_deref(), Some("abc"));
        assert_eq!(prefix.resolve_key("/"), None);
        assert_eq!(prefix.resolve_key("/a/b"), None);
        assert_eq!(prefix.to_string(), "/");
    }

    proptest! {
        #[test]
        fn prop_key_under_prefix_resolves(key in "[A-Za-z0-9_-]{1,40}", depth in 0usize..4) {
            let prefix_path: String = (0..depth).map(|i| format!("/p{i}")).collect();
            let prefix = ServerPrefix::new(Some(&prefix_path));
            let resolved = prefix.resolve_key(&format!("{prefix_path}/{key}"));
            prop_assert_eq!(resolved, Some(key));
        }

        #[test]
        fn prop_normalized_path_has_no_dot_segments(path in "(/(\\.|\\.\\.|[a-z]{1,3}|)){0,10}") {
            for segment in normalize_path(&path) {
                prop_assert!(segment != "." && segment != ".." && !segment.is_empty());
            }
        }
    }
}
