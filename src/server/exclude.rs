//! Exclusion list for paths that bypass the limiter entirely.

/// Compiled exclusion patterns: literal paths and `/*` prefixes.
///
/// Both the patterns and the request path are normalised by trimming
/// trailing slashes before comparison, so `/admin/` and `/admin` match the
/// same entries.
pub struct ExclusionList {
    exact: Vec<String>,
    prefixes: Vec<String>,
}

fn normalize(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

impl ExclusionList {
    pub fn new(patterns: &[String]) -> Self {
        let mut exact = Vec::new();
        let mut prefixes = Vec::new();
        for pattern in patterns {
            if let Some(prefix) = pattern.strip_suffix("/*") {
                prefixes.push(normalize(prefix).to_string());
            } else {
                exact.push(normalize(pattern).to_string());
            }
        }
        ExclusionList { exact, prefixes }
    }

    /// Returns true if the path bypasses all rate limiting.
    pub fn matches(&self, path: &str) -> bool {
        let path = normalize(path);

        if self.exact.iter().any(|entry| entry == path) {
            return true;
        }

        self.prefixes.iter().any(|prefix| {
            // A bare "/*" excludes everything.
            prefix == "/" || path == prefix || path.starts_with(&format!("{prefix}/"))
        })
    }
}
