// Extension, exclusion, and temp-file filters applied by the watcher

use std::collections::HashSet;
use std::path::Path;

use crate::error::AgentError;

/// Suffixes of files that are still being produced by another program and
/// must never be uploaded mid-write.
const TEMP_SUFFIXES: &[&str] = &[
    ".tmp",
    ".part",
    ".crdownload",
    ".download",
    ".swp",
    ".swx",
    ".swpx",
];

/// Case-insensitive O(1) suffix filter.
///
/// Built from a free-form list such as `".log, .TXT; .gz .zip"` — tokens are
/// split on commas, semicolons, and whitespace, and every token must begin
/// with a dot. An empty matcher matches everything.
#[derive(Debug, Clone, Default)]
pub struct ExtensionMatcher {
    /// Single-extension tokens, stored without the leading dot.
    exts: HashSet<String>,
    /// Tokens containing more than one dot (e.g. `.tar.gz`), matched as
    /// whole-filename suffixes.
    multi: Vec<String>,
}

impl ExtensionMatcher {
    pub fn parse(spec: &str) -> Result<Self, AgentError> {
        let mut exts = HashSet::new();
        let mut multi = Vec::new();

        for token in spec.split([',', ';', ' ', '\t']) {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            if !token.starts_with('.') {
                return Err(AgentError::InvalidExtension {
                    token: token.to_string(),
                });
            }
            let lowered = token.to_lowercase();
            if lowered[1..].contains('.') {
                multi.push(lowered);
            } else {
                exts.insert(lowered[1..].to_string());
            }
        }

        Ok(Self { exts, multi })
    }

    pub fn is_empty(&self) -> bool {
        self.exts.is_empty() && self.multi.is_empty()
    }

    pub fn matches(&self, path: &Path) -> bool {
        if self.is_empty() {
            return true;
        }

        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            if self.exts.contains(&ext.to_lowercase()) {
                return true;
            }
        }

        if !self.multi.is_empty() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                let lowered = name.to_lowercase();
                return self.multi.iter().any(|suffix| lowered.ends_with(suffix));
            }
        }

        false
    }
}

/// Rule shapes accepted by the exclude list.
#[derive(Debug, Clone)]
enum ExcludeRule {
    /// Absolute path: excludes the subtree below it.
    Prefix(String),
    /// Multi-segment relative pattern: substring match bounded by `/`.
    Segments(String),
    /// Bare name: matches any single path segment.
    Name(String),
}

/// Name / segment / absolute-prefix exclusion. An empty configuration is a
/// no-op matcher.
#[derive(Debug, Clone, Default)]
pub struct ExcludeMatcher {
    rules: Vec<ExcludeRule>,
}

impl ExcludeMatcher {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            let rule = if pattern.starts_with('/') {
                ExcludeRule::Prefix(pattern.trim_end_matches('/').to_string())
            } else if pattern.contains('/') {
                ExcludeRule::Segments(pattern.trim_matches('/').to_string())
            } else {
                ExcludeRule::Name(pattern.to_string())
            };
            rules.push(rule);
        }
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        if self.rules.is_empty() {
            return false;
        }

        let text = path.to_string_lossy();
        let text = if std::path::MAIN_SEPARATOR == '/' {
            text.into_owned()
        } else {
            text.replace(std::path::MAIN_SEPARATOR, "/")
        };
        // Trailing slash so segment-bounded needles can match the last segment.
        let bounded = format!("{text}/");

        for rule in &self.rules {
            let hit = match rule {
                ExcludeRule::Prefix(prefix) => {
                    text == *prefix || text.starts_with(&format!("{prefix}/"))
                }
                ExcludeRule::Segments(pattern) => bounded.contains(&format!("/{pattern}/")),
                ExcludeRule::Name(name) => path
                    .components()
                    .any(|c| c.as_os_str().to_string_lossy() == *name),
            };
            if hit {
                return true;
            }
        }
        false
    }
}

/// True for files another program is still producing (browser downloads,
/// editor swap files, partial transfers).
pub fn is_temp_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let lowered = name.to_lowercase();
    TEMP_SUFFIXES.iter().any(|suffix| lowered.ends_with(suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn extension_matcher_parses_free_form_lists() {
        let m = ExtensionMatcher::parse(".log, .TXT; .gz\t.zip").unwrap();
        assert!(m.matches(Path::new("/a/b.log")));
        assert!(m.matches(Path::new("/a/B.TXT")));
        assert!(m.matches(Path::new("/a/b.GZ")));
        assert!(!m.matches(Path::new("/a/b.json")));
    }

    #[test]
    fn empty_matcher_matches_everything() {
        let m = ExtensionMatcher::parse("  ").unwrap();
        assert!(m.is_empty());
        assert!(m.matches(Path::new("/anything.xyz")));
        assert!(m.matches(Path::new("/no-extension")));
    }

    #[test]
    fn tokens_without_leading_dot_are_fatal() {
        let err = ExtensionMatcher::parse(".log txt").unwrap_err();
        assert_eq!(err.label(), "invalid-extension");
    }

    #[test]
    fn multi_dot_suffixes_match_whole_names() {
        let m = ExtensionMatcher::parse(".tar.gz").unwrap();
        assert!(m.matches(Path::new("/a/backup.tar.gz")));
        assert!(!m.matches(Path::new("/a/backup.gz")));
    }

    #[test]
    fn exclude_prefix_rule() {
        let m = ExcludeMatcher::new(["/var/log/private"]);
        assert!(m.is_excluded(Path::new("/var/log/private/a.log")));
        assert!(m.is_excluded(Path::new("/var/log/private")));
        assert!(!m.is_excluded(Path::new("/var/log/privateer/a.log")));
    }

    #[test]
    fn exclude_segment_pattern() {
        let m = ExcludeMatcher::new(["cache/tmp"]);
        assert!(m.is_excluded(Path::new("/srv/cache/tmp/x.log")));
        assert!(!m.is_excluded(Path::new("/srv/cache/tmpx/x.log")));
        assert!(!m.is_excluded(Path::new("/srv/cachex/tmp/x.log")));
    }

    #[test]
    fn exclude_bare_name_matches_any_segment() {
        let m = ExcludeMatcher::new(["node_modules"]);
        assert!(m.is_excluded(Path::new("/app/node_modules/pkg/index.js")));
        assert!(!m.is_excluded(Path::new("/app/node_modules_bak/x")));
    }

    #[test]
    fn empty_exclude_is_noop() {
        let m = ExcludeMatcher::new(Vec::<String>::new());
        assert!(m.is_empty());
        assert!(!m.is_excluded(Path::new("/anything")));
    }

    #[test]
    fn temp_file_suffixes() {
        assert!(is_temp_file(Path::new("/a/b.log.TMP")));
        assert!(is_temp_file(Path::new("/a/download.crdownload")));
        assert!(is_temp_file(Path::new("/a/.b.log.swp")));
        assert!(!is_temp_file(Path::new("/a/b.log")));
    }
}
