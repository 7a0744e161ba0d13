//! Case-insensitive `*` glob matching for hook tool filters and session tags.

use regex::{Regex, RegexBuilder};

#[derive(Debug, Clone)]
/// Compiled `tools` filter of one hook; an empty filter matches every tool.
pub struct ToolMatcher {
    patterns: Vec<String>,
    compiled: Vec<Regex>,
}

impl ToolMatcher {
    /// Compiles the patterns; the error carries the offending pattern.
    pub fn new(patterns: &[String]) -> Result<Self, (String, String)> {
        let mut kept = Vec::with_capacity(patterns.len());
        let mut compiled = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let trimmed = pattern.trim();
            if trimmed.is_empty() {
                return Err((pattern.clone(), "pattern must not be empty".to_string()));
            }
            let regex = RegexBuilder::new(&glob_to_regex(trimmed))
                .case_insensitive(true)
                .build()
                .map_err(|error| (pattern.clone(), error.to_string()))?;
            kept.push(trimmed.to_string());
            compiled.push(regex);
        }
        Ok(Self {
            patterns: kept,
            compiled,
        })
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn matches(&self, tool_name: &str) -> bool {
        self.compiled.is_empty() || self.compiled.iter().any(|regex| regex.is_match(tool_name))
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    format!("^{body}$")
}

/// A hook without tags applies to every session; otherwise at least one
/// session tag must match (case-insensitive).
pub fn tags_match(hook_tags: &[String], session_tags: &[String]) -> bool {
    hook_tags.is_empty()
        || hook_tags.iter().any(|hook_tag| {
            session_tags
                .iter()
                .any(|session_tag| session_tag.trim().eq_ignore_ascii_case(hook_tag))
        })
}

#[cfg(test)]
mod tests {
    use super::{tags_match, ToolMatcher};

    fn patterns(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn unit_tool_matcher_supports_wildcards_case_insensitively() {
        let matcher = ToolMatcher::new(&patterns(&["shopify_*", "Bash"])).expect("compile");
        assert!(matcher.matches("shopify_create_order"));
        assert!(matcher.matches("SHOPIFY_"));
        assert!(matcher.matches("bash"));
        assert!(!matcher.matches("bash_extra"));
        assert!(!matcher.matches("fedex_track"));
    }

    #[test]
    fn unit_tool_matcher_escapes_regex_metacharacters() {
        let matcher = ToolMatcher::new(&patterns(&["file.read", "a+b*"])).expect("compile");
        assert!(matcher.matches("file.read"));
        assert!(!matcher.matches("fileXread"));
        assert!(matcher.matches("a+b-anything"));
        assert!(!matcher.matches("aab"));
    }

    #[test]
    fn unit_empty_tool_matcher_matches_everything() {
        let matcher = ToolMatcher::new(&[]).expect("compile");
        assert!(matcher.matches("anything"));
        assert!(matcher.matches("write"));
    }

    #[test]
    fn regression_tool_matcher_rejects_blank_patterns() {
        let (pattern, reason) = ToolMatcher::new(&patterns(&["  "])).expect_err("blank");
        assert_eq!(pattern, "  ");
        assert!(reason.contains("must not be empty"));
    }

    #[test]
    fn unit_tags_match_requires_intersection_when_hook_has_tags() {
        let session = patterns(&["Prod", "eu"]);
        assert!(tags_match(&[], &session));
        assert!(tags_match(&patterns(&["prod"]), &session));
        assert!(!tags_match(&patterns(&["staging"]), &session));
        assert!(!tags_match(&patterns(&["prod"]), &[]));
    }
}
