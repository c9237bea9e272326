//! Template engine external interface: maps a filename to a destination
//! subfolder. See `SPEC_FULL.md` §6.
//!
//! Only `generate_output_path` is load-bearing for the `CopyEngine`'s
//! preparation step; the rule-table implementation here is a concrete default
//! grounded in the reference implementation's parser, since spec.md itself
//! under-specifies the rule syntax.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub trait TemplateEngine: Send + Sync {
    /// Returns the destination subfolder (relative) a file should land in.
    fn generate_output_path(&self, filename: &str, mtime: DateTime<Utc>) -> String;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRule {
    pub pattern: String,
    pub folder_template: String,
    pub priority: u32,
    #[serde(default)]
    pub is_regex: bool,
}

impl TemplateRule {
    fn matches(&self, filename: &str) -> bool {
        if self.is_regex {
            regex::Regex::new(&self.pattern)
                .map(|re| re.is_match(filename))
                .unwrap_or(false)
        } else {
            wildcard_match(&self.pattern.to_lowercase(), &filename.to_lowercase())
        }
    }
}

/// First-match-by-ascending-priority rule table, falling back to a default
/// category when nothing matches (`SPEC_FULL.md` §6).
pub struct RuleBasedTemplateEngine {
    rules: Vec<TemplateRule>,
    default_category: String,
    date_slice: (usize, usize),
}

impl RuleBasedTemplateEngine {
    pub fn new(mut rules: Vec<TemplateRule>, default_category: impl Into<String>) -> Self {
        rules.sort_by_key(|r| r.priority);
        Self {
            rules,
            default_category: default_category.into(),
            date_slice: (0, 6),
        }
    }

    /// Overrides the `{date}` slice from the default first-6-characters rule to
    /// an explicit `[start, end)` range, mirroring the reference implementation's
    /// `filename[a:b]` slice notation.
    pub fn with_date_slice(mut self, start: usize, end: usize) -> Self {
        self.date_slice = (start, end);
        self
    }

    fn find_matching_rule(&self, filename: &str) -> Option<&TemplateRule> {
        self.rules.iter().find(|r| r.matches(filename))
    }

    fn extract_variables(&self, filename: &str) -> Vec<(&'static str, String)> {
        let stem = Path::new(filename)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| filename.to_string());

        let (start, end) = self.date_slice;
        let chars: Vec<char> = filename.chars().collect();
        let end = end.min(chars.len());
        let date = if start < end {
            chars[start..end].iter().collect()
        } else {
            chars.iter().take(6).collect()
        };

        vec![
            ("filename", filename.to_string()),
            ("name_no_ext", stem),
            ("date", date),
        ]
    }

    fn substitute(&self, template: &str, variables: &[(&'static str, String)]) -> String {
        let mut result = template.to_string();
        for (name, value) in variables {
            result = result.replace(&format!("{{{name}}}"), value);
        }
        result
    }
}

impl TemplateEngine for RuleBasedTemplateEngine {
    fn generate_output_path(&self, filename: &str, _mtime: DateTime<Utc>) -> String {
        let variables = self.extract_variables(filename);
        let template = self
            .find_matching_rule(filename)
            .map(|r| r.folder_template.as_str())
            .unwrap_or(&self.default_category);
        self.substitute(template, &variables)
    }
}

fn wildcard_match(pattern: &str, text: &str) -> bool {
    fn recurse(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => recurse(&p[1..], t) || (!t.is_empty() && recurse(p, &t[1..])),
            (Some(b'?'), Some(_)) => recurse(&p[1..], &t[1..]),
            (Some(pc), Some(tc)) if pc == tc => recurse(&p[1..], &t[1..]),
            _ => false,
        }
    }
    recurse(pattern.as_bytes(), text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_rule_matches_first_by_priority() {
        let engine = RuleBasedTemplateEngine::new(
            vec![
                TemplateRule {
                    pattern: "*.mxf".to_string(),
                    folder_template: "video/{date}".to_string(),
                    priority: 10,
                    is_regex: false,
                },
                TemplateRule {
                    pattern: "cam1*".to_string(),
                    folder_template: "cam1/{name_no_ext}".to_string(),
                    priority: 1,
                    is_regex: false,
                },
            ],
            "misc",
        );
        let path = engine.generate_output_path("cam1_20260101.mxf", Utc::now());
        assert_eq!(path, "cam1/cam1_20260101");
    }

    #[test]
    fn no_match_falls_back_to_default_category() {
        let engine = RuleBasedTemplateEngine::new(vec![], "unsorted/{date}");
        let path = engine.generate_output_path("abcdef_clip.mov", Utc::now());
        assert_eq!(path, "unsorted/abcdef");
    }

    #[test]
    fn regex_rule_matches() {
        let engine = RuleBasedTemplateEngine::new(
            vec![TemplateRule {
                pattern: r"^cam\d+_.*\.mxf$".to_string(),
                folder_template: "cams/{name_no_ext}".to_string(),
                priority: 1,
                is_regex: true,
            }],
            "misc",
        );
        let path = engine.generate_output_path("cam3_clip.mxf", Utc::now());
        assert_eq!(path, "cams/cam3_clip");
    }

    #[test]
    fn custom_date_slice() {
        let engine = RuleBasedTemplateEngine::new(vec![], "out/{date}").with_date_slice(4, 10);
        let path = engine.generate_output_path("cam1_20260315_clip.mxf", Utc::now());
        assert_eq!(path, "out/202603");
    }
}
