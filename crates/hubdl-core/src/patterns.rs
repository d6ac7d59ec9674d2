//! Include/exclude filtering of repository file paths

use glob::{MatchOptions, Pattern};
use hubdl_types::PatternPreset;

const OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    // `*` crosses directory separators
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Compiled include/exclude filter
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl FileFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Self {
        Self {
            include: compile(include),
            exclude: compile(exclude),
        }
    }

    /// An empty include list accepts everything; any exclude match rejects.
    pub fn matches(&self, path: &str) -> bool {
        let included =
            self.include.is_empty() || self.include.iter().any(|p| p.matches_with(path, OPTIONS));
        included && !self.exclude.iter().any(|p| p.matches_with(path, OPTIONS))
    }

    /// Like [`matches`](Self::matches) for includes, but also accepts a
    /// match on the bare file name. Used when cleaning up partial downloads.
    pub fn includes_path_or_name(&self, rel_path: &str) -> bool {
        let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
        self.include
            .iter()
            .any(|p| p.matches_with(rel_path, OPTIONS) || p.matches_with(name, OPTIONS))
    }

    pub fn has_includes(&self) -> bool {
        !self.include.is_empty()
    }
}

fn compile(patterns: &[String]) -> Vec<Pattern> {
    patterns
        .iter()
        .filter(|p| !p.trim().is_empty())
        .filter_map(|p| {
            Pattern::new(p)
                .or_else(|_| Pattern::new(&Pattern::escape(p)))
                .ok()
        })
        .collect()
}

/// Append a preset's patterns to the caller's lists, skipping duplicates
pub fn apply_preset(include: &mut Vec<String>, exclude: &mut Vec<String>, preset: PatternPreset) {
    for p in preset.include() {
        if !include.iter().any(|e| e == p) {
            include.push(p.to_string());
        }
    }
    for p in preset.exclude() {
        if !exclude.iter().any(|e| e == p) {
            exclude.push(p.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(include: &[&str], exclude: &[&str]) -> FileFilter {
        let inc: Vec<String> = include.iter().map(|s| s.to_string()).collect();
        let exc: Vec<String> = exclude.iter().map(|s| s.to_string()).collect();
        FileFilter::new(&inc, &exc)
    }

    #[test]
    fn test_empty_include_accepts_all() {
        let f = filter(&[], &[]);
        assert!(f.matches("model.safetensors"));
        assert!(f.matches("nested/dir/file.bin"));
    }

    #[test]
    fn test_star_crosses_directories() {
        let f = filter(&["*.gguf"], &[]);
        assert!(f.matches("q4/model-q4.gguf"));
        assert!(!f.matches("README.md"));
    }

    #[test]
    fn test_exclude_wins() {
        let f = filter(&["*"], &["*.bin"]);
        assert!(f.matches("config.json"));
        assert!(!f.matches("pytorch_model.bin"));
    }

    #[test]
    fn test_name_match_for_cleanup() {
        let f = filter(&["config.json"], &[]);
        assert!(!f.matches("sub/config.json"));
        assert!(f.includes_path_or_name("sub/config.json"));
    }

    #[test]
    fn test_apply_preset_dedupes() {
        let mut include = vec!["*.gguf".to_string()];
        let mut exclude = Vec::new();
        apply_preset(&mut include, &mut exclude, PatternPreset::GgufOnly);
        assert_eq!(include, vec!["*.gguf", "README.md"]);
        assert!(exclude.is_empty());
    }
}
