//! Stream view mapping
//!
//! Ordered include/exclude rules translating depot paths into
//! stream-relative paths, plus the prefix math used by commit ingestion:
//! minimal depot roots for polling and longest-common-prefix base paths.
//!
//! Patterns support a trailing `...` wildcard (any suffix) or an exact file
//! path. Later entries win, and an exclude entry unmaps a path matched by an
//! earlier include.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One view mapping rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewEntry {
    pub include: bool,
    /// Depot-side pattern, e.g. `//depot/main/...`.
    pub source: String,
    /// Stream-relative pattern, e.g. `/...`.
    pub target: String,
}

impl ViewEntry {
    pub fn include(source: &str, target: &str) -> Self {
        Self {
            include: true,
            source: source.to_string(),
            target: target.to_string(),
        }
    }

    pub fn exclude(source: &str) -> Self {
        Self {
            include: false,
            source: source.to_string(),
            target: String::new(),
        }
    }
}

/// Ordered view of one stream, resolved from the version-control server.
///
/// Recomputed on each ingestion pass; cheap enough not to cache across runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewMap {
    entries: Vec<ViewEntry>,
}

impl ViewMap {
    pub fn new(entries: Vec<ViewEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[ViewEntry] {
        &self.entries
    }

    /// Translate a depot path into a stream-relative path. Returns `None`
    /// when no include entry matches, or when the last matching entry is an
    /// exclusion.
    pub fn map_path(&self, depot_path: &str) -> Option<String> {
        let mut mapped = None;
        for entry in &self.entries {
            if let Some(suffix) = match_pattern(&entry.source, depot_path) {
                mapped = if entry.include {
                    Some(translate(&entry.target, suffix))
                } else {
                    None
                };
            }
        }
        mapped
    }

    /// Depot-side patterns of the include entries, used as the default sync
    /// scope for a stream.
    pub fn include_sources(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.include)
            .map(|e| e.source.clone())
            .collect()
    }
}

/// Match a depot path against a pattern. Returns the wildcard suffix for
/// `...` patterns (empty string for exact matches), or `None` on mismatch.
fn match_pattern<'a>(pattern: &str, path: &'a str) -> Option<&'a str> {
    if let Some(prefix) = pattern.strip_suffix("...") {
        path.strip_prefix(prefix)
    } else if pattern == path {
        Some("")
    } else {
        None
    }
}

/// Substitute the matched suffix into a target pattern.
fn translate(target: &str, suffix: &str) -> String {
    match target.strip_suffix("...") {
        Some(prefix) => format!("{}{}", prefix, suffix),
        None => target.to_string(),
    }
}

/// Compute the minimal set of depot root prefixes covering all given view
/// sources, one per top-level depot: entries sharing a depot are iteratively
/// widened to their common ancestor directory. Roots come back as wildcard
/// patterns, e.g. `//depot/main/...`.
pub fn minimal_depot_roots<'a>(sources: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut per_depot: BTreeMap<String, String> = BTreeMap::new();
    for source in sources {
        let dir = pattern_dir(source);
        let Some(depot) = top_level_depot(&dir) else {
            continue;
        };
        per_depot
            .entry(depot)
            .and_modify(|root| *root = common_prefix([root.as_str(), dir.as_str()]))
            .or_insert(dir);
    }
    per_depot
        .into_values()
        .map(|root| format!("{}/...", root))
        .collect()
}

/// Directory part of a pattern: strips a trailing `...` wildcard, or the
/// file name for exact entries.
fn pattern_dir(pattern: &str) -> String {
    if let Some(prefix) = pattern.strip_suffix("...") {
        prefix.trim_end_matches('/').to_string()
    } else {
        match pattern.rsplit_once('/') {
            Some((dir, _)) if dir.len() > 1 => dir.to_string(),
            _ => pattern.to_string(),
        }
    }
}

/// Top-level depot of a path, e.g. `//depot` for `//depot/main/file.txt`.
fn top_level_depot(path: &str) -> Option<String> {
    let rest = path.strip_prefix("//")?;
    let depot = rest.split('/').next()?;
    if depot.is_empty() {
        return None;
    }
    Some(format!("//{}", depot))
}

/// Longest common prefix of a set of paths, at path-component granularity.
/// Returns an empty string when the input is empty.
pub fn common_prefix<'a>(paths: impl IntoIterator<Item = &'a str>) -> String {
    let mut iter = paths.into_iter();
    let Some(first) = iter.next() else {
        return String::new();
    };
    let mut components: Vec<&str> = first.split('/').collect();
    for path in iter {
        let other: Vec<&str> = path.split('/').collect();
        let shared = components
            .iter()
            .zip(other.iter())
            .take_while(|(a, b)| a == b)
            .count();
        components.truncate(shared);
        if components.is_empty() {
            return String::new();
        }
    }
    let joined = components.join("/");
    if joined.is_empty() && first.starts_with('/') {
        // Absolute paths always share at least the root
        return "/".to_string();
    }
    joined
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> ViewMap {
        ViewMap::new(vec![
            ViewEntry::include("//depot/main/...", "/..."),
            ViewEntry::exclude("//depot/main/Docs/..."),
            ViewEntry::include("//depot/shared/libs/...", "/Libs/..."),
        ])
    }

    #[test]
    fn test_map_wildcard_include() {
        assert_eq!(
            view().map_path("//depot/main/Engine/build.cs"),
            Some("/Engine/build.cs".to_string())
        );
    }

    #[test]
    fn test_map_exclusion_wins() {
        assert_eq!(view().map_path("//depot/main/Docs/readme.md"), None);
    }

    #[test]
    fn test_map_retargeted_include() {
        assert_eq!(
            view().map_path("//depot/shared/libs/z.a"),
            Some("/Libs/z.a".to_string())
        );
    }

    #[test]
    fn test_map_unrelated_path() {
        assert_eq!(view().map_path("//other/main/file.txt"), None);
    }

    #[test]
    fn test_later_include_overrides_exclusion() {
        let view = ViewMap::new(vec![
            ViewEntry::include("//depot/main/...", "/..."),
            ViewEntry::exclude("//depot/main/Docs/..."),
            ViewEntry::include("//depot/main/Docs/api/...", "/Docs/api/..."),
        ]);
        assert_eq!(view.map_path("//depot/main/Docs/guide.md"), None);
        assert_eq!(
            view.map_path("//depot/main/Docs/api/index.md"),
            Some("/Docs/api/index.md".to_string())
        );
    }

    #[test]
    fn test_exact_entry() {
        let view = ViewMap::new(vec![ViewEntry::include("//depot/cfg/one.ini", "/one.ini")]);
        assert_eq!(
            view.map_path("//depot/cfg/one.ini"),
            Some("/one.ini".to_string())
        );
        assert_eq!(view.map_path("//depot/cfg/two.ini"), None);
    }

    #[test]
    fn test_minimal_roots_single_depot() {
        let roots = minimal_depot_roots(["//depot/a/b/...", "//depot/a/c/..."]);
        assert_eq!(roots, vec!["//depot/a/...".to_string()]);
    }

    #[test]
    fn test_minimal_roots_multiple_depots() {
        let roots = minimal_depot_roots(["//depot/a/...", "//other/x/y/...", "//other/x/z/..."]);
        assert_eq!(
            roots,
            vec!["//depot/a/...".to_string(), "//other/x/...".to_string()]
        );
    }

    #[test]
    fn test_minimal_roots_widens_to_depot() {
        let roots = minimal_depot_roots(["//depot/a/...", "//depot/b/..."]);
        assert_eq!(roots, vec!["//depot/...".to_string()]);
    }

    #[test]
    fn test_common_prefix() {
        assert_eq!(common_prefix(["/a/b/c.txt", "/a/b/d.txt"]), "/a/b");
        assert_eq!(common_prefix(["/a/b/c.txt"]), "/a/b/c.txt");
        assert_eq!(common_prefix(["/a/x.txt", "/b/y.txt"]), "/");
        assert_eq!(common_prefix(["a/x.txt", "b/y.txt"]), "");
        assert_eq!(common_prefix(std::iter::empty::<&str>()), "");
    }
}
