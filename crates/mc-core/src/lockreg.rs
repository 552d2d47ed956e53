//! In-memory file lock registry.
//!
//! Tracks which work unit has claimed which paths so two concurrent units
//! never modify overlapping files. Rebuilt from running units on start; no
//! durability needed.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Registry of path claims keyed by unit id.
#[derive(Debug, Default)]
pub struct FileLockRegistry {
    claims: Mutex<HashMap<String, HashSet<String>>>,
}

impl FileLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim paths for a unit. Returns the conflicting paths (empty means
    /// the claim succeeded). Re-claiming paths already held by the same
    /// unit succeeds, so retries are safe.
    pub fn claim(&self, unit_id: &str, paths: &[String]) -> Vec<String> {
        if paths.is_empty() {
            return Vec::new();
        }

        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());

        let conflicts: Vec<String> = paths
            .iter()
            .filter(|requested| {
                claims.iter().any(|(holder, held)| {
                    holder.as_str() != unit_id
                        && held.iter().any(|h| paths_overlap(requested, h))
                })
            })
            .cloned()
            .collect();

        if !conflicts.is_empty() {
            return conflicts;
        }

        claims.insert(unit_id.to_owned(), paths.iter().cloned().collect());
        Vec::new()
    }

    /// Release all claims held by a unit.
    pub fn release(&self, unit_id: &str) {
        self.claims
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(unit_id);
    }

    /// Map of requested path -> claiming unit id for any overlap.
    pub fn get_conflicts(&self, paths: &[String]) -> HashMap<String, String> {
        let claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        let mut result = HashMap::new();
        for (unit_id, held) in claims.iter() {
            for requested in paths {
                if held.iter().any(|h| paths_overlap(requested, h)) {
                    result.insert(requested.clone(), unit_id.clone());
                }
            }
        }
        result
    }

    /// Copy of the current claims for inspection.
    pub fn active_claims(&self) -> HashMap<String, HashSet<String>> {
        self.claims.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Whether two path specs overlap.
///
/// Exact matches always overlap; a directory claim (trailing '/') overlaps
/// with anything beneath it, in either direction. Comparison is on path
/// components, not string prefixes, so `src/` does not capture
/// `src-extra/file`.
pub fn paths_overlap(a: &str, b: &str) -> bool {
    let a_norm = a.trim_end_matches('/');
    let b_norm = b.trim_end_matches('/');

    if a_norm == b_norm {
        return true;
    }

    let a_is_dir = a.ends_with('/');
    let b_is_dir = b.ends_with('/');

    (a_is_dir && is_under(b_norm, a_norm)) || (b_is_dir && is_under(a_norm, b_norm))
}

fn is_under(child: &str, parent: &str) -> bool {
    let child_parts: Vec<&str> = child.split('/').filter(|p| !p.is_empty()).collect();
    let parent_parts: Vec<&str> = parent.split('/').filter(|p| !p.is_empty()).collect();
    child_parts.len() > parent_parts.len() && child_parts[..parent_parts.len()] == parent_parts[..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn exact_and_directory_overlap() {
        assert!(paths_overlap("src/a.rs", "src/a.rs"));
        assert!(paths_overlap("src/", "src/a.rs"));
        assert!(paths_overlap("src/deep/file.rs", "src/"));
        assert!(!paths_overlap("src/a.rs", "src/b.rs"));
    }

    #[test]
    fn directory_overlap_is_component_wise() {
        assert!(!paths_overlap("src/", "src-extra/file.rs"));
        assert!(!paths_overlap("src-extra/", "src/file.rs"));
    }

    #[test]
    fn claim_then_conflict() {
        let registry = FileLockRegistry::new();
        assert!(registry.claim("u1", &paths(&["src/a.rs", "src/b.rs"])).is_empty());

        let conflicts = registry.claim("u2", &paths(&["src/b.rs"]));
        assert_eq!(conflicts, vec!["src/b.rs"]);

        let conflicts_map = registry.get_conflicts(&paths(&["src/b.rs"]));
        assert_eq!(conflicts_map.get("src/b.rs").map(String::as_str), Some("u1"));
    }

    #[test]
    fn reclaim_by_same_unit_is_idempotent() {
        let registry = FileLockRegistry::new();
        assert!(registry.claim("u1", &paths(&["src/a.rs"])).is_empty());
        assert!(registry.claim("u1", &paths(&["src/a.rs"])).is_empty());
        assert_eq!(registry.active_claims().len(), 1);
    }

    #[test]
    fn release_frees_claims() {
        let registry = FileLockRegistry::new();
        assert!(registry.claim("u1", &paths(&["src/"])).is_empty());
        assert!(!registry.claim("u2", &paths(&["src/a.rs"])).is_empty());

        registry.release("u1");
        assert!(registry.claim("u2", &paths(&["src/a.rs"])).is_empty());
    }

    #[test]
    fn empty_claim_always_succeeds() {
        let registry = FileLockRegistry::new();
        assert!(registry.claim("u1", &[]).is_empty());
        assert!(registry.active_claims().is_empty());
    }
}
