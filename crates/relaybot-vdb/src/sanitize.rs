//! Collection-name sanitization for backends with restricted identifiers.
//!
//! UUID-shaped collection names carry hyphens, which some storage layers
//! reject in identifiers. Backends map names through a [`NameMap`] that
//! rewrites disallowed characters and remembers the original, so every
//! caller-facing surface stays UUID-agnostic.

use dashmap::DashMap;

/// Bidirectional original <-> safe collection-name map.
#[derive(Debug, Default)]
pub struct NameMap {
    safe_by_original: DashMap<String, String>,
}

impl NameMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The storage-safe form of `original`, recording the mapping.
    pub fn safe(&self, original: &str) -> String {
        if let Some(existing) = self.safe_by_original.get(original) {
            return existing.clone();
        }
        let safe = sanitize(original);
        self.safe_by_original
            .insert(original.to_string(), safe.clone());
        safe
    }

    /// Forget a mapping (on collection deletion).
    pub fn forget(&self, original: &str) {
        self.safe_by_original.remove(original);
    }
}

/// Hyphens become underscores; a leading digit gets a `c_` prefix so the
/// identifier is valid in SQL-like dialects.
fn sanitize(name: &str) -> String {
    let replaced = name.replace('-', "_");
    if replaced.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        format!("c_{replaced}")
    } else {
        replaced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_maps_consistently() {
        let map = NameMap::new();
        let original = "550e8400-e29b-41d4-a716-446655440000";
        let safe = map.safe(original);
        assert_eq!(safe, "c_550e8400_e29b_41d4_a716_446655440000");
        // Same input, same output.
        assert_eq!(map.safe(original), safe);
    }

    #[test]
    fn plain_names_pass_through() {
        let map = NameMap::new();
        assert_eq!(map.safe("documents"), "documents");
    }

    #[test]
    fn forget_removes_mapping() {
        let map = NameMap::new();
        map.safe("kb-1");
        map.forget("kb-1");
        assert_eq!(map.safe("kb-1"), "kb_1");
    }
}
