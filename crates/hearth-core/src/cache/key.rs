//! Scoped cache keys.
//!
//! A key is the deterministic concatenation `scope:kind[:params]`. Because
//! `scope` and `kind` may not contain the separator, every key of a scope
//! shares the segment prefix `scope:` and prefix invalidation can never spill
//! into another scope whose name merely starts with the same characters.

use std::fmt;

use crate::error::Error;

/// Separator between key segments.
pub const KEY_SEPARATOR: char = ':';

/// A cache key scoped to a tenant (`scope`) and data category (`kind`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    scope: String,
    kind: String,
    params: Option<String>,
    rendered: String,
}

impl CacheKey {
    /// Create a key for a whole `kind` under `scope`.
    pub fn new(scope: impl Into<String>, kind: impl Into<String>) -> Result<Self, Error> {
        Self::build(scope.into(), kind.into(), None)
    }

    /// Create a key qualified by serialized query parameters.
    pub fn with_params(
        scope: impl Into<String>,
        kind: impl Into<String>,
        params: impl Into<String>,
    ) -> Result<Self, Error> {
        Self::build(scope.into(), kind.into(), Some(params.into()))
    }

    fn build(scope: String, kind: String, params: Option<String>) -> Result<Self, Error> {
        validate_segment("scope", &scope)?;
        validate_segment("kind", &kind)?;
        if let Some(p) = &params {
            if p.is_empty() {
                return Err(Error::InvalidKey {
                    component: "params",
                    reason: "must not be empty".to_string(),
                });
            }
        }

        let mut rendered = format!("{scope}{KEY_SEPARATOR}{kind}");
        if let Some(p) = &params {
            rendered.push(KEY_SEPARATOR);
            rendered.push_str(p);
        }

        Ok(Self {
            scope,
            kind,
            params,
            rendered,
        })
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn params(&self) -> Option<&str> {
        self.params.as_deref()
    }

    /// The opaque string form used as the map key.
    pub fn as_str(&self) -> &str {
        &self.rendered
    }

    /// Prefix covering every key of `kind` under `scope`, parameterized or not.
    pub fn kind_prefix(scope: &str, kind: &str) -> String {
        format!("{scope}{KEY_SEPARATOR}{kind}")
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

/// Whether `key` equals `prefix` or extends it by at least one whole segment.
pub fn matches_prefix(key: &str, prefix: &str) -> bool {
    match key.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with(KEY_SEPARATOR),
        None => false,
    }
}

fn validate_segment(component: &'static str, value: &str) -> Result<(), Error> {
    if value.is_empty() {
        return Err(Error::InvalidKey {
            component,
            reason: "must not be empty".to_string(),
        });
    }
    if value.contains(KEY_SEPARATOR) {
        return Err(Error::InvalidKey {
            component,
            reason: format!("must not contain '{KEY_SEPARATOR}'"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_rendering() {
        let key = CacheKey::new("fam1", "chores").unwrap();
        assert_eq!(key.as_str(), "fam1:chores");
        assert_eq!(key.params(), None);

        let key = CacheKey::with_params("fam1", "chores", "status=open").unwrap();
        assert_eq!(key.as_str(), "fam1:chores:status=open");
        assert_eq!(key.scope(), "fam1");
        assert_eq!(key.kind(), "chores");
    }

    #[test]
    fn test_params_may_contain_separator() {
        let key = CacheKey::with_params("fam1", "chores", "due:2024-03-01").unwrap();
        assert_eq!(key.as_str(), "fam1:chores:due:2024-03-01");
    }

    #[test]
    fn test_structural_equality() {
        let a = CacheKey::new("fam1", "members").unwrap();
        let b = CacheKey::new(String::from("fam1"), String::from("members")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, CacheKey::new("fam2", "members").unwrap());
    }

    #[test]
    fn test_invalid_segments() {
        assert!(matches!(
            CacheKey::new("", "chores"),
            Err(Error::InvalidKey { component: "scope", .. })
        ));
        assert!(matches!(
            CacheKey::new("fam1", "cho:res"),
            Err(Error::InvalidKey { component: "kind", .. })
        ));
        assert!(matches!(
            CacheKey::with_params("fam1", "chores", ""),
            Err(Error::InvalidKey { component: "params", .. })
        ));
    }

    #[test]
    fn test_prefix_matching_is_segment_aware() {
        assert!(matches_prefix("fam1:chores", "fam1"));
        assert!(matches_prefix("fam1:chores", "fam1:chores"));
        assert!(matches_prefix("fam1:chores:open", "fam1:chores"));
        assert!(!matches_prefix("fam10:chores", "fam1"));
        assert!(!matches_prefix("fam1:chores_archive", "fam1:chores"));
        assert!(!matches_prefix("fam1", "fam1:chores"));
    }
}
