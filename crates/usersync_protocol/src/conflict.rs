//! Conflict pairs exposed to conflict-resolution UIs.

use url::Url;

/// A pair of preview resources the user must reconcile.
///
/// `local` and `remote` name the two sides of one unresolved merge. Equality
/// is by both URIs; the engine replaces its conflict list atomically whenever
/// any pair changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// Preview of the local side.
    pub local: Url,
    /// Preview of the remote side.
    pub remote: Url,
}

impl Conflict {
    /// Creates a conflict pair.
    pub fn new(local: Url, remote: Url) -> Self {
        Self { local, remote }
    }
}

/// Returns true if two conflict lists contain the same pairs in the same
/// order.
pub fn same_conflicts(a: &[Conflict], b: &[Conflict]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conflict(local: &str, remote: &str) -> Conflict {
        Conflict::new(Url::parse(local).unwrap(), Url::parse(remote).unwrap())
    }

    #[test]
    fn equality_is_by_both_uris() {
        let a = conflict("scheme://a/local", "scheme://a/remote");
        let b = conflict("scheme://a/local", "scheme://a/remote");
        let c = conflict("scheme://a/local", "scheme://b/remote");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn list_comparison() {
        let a = vec![conflict("s://1/l", "s://1/r")];
        let b = vec![conflict("s://1/l", "s://1/r")];
        let c = vec![conflict("s://2/l", "s://2/r")];
        assert!(same_conflicts(&a, &b));
        assert!(!same_conflicts(&a, &c));
        assert!(!same_conflicts(&a, &[]));
    }
}
