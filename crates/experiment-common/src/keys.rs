//! `namespace/name` keys used to address Runs on the work queue

use crate::Error;

/// Join a namespace and a name into a queue key
pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Split a queue key into its namespace and name.
///
/// Runs are namespaced, so both halves must be present and non-empty.
pub fn split_key(key: &str) -> Result<(&str, &str), Error> {
    let mut parts = key.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(namespace), Some(name), None) if !namespace.is_empty() && !name.is_empty() => {
            Ok((namespace, name))
        }
        (_, _, Some(_)) => Err(Error::invalid_key(key, "too many '/' separators")),
        _ => Err(Error::invalid_key(key, "expected namespace/name")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_namespaced_key() {
        assert_eq!(split_key("team-a/run-1").unwrap(), ("team-a", "run-1"));
        assert_eq!(object_key("team-a", "run-1"), "team-a/run-1");
    }

    #[test]
    fn rejects_malformed_keys() {
        for key in ["", "run-1", "/run-1", "team-a/", "a/b/c"] {
            let err = split_key(key).unwrap_err();
            assert!(matches!(err, Error::InvalidKey { .. }), "key {key:?}");
        }
    }
}
