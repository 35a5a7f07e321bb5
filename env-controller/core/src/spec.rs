use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const REPO_KEY: &str = "repo";
pub const BRANCH_KEY: &str = "branch";
pub const PATH_KEY: &str = "path";
pub const EXPIRATION_KEY: &str = "expiration";

/// Request fields that never contribute to a workload's fingerprint.
///
/// The lease is stamped by the controller after the request is written, so a
/// fingerprint that included it would change underneath a healthy workload.
pub const FINGERPRINT_IGNORED_FIELDS: &[&str] = &[EXPIRATION_KEY];

/// What a user asked to run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct EnvSpec {
    pub repo: String,
    pub branch: String,
    pub path: String,
}

/// Canonical serialization of a request's data, stored on the workload so
/// that drift can be detected without consulting the request's history.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

// === impl EnvSpec ===

impl EnvSpec {
    /// Reads the spec out of a request's data. Missing fields are empty and
    /// will be rejected by the allowlist.
    pub fn from_data(data: &BTreeMap<String, String>) -> Self {
        let field = |key: &str| data.get(key).cloned().unwrap_or_default();
        Self {
            repo: field(REPO_KEY),
            branch: field(BRANCH_KEY),
            path: field(PATH_KEY),
        }
    }
}

// === impl Fingerprint ===

impl Fingerprint {
    pub fn of(data: &BTreeMap<String, String>) -> Result<Self, serde_json::Error> {
        let fields = data
            .iter()
            .filter(|(k, _)| !FINGERPRINT_IGNORED_FIELDS.contains(&k.as_str()))
            .collect::<BTreeMap<_, _>>();
        serde_json::to_string(&fields).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Fingerprint {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn to_data(spec: &EnvSpec) -> BTreeMap<String, String> {
        btreemap! {
            REPO_KEY.to_string() => spec.repo.clone(),
            BRANCH_KEY.to_string() => spec.branch.clone(),
            PATH_KEY.to_string() => spec.path.clone(),
        }
    }

    #[test]
    fn fingerprint_is_canonical() {
        let data = btreemap! {
            "repo".to_string() => "tilt-dev/tilt-avatars".to_string(),
            "path".to_string() => "Tiltfile".to_string(),
            "branch".to_string() => "main".to_string(),
        };
        let fp = Fingerprint::of(&data).unwrap();
        assert_eq!(
            fp.as_str(),
            r#"{"branch":"main","path":"Tiltfile","repo":"tilt-dev/tilt-avatars"}"#
        );
    }

    #[test]
    fn fingerprint_ignores_expiration() {
        let spec = EnvSpec {
            repo: "tilt-dev/tilt-avatars".to_string(),
            branch: "main".to_string(),
            path: "Tiltfile".to_string(),
        };
        let mut data = to_data(&spec);
        let before = Fingerprint::of(&data).unwrap();
        data.insert(
            EXPIRATION_KEY.to_string(),
            "2026-10-19T12:00:00Z".to_string(),
        );
        assert_eq!(Fingerprint::of(&data).unwrap(), before);
    }

    #[test]
    fn fingerprint_tracks_path() {
        let mut data = to_data(&EnvSpec {
            repo: "a/b".to_string(),
            branch: "main".to_string(),
            path: "C".to_string(),
        });
        let before = Fingerprint::of(&data).unwrap();
        data.insert(PATH_KEY.to_string(), "D".to_string());
        assert_ne!(Fingerprint::of(&data).unwrap(), before);
    }

    #[test]
    fn missing_fields_are_empty() {
        let spec = EnvSpec::from_data(&btreemap! {
            "repo".to_string() => "a/b".to_string(),
        });
        assert_eq!(spec.repo, "a/b");
        assert!(spec.branch.is_empty());
        assert!(spec.path.is_empty());
    }
}
