use crate::SYSTEM_NAME;
use std::collections::BTreeMap;
use thiserror::Error;

pub const PART_OF_KEY: &str = "app.kubernetes.io/part-of";
pub const NAME_KEY: &str = "app.kubernetes.io/name";
pub const OWNER_NAME_KEY: &str = "ephemerator.tilt.dev/owner-name";

/// Held on requests until their workload and service have been released.
pub const FINALIZER: &str = "ephemerator.tilt.dev/cleanup";

pub type Labels = BTreeMap<String, String>;

/// The kinds of objects this system manages.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Environment requests and the workloads and services derived from them.
    Runner,

    /// The shared routing object.
    Gateway,
}

/// Identifies an object as belonging to this system.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ownership {
    pub kind: Kind,

    /// The request an object was derived from, if any.
    pub owner: Option<String>,
}

/// An object exists with a name we need, but it isn't ours.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("cannot touch conflicting object: expected {expected}, found {found}")]
pub struct Conflict {
    pub expected: Kind,
    pub found: String,
}

// === impl Kind ===

impl Kind {
    pub fn label_value(&self) -> &'static str {
        match self {
            Self::Runner => "ephrunner",
            Self::Gateway => "ephgateway",
        }
    }

    fn from_label_value(v: &str) -> Option<Self> {
        match v {
            "ephrunner" => Some(Self::Runner),
            "ephgateway" => Some(Self::Gateway),
            _ => None,
        }
    }

    /// A label selector matching every object of this kind.
    pub fn selector(&self) -> String {
        format!(
            "{PART_OF_KEY}={SYSTEM_NAME},{NAME_KEY}={}",
            self.label_value()
        )
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.label_value().fmt(f)
    }
}

// === impl Ownership ===

impl Ownership {
    pub fn derived(owner: impl ToString) -> Self {
        Self {
            kind: Kind::Runner,
            owner: Some(owner.to_string()),
        }
    }

    /// Reads ownership from an object's labels. Returns `None` unless the
    /// object is part of this system and names a known kind.
    pub fn from_labels(labels: &Labels) -> Option<Self> {
        if labels.get(PART_OF_KEY).map(String::as_str) != Some(SYSTEM_NAME) {
            return None;
        }
        let kind = Kind::from_label_value(labels.get(NAME_KEY)?)?;
        Some(Self {
            kind,
            owner: labels.get(OWNER_NAME_KEY).cloned(),
        })
    }

    /// Validates that an existing object may be managed as `expected`.
    pub fn check(expected: Kind, labels: Option<&Labels>) -> Result<Self, Conflict> {
        let empty = Labels::new();
        let labels = labels.unwrap_or(&empty);
        match Self::from_labels(labels) {
            Some(ownership) if ownership.kind == expected => Ok(ownership),
            found => Err(Conflict {
                expected,
                found: found
                    .map(|o| o.kind.to_string())
                    .unwrap_or_else(|| "unowned".to_string()),
            }),
        }
    }

    /// Labels to stamp on an object created with this ownership.
    pub fn labels(&self) -> Labels {
        let mut labels = Labels::new();
        labels.insert(PART_OF_KEY.to_string(), SYSTEM_NAME.to_string());
        labels.insert(NAME_KEY.to_string(), self.kind.label_value().to_string());
        if let Some(owner) = &self.owner {
            labels.insert(OWNER_NAME_KEY.to_string(), owner.clone());
        }
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    const GATEWAY: Ownership = Ownership {
        kind: Kind::Gateway,
        owner: None,
    };

    #[test]
    fn round_trips_labels() {
        let ownership = Ownership::derived("alice");
        assert_eq!(
            Ownership::from_labels(&ownership.labels()),
            Some(ownership.clone())
        );
        assert_eq!(
            ownership.labels(),
            btreemap! {
                "app.kubernetes.io/part-of".to_string() => "ephemerator".to_string(),
                "app.kubernetes.io/name".to_string() => "ephrunner".to_string(),
                "ephemerator.tilt.dev/owner-name".to_string() => "alice".to_string(),
            }
        );
    }

    #[test]
    fn rejects_foreign_objects() {
        assert_eq!(
            Ownership::check(Kind::Runner, None),
            Err(Conflict {
                expected: Kind::Runner,
                found: "unowned".to_string(),
            })
        );

        let labels = btreemap! {
            "app.kubernetes.io/part-of".to_string() => "something-else".to_string(),
            "app.kubernetes.io/name".to_string() => "ephrunner".to_string(),
        };
        assert!(Ownership::check(Kind::Runner, Some(&labels)).is_err());
    }

    #[test]
    fn rejects_other_kinds() {
        let labels = GATEWAY.labels();
        assert_eq!(
            Ownership::check(Kind::Runner, Some(&labels)),
            Err(Conflict {
                expected: Kind::Runner,
                found: "ephgateway".to_string(),
            })
        );
        assert_eq!(Ownership::check(Kind::Gateway, Some(&labels)), Ok(GATEWAY));
    }

    #[test]
    fn selectors() {
        assert_eq!(
            Kind::Runner.selector(),
            "app.kubernetes.io/part-of=ephemerator,app.kubernetes.io/name=ephrunner"
        );
        assert_eq!(
            Kind::Gateway.selector(),
            "app.kubernetes.io/part-of=ephemerator,app.kubernetes.io/name=ephgateway"
        );
    }
}
