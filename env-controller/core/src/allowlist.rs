use crate::spec::EnvSpec;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static BRANCH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z_/0-9-]*$").expect("branch regex must compile"));

static PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z_/0-9.-]*$").expect("path regex must compile"));

/// The repositories that may be run as environments.
///
/// All allowed repositories share a single base (e.g. a GitHub org).
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Allowlist {
    pub repo_base: String,

    #[serde(default)]
    pub repo_names: Vec<String>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Forbidden {
    #[error("Forbidden: malformed repo: {0}")]
    MalformedRepo(String),

    #[error("Forbidden: unrecognized base: {0}")]
    UnrecognizedBase(String),

    #[error("Forbidden: unrecognized repo name: {0}")]
    UnrecognizedRepoName(String),

    #[error("Forbidden: malformed branch name")]
    MalformedBranch,

    #[error("Forbidden: path must be relative")]
    AbsolutePath,

    #[error("Forbidden: no '..' references allowed in path")]
    ParentReference,

    #[error("Forbidden: malformed path")]
    MalformedPath,
}

// === impl Allowlist ===

impl Allowlist {
    /// Validates an environment spec for anything that looks suspicious:
    ///
    /// - The repo must match the allowlist.
    /// - The branch must look like a reasonable branch name.
    /// - The path must be a valid relative path.
    pub fn is_allowed(&self, spec: &EnvSpec) -> Result<(), Forbidden> {
        self.is_repo_allowed(&spec.repo)?;
        is_branch_allowed(&spec.branch)?;
        is_path_allowed(&spec.path)
    }

    pub fn is_repo_allowed(&self, repo: &str) -> Result<(), Forbidden> {
        let (base, name) = repo
            .rsplit_once('/')
            .ok_or_else(|| Forbidden::MalformedRepo(repo.to_string()))?;

        if base != self.repo_base {
            return Err(Forbidden::UnrecognizedBase(repo.to_string()));
        }

        if !self.repo_names.iter().any(|n| n == name) {
            return Err(Forbidden::UnrecognizedRepoName(repo.to_string()));
        }

        Ok(())
    }
}

fn is_branch_allowed(branch: &str) -> Result<(), Forbidden> {
    if !BRANCH_RE.is_match(branch) {
        return Err(Forbidden::MalformedBranch);
    }
    Ok(())
}

fn is_path_allowed(path: &str) -> Result<(), Forbidden> {
    if path.starts_with('/') {
        return Err(Forbidden::AbsolutePath);
    }
    if path.contains("..") {
        return Err(Forbidden::ParentReference);
    }
    if !PATH_RE.is_match(path) {
        return Err(Forbidden::MalformedPath);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowlist() -> Allowlist {
        Allowlist {
            repo_base: "tilt-dev".to_string(),
            repo_names: vec!["tilt-avatars".to_string(), "tilt-example-html".to_string()],
        }
    }

    fn spec(repo: &str, branch: &str, path: &str) -> EnvSpec {
        EnvSpec {
            repo: repo.to_string(),
            branch: branch.to_string(),
            path: path.to_string(),
        }
    }

    #[test]
    fn allowed() {
        for (spec, msg) in [
            (spec("tilt-dev/tilt-avatars", "main", "Tiltfile"), ""),
            (
                spec("tilt-dev/tilt-avatars", "feature/x-1", "web/Tiltfile"),
                "",
            ),
            (
                spec("tilt-dev/tilt-avatars2", "main", "Tiltfile"),
                "unrecognized repo name",
            ),
            (
                spec("tilt-dev2/tilt-avatars", "main", "Tiltfile"),
                "unrecognized base",
            ),
            (spec("tilt-avatars", "main", "Tiltfile"), "malformed repo"),
            (
                spec("tilt-dev/tilt-avatars", "main", "/Tiltfile"),
                "path must be relative",
            ),
            (
                spec("tilt-dev/tilt-avatars", "main", "x/../../Tiltfile"),
                "no '..' references",
            ),
            (
                spec("tilt-dev/tilt-avatars", "m x", "Tiltfile"),
                "malformed branch",
            ),
            (spec("tilt-dev/tilt-avatars", "", "Tiltfile"), "malformed branch"),
            (
                spec("tilt-dev/tilt-avatars", "main", "Tilt file"),
                "malformed path",
            ),
            (spec("tilt-dev/tilt-avatars", "main", ""), "malformed path"),
        ] {
            let res = allowlist().is_allowed(&spec);
            if msg.is_empty() {
                assert_eq!(res, Ok(()), "{spec:?}");
            } else {
                let err = res.expect_err("spec must be rejected");
                assert!(
                    err.to_string().contains(msg),
                    "{spec:?}: {err} does not contain {msg}"
                );
            }
        }
    }

    #[test]
    fn nested_base() {
        let allowlist = Allowlist {
            repo_base: "github.com/tilt-dev".to_string(),
            repo_names: vec!["tilt-avatars".to_string()],
        };
        assert_eq!(
            allowlist.is_repo_allowed("github.com/tilt-dev/tilt-avatars"),
            Ok(())
        );
    }

    #[test]
    fn parses_yaml() {
        let allowlist: Allowlist = serde_yaml::from_str(
            "repoBase: tilt-dev\nrepoNames:\n- tilt-avatars\n- tilt-example-html\n",
        )
        .unwrap();
        assert_eq!(allowlist, self::allowlist());
    }
}
