//! Authorization
//!
//! File-backed ACL check. Policies are comma-separated rows of the
//! form `p, subject, object, action`; a subject may act when a row
//! grants that (object, action) pair. Nodes configured without policy
//! files allow everything.

use std::path::Path;

use crate::error::{Error, Result};

/// Objects and actions used by the RPC surface
pub const OBJECT_WILDCARD: &str = "*";
pub const ACTION_PRODUCE: &str = "produce";
pub const ACTION_CONSUME: &str = "consume";

/// One granted (subject, object, action) triple
#[derive(Debug, Clone, PartialEq, Eq)]
struct PolicyRule {
    subject: String,
    object: String,
    action: String,
}

/// Policy-file-backed authorizer
pub struct Authorizer {
    /// None means no policy configured: allow all
    rules: Option<Vec<PolicyRule>>,
}

impl Authorizer {
    /// Load the authorizer from model and policy files. Either path
    /// missing yields a permissive authorizer.
    pub fn new(model_file: Option<&Path>, policy_file: Option<&Path>) -> Result<Self> {
        let (Some(_model), Some(policy)) = (model_file, policy_file) else {
            return Ok(Self { rules: None });
        };

        let content = std::fs::read_to_string(policy)?;
        let mut rules = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            match fields.as_slice() {
                ["p", subject, object, action] => rules.push(PolicyRule {
                    subject: subject.to_string(),
                    object: object.to_string(),
                    action: action.to_string(),
                }),
                _ => {
                    return Err(Error::Config(format!(
                        "malformed policy rule: {}",
                        line
                    )))
                }
            }
        }

        Ok(Self { rules: Some(rules) })
    }

    /// Permissive authorizer for nodes without ACLs
    pub fn permissive() -> Self {
        Self { rules: None }
    }

    /// Check whether `subject` may perform `action` on `object`
    pub fn authorize(&self, subject: &str, object: &str, action: &str) -> Result<()> {
        let Some(rules) = &self.rules else {
            return Ok(());
        };

        let allowed = rules.iter().any(|rule| {
            rule.subject == subject
                && (rule.object == object || rule.object == OBJECT_WILDCARD)
                && rule.action == action
        });

        if allowed {
            Ok(())
        } else {
            Err(Error::PermissionDenied {
                subject: subject.to_string(),
                object: object.to_string(),
                action: action.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_policy(content: &str) -> (tempfile::TempDir, std::path::PathBuf, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.conf");
        std::fs::File::create(&model).unwrap();
        let policy = dir.path().join("policy.csv");
        let mut file = std::fs::File::create(&policy).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        (dir, model, policy)
    }

    #[test]
    fn test_permissive_without_files() {
        let auth = Authorizer::new(None, None).unwrap();
        assert!(auth.authorize("nobody", OBJECT_WILDCARD, ACTION_PRODUCE).is_ok());
    }

    #[test]
    fn test_policy_grants_and_denies() {
        let (_dir, model, policy) = write_policy(
            "p, root, *, produce\np, root, *, consume\np, nobody, *, consume\n",
        );
        let auth = Authorizer::new(Some(&model), Some(&policy)).unwrap();

        assert!(auth.authorize("root", OBJECT_WILDCARD, ACTION_PRODUCE).is_ok());
        assert!(auth.authorize("root", OBJECT_WILDCARD, ACTION_CONSUME).is_ok());
        assert!(auth.authorize("nobody", OBJECT_WILDCARD, ACTION_CONSUME).is_ok());

        let denied = auth.authorize("nobody", OBJECT_WILDCARD, ACTION_PRODUCE);
        assert!(matches!(denied, Err(Error::PermissionDenied { .. })));
    }

    #[test]
    fn test_malformed_policy_rejected() {
        let (_dir, model, policy) = write_policy("p, broken\n");
        assert!(Authorizer::new(Some(&model), Some(&policy)).is_err());
    }
}
