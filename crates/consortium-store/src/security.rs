//! Per-store access policy for security-aware backends.

use serde::{Deserialize, Serialize};

/// Role granted to server administrators.
pub const ADMIN_ROLE: &str = "_admin";

/// A set of principals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Members {
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Members {
    /// True when no principal is listed, i.e. anyone qualifies.
    pub fn is_open(&self) -> bool {
        self.names.is_empty() && self.roles.is_empty()
    }
}

/// Who may administer and who may read/write a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    #[serde(default)]
    pub admins: Members,
    #[serde(default)]
    pub members: Members,
}

impl SecurityPolicy {
    /// No anonymous readers or writers: only administrators.
    pub fn private() -> Self {
        let admins = Members {
            names: Vec::new(),
            roles: vec![ADMIN_ROLE.to_string()],
        };
        Self {
            members: admins.clone(),
            admins,
        }
    }

    /// Whether anonymous users can read or write.
    pub fn allows_anonymous(&self) -> bool {
        self.members.is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_public() {
        assert!(SecurityPolicy::default().allows_anonymous());
    }

    #[test]
    fn private_policy_locks_out_anonymous() {
        let policy = SecurityPolicy::private();
        assert!(!policy.allows_anonymous());
        assert_eq!(policy.admins.roles, vec![ADMIN_ROLE]);
    }
}
