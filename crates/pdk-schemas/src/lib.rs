//! pdk-schemas
//!
//! Shared vocabulary types for the coordination core. Everything here is
//! plain data: no I/O, no async, no policy.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

pub mod canonical;

/// Delimiter used when flattening a [`PlanKey`] to a single string.
/// Branch names are validated to never contain it.
pub const PLAN_KEY_DELIMITER: char = '|';

// ---------------------------------------------------------------------------
// PlanKey
// ---------------------------------------------------------------------------

/// The (plan, branch) pair identifying a logical execution target.
///
/// An empty `branch` denotes the plan root. Keys flatten to
/// `"<plan_id>|<branch>"` for use in keyed stores; the delimiter cannot occur
/// in either field.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlanKey {
    plan_id: String,
    branch: String,
}

impl PlanKey {
    /// Build a key, rejecting branch names that contain the delimiter.
    pub fn new(plan_id: impl Into<String>, branch: impl Into<String>) -> Result<Self> {
        let plan_id = plan_id.into();
        let branch = branch.into();
        if plan_id.is_empty() {
            return Err(anyhow!("plan_id must not be empty"));
        }
        if plan_id.contains(PLAN_KEY_DELIMITER) {
            return Err(anyhow!("plan_id must not contain '{PLAN_KEY_DELIMITER}': {plan_id}"));
        }
        if branch.contains(PLAN_KEY_DELIMITER) {
            return Err(anyhow!("branch must not contain '{PLAN_KEY_DELIMITER}': {branch}"));
        }
        Ok(Self { plan_id, branch })
    }

    /// Key for the plan root (empty branch).
    pub fn root(plan_id: impl Into<String>) -> Result<Self> {
        Self::new(plan_id, "")
    }

    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    /// The branch name; empty for the plan root.
    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// True when this key targets the plan root rather than a branch.
    pub fn is_root(&self) -> bool {
        self.branch.is_empty()
    }

    /// Parse a flattened `"<plan_id>|<branch>"` string.
    pub fn parse(s: &str) -> Result<Self> {
        let (plan_id, branch) = s
            .split_once(PLAN_KEY_DELIMITER)
            .ok_or_else(|| anyhow!("malformed plan key (no delimiter): {s}"))?;
        Self::new(plan_id, branch)
    }
}

impl std::fmt::Display for PlanKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.plan_id, PLAN_KEY_DELIMITER, self.branch)
    }
}

// ---------------------------------------------------------------------------
// LockScope
// ---------------------------------------------------------------------------

/// Scope of a repository lock or queued operation: read or write.
///
/// Scope governs lock compatibility: reads on the same branch may coexist,
/// a write excludes everything else on its (plan, branch).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockScope {
    Read,
    Write,
}

impl LockScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockScope::Read => "read",
            LockScope::Write => "write",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "read" => Ok(LockScope::Read),
            "write" => Ok(LockScope::Write),
            other => Err(anyhow!("invalid lock scope: {}", other)),
        }
    }
}

impl std::fmt::Display for LockScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_key_round_trips_through_display() {
        let key = PlanKey::new("plan-1", "feature/x").unwrap();
        let parsed = PlanKey::parse(&key.to_string()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn root_key_has_empty_branch() {
        let key = PlanKey::root("plan-1").unwrap();
        assert!(key.is_root());
        assert_eq!(key.to_string(), "plan-1|");
    }

    #[test]
    fn branch_with_delimiter_rejected() {
        assert!(PlanKey::new("plan-1", "bad|branch").is_err());
    }

    #[test]
    fn empty_plan_id_rejected() {
        assert!(PlanKey::new("", "main").is_err());
    }

    #[test]
    fn scope_string_round_trip() {
        assert_eq!(LockScope::parse("read").unwrap(), LockScope::Read);
        assert_eq!(LockScope::parse("write").unwrap(), LockScope::Write);
        assert!(LockScope::parse("exclusive").is_err());
        assert_eq!(LockScope::Write.as_str(), "write");
    }
}
