use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{FdwXactError, Result};

/// How a local transaction that modified several foreign servers commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitPolicy {
    /// **Disabled:**
    ///
    /// Every foreign server is committed with ordinary one-phase commit at
    /// pre-commit time. No foreign transaction is ever prepared.
    Disabled,
    /// **Prefer (best effort):**
    ///
    /// Servers capable of two-phase commit are prepared and resolved after
    /// the local commit. Servers that are not capable are committed directly
    /// at pre-commit time, so atomicity holds only among capable servers.
    Prefer,
    /// **Required (strict):**
    ///
    /// Atomic commit is mandatory. If it is required and any modified server
    /// cannot prepare, the commit fails instead of silently degrading.
    Required,
}

impl CommitPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            CommitPolicy::Disabled => "disabled",
            CommitPolicy::Prefer => "prefer",
            CommitPolicy::Required => "required",
        }
    }
}

/// What a resolver does when a remote resolve call fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureSeverity {
    /// Log a warning and forget the entry.
    Warning,
    /// Keep the entry and report the failure so that it is retried later.
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FdwXactConfig {
    /// Capacity of the foreign transaction table.
    pub max_prepared_foreign_xacts: usize,
    /// Maximum number of background resolver workers.
    pub max_foreign_xact_resolvers: usize,
    /// How long a resolver waits before retrying failed resolutions.
    pub resolution_retry_interval: Duration,
    /// A resolver with nothing to do for this long exits.
    pub resolver_timeout: Duration,
    pub commit_policy: CommitPolicy,
    pub resolution_failure: FailureSeverity,
    /// Directory under which `pg_fdw_xact/` state files are kept.
    pub data_dir: PathBuf,
    /// Spawn background resolvers on wake-up. When false, wake-ups are only
    /// counted and resolution is driven by the caller.
    pub autostart_resolvers: bool,
}

impl Default for FdwXactConfig {
    fn default() -> Self {
        Self {
            max_prepared_foreign_xacts: 64,
            max_foreign_xact_resolvers: 4,
            resolution_retry_interval: Duration::from_secs(10),
            resolver_timeout: Duration::from_secs(60),
            commit_policy: CommitPolicy::Disabled,
            resolution_failure: FailureSeverity::Error,
            data_dir: PathBuf::from("."),
            autostart_resolvers: true,
        }
    }
}

impl FdwXactConfig {
    /// Returns true when both capacity knobs allow preparing foreign transactions.
    pub fn atomic_commit_enabled(&self) -> bool {
        self.max_prepared_foreign_xacts > 0 && self.max_foreign_xact_resolvers > 0
    }

    /// Checks that the commit policy is usable with the configured capacities.
    pub fn validate(&self) -> Result<()> {
        self.check_policy(self.commit_policy)
    }

    pub(crate) fn check_policy(&self, policy: CommitPolicy) -> Result<()> {
        if policy == CommitPolicy::Disabled {
            return Ok(());
        }
        if self.max_prepared_foreign_xacts == 0 {
            return Err(FdwXactError::InvalidCommitPolicy {
                policy: policy.as_str(),
                knob: "max_prepared_foreign_xacts",
            });
        }
        if self.max_foreign_xact_resolvers == 0 {
            return Err(FdwXactError::InvalidCommitPolicy {
                policy: policy.as_str(),
                knob: "max_foreign_xact_resolvers",
            });
        }
        Ok(())
    }
}
