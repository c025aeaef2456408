//! Decides whether a local transaction needs atomic commit across its
//! foreign servers.

use log::debug;

use crate::config::{CommitPolicy, FdwXactConfig};
use crate::errors::{FdwXactError, Result};
use crate::participant::ParticipantList;

/// Returns true when the transaction must commit its foreign servers with
/// two-phase commit.
///
/// Only callable once it is safe to ask drivers about server capabilities,
/// i.e. at pre-commit time. As a side effect, caches each participant's
/// two-phase capability and marks the list as containing a write that
/// cannot be prepared if a modified server is not capable.
///
/// Atomic commit is only meaningful with two or more writers; the local
/// transaction counts as one writer if it modified non-temporary data.
pub fn atomic_commit_required(
    config: &FdwXactConfig,
    policy: CommitPolicy,
    participants: &mut ParticipantList,
    wrote_local_data: bool,
) -> bool {
    if !config.atomic_commit_enabled() || policy == CommitPolicy::Disabled {
        return false;
    }

    let mut nwriters = 0;
    let mut nonprepared = false;
    for p in participants.iter_mut() {
        p.two_phase_capable = p.driver.is_two_phase_capable(p.server_id);
        if p.modified {
            nwriters += 1;
            if !p.two_phase_capable {
                nonprepared = true;
            }
        }
    }
    if nonprepared {
        participants.has_nonprepared_write = true;
    }
    if wrote_local_data {
        nwriters += 1;
    }

    debug!(
        "Transaction has {} writers, atomic commit {}",
        nwriters,
        if nwriters >= 2 { "required" } else { "not required" }
    );
    nwriters >= 2
}

/// Under the strict policy, fails if atomic commit is required but some
/// modified server cannot be prepared.
pub fn check_strict_policy(
    policy: CommitPolicy,
    required: bool,
    participants: &ParticipantList,
) -> Result<()> {
    if policy == CommitPolicy::Required && required && participants.has_nonprepared_write {
        return Err(FdwXactError::CannotCommitDistributed);
    }
    Ok(())
}
