// SPDX-License-Identifier: MIT OR Apache-2.0
//! Background scheduler tick and tenant-slot janitor sweep.
//!
//! The daemon owns the only long-lived process in this deployment, so it's
//! the one that ticks the Scheduler and reclaims tenant slots abandoned by
//! a worker that went silent — both are one-shot operations elsewhere
//! (`rcx job scheduled tick` does the same tick from the CLI).

use crate::state::AppState;
use chrono::{DateTime, Utc};
use rcx_core::CloudKind;
use rcx_error::CoreResult;
use rcx_ruleset::RuleSelector;
use rcx_scheduler::{JobSubmitter, TickReport};

struct CoordinatorSubmitter<'a> {
    state: &'a AppState,
}

impl JobSubmitter for CoordinatorSubmitter<'_> {
    fn submit(&self, entry: &rcx_core::ScheduledJob) -> CoreResult<()> {
        let submission = rcx_coordinator::Submission {
            tenant: entry.target_tenant.clone(),
            cloud: self.state.require_tenant(&entry.target_tenant).map(|t| t.cloud).unwrap_or(CloudKind::Aws),
            regions: entry.regions.clone(),
            selector: RuleSelector::Explicit(Vec::new()),
            submitter: format!("scheduler:{}", entry.name),
            explicit_credentials: None,
            tenant_binding_credentials: None,
            submitter_environment_credentials: None,
        };
        self.state.with_admission(|ctx| rcx_coordinator::admit(ctx, submission))?;
        Ok(())
    }
}

/// Fire every due [`rcx_core::ScheduledJob`] entry, admitting a job for each.
///
/// # Errors
///
/// Propagates a scheduled-job store failure. A single entry's admission
/// failure is recorded in the returned [`TickReport`], not surfaced here.
pub fn tick(state: &AppState, now: DateTime<Utc>) -> CoreResult<TickReport> {
    let submitter = CoordinatorSubmitter { state };
    rcx_scheduler::tick(state.scheduled_jobs.as_ref(), &submitter, now)
}

/// Reclaim tenant slots whose holder has gone silent past the configured
/// TTL, marking each reclaimed job `TIMED_OUT`.
///
/// # Errors
///
/// Propagates a job or slot store failure.
pub fn reclaim_expired_slots(state: &AppState, slot_ttl_secs: i64) -> CoreResult<usize> {
    let slots = state.slot_store();
    rcx_coordinator::reclaim_expired_slots(state.jobs.as_ref(), &slots, slot_ttl_secs)
}
