//! Application-level orchestration.
//!
//! This module owns the workflow run lifecycle (preconditions, stage sequencing,
//! the seed-point suspension and the secondary-analysis join) and post-run
//! processing such as product links and report export. CLI layers call into
//! this module and observe progress through the reporter seams.

mod controller;
mod post_process;
mod seed;

pub(crate) use controller::WorkflowOrchestrator;
pub(crate) use post_process::export_report;
pub(crate) use seed::{seed_point_channel, SeedPointListener, SeedPointTrigger};
