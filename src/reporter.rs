//! Notification seams between the orchestrator and presentation layers.
//!
//! [`StatusReporter`] receives per-stage lifecycle notifications and
//! [`MapDisplay`] receives geometry and imagery to show. [`EventReporter`]
//! implements both by forwarding [`WorkflowEvent`]s over a channel, which the
//! CLI modes consume.

use crate::model::{
    InfoEvent, MapLink, Product, RunReport, SeedPoints, Stage, SuccessPayload, WorkflowEvent,
};
use crate::orchestrator::SeedPointListener;
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

pub trait StatusReporter: Send + Sync {
    fn show_loading(&self, stage: Stage);
    fn show_success(&self, stage: Stage, payload: Option<SuccessPayload>);
    fn show_failure(&self, stage: Stage);
    fn show_skipped(&self, stage: Stage);

    fn notify_rejected(&self, problem: &str);
    fn notify_upload_failed(&self);
    fn notify_fire_not_found(&self);
    fn notify_products_failed(&self);

    fn info(&self, event: InfoEvent);
    fn run_completed(&self, report: &RunReport);
}

#[async_trait]
pub trait MapDisplay: Send + Sync {
    /// Provisional boundaries are drawn red and unfilled, final ones black and filled.
    fn publish_boundary(&self, geojson: &str, provisional: bool);
    fn publish_intermediate_imagery(&self, url: &str);
    fn remove_intermediate_imagery(&self);
    fn publish_products(&self, products: &[Product], links: &[MapLink]);

    /// Resolves once the user has placed and confirmed seed markers.
    async fn await_seed_points(&self) -> Option<SeedPoints>;
}

/// Channel-backed reporter and display for one run.
pub struct EventReporter {
    event_tx: UnboundedSender<WorkflowEvent>,
    seeds: SeedPointListener,
}

impl EventReporter {
    pub fn new(event_tx: UnboundedSender<WorkflowEvent>, seeds: SeedPointListener) -> Self {
        Self { event_tx, seeds }
    }

    fn emit(&self, ev: WorkflowEvent) {
        // A closed receiver only means nobody is watching anymore.
        let _ = self.event_tx.send(ev);
    }
}

impl StatusReporter for EventReporter {
    fn show_loading(&self, stage: Stage) {
        self.emit(WorkflowEvent::StageLoading { stage });
    }

    fn show_success(&self, stage: Stage, payload: Option<SuccessPayload>) {
        self.emit(WorkflowEvent::StageSucceeded { stage, payload });
    }

    fn show_failure(&self, stage: Stage) {
        self.emit(WorkflowEvent::StageFailed { stage });
    }

    fn show_skipped(&self, stage: Stage) {
        self.emit(WorkflowEvent::StageSkipped { stage });
    }

    fn notify_rejected(&self, problem: &str) {
        self.emit(WorkflowEvent::Rejected {
            problem: problem.to_string(),
        });
    }

    fn notify_upload_failed(&self) {
        self.emit(WorkflowEvent::UploadFailed);
    }

    fn notify_fire_not_found(&self) {
        self.emit(WorkflowEvent::FireNotFound);
    }

    fn notify_products_failed(&self) {
        self.emit(WorkflowEvent::ProductsFailed);
    }

    fn info(&self, event: InfoEvent) {
        self.emit(WorkflowEvent::Info(event));
    }

    fn run_completed(&self, report: &RunReport) {
        self.emit(WorkflowEvent::RunCompleted {
            report: Box::new(report.clone()),
        });
    }
}

#[async_trait]
impl MapDisplay for EventReporter {
    fn publish_boundary(&self, geojson: &str, provisional: bool) {
        self.emit(WorkflowEvent::BoundaryPublished {
            geojson: geojson.to_string(),
            provisional,
        });
    }

    fn publish_intermediate_imagery(&self, url: &str) {
        self.emit(WorkflowEvent::IntermediateImageryPublished {
            url: url.to_string(),
        });
    }

    fn remove_intermediate_imagery(&self) {
        self.emit(WorkflowEvent::IntermediateImageryRemoved);
    }

    fn publish_products(&self, products: &[Product], links: &[MapLink]) {
        self.emit(WorkflowEvent::ProductsPublished {
            products: products.to_vec(),
            links: links.to_vec(),
        });
    }

    async fn await_seed_points(&self) -> Option<SeedPoints> {
        self.seeds.wait().await
    }
}
