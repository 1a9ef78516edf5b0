//! Workflow run controller.
//!
//! Drives one submission through upload, burn analysis, optional seed-point
//! refinement, the secondary analyses and the product listing, emitting status
//! notifications as it goes. The main chain is fail-fast; the secondary
//! analyses settle independently and are always joined.

use super::post_process::{intermediate_imagery_url, map_links};
use crate::model::{
    now_utc, AoiKind, AreaOfInterestSource, DateRanges, FailureCause, InfoEvent, MapLink, Product,
    RunConfig, RunOutcome, RunReport, SatellitePassInfo, Stage, StageStatus, StageStatuses,
    Submission, SuccessPayload, PROBLEM_INVALID_DATES, PROBLEM_NO_AOI, PROBLEM_RUN_IN_PROGRESS,
};
use crate::reporter::{MapDisplay, StatusReporter};
use crate::service::{
    AnalysisService, BurnAnalysisRequest, FireEvent, SecondaryRequest, ServiceResult,
};
use rand::RngCore;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Burn metric whose imagery is shown for seed placement.
const SEED_IMAGERY_PRODUCT: &str = "rbr";

/// Why the main chain stopped before the secondary analyses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    UploadFailed,
    AnalysisFailed,
    FireNotFound,
}

impl From<Halt> for RunOutcome {
    fn from(h: Halt) -> Self {
        match h {
            Halt::UploadFailed => RunOutcome::UploadFailed,
            Halt::AnalysisFailed => RunOutcome::AnalysisFailed,
            Halt::FireNotFound => RunOutcome::FireNotFound,
        }
    }
}

/// Working state for one submission. Created once the preconditions pass,
/// consumed into a [`RunReport`] at the terminal outcome.
struct RunContext {
    run_id: String,
    started_utc: String,
    event: FireEvent,
    date_ranges: DateRanges,
    aoi_kind: AoiKind,
    /// Replaced once if seed-point refinement succeeds.
    boundary: String,
    satellite_pass_info: Option<SatellitePassInfo>,
    statuses: StageStatuses,
    products: Vec<Product>,
    map_links: Vec<MapLink>,
}

impl RunContext {
    fn mark(&mut self, stage: Stage, status: StageStatus) {
        debug!(run_id = %self.run_id, ?stage, ?status, "stage transition");
        self.statuses.set(stage, status);
    }

    fn into_report(self, outcome: RunOutcome) -> RunReport {
        RunReport {
            run_id: self.run_id,
            started_utc: self.started_utc,
            finished_utc: now_utc(),
            fire_event_name: self.event.fire_event_name,
            affiliation: self.event.affiliation,
            aoi_kind: Some(self.aoi_kind),
            outcome,
            stages: self.statuses,
            boundary_geojson: (!self.boundary.is_empty()).then_some(self.boundary),
            satellite_pass_info: self.satellite_pass_info,
            products: self.products,
            map_links: self.map_links,
        }
    }
}

/// Clears the single-run flag when a run ends, however it ends.
struct ActiveRun<'a>(&'a AtomicBool);

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Generate a random identifier for one run.
fn gen_run_id() -> String {
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    format!("{:016x}", u64::from_le_bytes(b))
}

pub struct WorkflowOrchestrator<S> {
    service: S,
    cfg: RunConfig,
    active: AtomicBool,
}

impl<S: AnalysisService> WorkflowOrchestrator<S> {
    pub fn new(service: S, cfg: RunConfig) -> Self {
        Self {
            service,
            cfg,
            active: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub(crate) fn service(&self) -> &S {
        &self.service
    }

    /// Run one submission to its terminal outcome.
    ///
    /// Only one run may be in flight per orchestrator; a submission arriving
    /// while another is active is rejected without touching the service.
    pub async fn run(
        &self,
        submission: &Submission,
        status: &dyn StatusReporter,
        display: &dyn MapDisplay,
    ) -> RunReport {
        let run_id = gen_run_id();
        let started_utc = now_utc();

        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return reject(run_id, started_utc, submission, PROBLEM_RUN_IN_PROGRESS, status);
        }
        let _active = ActiveRun(&self.active);

        let Some(aoi) = submission.aoi.source() else {
            return reject(run_id, started_utc, submission, PROBLEM_NO_AOI, status);
        };
        if let Some(problem) = submission.metadata.first_problem() {
            return reject(run_id, started_utc, submission, &problem, status);
        }
        let Some(date_ranges) = submission.metadata.date_ranges() else {
            return reject(run_id, started_utc, submission, PROBLEM_INVALID_DATES, status);
        };

        let mut ctx = RunContext {
            run_id,
            started_utc,
            event: FireEvent {
                fire_event_name: submission.metadata.fire_event_name.clone(),
                affiliation: submission.metadata.affiliation.clone(),
            },
            date_ranges,
            aoi_kind: aoi.kind(),
            boundary: String::new(),
            satellite_pass_info: None,
            statuses: StageStatuses::default(),
            products: Vec::new(),
            map_links: Vec::new(),
        };
        info!(
            run_id = %ctx.run_id,
            fire_event_name = %ctx.event.fire_event_name,
            affiliation = %ctx.event.affiliation,
            aoi_kind = ?ctx.aoi_kind,
            "starting workflow run"
        );

        status.info(InfoEvent::Message(format!(
            "Submitting {} AOI for {}",
            match ctx.aoi_kind {
                AoiKind::Drawn => "drawn",
                AoiKind::Uploaded => "uploaded",
            },
            ctx.event.fire_event_name
        )));
        for stage in Stage::ALL {
            status.show_loading(stage);
        }

        let outcome = match self.drive(&mut ctx, &aoi, status, display).await {
            Ok(()) => RunOutcome::Completed,
            Err(halt) => halt.into(),
        };
        info!(run_id = %ctx.run_id, outcome = outcome.label(), "workflow run finished");

        let report = ctx.into_report(outcome);
        status.run_completed(&report);
        report
    }

    async fn drive(
        &self,
        ctx: &mut RunContext,
        aoi: &AreaOfInterestSource,
        status: &dyn StatusReporter,
        display: &dyn MapDisplay,
    ) -> Result<(), Halt> {
        self.upload(ctx, aoi, status, display).await?;
        self.analyze_burn(ctx, status, display).await?;
        if ctx.aoi_kind == AoiKind::Drawn {
            self.refine(ctx, status, display).await?;
        }
        self.secondary_analyses(ctx, status).await;
        self.update_products(ctx, status, display).await;
        Ok(())
    }

    async fn upload(
        &self,
        ctx: &mut RunContext,
        aoi: &AreaOfInterestSource,
        status: &dyn StatusReporter,
        display: &dyn MapDisplay,
    ) -> Result<(), Halt> {
        let result = match aoi {
            AreaOfInterestSource::Drawn(shape) => {
                self.service.upload_drawn(&ctx.event, shape).await
            }
            AreaOfInterestSource::Uploaded(archive) => {
                self.service.upload_shapefile(&ctx.event, archive).await
            }
        };

        match result {
            Ok(upload) => {
                ctx.mark(Stage::Upload, StageStatus::Success);
                status.show_success(Stage::Upload, None);
                display.publish_boundary(&upload.geojson, ctx.aoi_kind.is_provisional());
                ctx.boundary = upload.geojson;
                Ok(())
            }
            Err(e) => {
                warn!(run_id = %ctx.run_id, error = %e, "AOI upload failed");
                ctx.mark(Stage::Upload, StageStatus::Failure(FailureCause::Error));
                status.show_failure(Stage::Upload);
                status.notify_upload_failed();
                skip(
                    ctx,
                    &[Stage::BurnAnalysis, Stage::Ecoclass, Stage::Rangeland],
                    status,
                );
                Err(Halt::UploadFailed)
            }
        }
    }

    async fn analyze_burn(
        &self,
        ctx: &mut RunContext,
        status: &dyn StatusReporter,
        display: &dyn MapDisplay,
    ) -> Result<(), Halt> {
        let derive_boundary = ctx.aoi_kind == AoiKind::Drawn;
        let result = self
            .service
            .analyze_burn(BurnAnalysisRequest {
                geojson: &ctx.boundary,
                event: &ctx.event,
                derive_boundary,
                date_ranges: ctx.date_ranges,
            })
            .await;

        if !result.executed {
            warn!(run_id = %ctx.run_id, "burn analysis was not executed");
            return Err(fail_analysis(ctx, status));
        }
        ctx.satellite_pass_info = result.satellite_pass_info.clone();

        match ctx.aoi_kind {
            // The boundary is already final, so whether a fire was found has no bearing.
            AoiKind::Uploaded => {
                ctx.mark(Stage::BurnAnalysis, StageStatus::Success);
                status.show_success(Stage::BurnAnalysis, pass_payload(ctx));
                Ok(())
            }
            AoiKind::Drawn => {
                if !result.fire_found {
                    info!(run_id = %ctx.run_id, "no burn imagery produced for drawn AOI");
                    return Err(fire_not_found(ctx, status));
                }
                let Some(cog_path) = result.cog_path(SEED_IMAGERY_PRODUCT) else {
                    warn!(run_id = %ctx.run_id, "burn analysis returned no seed imagery");
                    return Err(fail_analysis(ctx, status));
                };
                let url = intermediate_imagery_url(&self.cfg.cog_tileserver_prefix, cog_path);
                display.publish_intermediate_imagery(&url);
                Ok(())
            }
        }
    }

    /// Suspends until the user submits seed points, then derives the final boundary.
    async fn refine(
        &self,
        ctx: &mut RunContext,
        status: &dyn StatusReporter,
        display: &dyn MapDisplay,
    ) -> Result<(), Halt> {
        status.info(InfoEvent::AwaitingSeedPoints);
        info!(run_id = %ctx.run_id, "waiting for seed points");

        let Some(seeds) = display.await_seed_points().await else {
            warn!(run_id = %ctx.run_id, "seed point source closed before submission");
            return Err(fail_analysis(ctx, status));
        };
        status.info(InfoEvent::SeedPointsReceived { count: seeds.len() });

        let refined = self.service.refine_boundary(&ctx.event, &seeds).await;
        if !refined.executed {
            warn!(run_id = %ctx.run_id, "boundary refinement was not executed");
            return Err(fail_analysis(ctx, status));
        }
        let Some(boundary) = refined.derived_boundary.filter(|_| refined.fire_detected) else {
            info!(run_id = %ctx.run_id, "no fire detected from seed points");
            return Err(fire_not_found(ctx, status));
        };

        ctx.boundary = boundary;
        ctx.mark(Stage::BurnAnalysis, StageStatus::Success);
        status.show_success(Stage::BurnAnalysis, pass_payload(ctx));
        display.remove_intermediate_imagery();
        display.publish_boundary(&ctx.boundary, false);
        Ok(())
    }

    /// Ecoclass and rangeland run concurrently; each settles on its own and
    /// neither failure stops the run.
    async fn secondary_analyses(&self, ctx: &mut RunContext, status: &dyn StatusReporter) {
        let request = SecondaryRequest {
            boundary: &ctx.boundary,
            event: &ctx.event,
            date_ranges: ctx.date_ranges,
        };
        let run_id = ctx.run_id.as_str();

        let ecoclass = async {
            let r = self.service.fetch_ecoclass(request).await;
            settle(run_id, Stage::Ecoclass, r, status)
        };
        let rangeland = async {
            let r = self.service.fetch_rangeland(request).await;
            settle(run_id, Stage::Rangeland, r, status)
        };
        let (ecoclass, rangeland) = futures::future::join(ecoclass, rangeland).await;

        ctx.mark(Stage::Ecoclass, ecoclass);
        ctx.mark(Stage::Rangeland, rangeland);
    }

    /// Bookkeeping only: a failure here is reported but no stage changes.
    async fn update_products(
        &self,
        ctx: &mut RunContext,
        status: &dyn StatusReporter,
        display: &dyn MapDisplay,
    ) {
        match self.service.list_derived_products(&ctx.event).await {
            Ok(products) => {
                let links = map_links(
                    &self.cfg.tileserver_url,
                    &ctx.event.affiliation,
                    &ctx.event.fire_event_name,
                );
                display.publish_products(&products, &links);
                ctx.products = products;
                ctx.map_links = links;
            }
            Err(e) => {
                warn!(run_id = %ctx.run_id, error = %e, "failed to list derived products");
                status.notify_products_failed();
            }
        }
    }
}

fn reject(
    run_id: String,
    started_utc: String,
    submission: &Submission,
    problem: &str,
    status: &dyn StatusReporter,
) -> RunReport {
    info!(%run_id, problem, "submission rejected");
    status.notify_rejected(problem);
    let report = RunReport {
        run_id,
        started_utc,
        finished_utc: now_utc(),
        fire_event_name: submission.metadata.fire_event_name.clone(),
        affiliation: submission.metadata.affiliation.clone(),
        aoi_kind: submission.aoi.source().map(|s| s.kind()),
        outcome: RunOutcome::Rejected {
            reason: problem.to_string(),
        },
        stages: StageStatuses::default(),
        boundary_geojson: None,
        satellite_pass_info: None,
        products: Vec::new(),
        map_links: Vec::new(),
    };
    status.run_completed(&report);
    report
}

fn pass_payload(ctx: &RunContext) -> Option<SuccessPayload> {
    ctx.satellite_pass_info
        .clone()
        .map(SuccessPayload::SatellitePasses)
}

fn skip(ctx: &mut RunContext, stages: &[Stage], status: &dyn StatusReporter) {
    for &stage in stages {
        ctx.mark(stage, StageStatus::Failure(FailureCause::Skipped));
        status.show_skipped(stage);
    }
}

fn fail_analysis(ctx: &mut RunContext, status: &dyn StatusReporter) -> Halt {
    ctx.mark(Stage::BurnAnalysis, StageStatus::Failure(FailureCause::Error));
    status.show_failure(Stage::BurnAnalysis);
    skip(ctx, &[Stage::Ecoclass, Stage::Rangeland], status);
    Halt::AnalysisFailed
}

fn fire_not_found(ctx: &mut RunContext, status: &dyn StatusReporter) -> Halt {
    ctx.mark(
        Stage::BurnAnalysis,
        StageStatus::Failure(FailureCause::NothingFound),
    );
    status.notify_fire_not_found();
    skip(ctx, &[Stage::Ecoclass, Stage::Rangeland], status);
    Halt::FireNotFound
}

fn settle(
    run_id: &str,
    stage: Stage,
    result: ServiceResult<serde_json::Value>,
    status: &dyn StatusReporter,
) -> StageStatus {
    match result {
        Ok(payload) => {
            status.show_success(stage, Some(SuccessPayload::Analysis(payload)));
            StageStatus::Success
        }
        Err(e) => {
            warn!(run_id, ?stage, error = %e, "secondary analysis failed");
            status.show_failure(stage);
            StageStatus::Failure(FailureCause::Error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AoiSelection, BurnAnalysisResult, DrawnShape, MetadataForm, SeedPoint, SeedPoints,
        SubmissionMetadata, WorkflowEvent, PROBLEM_DATE_ORDER,
    };
    use crate::orchestrator::{seed_point_channel, SeedPointTrigger};
    use crate::reporter::EventReporter;
    use crate::service::mock::{
        pass_info, Call, MockAnalysisService, AOI_GEOJSON, REFINED_GEOJSON,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{mpsc, Notify};

    fn cfg() -> RunConfig {
        RunConfig {
            base_url: "http://service".to_string(),
            tileserver_url: "https://tiles.example.com".to_string(),
            cog_tileserver_prefix: "https://cog.example.com/tiles?url=".to_string(),
            request_timeout: Duration::from_secs(5),
            user_agent: "burn-workflow/test".to_string(),
        }
    }

    fn metadata() -> SubmissionMetadata {
        SubmissionMetadata::from_form(&MetadataForm {
            prefire_start: "2023-01-01".into(),
            prefire_end: "2023-01-15".into(),
            postfire_start: "2023-02-01".into(),
            postfire_end: "2023-02-15".into(),
            fire_event_name: "TestFire".into(),
            affiliation: "org".into(),
        })
    }

    fn shapefile_submission() -> Submission {
        let mut aoi = AoiSelection::default();
        aoi.on_shapefiles_selected(vec!["fire.zip".into()]);
        Submission {
            metadata: metadata(),
            aoi,
        }
    }

    fn drawn_submission() -> Submission {
        let mut aoi = AoiSelection::default();
        aoi.on_aoi_drawn(DrawnShape {
            geojson: r#"{"type":"FeatureCollection","features":[]}"#.into(),
        });
        Submission {
            metadata: metadata(),
            aoi,
        }
    }

    fn harness() -> (
        EventReporter,
        mpsc::UnboundedReceiver<WorkflowEvent>,
        SeedPointTrigger,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (trigger, listener) = seed_point_channel();
        (EventReporter::new(tx, listener), rx, trigger)
    }

    fn seeds() -> SeedPoints {
        SeedPoints(vec![SeedPoint {
            lon: -120.0,
            lat: 38.0,
        }])
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WorkflowEvent>) -> Vec<WorkflowEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn skipped(events: &[WorkflowEvent]) -> Vec<Stage> {
        events
            .iter()
            .filter_map(|e| match e {
                WorkflowEvent::StageSkipped { stage } => Some(*stage),
                _ => None,
            })
            .collect()
    }

    fn is_secondary(c: &Call) -> bool {
        matches!(c, Call::Ecoclass { .. } | Call::Rangeland { .. })
    }

    #[tokio::test]
    async fn missing_aoi_is_rejected_without_remote_calls() {
        let orch = WorkflowOrchestrator::new(MockAnalysisService::happy(), cfg());
        let (reporter, mut rx, _trigger) = harness();
        let submission = Submission {
            metadata: metadata(),
            aoi: AoiSelection::default(),
        };

        let report = orch.run(&submission, &reporter, &reporter).await;

        assert_eq!(
            report.outcome,
            RunOutcome::Rejected {
                reason: PROBLEM_NO_AOI.to_string()
            }
        );
        assert!(orch.service().calls().is_empty());
        assert_eq!(report.stages, StageStatuses::default());
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, WorkflowEvent::Rejected { problem }
                if problem == PROBLEM_NO_AOI)));
        assert!(!events
            .iter()
            .any(|e| matches!(e, WorkflowEvent::StageLoading { .. })));
    }

    #[tokio::test]
    async fn invalid_metadata_surfaces_first_problem() {
        let orch = WorkflowOrchestrator::new(MockAnalysisService::happy(), cfg());
        let (reporter, _rx, _trigger) = harness();
        let mut submission = shapefile_submission();
        submission.metadata.prefire_end = submission.metadata.prefire_start;

        let report = orch.run(&submission, &reporter, &reporter).await;

        assert_eq!(
            report.outcome,
            RunOutcome::Rejected {
                reason: PROBLEM_DATE_ORDER.to_string()
            }
        );
        assert!(orch.service().calls().is_empty());
    }

    #[tokio::test]
    async fn upload_failure_skips_downstream_stages() {
        let mut service = MockAnalysisService::happy();
        service.upload = None;
        let orch = WorkflowOrchestrator::new(service, cfg());
        let (reporter, mut rx, _trigger) = harness();

        let report = orch.run(&shapefile_submission(), &reporter, &reporter).await;

        assert_eq!(report.outcome, RunOutcome::UploadFailed);
        assert_eq!(
            report.stages.upload,
            StageStatus::Failure(FailureCause::Error)
        );
        for stage in [Stage::BurnAnalysis, Stage::Ecoclass, Stage::Rangeland] {
            assert_eq!(
                report.stages.get(stage),
                StageStatus::Failure(FailureCause::Skipped)
            );
        }
        let events = drain(&mut rx);
        assert_eq!(
            skipped(&events),
            vec![Stage::BurnAnalysis, Stage::Ecoclass, Stage::Rangeland]
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, WorkflowEvent::UploadFailed)));
        assert_eq!(
            orch.service().calls(),
            vec![Call::UploadShapefile {
                file_name: "fire.zip".into()
            }]
        );
    }

    #[tokio::test]
    async fn shapefile_path_goes_straight_to_secondary_analyses() {
        let orch = WorkflowOrchestrator::new(MockAnalysisService::happy(), cfg());
        let (reporter, mut rx, _trigger) = harness();

        let report = orch.run(&shapefile_submission(), &reporter, &reporter).await;

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.stages.burn_analysis, StageStatus::Success);
        assert_eq!(report.boundary_geojson.as_deref(), Some(AOI_GEOJSON));
        assert_eq!(report.satellite_pass_info, Some(pass_info()));

        let calls = orch.service().calls();
        assert_eq!(calls[0], Call::UploadShapefile { file_name: "fire.zip".into() });
        assert_eq!(
            calls[1],
            Call::AnalyzeBurn {
                geojson: AOI_GEOJSON.into(),
                derive_boundary: false
            }
        );
        assert!(calls[2..4].iter().all(is_secondary));
        assert_eq!(calls[4], Call::ListProducts);
        assert!(!calls.iter().any(|c| matches!(c, Call::Refine { .. })));

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            WorkflowEvent::BoundaryPublished { provisional: false, .. }
        )));
        assert!(!events
            .iter()
            .any(|e| matches!(e, WorkflowEvent::IntermediateImageryPublished { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            WorkflowEvent::StageSucceeded {
                stage: Stage::BurnAnalysis,
                payload: Some(SuccessPayload::SatellitePasses(_))
            }
        )));
        assert_eq!(report.map_links.len(), 2);
        assert_eq!(
            report.map_links[0].url,
            "https://tiles.example.com/map/org/TestFire/rbr"
        );
        assert_eq!(report.products.len(), 1);
    }

    #[tokio::test]
    async fn shapefile_path_treats_no_content_as_success() {
        let mut service = MockAnalysisService::happy();
        service.burn = BurnAnalysisResult::nothing_found();
        let orch = WorkflowOrchestrator::new(service, cfg());
        let (reporter, _rx, _trigger) = harness();

        let report = orch.run(&shapefile_submission(), &reporter, &reporter).await;

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.stages.burn_analysis, StageStatus::Success);
    }

    #[tokio::test]
    async fn burn_analysis_not_executed_aborts_run() {
        let mut service = MockAnalysisService::happy();
        service.burn = BurnAnalysisResult::not_executed();
        let orch = WorkflowOrchestrator::new(service, cfg());
        let (reporter, mut rx, _trigger) = harness();

        let report = orch.run(&shapefile_submission(), &reporter, &reporter).await;

        assert_eq!(report.outcome, RunOutcome::AnalysisFailed);
        assert_eq!(
            report.stages.burn_analysis,
            StageStatus::Failure(FailureCause::Error)
        );
        assert_eq!(orch.service().count(is_secondary), 0);
        assert_eq!(orch.service().count(|c| *c == Call::ListProducts), 0);
        assert_eq!(
            skipped(&drain(&mut rx)),
            vec![Stage::Ecoclass, Stage::Rangeland]
        );
    }

    #[tokio::test]
    async fn drawn_path_waits_for_seed_points_and_resumes_once() {
        let orch = WorkflowOrchestrator::new(MockAnalysisService::happy(), cfg());
        let (reporter, mut rx, trigger) = harness();
        let submission = drawn_submission();

        let run = orch.run(&submission, &reporter, &reporter);
        let driver = async {
            loop {
                match rx.recv().await {
                    Some(WorkflowEvent::IntermediateImageryPublished { url }) => {
                        assert_eq!(
                            url,
                            "https://cog.example.com/tiles?url=public/org/TestFire/rbr.tif"
                        );
                        break;
                    }
                    Some(WorkflowEvent::RunCompleted { .. }) | None => {
                        panic!("run ended before imagery was published")
                    }
                    Some(_) => {}
                }
            }
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
            assert_eq!(orch.service().count(|c| matches!(c, Call::Refine { .. })), 0);
            assert_eq!(orch.service().count(is_secondary), 0);

            assert!(trigger.submit(seeds()));
            assert!(!trigger.submit(seeds()));
        };
        let (report, ()) = tokio::join!(run, driver);

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(
            orch.service().count(|c| matches!(c, Call::Refine { .. })),
            1
        );
        assert_eq!(report.boundary_geojson.as_deref(), Some(REFINED_GEOJSON));
        assert_eq!(report.stages.burn_analysis, StageStatus::Success);
        assert_eq!(
            orch.service().count(|c| *c
                == Call::Ecoclass {
                    boundary: REFINED_GEOJSON.into()
                }),
            1
        );
        assert!(orch.service().calls().contains(&Call::AnalyzeBurn {
            geojson: AOI_GEOJSON.into(),
            derive_boundary: true
        }));

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, WorkflowEvent::IntermediateImageryRemoved)));
        assert!(events.iter().any(|e| matches!(
            e,
            WorkflowEvent::BoundaryPublished { geojson, provisional: false }
                if geojson == REFINED_GEOJSON
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            WorkflowEvent::StageSucceeded {
                stage: Stage::BurnAnalysis,
                payload: Some(SuccessPayload::SatellitePasses(_))
            }
        )));
    }

    #[tokio::test]
    async fn drawn_aoi_is_published_as_provisional() {
        let orch = WorkflowOrchestrator::new(MockAnalysisService::happy(), cfg());
        let (reporter, mut rx, trigger) = harness();
        trigger.submit(seeds());

        orch.run(&drawn_submission(), &reporter, &reporter).await;

        let first_boundary = drain(&mut rx).into_iter().find_map(|e| match e {
            WorkflowEvent::BoundaryPublished { provisional, .. } => Some(provisional),
            _ => None,
        });
        assert_eq!(first_boundary, Some(true));
    }

    #[tokio::test]
    async fn refinement_without_detection_ends_in_fire_not_found() {
        let mut service = MockAnalysisService::happy();
        service.refine = crate::model::RefinementResult::not_detected();
        let orch = WorkflowOrchestrator::new(service, cfg());
        let (reporter, mut rx, trigger) = harness();
        trigger.submit(seeds());

        let report = orch.run(&drawn_submission(), &reporter, &reporter).await;

        assert_eq!(report.outcome, RunOutcome::FireNotFound);
        assert_eq!(
            report.stages.burn_analysis,
            StageStatus::Failure(FailureCause::NothingFound)
        );
        assert_eq!(orch.service().count(is_secondary), 0);
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, WorkflowEvent::FireNotFound)));
        assert!(!events.iter().any(|e| matches!(
            e,
            WorkflowEvent::StageFailed {
                stage: Stage::BurnAnalysis
            }
        )));
    }

    #[tokio::test]
    async fn refinement_not_executed_is_analysis_failure() {
        let mut service = MockAnalysisService::happy();
        service.refine = crate::model::RefinementResult::not_executed();
        let orch = WorkflowOrchestrator::new(service, cfg());
        let (reporter, _rx, trigger) = harness();
        trigger.submit(seeds());

        let report = orch.run(&drawn_submission(), &reporter, &reporter).await;

        assert_eq!(report.outcome, RunOutcome::AnalysisFailed);
        assert_eq!(orch.service().count(is_secondary), 0);
    }

    #[tokio::test]
    async fn drawn_path_without_imagery_is_fire_not_found() {
        let mut service = MockAnalysisService::happy();
        service.burn = BurnAnalysisResult::nothing_found();
        let orch = WorkflowOrchestrator::new(service, cfg());
        let (reporter, _rx, _trigger) = harness();

        let report = orch.run(&drawn_submission(), &reporter, &reporter).await;

        assert_eq!(report.outcome, RunOutcome::FireNotFound);
        assert_eq!(orch.service().count(|c| matches!(c, Call::Refine { .. })), 0);
    }

    #[tokio::test]
    async fn closed_seed_source_fails_the_analysis() {
        let orch = WorkflowOrchestrator::new(MockAnalysisService::happy(), cfg());
        let (reporter, _rx, trigger) = harness();
        drop(trigger);

        let report = orch.run(&drawn_submission(), &reporter, &reporter).await;

        assert_eq!(report.outcome, RunOutcome::AnalysisFailed);
        assert_eq!(orch.service().count(|c| matches!(c, Call::Refine { .. })), 0);
    }

    #[tokio::test]
    async fn secondary_failure_is_isolated_to_its_subtask() {
        let mut service = MockAnalysisService::happy();
        service.ecoclass_ok = false;
        let orch = WorkflowOrchestrator::new(service, cfg());
        let (reporter, mut rx, _trigger) = harness();

        let report = orch.run(&shapefile_submission(), &reporter, &reporter).await;

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(
            report.stages.ecoclass,
            StageStatus::Failure(FailureCause::Error)
        );
        assert_eq!(report.stages.rangeland, StageStatus::Success);
        assert_eq!(orch.service().count(|c| *c == Call::ListProducts), 1);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            WorkflowEvent::StageFailed {
                stage: Stage::Ecoclass
            }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            WorkflowEvent::StageSucceeded {
                stage: Stage::Rangeland,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn rangeland_failure_leaves_ecoclass_result_intact() {
        let mut service = MockAnalysisService::happy();
        service.rangeland_ok = false;
        let orch = WorkflowOrchestrator::new(service, cfg());
        let (reporter, mut rx, _trigger) = harness();

        let report = orch.run(&shapefile_submission(), &reporter, &reporter).await;

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.stages.ecoclass, StageStatus::Success);
        assert_eq!(
            report.stages.rangeland,
            StageStatus::Failure(FailureCause::Error)
        );
        assert_eq!(orch.service().count(|c| *c == Call::ListProducts), 1);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            WorkflowEvent::StageFailed {
                stage: Stage::Rangeland
            }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            WorkflowEvent::StageSucceeded {
                stage: Stage::Ecoclass,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn secondary_analyses_run_concurrently() {
        let mut service = MockAnalysisService::happy();
        service.secondary_gate = Some(Arc::new(Notify::new()));
        let orch = WorkflowOrchestrator::new(service, cfg());
        let (reporter, _rx, _trigger) = harness();
        let submission = shapefile_submission();

        // Ecoclass only finishes once rangeland is in flight, so awaiting them
        // one after the other never completes.
        let report = tokio::time::timeout(
            Duration::from_secs(2),
            orch.run(&submission, &reporter, &reporter),
        )
        .await
        .expect("secondary analyses were not dispatched concurrently");

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.stages.ecoclass, StageStatus::Success);
        assert_eq!(report.stages.rangeland, StageStatus::Success);
    }

    #[tokio::test]
    async fn product_listing_failure_does_not_touch_stages() {
        let mut service = MockAnalysisService::happy();
        service.products = None;
        let orch = WorkflowOrchestrator::new(service, cfg());
        let (reporter, mut rx, _trigger) = harness();

        let report = orch.run(&shapefile_submission(), &reporter, &reporter).await;

        assert_eq!(report.outcome, RunOutcome::Completed);
        for stage in Stage::ALL {
            assert_eq!(report.stages.get(stage), StageStatus::Success);
        }
        assert!(report.map_links.is_empty());
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, WorkflowEvent::ProductsFailed)));
    }

    #[tokio::test]
    async fn second_submission_is_rejected_while_a_run_is_active() {
        let orch = WorkflowOrchestrator::new(MockAnalysisService::happy(), cfg());
        let (reporter, mut rx, trigger) = harness();
        let (other_reporter, _other_rx, _other_trigger) = harness();
        let first = drawn_submission();
        let second = shapefile_submission();

        let run = orch.run(&first, &reporter, &reporter);
        let driver = async {
            while let Some(ev) = rx.recv().await {
                if matches!(ev, WorkflowEvent::IntermediateImageryPublished { .. }) {
                    break;
                }
            }
            let rejected = orch.run(&second, &other_reporter, &other_reporter).await;
            assert_eq!(
                rejected.outcome,
                RunOutcome::Rejected {
                    reason: PROBLEM_RUN_IN_PROGRESS.to_string()
                }
            );
            assert_eq!(
                orch.service()
                    .count(|c| matches!(c, Call::UploadShapefile { .. })),
                0
            );
            trigger.submit(seeds());
        };
        let (report, ()) = tokio::join!(run, driver);
        assert_eq!(report.outcome, RunOutcome::Completed);

        let (again, _rx, _trigger) = harness();
        let next = orch.run(&second, &again, &again).await;
        assert_eq!(next.outcome, RunOutcome::Completed);
    }
}
