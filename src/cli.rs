use crate::model::{
    AoiSelection, DrawnShape, MetadataForm, RunConfig, RunOutcome, RunReport, SeedPoint,
    SeedPoints, Submission, SubmissionMetadata, WorkflowEvent,
};
use crate::orchestrator::{
    export_report, seed_point_channel, SeedPointTrigger, WorkflowOrchestrator,
};
use crate::reporter::EventReporter;
use crate::service::HttpAnalysisClient;
use anyhow::{Context, Result};
use clap::Parser;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

const DEFAULT_COG_PREFIX: &str = "http://localhost:8080/cog/tiles/WebMercatorQuad/{z}/{x}/{y}.png?nodata=-99&return_mask=true&url=";

#[derive(Debug, Parser, Clone)]
#[command(
    name = "burn-workflow",
    version,
    about = "Run a burn severity analysis against the remote analysis service"
)]
pub struct Cli {
    /// Root URL of the analysis service
    #[arg(long, default_value = "http://localhost:8080")]
    pub base_url: String,

    /// Base URL used to build map links for derived products
    #[arg(long, default_value = "http://localhost:8080")]
    pub tileserver_url: String,

    /// Prefix prepended to a cloud-optimized raster path to display it
    #[arg(long, default_value = DEFAULT_COG_PREFIX)]
    pub cog_tileserver_prefix: String,

    /// Per-request timeout (burn analysis can take minutes)
    #[arg(long, default_value = "15m")]
    pub request_timeout: humantime::Duration,

    /// Start of the prefire window (YYYY-MM-DD)
    #[arg(long, default_value_t)]
    pub prefire_start: String,

    /// End of the prefire window (YYYY-MM-DD)
    #[arg(long, default_value_t)]
    pub prefire_end: String,

    /// Start of the postfire window (YYYY-MM-DD)
    #[arg(long, default_value_t)]
    pub postfire_start: String,

    /// End of the postfire window (YYYY-MM-DD)
    #[arg(long, default_value_t)]
    pub postfire_end: String,

    /// Name of the fire event
    #[arg(long, default_value_t)]
    pub fire_event_name: String,

    /// Affiliation the results are stored under
    #[arg(long, default_value_t)]
    pub affiliation: String,

    /// GeoJSON file with a hand-drawn area of interest (takes precedence over --shapefile)
    #[arg(long)]
    pub drawn_aoi: Option<PathBuf>,

    /// Zipped shapefile with the fire boundary; only the first one is used
    #[arg(long)]
    pub shapefile: Vec<PathBuf>,

    /// Seed point as lon,lat for boundary refinement (repeatable)
    #[arg(long, value_parser = parse_seed_point, allow_hyphen_values = true)]
    pub seed: Vec<SeedPoint>,

    /// GeoJSON file of Point features to use as seed points
    #[arg(long, conflicts_with = "seed")]
    pub seed_points: Option<PathBuf>,

    /// Print the JSON run report and exit
    #[arg(long)]
    pub json: bool,

    /// Print a text summary and exit (default)
    #[arg(long)]
    pub text: bool,

    /// Run silently: suppress all output except errors (for cron usage)
    #[arg(long)]
    pub silent: bool,

    /// Export the run report as JSON
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Enable debug logging on stderr
    #[arg(long, short)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Silent,
    Json,
    Text,
}

pub async fn run(args: Cli) -> Result<()> {
    // Validate that --silent can only be used with --json
    if args.silent && !args.json {
        return Err(anyhow::anyhow!(
            "--silent can only be used with --json. Use --silent --json together."
        ));
    }

    let mode = if args.silent {
        Mode::Silent
    } else if args.json {
        Mode::Json
    } else {
        Mode::Text
    };
    run_workflow(args, mode).await
}

/// Build a `RunConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> RunConfig {
    RunConfig {
        base_url: args.base_url.clone(),
        tileserver_url: args.tileserver_url.clone(),
        cog_tileserver_prefix: args.cog_tileserver_prefix.clone(),
        request_timeout: Duration::from(args.request_timeout),
        user_agent: format!("burn-workflow/{}", env!("CARGO_PKG_VERSION")),
    }
}

/// Collect form values and the AOI from the command line.
fn build_submission(args: &Cli) -> Result<Submission> {
    let metadata = SubmissionMetadata::from_form(&MetadataForm {
        prefire_start: args.prefire_start.clone(),
        prefire_end: args.prefire_end.clone(),
        postfire_start: args.postfire_start.clone(),
        postfire_end: args.postfire_end.clone(),
        fire_event_name: args.fire_event_name.clone(),
        affiliation: args.affiliation.clone(),
    });

    let mut aoi = AoiSelection::default();
    if !args.shapefile.is_empty() {
        aoi.on_shapefiles_selected(args.shapefile.clone());
    }
    if let Some(p) = args.drawn_aoi.as_deref() {
        let geojson = std::fs::read_to_string(p)
            .with_context(|| format!("failed to read drawn AOI {}", p.display()))?;
        aoi.on_aoi_drawn(DrawnShape { geojson });
    }

    Ok(Submission { metadata, aoi })
}

/// Seed points given up front, if any.
fn preset_seed_points(args: &Cli) -> Result<Option<SeedPoints>> {
    if !args.seed.is_empty() {
        return Ok(Some(SeedPoints(args.seed.clone())));
    }
    let Some(p) = args.seed_points.as_deref() else {
        return Ok(None);
    };
    let raw = std::fs::read_to_string(p)
        .with_context(|| format!("failed to read seed points {}", p.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not valid JSON", p.display()))?;
    let seeds = seed_points_from_geojson(&value)?;
    anyhow::ensure!(!seeds.is_empty(), "{} contains no Point features", p.display());
    Ok(Some(seeds))
}

fn parse_seed_point(s: &str) -> std::result::Result<SeedPoint, String> {
    let (lon, lat) = s
        .split_once(',')
        .ok_or_else(|| format!("expected lon,lat but got {s:?}"))?;
    let lon: f64 = lon
        .trim()
        .parse()
        .map_err(|_| format!("invalid longitude {lon:?}"))?;
    let lat: f64 = lat
        .trim()
        .parse()
        .map_err(|_| format!("invalid latitude {lat:?}"))?;
    if !(-180.0..=180.0).contains(&lon) || !(-90.0..=90.0).contains(&lat) {
        return Err(format!("coordinates out of range: {lon},{lat}"));
    }
    Ok(SeedPoint { lon, lat })
}

/// Parse `lon,lat[;lon,lat...]` as typed at the seed prompt.
fn parse_seed_list(s: &str) -> std::result::Result<SeedPoints, String> {
    let points = s
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(parse_seed_point)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if points.is_empty() {
        return Err("at least one seed point is required".to_string());
    }
    Ok(SeedPoints(points))
}

/// Accepts a FeatureCollection, a single Feature or a bare Point geometry.
fn seed_points_from_geojson(value: &serde_json::Value) -> Result<SeedPoints> {
    fn point(geometry: &serde_json::Value) -> Option<SeedPoint> {
        if geometry.get("type")?.as_str()? != "Point" {
            return None;
        }
        let coords = geometry.get("coordinates")?.as_array()?;
        Some(SeedPoint {
            lon: coords.first()?.as_f64()?,
            lat: coords.get(1)?.as_f64()?,
        })
    }

    let points = match value.get("type").and_then(|t| t.as_str()) {
        Some("FeatureCollection") => value
            .get("features")
            .and_then(|f| f.as_array())
            .context("FeatureCollection without features")?
            .iter()
            .filter_map(|f| f.get("geometry").and_then(point))
            .collect(),
        Some("Feature") => value.get("geometry").and_then(point).into_iter().collect(),
        Some("Point") => point(value).into_iter().collect(),
        other => anyhow::bail!("unsupported GeoJSON type {other:?} for seed points"),
    };
    Ok(SeedPoints(points))
}

/// Prompt on stderr and read seed points from stdin until a valid line or EOF.
/// Dropping the trigger on EOF ends the run's wait.
fn prompt_seed_points(trigger: SeedPointTrigger, out: mpsc::UnboundedSender<OutputLine>) {
    let _ = out.send(OutputLine::Stderr(
        "Enter seed points as lon,lat[;lon,lat...]:".to_string(),
    ));
    for line in std::io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        match parse_seed_list(&line) {
            Ok(seeds) => {
                trigger.submit(seeds);
                return;
            }
            Err(e) => {
                let _ = out.send(OutputLine::Stderr(format!("{e}; try again:")));
            }
        }
    }
    warn!("stdin closed before seed points were entered");
}

/// One status line for text mode, or `None` for events that print nothing.
fn describe_event(ev: &WorkflowEvent) -> Option<String> {
    Some(match ev {
        WorkflowEvent::StageLoading { stage } => format!("{}: running", stage.label()),
        WorkflowEvent::StageSucceeded { stage, .. } => format!("{}: ok", stage.label()),
        WorkflowEvent::StageFailed { stage } => format!("{}: failed", stage.label()),
        WorkflowEvent::StageSkipped { stage } => format!("{}: skipped", stage.label()),
        WorkflowEvent::Rejected { problem } => format!("Submission rejected: {problem}"),
        WorkflowEvent::UploadFailed => "The AOI upload failed".to_string(),
        WorkflowEvent::FireNotFound => "No fire was found for this event".to_string(),
        WorkflowEvent::ProductsFailed => "Failed to list derived products".to_string(),
        WorkflowEvent::BoundaryPublished { provisional, .. } => {
            if *provisional {
                "Provisional boundary received".to_string()
            } else {
                "Fire boundary received".to_string()
            }
        }
        WorkflowEvent::IntermediateImageryPublished { url } => {
            format!("Intermediate burn imagery: {url}")
        }
        WorkflowEvent::Info(info) => info.to_message(),
        WorkflowEvent::IntermediateImageryRemoved
        | WorkflowEvent::ProductsPublished { .. }
        | WorkflowEvent::RunCompleted { .. } => return None,
    })
}

async fn run_workflow(args: Cli, mode: Mode) -> Result<()> {
    let cfg = build_config(&args);
    let submission = build_submission(&args)?;
    let mut preset = preset_seed_points(&args)?;
    let client = HttpAnalysisClient::new(&cfg).context("failed to build analysis client")?;

    let (out_tx, out_handle) = if mode == Mode::Silent {
        (None, None)
    } else {
        let (tx, handle) = spawn_output_writer();
        (Some(tx), Some(handle))
    };

    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<WorkflowEvent>();
    let (trigger, listener) = seed_point_channel();
    let mut trigger = Some(trigger);
    let reporter = EventReporter::new(evt_tx, listener);

    let orchestrator = WorkflowOrchestrator::new(client, cfg);
    let handle =
        tokio::spawn(async move { orchestrator.run(&submission, &reporter, &reporter).await });

    while let Some(ev) = evt_rx.recv().await {
        if mode == Mode::Text {
            if let (Some(tx), Some(line)) = (out_tx.as_ref(), describe_event(&ev)) {
                let _ = tx.send(OutputLine::Stderr(line));
            }
        }

        if let WorkflowEvent::IntermediateImageryPublished { .. } = ev {
            let Some(trigger) = trigger.take() else {
                continue;
            };
            if let Some(seeds) = preset.take() {
                trigger.submit(seeds);
            } else if let Some(tx) = out_tx.clone() {
                tokio::task::spawn_blocking(move || prompt_seed_points(trigger, tx));
            } else {
                warn!("no seed points supplied; refinement cannot continue in silent mode");
            }
        }
    }

    let report = handle.await.context("workflow task failed")?;

    if let Some(p) = args.export_json.as_deref() {
        export_report(p, &report)?;
    }

    if let Some(tx) = out_tx.as_ref() {
        match mode {
            Mode::Json => {
                let out = serde_json::to_string_pretty(&report)?;
                let _ = tx.send(OutputLine::Stdout(out));
            }
            Mode::Text => {
                for line in crate::text_summary::build_text_summary(&report).lines {
                    let _ = tx.send(OutputLine::Stdout(line));
                }
            }
            Mode::Silent => {}
        }
    }

    drop(out_tx);
    if let Some(handle) = out_handle {
        let _ = handle.await;
    }

    outcome_result(&report)
}

/// Anything short of a completed run is an error for the exit status.
fn outcome_result(report: &RunReport) -> Result<()> {
    match &report.outcome {
        RunOutcome::Completed => Ok(()),
        RunOutcome::Rejected { reason } => Err(anyhow::anyhow!("submission rejected: {reason}")),
        outcome => Err(anyhow::anyhow!(
            "burn workflow for {:?} ended: {}",
            report.fire_event_name,
            outcome.label()
        )),
    }
}
