use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

pub const PROBLEM_INVALID_DATES: &str = "Please enter valid dates";
pub const PROBLEM_DATE_ORDER: &str = "Please enter valid date ranges";
pub const PROBLEM_MISSING_NAME: &str = "Please enter a fire event name";
pub const PROBLEM_NO_AOI: &str = "Please upload a shapefile or draw an AOI";
pub const PROBLEM_RUN_IN_PROGRESS: &str = "A submission is already in progress";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub base_url: String,
    pub tileserver_url: String,
    pub cog_tileserver_prefix: String,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub user_agent: String,
}

/// Raw form values as entered by the user, before any parsing.
#[derive(Debug, Clone, Default)]
pub struct MetadataForm {
    pub prefire_start: String,
    pub prefire_end: String,
    pub postfire_start: String,
    pub postfire_end: String,
    pub fire_event_name: String,
    pub affiliation: String,
}

/// Parse a form date. Accepts `YYYY-MM-DD` or a full RFC3339 timestamp.
pub fn parse_date(raw: &str) -> Option<Date> {
    let raw = raw.trim();
    Date::parse(raw, format_description!("[year]-[month]-[day]"))
        .ok()
        .or_else(|| OffsetDateTime::parse(raw, &Rfc3339).ok().map(|t| t.date()))
}

/// Time window and identifiers for one analysis run.
///
/// Dates that failed to parse are kept as `None` so that [`problems`](Self::problems)
/// can report them instead of the constructor failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionMetadata {
    pub prefire_start: Option<Date>,
    pub prefire_end: Option<Date>,
    pub postfire_start: Option<Date>,
    pub postfire_end: Option<Date>,
    pub fire_event_name: String,
    pub affiliation: String,
}

/// Fully parsed pre/post fire windows, each `(start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRanges {
    pub prefire: (Date, Date),
    pub postfire: (Date, Date),
}

impl SubmissionMetadata {
    pub fn from_form(form: &MetadataForm) -> Self {
        Self {
            prefire_start: parse_date(&form.prefire_start),
            prefire_end: parse_date(&form.prefire_end),
            postfire_start: parse_date(&form.postfire_start),
            postfire_end: parse_date(&form.postfire_end),
            fire_event_name: form.fire_event_name.trim().to_string(),
            affiliation: form.affiliation.trim().to_string(),
        }
    }

    /// All four dates, if every one of them parsed.
    pub fn date_ranges(&self) -> Option<DateRanges> {
        Some(DateRanges {
            prefire: (self.prefire_start?, self.prefire_end?),
            postfire: (self.postfire_start?, self.postfire_end?),
        })
    }

    /// Ordered list of human readable problems; empty means the metadata is valid.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        match self.date_ranges() {
            None => problems.push(PROBLEM_INVALID_DATES.to_string()),
            Some(r) => {
                // Equal endpoints are rejected as well as reversed ones.
                let ordered = r.prefire.0 < r.prefire.1
                    && r.prefire.1 < r.postfire.0
                    && r.postfire.0 < r.postfire.1;
                if !ordered {
                    problems.push(PROBLEM_DATE_ORDER.to_string());
                }
            }
        }

        if self.fire_event_name.is_empty() {
            problems.push(PROBLEM_MISSING_NAME.to_string());
        }

        problems
    }

    pub fn first_problem(&self) -> Option<String> {
        self.problems().into_iter().next()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AoiKind {
    Drawn,
    Uploaded,
}

impl AoiKind {
    /// Drawn AOIs are only an approximation; the final boundary is derived later.
    pub fn is_provisional(self) -> bool {
        matches!(self, AoiKind::Drawn)
    }
}

/// Geometry serialized from the map's editable layer set (a GeoJSON string).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawnShape {
    pub geojson: String,
}

/// A zipped ESRI shapefile selected for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapefileArchive {
    pub path: PathBuf,
}

impl ShapefileArchive {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "shapefile.zip".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AreaOfInterestSource {
    Drawn(DrawnShape),
    Uploaded(ShapefileArchive),
}

impl AreaOfInterestSource {
    pub fn kind(&self) -> AoiKind {
        match self {
            AreaOfInterestSource::Drawn(_) => AoiKind::Drawn,
            AreaOfInterestSource::Uploaded(_) => AoiKind::Uploaded,
        }
    }
}

/// Tracks the two independent "AOI supplied" signals raised by the UI.
#[derive(Debug, Clone, Default)]
pub struct AoiSelection {
    drawn: Option<DrawnShape>,
    shapefiles: Vec<PathBuf>,
}

impl AoiSelection {
    pub fn on_aoi_drawn(&mut self, shape: DrawnShape) {
        self.drawn = Some(shape);
    }

    pub fn on_shapefiles_selected(&mut self, files: Vec<PathBuf>) {
        self.shapefiles = files;
    }

    /// The drawn shape wins when both were supplied; otherwise the first selected archive.
    pub fn source(&self) -> Option<AreaOfInterestSource> {
        if let Some(shape) = &self.drawn {
            return Some(AreaOfInterestSource::Drawn(shape.clone()));
        }
        self.shapefiles.first().map(|path| {
            AreaOfInterestSource::Uploaded(ShapefileArchive { path: path.clone() })
        })
    }
}

/// One user submission: metadata plus whatever AOI the UI collected.
#[derive(Debug, Clone)]
pub struct Submission {
    pub metadata: SubmissionMetadata,
    pub aoi: AoiSelection,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeedPoint {
    pub lon: f64,
    pub lat: f64,
}

/// Seed markers placed on the intermediate imagery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedPoints(pub Vec<SeedPoint>);

impl SeedPoints {
    /// Export the markers as a GeoJSON FeatureCollection of points.
    pub fn to_geojson(&self) -> serde_json::Value {
        let features: Vec<serde_json::Value> = self
            .0
            .iter()
            .map(|p| {
                serde_json::json!({
                    "type": "Feature",
                    "properties": {},
                    "geometry": { "type": "Point", "coordinates": [p.lon, p.lat] },
                })
            })
            .collect();
        serde_json::json!({ "type": "FeatureCollection", "features": features })
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub geojson: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SatellitePassInfo {
    pub n_prefire_passes: u32,
    pub n_postfire_passes: u32,
    #[serde(default)]
    pub latest_pass: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BurnAnalysisResult {
    pub executed: bool,
    pub fire_found: bool,
    pub satellite_pass_info: Option<SatellitePassInfo>,
    pub cloud_cog_paths: Option<BTreeMap<String, String>>,
    pub derived_boundary: Option<String>,
}

impl BurnAnalysisResult {
    pub fn not_executed() -> Self {
        Self::default()
    }

    /// The service ran but produced nothing usable.
    pub fn nothing_found() -> Self {
        Self {
            executed: true,
            ..Self::default()
        }
    }

    pub fn cog_path(&self, product: &str) -> Option<&str> {
        self.cloud_cog_paths
            .as_ref()
            .and_then(|paths| paths.get(product))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefinementResult {
    pub executed: bool,
    pub fire_detected: bool,
    pub derived_boundary: Option<String>,
}

impl RefinementResult {
    pub fn not_executed() -> Self {
        Self::default()
    }

    pub fn not_detected() -> Self {
        Self {
            executed: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub product_type: String,
    pub url: String,
}

/// Display link for one product family on the tileserver map page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapLink {
    pub product: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Upload,
    BurnAnalysis,
    Ecoclass,
    Rangeland,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Upload,
        Stage::BurnAnalysis,
        Stage::Ecoclass,
        Stage::Rangeland,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Stage::Upload => "Upload",
            Stage::BurnAnalysis => "Burn analysis",
            Stage::Ecoclass => "Ecoclass analysis",
            Stage::Rangeland => "Rangeland Analysis Platform query",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// The stage itself ran and failed.
    Error,
    /// Never ran because an upstream stage failed.
    Skipped,
    /// Ran correctly but found no fire.
    NothingFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Success,
    Failure(FailureCause),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStatuses {
    pub upload: StageStatus,
    pub burn_analysis: StageStatus,
    pub ecoclass: StageStatus,
    pub rangeland: StageStatus,
}

impl Default for StageStatuses {
    fn default() -> Self {
        Self {
            upload: StageStatus::Pending,
            burn_analysis: StageStatus::Pending,
            ecoclass: StageStatus::Pending,
            rangeland: StageStatus::Pending,
        }
    }
}

impl StageStatuses {
    pub fn get(&self, stage: Stage) -> StageStatus {
        match stage {
            Stage::Upload => self.upload,
            Stage::BurnAnalysis => self.burn_analysis,
            Stage::Ecoclass => self.ecoclass,
            Stage::Rangeland => self.rangeland,
        }
    }

    pub fn set(&mut self, stage: Stage, status: StageStatus) {
        match stage {
            Stage::Upload => self.upload = status,
            Stage::BurnAnalysis => self.burn_analysis = status,
            Stage::Ecoclass => self.ecoclass = status,
            Stage::Rangeland => self.rangeland = status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Rejected { reason: String },
    UploadFailed,
    AnalysisFailed,
    FireNotFound,
    Completed,
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Rejected { .. } => "rejected",
            RunOutcome::UploadFailed => "upload failed",
            RunOutcome::AnalysisFailed => "analysis failed",
            RunOutcome::FireNotFound => "fire not found",
            RunOutcome::Completed => "completed",
        }
    }
}

/// Optional detail attached to a stage success notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SuccessPayload {
    SatellitePasses(SatellitePassInfo),
    Analysis(serde_json::Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkflowEvent {
    StageLoading {
        stage: Stage,
    },
    StageSucceeded {
        stage: Stage,
        payload: Option<SuccessPayload>,
    },
    StageFailed {
        stage: Stage,
    },
    StageSkipped {
        stage: Stage,
    },
    Rejected {
        problem: String,
    },
    UploadFailed,
    FireNotFound,
    ProductsFailed,
    BoundaryPublished {
        geojson: String,
        provisional: bool,
    },
    IntermediateImageryPublished {
        url: String,
    },
    IntermediateImageryRemoved,
    ProductsPublished {
        products: Vec<Product>,
        links: Vec<MapLink>,
    },
    Info(InfoEvent),
    RunCompleted {
        // Boxed to keep WorkflowEvent small.
        report: Box<RunReport>,
    },
}

/// Structured info events emitted by the orchestrator and consumed by UI/CLI layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InfoEvent {
    Message(String),
    AwaitingSeedPoints,
    SeedPointsReceived { count: usize },
}

impl InfoEvent {
    /// Render a human-readable message for UI/CLI layers.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::AwaitingSeedPoints => {
                "Waiting for seed points on the intermediate burn imagery".to_string()
            }
            InfoEvent::SeedPointsReceived { count } => {
                format!("Received {} seed point(s), refining boundary", count)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_utc: String,
    #[serde(default)]
    pub finished_utc: String,
    pub fire_event_name: String,
    pub affiliation: String,
    pub aoi_kind: Option<AoiKind>,
    pub outcome: RunOutcome,
    pub stages: StageStatuses,
    #[serde(default)]
    pub boundary_geojson: Option<String>,
    #[serde(default)]
    pub satellite_pass_info: Option<SatellitePassInfo>,
    #[serde(default)]
    pub products: Vec<Product>,
    #[serde(default)]
    pub map_links: Vec<MapLink>,
}

/// Current UTC time as RFC3339.
pub fn now_utc() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "now".into())
}
