use super::{
    AnalysisService, BurnAnalysisRequest, FireEvent, SecondaryRequest, ServiceError,
    ServiceResult,
};
use crate::model::{
    BurnAnalysisResult, DateRanges, DrawnShape, Product, RefinementResult, RunConfig,
    SatellitePassInfo, SeedPoints, ShapefileArchive, UploadResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, error, warn};

const UPLOAD_DRAWN_PATH: &str = "api/upload/drawn-aoi";
const UPLOAD_SHAPEFILE_PATH: &str = "api/upload/shapefile-zip";
const ANALYZE_BURN_PATH: &str = "api/analyze/spectral-burn-metrics";
const REFINE_PATH: &str = "api/refine/flood-fill-segmentation";
const ECOCLASS_PATH: &str = "api/fetch/fetch-ecoclass";
const RANGELAND_PATH: &str = "api/fetch/rangeland_analysis_platform";
const DERIVED_PRODUCTS_PATH: &str = "api/list/derived-products";

#[derive(Debug, Serialize)]
struct DateRangesBody {
    prefire: [String; 2],
    postfire: [String; 2],
}

impl From<DateRanges> for DateRangesBody {
    fn from(r: DateRanges) -> Self {
        Self {
            prefire: [r.prefire.0.to_string(), r.prefire.1.to_string()],
            postfire: [r.postfire.0.to_string(), r.postfire.1.to_string()],
        }
    }
}

#[derive(Debug, Serialize)]
struct AnalyzeBurnBody<'a> {
    geojson: &'a str,
    fire_event_name: &'a str,
    affiliation: &'a str,
    derive_boundary: bool,
    date_ranges: DateRangesBody,
}

#[derive(Debug, Serialize)]
struct RefineBody<'a> {
    geojson: serde_json::Value,
    fire_event_name: &'a str,
    affiliation: &'a str,
}

#[derive(Debug, Serialize)]
struct EcoclassBody<'a> {
    geojson: &'a str,
    fire_event_name: &'a str,
    affiliation: &'a str,
}

#[derive(Debug, Serialize)]
struct RangelandBody<'a> {
    geojson: &'a str,
    ignition_date: String,
    fire_event_name: &'a str,
    affiliation: &'a str,
}

#[derive(Debug, Serialize)]
struct EventBody<'a> {
    fire_event_name: &'a str,
    affiliation: &'a str,
}

impl<'a> From<&'a FireEvent> for EventBody<'a> {
    fn from(e: &'a FireEvent) -> Self {
        Self {
            fire_event_name: &e.fire_event_name,
            affiliation: &e.affiliation,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BurnMetricsResponse {
    #[serde(default)]
    satellite_pass_information: Option<SatellitePassInfo>,
    #[serde(default)]
    cloud_cog_paths: Option<BTreeMap<String, String>>,
    #[serde(default)]
    derived_boundary: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RefineResponse {
    #[serde(default)]
    derived_boundary: Option<serde_json::Value>,
}

/// The service returns boundaries either as a GeoJSON string or an inline object.
fn geojson_to_string(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

/// Ignition date for the rangeland query: the last prefire day, as the service expects.
fn ignition_date(r: &DateRanges) -> String {
    format!("{}T00:00:00.000Z", r.prefire.1)
}

/// Map a spectral burn metrics response onto a [`BurnAnalysisResult`].
///
/// 200 means the analysis ran and produced imagery, 204 means it ran but found
/// nothing usable, anything else (or an undecodable body) means it did not run.
pub(crate) fn interpret_burn_response(
    status: StatusCode,
    body: &[u8],
    derive_boundary: bool,
) -> BurnAnalysisResult {
    match status {
        StatusCode::OK => match serde_json::from_slice::<BurnMetricsResponse>(body) {
            Ok(parsed) => BurnAnalysisResult {
                executed: true,
                fire_found: true,
                satellite_pass_info: parsed.satellite_pass_information,
                cloud_cog_paths: parsed.cloud_cog_paths,
                derived_boundary: if derive_boundary {
                    parsed.derived_boundary.and_then(geojson_to_string)
                } else {
                    None
                },
            },
            Err(e) => {
                warn!(error = %e, "undecodable spectral burn metrics response");
                BurnAnalysisResult::not_executed()
            }
        },
        StatusCode::NO_CONTENT => BurnAnalysisResult::nothing_found(),
        _ => BurnAnalysisResult::not_executed(),
    }
}

/// Map a flood-fill refinement response onto a [`RefinementResult`].
pub(crate) fn interpret_refine_response(status: StatusCode, body: &[u8]) -> RefinementResult {
    match status {
        StatusCode::OK => {
            let boundary = serde_json::from_slice::<RefineResponse>(body)
                .ok()
                .and_then(|r| r.derived_boundary)
                .and_then(geojson_to_string);
            match boundary {
                Some(b) => RefinementResult {
                    executed: true,
                    fire_detected: true,
                    derived_boundary: Some(b),
                },
                None => {
                    warn!("refinement response carried no derived boundary");
                    RefinementResult::not_executed()
                }
            }
        }
        StatusCode::NO_CONTENT => RefinementResult::not_detected(),
        _ => RefinementResult::not_executed(),
    }
}

/// Decode a loosely specified JSON payload; an empty body decodes to `null`
/// and non-JSON text is kept as a string.
fn loose_json(body: &[u8]) -> serde_json::Value {
    if body.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(body).into_owned()))
}

fn products_from_map(map: BTreeMap<String, serde_json::Value>) -> Vec<Product> {
    map.into_iter()
        .filter_map(|(product_type, url)| {
            geojson_to_string(url).map(|url| Product { product_type, url })
        })
        .collect()
}

#[derive(Clone)]
pub(crate) struct HttpAnalysisClient {
    http: Client,
    base_url: Url,
}

impl std::fmt::Debug for HttpAnalysisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAnalysisClient")
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

impl HttpAnalysisClient {
    pub fn new(cfg: &RunConfig) -> ServiceResult<Self> {
        let mut base = cfg.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url =
            Url::parse(&base).map_err(|e| ServiceError::InvalidUrl(format!("{base}: {e}")))?;

        let http = Client::builder()
            .timeout(cfg.request_timeout)
            .user_agent(cfg.user_agent.clone())
            .build()?;

        Ok(Self { http, base_url })
    }

    pub fn endpoint(&self, path: &str) -> ServiceResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| ServiceError::InvalidUrl(format!("{path}: {e}")))
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> ServiceResult<reqwest::Response> {
        let url = self.endpoint(path)?;
        debug!(%url, "POST");
        Ok(self.http.post(url).json(body).send().await?)
    }

    /// Read the body of a response whose status decides the interpretation.
    /// Transport failures are logged and reported as `None`.
    async fn post_for_status<B: Serialize + ?Sized>(
        &self,
        operation: &'static str,
        path: &str,
        body: &B,
    ) -> Option<(StatusCode, Bytes)> {
        let resp = match self.post_json(path, body).await {
            Ok(r) => r,
            Err(e) => {
                error!(operation, error = %e, "request failed");
                return None;
            }
        };
        let status = resp.status();
        if !status.is_success() {
            warn!(operation, %status, "service did not execute request");
        }
        match resp.bytes().await {
            Ok(b) => Some((status, b)),
            Err(e) => {
                error!(operation, error = %e, "failed to read response body");
                None
            }
        }
    }

    async fn expect_success(
        operation: &'static str,
        resp: reqwest::Response,
    ) -> ServiceResult<Bytes> {
        let status = resp.status();
        if status.is_success() {
            debug!(operation, %status, "completed");
            return Ok(resp.bytes().await?);
        }
        let message = resp
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        error!(operation, %status, error = %message, "failed operation");
        Err(ServiceError::status(operation, status.as_u16(), message))
    }

    fn decode<T: DeserializeOwned>(operation: &'static str, body: &[u8]) -> ServiceResult<T> {
        serde_json::from_slice(body).map_err(|e| ServiceError::decode(operation, e.to_string()))
    }
}

#[async_trait]
impl AnalysisService for HttpAnalysisClient {
    async fn upload_drawn(
        &self,
        event: &FireEvent,
        shape: &DrawnShape,
    ) -> ServiceResult<UploadResult> {
        const OP: &str = "upload drawn AOI";
        let url = self.endpoint(UPLOAD_DRAWN_PATH)?;
        debug!(%url, "POST");
        let resp = self
            .http
            .post(url)
            .form(&[
                ("fire_event_name", event.fire_event_name.as_str()),
                ("affiliation", event.affiliation.as_str()),
                ("geojson", shape.geojson.as_str()),
            ])
            .send()
            .await?;
        let body = Self::expect_success(OP, resp).await?;
        Self::decode(OP, &body)
    }

    async fn upload_shapefile(
        &self,
        event: &FireEvent,
        archive: &ShapefileArchive,
    ) -> ServiceResult<UploadResult> {
        const OP: &str = "upload shapefile";
        let content = Bytes::from(tokio::fs::read(&archive.path).await?);
        debug!(path = %archive.path.display(), bytes = content.len(), "read shapefile archive");

        let part = Part::stream(content)
            .file_name(archive.file_name())
            .mime_str("application/zip")?;
        let form = Form::new()
            .part("file", part)
            .text("fire_event_name", event.fire_event_name.clone())
            .text("affiliation", event.affiliation.clone())
            .text("derive_boundary", "false");

        let url = self.endpoint(UPLOAD_SHAPEFILE_PATH)?;
        debug!(%url, "POST");
        let resp = self.http.post(url).multipart(form).send().await?;
        let body = Self::expect_success(OP, resp).await?;
        Self::decode(OP, &body)
    }

    async fn analyze_burn(&self, request: BurnAnalysisRequest<'_>) -> BurnAnalysisResult {
        let body = AnalyzeBurnBody {
            geojson: request.geojson,
            fire_event_name: &request.event.fire_event_name,
            affiliation: &request.event.affiliation,
            derive_boundary: request.derive_boundary,
            date_ranges: request.date_ranges.into(),
        };
        match self
            .post_for_status("spectral burn metrics", ANALYZE_BURN_PATH, &body)
            .await
        {
            Some((status, bytes)) => {
                interpret_burn_response(status, &bytes, request.derive_boundary)
            }
            None => BurnAnalysisResult::not_executed(),
        }
    }

    async fn refine_boundary(&self, event: &FireEvent, seeds: &SeedPoints) -> RefinementResult {
        let body = RefineBody {
            geojson: seeds.to_geojson(),
            fire_event_name: &event.fire_event_name,
            affiliation: &event.affiliation,
        };
        match self
            .post_for_status("flood-fill refinement", REFINE_PATH, &body)
            .await
        {
            Some((status, bytes)) => interpret_refine_response(status, &bytes),
            None => RefinementResult::not_executed(),
        }
    }

    async fn fetch_ecoclass(
        &self,
        request: SecondaryRequest<'_>,
    ) -> ServiceResult<serde_json::Value> {
        let body = EcoclassBody {
            geojson: request.boundary,
            fire_event_name: &request.event.fire_event_name,
            affiliation: &request.event.affiliation,
        };
        let resp = self.post_json(ECOCLASS_PATH, &body).await?;
        let bytes = Self::expect_success("ecoclass", resp).await?;
        Ok(loose_json(&bytes))
    }

    async fn fetch_rangeland(
        &self,
        request: SecondaryRequest<'_>,
    ) -> ServiceResult<serde_json::Value> {
        let body = RangelandBody {
            geojson: request.boundary,
            ignition_date: ignition_date(&request.date_ranges),
            fire_event_name: &request.event.fire_event_name,
            affiliation: &request.event.affiliation,
        };
        let resp = self.post_json(RANGELAND_PATH, &body).await?;
        let bytes = Self::expect_success("rangeland analysis", resp).await?;
        Ok(loose_json(&bytes))
    }

    async fn list_derived_products(&self, event: &FireEvent) -> ServiceResult<Vec<Product>> {
        const OP: &str = "list derived products";
        let resp = self
            .post_json(DERIVED_PRODUCTS_PATH, &EventBody::from(event))
            .await?;
        let bytes = Self::expect_success(OP, resp).await?;
        let map: BTreeMap<String, serde_json::Value> = Self::decode(OP, &bytes)?;
        Ok(products_from_map(map))
    }
}
