//! Scripted in-memory [`AnalysisService`] for orchestrator tests.

use super::{
    AnalysisService, BurnAnalysisRequest, FireEvent, SecondaryRequest, ServiceError,
    ServiceResult,
};
use crate::model::{
    BurnAnalysisResult, DrawnShape, Product, RefinementResult, SatellitePassInfo, SeedPoints,
    ShapefileArchive, UploadResult,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    UploadDrawn { geojson: String },
    UploadShapefile { file_name: String },
    AnalyzeBurn { geojson: String, derive_boundary: bool },
    Refine { seed_count: usize },
    Ecoclass { boundary: String },
    Rangeland { boundary: String },
    ListProducts,
}

pub(crate) struct MockAnalysisService {
    pub upload: Option<UploadResult>,
    pub burn: BurnAnalysisResult,
    pub refine: RefinementResult,
    pub ecoclass_ok: bool,
    pub rangeland_ok: bool,
    pub products: Option<Vec<Product>>,
    /// When set, ecoclass does not finish until rangeland has been dispatched.
    pub secondary_gate: Option<Arc<Notify>>,
    calls: Mutex<Vec<Call>>,
}

pub(crate) const AOI_GEOJSON: &str = r#"{"type":"Polygon","coordinates":[]}"#;
pub(crate) const REFINED_GEOJSON: &str = r#"{"type":"MultiPolygon","coordinates":[]}"#;

pub(crate) fn pass_info() -> SatellitePassInfo {
    SatellitePassInfo {
        n_prefire_passes: 4,
        n_postfire_passes: 3,
        latest_pass: "2023-02-14".to_string(),
    }
}

impl MockAnalysisService {
    /// Every operation succeeds; burn analysis returns imagery with an `rbr` product.
    pub fn happy() -> Self {
        let mut paths = BTreeMap::new();
        paths.insert("rbr".to_string(), "public/org/TestFire/rbr.tif".to_string());
        Self {
            upload: Some(UploadResult {
                geojson: AOI_GEOJSON.to_string(),
            }),
            burn: BurnAnalysisResult {
                executed: true,
                fire_found: true,
                satellite_pass_info: Some(pass_info()),
                cloud_cog_paths: Some(paths),
                derived_boundary: None,
            },
            refine: RefinementResult {
                executed: true,
                fire_detected: true,
                derived_boundary: Some(REFINED_GEOJSON.to_string()),
            },
            ecoclass_ok: true,
            rangeland_ok: true,
            products: Some(vec![Product {
                product_type: "rbr".to_string(),
                url: "https://storage/public/org/TestFire/rbr.tif".to_string(),
            }]),
            secondary_gate: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn upload_result(&self, operation: &'static str) -> ServiceResult<UploadResult> {
        self.upload
            .clone()
            .ok_or_else(|| ServiceError::status(operation, 400, "simulated failure"))
    }
}

#[async_trait]
impl AnalysisService for MockAnalysisService {
    async fn upload_drawn(
        &self,
        _event: &FireEvent,
        shape: &DrawnShape,
    ) -> ServiceResult<UploadResult> {
        self.record(Call::UploadDrawn {
            geojson: shape.geojson.clone(),
        });
        tokio::task::yield_now().await;
        self.upload_result("upload drawn AOI")
    }

    async fn upload_shapefile(
        &self,
        _event: &FireEvent,
        archive: &ShapefileArchive,
    ) -> ServiceResult<UploadResult> {
        self.record(Call::UploadShapefile {
            file_name: archive.file_name(),
        });
        tokio::task::yield_now().await;
        self.upload_result("upload shapefile")
    }

    async fn analyze_burn(&self, request: BurnAnalysisRequest<'_>) -> BurnAnalysisResult {
        self.record(Call::AnalyzeBurn {
            geojson: request.geojson.to_string(),
            derive_boundary: request.derive_boundary,
        });
        tokio::task::yield_now().await;
        self.burn.clone()
    }

    async fn refine_boundary(&self, _event: &FireEvent, seeds: &SeedPoints) -> RefinementResult {
        self.record(Call::Refine {
            seed_count: seeds.len(),
        });
        tokio::task::yield_now().await;
        self.refine.clone()
    }

    async fn fetch_ecoclass(
        &self,
        request: SecondaryRequest<'_>,
    ) -> ServiceResult<serde_json::Value> {
        self.record(Call::Ecoclass {
            boundary: request.boundary.to_string(),
        });
        tokio::task::yield_now().await;
        if let Some(gate) = &self.secondary_gate {
            gate.notified().await;
        }
        if self.ecoclass_ok {
            Ok(serde_json::json!(["Ecoclass GeoJSON uploaded", 200]))
        } else {
            Err(ServiceError::status("ecoclass", 400, "simulated failure"))
        }
    }

    async fn fetch_rangeland(
        &self,
        request: SecondaryRequest<'_>,
    ) -> ServiceResult<serde_json::Value> {
        self.record(Call::Rangeland {
            boundary: request.boundary.to_string(),
        });
        if let Some(gate) = &self.secondary_gate {
            gate.notify_one();
        }
        tokio::task::yield_now().await;
        if self.rangeland_ok {
            Ok(serde_json::json!({"message": "RAP estimates uploaded"}))
        } else {
            Err(ServiceError::status("rangeland analysis", 400, "simulated failure"))
        }
    }

    async fn list_derived_products(&self, _event: &FireEvent) -> ServiceResult<Vec<Product>> {
        self.record(Call::ListProducts);
        self.products
            .clone()
            .ok_or_else(|| ServiceError::status("list derived products", 400, "simulated failure"))
    }
}
