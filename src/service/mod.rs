//! Remote analysis service contract.
//!
//! The orchestrator only talks to [`AnalysisService`]; [`HttpAnalysisClient`] is the
//! reqwest implementation used by the CLI.

mod http;
#[cfg(test)]
pub(crate) mod mock;

pub(crate) use http::HttpAnalysisClient;

use crate::model::{
    BurnAnalysisResult, DateRanges, DrawnShape, Product, RefinementResult, SeedPoints,
    ShapefileArchive, UploadResult,
};
use async_trait::async_trait;
use thiserror::Error;

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{operation} returned HTTP {status}: {message}")]
    Status {
        operation: &'static str,
        status: u16,
        message: String,
    },

    #[error("failed to decode {operation} response: {reason}")]
    Decode {
        operation: &'static str,
        reason: String,
    },

    #[error("failed to read upload: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl ServiceError {
    pub fn status(operation: &'static str, status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            operation,
            status,
            message: message.into(),
        }
    }

    pub fn decode(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Decode {
            operation,
            reason: reason.into(),
        }
    }
}

/// Identifiers carried by every request of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FireEvent {
    pub fire_event_name: String,
    pub affiliation: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurnAnalysisRequest<'a> {
    pub geojson: &'a str,
    pub event: &'a FireEvent,
    pub derive_boundary: bool,
    pub date_ranges: DateRanges,
}

/// Boundary plus metadata sent to the secondary analyses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecondaryRequest<'a> {
    pub boundary: &'a str,
    pub event: &'a FireEvent,
    pub date_ranges: DateRanges,
}

/// Operations the workflow needs from the remote analysis service.
///
/// Burn analysis and refinement fold every failure into `executed = false`;
/// the remaining operations surface a [`ServiceError`].
#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn upload_drawn(&self, event: &FireEvent, shape: &DrawnShape)
        -> ServiceResult<UploadResult>;

    async fn upload_shapefile(
        &self,
        event: &FireEvent,
        archive: &ShapefileArchive,
    ) -> ServiceResult<UploadResult>;

    async fn analyze_burn(&self, request: BurnAnalysisRequest<'_>) -> BurnAnalysisResult;

    async fn refine_boundary(&self, event: &FireEvent, seeds: &SeedPoints) -> RefinementResult;

    async fn fetch_ecoclass(&self, request: SecondaryRequest<'_>)
        -> ServiceResult<serde_json::Value>;

    async fn fetch_rangeland(
        &self,
        request: SecondaryRequest<'_>,
    ) -> ServiceResult<serde_json::Value>;

    async fn list_derived_products(&self, event: &FireEvent) -> ServiceResult<Vec<Product>>;
}
