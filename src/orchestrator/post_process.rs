//! Post-run processing utilities.
//!
//! Builds display links for derived products and exports finished run reports.

use crate::model::{MapLink, RunReport};
use anyhow::{Context, Result};
use reqwest::Url;
use std::path::Path;

/// Product families that get a tileserver map link.
pub(crate) const MAP_PRODUCT_FAMILIES: [&str; 2] = ["rbr", "dnbr"];

/// Tileserver page for one product family: `{base}/map/{affiliation}/{fire}/{family}`.
fn map_link_url(base: &str, affiliation: &str, fire_event_name: &str, family: &str) -> String {
    let fallback = || {
        format!(
            "{}/map/{}/{}/{}",
            base.trim_end_matches('/'),
            affiliation,
            fire_event_name,
            family
        )
    };
    let Ok(mut url) = Url::parse(base) else {
        return fallback();
    };
    match url.path_segments_mut() {
        Ok(mut segments) => {
            segments
                .pop_if_empty()
                .extend(["map", affiliation, fire_event_name, family]);
        }
        Err(()) => return fallback(),
    }
    url.to_string()
}

pub(crate) fn map_links(
    tileserver_url: &str,
    affiliation: &str,
    fire_event_name: &str,
) -> Vec<MapLink> {
    MAP_PRODUCT_FAMILIES
        .iter()
        .map(|family| MapLink {
            product: family.to_string(),
            url: map_link_url(tileserver_url, affiliation, fire_event_name, family),
        })
        .collect()
}

/// URL of a tile-servable intermediate raster.
pub(crate) fn intermediate_imagery_url(cog_tileserver_prefix: &str, cog_path: &str) -> String {
    format!("{cog_tileserver_prefix}{cog_path}")
}

/// Write a finished run report as pretty JSON.
pub(crate) fn export_report(path: &Path, report: &RunReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("serialize run report")?;
    std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
