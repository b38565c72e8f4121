//! Run configuration: a typed, validated description of a single harvest
//! run, constructible directly (library use) or from environment variables
//! (CLI use).

use crate::error::{HarvestError, Result};
use crate::tile_math::MAX_ZOOM;

fn env_usize(name: &str, default: usize, min: usize, max: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_u8(name: &str, default: u8, min: u8, max: u8) -> u8 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u8>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Where fetched tiles go. Zoom-sharded MBTiles isn't a separate variant:
/// per spec.md, whether an MBTiles run is sharded is decided solely by
/// whether `output_path` contains a `{z}` placeholder (see
/// `Controller::new`'s sink construction).
#[derive(Debug, Clone, PartialEq)]
pub enum SinkKind {
    Directory,
    Mbtiles,
}

/// A fully validated description of one harvest run: bbox, zoom range,
/// provider, concurrency, and storage. `RunConfig::from_env` mirrors the
/// clamped-environment-variable pattern used for the CLI binary;
/// `RunConfig::new` is for direct library construction.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub provider_name: String,
    pub url_template: String,
    pub subdomains: Vec<String>,
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub is_tms: bool,
    pub threads: usize,
    pub retries: u32,
    pub output_path: String,
    pub sink_kind: SinkKind,
    pub scheme: String,
}

impl RunConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider_name: impl Into<String>,
        url_template: impl Into<String>,
        subdomains: Vec<String>,
        west: f64,
        south: f64,
        east: f64,
        north: f64,
        min_zoom: u8,
        max_zoom: u8,
        threads: usize,
        sink_kind: SinkKind,
        output_path: impl Into<String>,
    ) -> Result<Self> {
        let config = RunConfig {
            provider_name: provider_name.into(),
            url_template: url_template.into(),
            subdomains,
            west,
            south,
            east,
            north,
            min_zoom,
            max_zoom,
            is_tms: false,
            threads,
            retries: 3,
            output_path: output_path.into(),
            sink_kind,
            scheme: "xyz".to_string(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Builds a run configuration from environment variables, mirroring the
    /// `env_usize`/`env_i64`-style clamped lookups used elsewhere in this
    /// stack. Unset variables fall back to sane single-tile-test defaults.
    pub fn from_env() -> Result<Self> {
        let config = RunConfig {
            provider_name: env_string("HARVEST_PROVIDER", "osm"),
            url_template: env_string(
                "HARVEST_URL_TEMPLATE",
                "https://{s}.tile.openstreetmap.org/{z}/{x}/{y}.png",
            ),
            subdomains: env_string("HARVEST_SUBDOMAINS", "a,b,c")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            west: env_f64("HARVEST_WEST", -180.0),
            south: env_f64("HARVEST_SOUTH", -85.0),
            east: env_f64("HARVEST_EAST", 180.0),
            north: env_f64("HARVEST_NORTH", 85.0),
            min_zoom: env_u8("HARVEST_MIN_ZOOM", 0, 0, MAX_ZOOM),
            max_zoom: env_u8("HARVEST_MAX_ZOOM", 2, 0, MAX_ZOOM),
            is_tms: env_bool("HARVEST_TMS", false),
            threads: env_usize("HARVEST_THREADS", 8, 1, 64),
            retries: env_usize("HARVEST_RETRIES", 3, 1, 10) as u32,
            output_path: env_string("HARVEST_OUTPUT", "tiles"),
            sink_kind: match env_string("HARVEST_SAVE_FORMAT", "directory").to_lowercase().as_str() {
                "mbtiles" => SinkKind::Mbtiles,
                _ => SinkKind::Directory,
            },
            scheme: env_string("HARVEST_SCHEME", "xyz").to_lowercase(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.west.is_finite()
            || !self.south.is_finite()
            || !self.east.is_finite()
            || !self.north.is_finite()
            || self.south >= self.north
        {
            return Err(HarvestError::InvalidBBox {
                west: self.west,
                south: self.south,
                east: self.east,
                north: self.north,
            });
        }
        if self.min_zoom > self.max_zoom || self.max_zoom > MAX_ZOOM {
            return Err(HarvestError::InvalidZoomRange {
                min_zoom: self.min_zoom,
                max_zoom: self.max_zoom,
            });
        }
        if self.threads == 0 {
            return Err(HarvestError::InvalidThreadCount(self.threads));
        }
        if !["{z}", "{x}", "{y}", "{q}"].iter().any(|p| self.url_template.contains(p)) {
            return Err(HarvestError::InvalidUrlTemplate(self.url_template.clone()));
        }
        Ok(())
    }

    /// Canonical bytes fed to BLAKE3 to produce the ledger's config
    /// fingerprint: provider identity, geometry, and storage scheme, but
    /// not operational knobs like thread count or retry budget (those can
    /// legitimately change between resumed runs without invalidating
    /// progress).
    pub fn fingerprint_input(&self) -> String {
        format!(
            "{}|{}|{:.8}|{:.8}|{:.8}|{:.8}|{}|{}|{}|{}",
            self.provider_name,
            self.url_template,
            self.west,
            self.south,
            self.east,
            self.north,
            self.min_zoom,
            self.max_zoom,
            self.is_tms,
            self.scheme,
        )
    }

    pub fn config_hash(&self) -> String {
        blake3::hash(self.fingerprint_input().as_bytes()).to_hex().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_inverted_bbox() {
        let err = RunConfig::new(
            "osm",
            "https://{s}.tile.openstreetmap.org/{z}/{x}/{y}.png",
            vec!["a".into()],
            10.0,
            50.0,
            -10.0,
            10.0,
            0,
            5,
            4,
            SinkKind::Directory,
            "tiles",
        )
        .unwrap_err();
        assert!(matches!(err, HarvestError::InvalidBBox { .. }));
    }

    #[test]
    fn rejects_inverted_zoom_range() {
        let err = RunConfig::new(
            "osm",
            "https://{s}.tile.openstreetmap.org/{z}/{x}/{y}.png",
            vec!["a".into()],
            -10.0,
            -10.0,
            10.0,
            10.0,
            8,
            3,
            4,
            SinkKind::Directory,
            "tiles",
        )
        .unwrap_err();
        assert!(matches!(err, HarvestError::InvalidZoomRange { .. }));
    }

    #[test]
    fn config_hash_is_stable_for_identical_geometry() {
        let a = RunConfig::new(
            "osm",
            "https://{s}.tile.openstreetmap.org/{z}/{x}/{y}.png",
            vec!["a".into()],
            -10.0,
            -10.0,
            10.0,
            10.0,
            0,
            5,
            4,
            SinkKind::Directory,
            "tiles",
        )
        .unwrap();
        let b = a.clone();
        assert_eq!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn config_hash_changes_with_bbox() {
        let a = RunConfig::new(
            "osm",
            "https://{s}.tile.openstreetmap.org/{z}/{x}/{y}.png",
            vec!["a".into()],
            -10.0,
            -10.0,
            10.0,
            10.0,
            0,
            5,
            4,
            SinkKind::Directory,
            "tiles",
        )
        .unwrap();
        let mut b = a.clone();
        b.east = 20.0;
        assert_ne!(a.config_hash(), b.config_hash());
    }
}
