//! Tile providers: map a `(x, y, z)` index to a fetch URL and a storage path.
//!
//! A single descriptor type rather than a class hierarchy per provider:
//! there is no behavior here that varies by provider beyond the URL
//! template and whether `{q}` needs a QuadKey substituted in, so a trait
//! hierarchy would be ceremony without payoff.

use std::path::PathBuf;

use crate::error::{HarvestError, Result};
use crate::tile_math::{flip_y, tile_to_quadkey};

/// A registered tile source: URL template, zoom bounds, and on-disk layout.
///
/// Immutable after construction except for `is_tms`, which a run sets once
/// before enumeration starts: it is run configuration threaded through the
/// descriptor, not a property of the tile source itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provider {
    pub name: String,
    pub url_template: String,
    pub subdomains: Vec<String>,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub extension: String,
    pub is_tms: bool,
    /// Whether `path_for` nests output under a provider-named
    /// subdirectory. OSM/Bing set this; ad-hoc custom providers don't.
    pub path_prefix: Option<String>,
}

impl Provider {
    /// Builds a provider, deriving its extension from the URL template
    /// unless `extension_override` is given. `jpeg` always normalizes to
    /// `jpg`.
    pub fn new(
        name: impl Into<String>,
        url_template: impl Into<String>,
        min_zoom: u8,
        max_zoom: u8,
        subdomains: Vec<String>,
        path_prefix: Option<String>,
        extension_override: Option<&str>,
    ) -> Result<Self> {
        let url_template = url_template.into();
        if !["{z}", "{x}", "{y}", "{q}"]
            .iter()
            .any(|p| url_template.contains(p))
        {
            return Err(HarvestError::InvalidUrlTemplate(url_template));
        }
        if min_zoom > max_zoom || max_zoom > crate::tile_math::MAX_ZOOM {
            return Err(HarvestError::InvalidZoomRange { min_zoom, max_zoom });
        }

        let extension = Self::extract_extension(&url_template, extension_override);

        Ok(Provider {
            name: name.into(),
            url_template,
            subdomains,
            min_zoom,
            max_zoom,
            extension,
            is_tms: false,
            path_prefix,
        })
    }

    /// Standard OpenStreetMap XYZ tiles.
    pub fn osm() -> Self {
        Provider::new(
            "osm",
            "https://{s}.tile.openstreetmap.org/{z}/{x}/{y}.png",
            0,
            19,
            vec!["a".into(), "b".into(), "c".into()],
            Some("osm".into()),
            None,
        )
        .expect("built-in OSM template is valid")
    }

    /// Bing Maps aerial tiles, addressed by QuadKey.
    pub fn bing() -> Self {
        Provider::new(
            "bing",
            "http://ecn.{s}.tiles.virtualearth.net/tiles/a{q}.jpeg?g=1",
            1,
            23,
            vec!["t0".into(), "t1".into(), "t2".into(), "t3".into()],
            Some("bing".into()),
            None,
        )
        .expect("built-in Bing template is valid")
    }

    /// A caller-supplied template; no provider-name subdirectory by default.
    pub fn custom(
        name: impl Into<String>,
        url_template: impl Into<String>,
        subdomains: Vec<String>,
        min_zoom: u8,
        max_zoom: u8,
    ) -> Result<Self> {
        Provider::new(
            name,
            url_template,
            min_zoom,
            max_zoom,
            subdomains,
            None,
            None,
        )
    }

    pub fn with_tms(mut self, is_tms: bool) -> Self {
        self.is_tms = is_tms;
        self
    }

    fn extract_extension(url_template: &str, extension_override: Option<&str>) -> String {
        let raw = match extension_override {
            Some(ext) => ext.to_string(),
            None => {
                // Take the last dot-segment of the path portion of the URL,
                // ignoring any query string.
                let path = url_template.split('?').next().unwrap_or(url_template);
                path.rsplit('.')
                    .next()
                    .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()) && !ext.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| "jpg".to_string())
            }
        };
        let lower = raw.to_lowercase();
        if lower == "jpeg" { "jpg".to_string() } else { lower }
    }

    pub fn in_zoom_range(&self, z: u8) -> bool {
        z >= self.min_zoom && z <= self.max_zoom
    }

    fn subdomain_for(&self, x: u32, y: u32) -> Option<&str> {
        if self.subdomains.is_empty() {
            None
        } else {
            let idx = ((x as u64 + y as u64) % self.subdomains.len() as u64) as usize;
            Some(&self.subdomains[idx])
        }
    }

    /// Never fails: an out-of-range zoom is the worker's concern, not the
    /// provider's.
    pub fn url_for(&self, x: u32, y: u32, z: u8) -> String {
        let mut url = self.url_template.clone();

        if url.contains("{q}") {
            let qk = tile_to_quadkey(x, y, z);
            url = url.replace("{q}", &qk);
        }
        url = url.replace("{z}", &z.to_string());
        url = url.replace("{x}", &x.to_string());
        url = url.replace("{y}", &y.to_string());
        if let Some(s) = self.subdomain_for(x, y) {
            url = url.replace("{s}", s);
        }
        url
    }

    /// `root/[prefix/]z/x/y.ext`, with the on-disk `y` flipped to TMS
    /// orientation when `self.is_tms` is set, regardless of the server's
    /// own y convention.
    pub fn path_for(&self, x: u32, y: u32, z: u8, root: &std::path::Path) -> PathBuf {
        let disk_y = if self.is_tms { flip_y(y, z) } else { y };
        let mut path = root.to_path_buf();
        if let Some(prefix) = &self.path_prefix {
            path.push(prefix);
        }
        path.push(z.to_string());
        path.push(x.to_string());
        path.push(format!("{disk_y}.{}", self.extension));
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn osm_url_rotates_subdomains() {
        let p = Provider::osm();
        let url = p.url_for(3, 5, 7);
        assert_eq!(url, "https://b.tile.openstreetmap.org/7/3/5.png");
    }

    #[test]
    fn bing_url_uses_quadkey() {
        let p = Provider::bing();
        let url = p.url_for(3, 5, 3);
        assert!(url.contains("a213.jpeg"));
    }

    #[test]
    fn jpeg_normalizes_to_jpg() {
        assert_eq!(Provider::extract_extension("http://x/{z}/{x}/{y}.jpeg", None), "jpg");
        assert_eq!(Provider::extract_extension("http://x/{z}/{x}/{y}.JPEG?g=1", None), "jpg");
        assert_eq!(Provider::extract_extension("http://x/{z}/{x}/{y}.png", None), "png");
    }

    #[test]
    fn custom_provider_has_no_path_prefix() {
        let p = Provider::custom("mycustom", "http://x/{z}/{x}/{y}.png", vec![], 0, 22).unwrap();
        assert_eq!(p.path_prefix, None);
        let path = p.path_for(1, 2, 3, std::path::Path::new("/root"));
        assert_eq!(path, std::path::PathBuf::from("/root/3/1/2.png"));
    }

    #[test]
    fn osm_path_nests_under_provider_name() {
        let p = Provider::osm();
        let path = p.path_for(1, 2, 3, std::path::Path::new("/root"));
        assert_eq!(path, std::path::PathBuf::from("/root/osm/3/1/2.png"));
    }

    #[test]
    fn tms_flips_disk_y() {
        let p = Provider::custom("c", "http://x/{z}/{x}/{y}.png", vec![], 0, 22)
            .unwrap()
            .with_tms(true);
        let path = p.path_for(1, 2, 3, std::path::Path::new("/root"));
        // flip_y(2, 3) == 5
        assert_eq!(path, std::path::PathBuf::from("/root/3/1/5.png"));
    }

    #[test]
    fn rejects_template_without_placeholders() {
        let err = Provider::custom("bad", "http://x/static.png", vec![], 0, 22).unwrap_err();
        assert!(matches!(err, HarvestError::InvalidUrlTemplate(_)));
    }
}
