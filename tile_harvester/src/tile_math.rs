//! Web Mercator / Slippy (XYZ) tile coordinate math.
//!
//! Pure functions over `f64`/`u32`; nothing here talks to a filesystem,
//! network, or database. Generalized so that enumerating a bounding box
//! never materializes the full tile list (`TileRange` is a lazy cursor,
//! not a `Vec`).

use std::f64::consts::PI;

/// Web Mercator's safe latitude range; beyond this the projection diverges.
pub const MAX_LATITUDE: f64 = 85.0511;

/// Highest zoom level the rest of the crate is willing to enumerate.
pub const MAX_ZOOM: u8 = 23;

fn clamp_lat(lat: f64) -> f64 {
    lat.clamp(-MAX_LATITUDE, MAX_LATITUDE)
}

/// Converts geographic coordinates to a tile index at zoom `z`.
///
/// `use_ceil` rounds the raw (pre-integer) tile coordinate up rather than
/// down, absorbing floating point error at tile edges with a `1e-10`
/// tolerance; it is how `tiles_in_bbox` computes an inclusive south-east
/// corner. The result is **not** clamped to `[0, 2^z - 1]` here — callers
/// that need a valid tile index (as opposed to a raw bbox corner, which may
/// legitimately fall just outside the valid range) clamp themselves.
pub fn latlon_to_tile(lat: f64, lon: f64, z: u8, tms: bool, use_ceil: bool) -> (i64, i64) {
    let lat = clamp_lat(lat);
    let n = 2f64.powi(z as i32);

    let x = (lon + 180.0) / 360.0 * n;
    let lat_rad = lat.to_radians();
    let y = (1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * n;

    let (x, mut y) = if use_ceil {
        ((x - 1e-10).ceil(), (y - 1e-10).ceil())
    } else {
        (x.floor(), y.floor())
    };

    if tms {
        y = (n - 1.0) - y;
    }

    (x as i64, y as i64)
}

/// Inverse of [`latlon_to_tile`]: returns the tile's north-west corner
/// `(lat, lon)`.
pub fn tile_to_latlon(x: i64, y: i64, z: u8, tms: bool) -> (f64, f64) {
    let n = 2f64.powi(z as i32);
    let y = if tms { (n - 1.0) - y as f64 } else { y as f64 };

    let lon = x as f64 / n * 360.0 - 180.0;
    let lat_rad = (PI * (1.0 - 2.0 * y / n)).sinh().atan();
    let lat = lat_rad.to_degrees();
    (lat, lon)
}

/// Geographic extent of a single tile, as `(west, south, east, north)`.
pub fn tile_bbox(x: i64, y: i64, z: u8, tms: bool) -> (f64, f64, f64, f64) {
    let (north, west) = tile_to_latlon(x, y, z, tms);
    let (south, east) = tile_to_latlon(x + 1, y + 1, z, tms);
    (west, south, east, north)
}

/// Flips a y coordinate between XYZ (north-origin) and TMS (south-origin)
/// conventions at zoom `z`. Applying this twice is the identity.
pub fn flip_y(y: u32, z: u8) -> u32 {
    let n = 1u32 << z;
    (n - 1) - y
}

/// A lazy, row-major cursor over every `(x, y)` tile index inside a bbox at
/// a single zoom level. Does not allocate proportionally to tile count —
/// safe to construct for a z=16+ world-spanning box.
#[derive(Debug, Clone)]
pub struct TileRange {
    min_x: u32,
    max_x: u32,
    min_y: u32,
    max_y: u32,
    cur_x: u32,
    cur_y: u32,
    done: bool,
}

impl TileRange {
    /// Total number of tiles this cursor will yield.
    pub fn len(&self) -> u64 {
        (self.max_x - self.min_x + 1) as u64 * (self.max_y - self.min_y + 1) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Iterator for TileRange {
    type Item = (u32, u32);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = (self.cur_x, self.cur_y);
        if self.cur_y == self.max_y {
            if self.cur_x == self.max_x {
                self.done = true;
            } else {
                self.cur_x += 1;
                self.cur_y = self.min_y;
            }
        } else {
            self.cur_y += 1;
        }
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.done { 0 } else { self.len() };
        (remaining as usize, Some(remaining as usize))
    }
}

/// Enumerates every tile at zoom `z` intersecting `(west, south, east, north)`.
///
/// Uses floor for the north-west corner and ceil for the south-east corner
/// (so a bbox edge that lands exactly on a tile boundary includes that tile
/// on the north/west side and excludes it on the south/east side), then
/// clamps to `[0, 2^z - 1]` and normalizes so the resulting range is never
/// inverted.
pub fn tiles_in_bbox(west: f64, south: f64, east: f64, north: f64, z: u8, tms: bool) -> TileRange {
    let n = 1u32 << z;
    let max_valid = n - 1;

    let (x1, y1) = latlon_to_tile(north, west, z, tms, false);
    let (x2, y2) = latlon_to_tile(south, east, z, tms, true);

    let clamp = |v: i64| -> u32 { v.clamp(0, max_valid as i64) as u32 };
    let (mut min_x, mut max_x) = (clamp(x1), clamp(x2));
    let (mut min_y, mut max_y) = (clamp(y1), clamp(y2));

    if min_x > max_x {
        std::mem::swap(&mut min_x, &mut max_x);
    }
    if min_y > max_y {
        std::mem::swap(&mut min_y, &mut max_y);
    }

    TileRange {
        min_x,
        max_x,
        min_y,
        max_y,
        cur_x: min_x,
        cur_y: min_y,
        done: false,
    }
}

/// Encodes `(x, y, z)` as a Bing Maps QuadKey: a base-4 digit per zoom
/// level, most significant first.
pub fn tile_to_quadkey(x: u32, y: u32, z: u8) -> String {
    let mut quadkey = String::with_capacity(z as usize);
    for i in (1..=z).rev() {
        let mask = 1u32 << (i - 1);
        let mut digit = 0u8;
        if x & mask != 0 {
            digit += 1;
        }
        if y & mask != 0 {
            digit += 2;
        }
        quadkey.push((b'0' + digit) as char);
    }
    quadkey
}

/// Inverse of [`tile_to_quadkey`].
pub fn quadkey_to_tile(quadkey: &str) -> Option<(u32, u32, u8)> {
    let z = quadkey.len() as u8;
    let (mut x, mut y) = (0u32, 0u32);
    for (i, ch) in quadkey.chars().enumerate() {
        let shift = z as u32 - i as u32 - 1;
        let digit = ch.to_digit(10)?;
        if digit > 3 {
            return None;
        }
        if digit & 1 != 0 {
            x |= 1 << shift;
        }
        if digit & 2 != 0 {
            y |= 1 << shift;
        }
    }
    Some((x, y, z))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quadkey_literals() {
        assert_eq!(tile_to_quadkey(3, 5, 3), "213");
        assert_eq!(tile_to_quadkey(0, 0, 1), "0");
        let qk = tile_to_quadkey(35210, 21493, 16);
        assert_eq!(qk.len(), 16);
        assert!(qk.starts_with("1202102332"));
    }

    #[test]
    fn quadkey_roundtrip() {
        for z in 1..=10u8 {
            let n = 1u32 << z;
            for x in (0..n).step_by((n / 4).max(1) as usize) {
                for y in (0..n).step_by((n / 4).max(1) as usize) {
                    let qk = tile_to_quadkey(x, y, z);
                    assert_eq!(quadkey_to_tile(&qk), Some((x, y, z)));
                }
            }
        }
    }

    #[test]
    fn bbox_tile_counts_world_z4() {
        let range = tiles_in_bbox(-180.0, -85.0, 180.0, 85.0, 4, false);
        assert_eq!(range.len(), 256);
        assert_eq!(range.count() as u64, 256);
    }

    #[test]
    fn bbox_tile_counts_across_zoom_range() {
        let total: u64 = (0..=4u8)
            .map(|z| tiles_in_bbox(-180.0, -85.0, 180.0, 85.0, z, false).len())
            .sum();
        assert_eq!(total, 1 + 4 + 16 + 64 + 256);
    }

    #[test]
    fn tms_flip_is_an_involution() {
        for z in 0..=10u8 {
            let n = 1u32 << z;
            for y in 0..n {
                assert_eq!(flip_y(flip_y(y, z), z), y);
            }
        }
    }

    #[test]
    fn tms_flip_matches_scenario_s3() {
        // at z=3, on-disk y=2 in TMS equals Slippy y=5
        assert_eq!(flip_y(2, 3), 5);
        assert_eq!(flip_y(5, 3), 2);
    }

    #[test]
    fn coordinate_round_trip() {
        for z in 1..=16u8 {
            let n = 1u32 << z;
            let probe_x = [0u32, n / 3, n - 1];
            let probe_y = [0u32, n / 2, n - 1];
            for &x in &probe_x {
                for &y in &probe_y {
                    let (lat, lon) = tile_to_latlon(x as i64, y as i64, z, false);
                    // Nudge into the tile's interior so floor() lands back on (x, y).
                    let eps = 1e-7;
                    let (rx, ry) = latlon_to_tile(lat - eps, lon + eps, z, false, false);
                    assert_eq!((rx, ry), (x as i64, y as i64), "z={z} x={x} y={y}");
                }
            }
        }
    }

    #[test]
    fn bbox_edge_snaps_to_boundary_asymmetrically() {
        // A bbox snapped exactly to tile boundaries at z=2 includes the
        // boundary tile on the north/west side and excludes it south/east.
        let z = 2;
        let (west, south, east, north) = tile_bbox(1, 1, z, false);
        let range = tiles_in_bbox(west, south, east, north, z, false);
        let tiles: Vec<_> = range.collect();
        assert_eq!(tiles, vec![(1, 1)]);
    }
}
