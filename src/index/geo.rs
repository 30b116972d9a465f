use std::collections::HashMap;

use serde_json::Value;

/// Earth radius in meters
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Pack a geopoint into a 64-bit cell id: lat and lng as 32-bit fixed-point
/// halves (lat in the high word).
pub fn pack_cell(lat: f64, lng: f64) -> u64 {
    let lat_fp = (((lat + 90.0) / 180.0) * (u32::MAX as f64)) as u32;
    let lng_fp = (((lng + 180.0) / 360.0) * (u32::MAX as f64)) as u32;
    ((lat_fp as u64) << 32) | lng_fp as u64
}

pub fn unpack_cell(cell: u64) -> (f64, f64) {
    let lat_fp = (cell >> 32) as u32;
    let lng_fp = (cell & 0xFFFF_FFFF) as u32;
    let lat = (lat_fp as f64 / u32::MAX as f64) * 180.0 - 90.0;
    let lng = (lng_fp as f64 / u32::MAX as f64) * 360.0 - 180.0;
    (lat, lng)
}

/// Haversine great-circle distance in meters.
pub fn haversine_meters(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lng = (lng2 - lng1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_M * c
}

/// Parse a geopoint document value: `[lat, lng]`.
pub fn parse_geopoint(value: &Value) -> Option<(f64, f64)> {
    let arr = value.as_array()?;
    if arr.len() != 2 {
        return None;
    }
    let lat = arr[0].as_f64()?;
    let lng = arr[1].as_f64()?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
        return None;
    }
    Some((lat, lng))
}

/// Per-field geopoint index: seq id → packed cell ids.
#[derive(Debug, Default)]
pub struct GeoIndex {
    cells: HashMap<u32, Vec<u64>>,
}

impl GeoIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, seq_id: u32, lat: f64, lng: f64) {
        self.cells.entry(seq_id).or_default().push(pack_cell(lat, lng));
    }

    pub fn remove(&mut self, seq_id: u32) {
        self.cells.remove(&seq_id);
    }

    /// Documents with a point within `radius_m` of the anchor, with their
    /// closest distance.
    pub fn within_radius(&self, lat: f64, lng: f64, radius_m: f64) -> Vec<(u32, f64)> {
        let mut out = Vec::new();
        for (seq_id, cells) in &self.cells {
            let mut best: Option<f64> = None;
            for cell in cells {
                let (p_lat, p_lng) = unpack_cell(*cell);
                let d = haversine_meters(lat, lng, p_lat, p_lng);
                if d <= radius_m {
                    best = Some(best.map_or(d, |b: f64| b.min(d)));
                }
            }
            if let Some(d) = best {
                out.push((*seq_id, d));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Documents with a point inside the polygon (ray casting over vertices).
    pub fn within_polygon(&self, vertices: &[(f64, f64)]) -> Vec<u32> {
        let mut out = Vec::new();
        for (seq_id, cells) in &self.cells {
            let inside = cells.iter().any(|cell| {
                let (lat, lng) = unpack_cell(*cell);
                point_in_polygon(lat, lng, vertices)
            });
            if inside {
                out.push(*seq_id);
            }
        }
        out.sort_unstable();
        out
    }

    /// Closest distance from the anchor, for geo sort clauses.
    pub fn distance_to(&self, seq_id: u32, lat: f64, lng: f64) -> Option<f64> {
        let cells = self.cells.get(&seq_id)?;
        cells
            .iter()
            .map(|cell| {
                let (p_lat, p_lng) = unpack_cell(*cell);
                haversine_meters(lat, lng, p_lat, p_lng)
            })
            .min_by(|a, b| a.total_cmp(b))
    }
}

fn point_in_polygon(lat: f64, lng: f64, vertices: &[(f64, f64)]) -> bool {
    let mut inside = false;
    let n = vertices.len();
    let mut j = n - 1;
    for i in 0..n {
        let (lat_i, lng_i) = vertices[i];
        let (lat_j, lng_j) = vertices[j];
        if ((lat_i > lat) != (lat_j > lat))
            && (lng < (lng_j - lng_i) * (lat - lat_i) / (lat_j - lat_i) + lng_i)
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pack_unpack_round_trip() {
        let (lat, lng) = (48.8566, 2.3522);
        let (out_lat, out_lng) = unpack_cell(pack_cell(lat, lng));
        assert!((lat - out_lat).abs() < 1e-6);
        assert!((lng - out_lng).abs() < 1e-6);
    }

    #[test]
    fn test_haversine_known_cities() {
        // Paris to London: approximately 343 km
        let d = haversine_meters(48.8566, 2.3522, 51.5074, -0.1278);
        let km = d / 1000.0;
        assert!(km > 340.0 && km < 350.0);
    }

    #[test]
    fn test_parse_geopoint() {
        assert_eq!(parse_geopoint(&json!([48.85, 2.35])), Some((48.85, 2.35)));
        assert_eq!(parse_geopoint(&json!([91.0, 0.0])), None);
        assert_eq!(parse_geopoint(&json!("nope")), None);
        assert_eq!(parse_geopoint(&json!([1.0])), None);
    }

    #[test]
    fn test_within_radius() {
        let mut index = GeoIndex::new();
        index.insert(1, 48.8566, 2.3522); // Paris
        index.insert(2, 51.5074, -0.1278); // London
        index.insert(3, 40.7128, -74.0060); // NYC

        // 400 km around Paris finds Paris and London.
        let hits = index.within_radius(48.8566, 2.3522, 400_000.0);
        let ids: Vec<u32> = hits.iter().map(|h| h.0).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(hits[0].1 < 1.0);
    }

    #[test]
    fn test_within_polygon() {
        let mut index = GeoIndex::new();
        index.insert(1, 1.0, 1.0);
        index.insert(2, 5.0, 5.0);

        let square = [(0.0, 0.0), (0.0, 2.0), (2.0, 2.0), (2.0, 0.0)];
        assert_eq!(index.within_polygon(&square), vec![1]);
    }

    #[test]
    fn test_multi_point_documents_use_closest() {
        let mut index = GeoIndex::new();
        index.insert(1, 48.8566, 2.3522);
        index.insert(1, 40.7128, -74.0060);

        let d = index.distance_to(1, 48.86, 2.35).unwrap();
        assert!(d < 5_000.0);
    }
}
