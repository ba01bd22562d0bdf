//! `geo:` URIs (RFC 5870) and the mesh position-precision tables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::IdError;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GeoUri {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,

    /// `u=` uncertainty in meters
    pub uncertainty: Option<f64>,
    /// `crs=`
    pub crs: Option<String>,

    /// `z=` zoom level (Android extension)
    pub zoom: Option<u32>,
    /// `q=` search query (Android extension)
    pub query: Option<String>,

    pub other_params: BTreeMap<String, String>,
    pub query_params: BTreeMap<String, String>,
}

impl GeoUri {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            ..Default::default()
        }
    }

    pub fn with_uncertainty(mut self, meters: f64) -> Self {
        self.uncertainty = Some(meters);
        self
    }

    pub fn with_altitude(mut self, meters: f64) -> Self {
        self.altitude = Some(meters);
        self
    }

    /// Position precision (in bits) matching this location's uncertainty
    pub fn precision_bits(&self) -> u32 {
        precision_bits(self.uncertainty)
    }

    /// Latitude in the mesh's 1e-7 degree fixed-point format
    pub fn latitude_i(&self) -> i32 {
        (self.latitude * 1e7).round() as i32
    }

    pub fn longitude_i(&self) -> i32 {
        (self.longitude * 1e7).round() as i32
    }
}

fn unescape(s: &str) -> Result<String, IdError> {
    urlencoding::decode(&s.replace('+', " "))
        .map(|v| v.into_owned())
        .map_err(|e| IdError::InvalidGeoUri(e.to_string()))
}

fn parse_f64(value: &str, what: &str) -> Result<f64, IdError> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|e| IdError::InvalidGeoUri(format!("invalid {}: {}", what, e)))
}

impl FromStr for GeoUri {
    type Err = IdError;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        let raw = uri
            .strip_prefix("geo:")
            .ok_or_else(|| IdError::InvalidGeoUri("must start with 'geo:'".to_string()))?;

        let (main_part, raw_query) = match raw.split_once('?') {
            Some((m, q)) => (m, Some(q)),
            None => (raw, None),
        };

        let mut parts = main_part.split(';');
        let coords: Vec<&str> = parts.next().unwrap_or_default().split(',').collect();
        if coords.len() < 2 || coords.len() > 3 {
            return Err(IdError::InvalidGeoUri(
                "expected 2 or 3 coordinates".to_string(),
            ));
        }

        let mut geo = GeoUri::new(
            parse_f64(coords[0], "latitude")?,
            parse_f64(coords[1], "longitude")?,
        );
        if let Some(alt) = coords.get(2) {
            geo.altitude = Some(parse_f64(alt, "altitude")?);
        }

        for param in parts.filter(|p| !p.is_empty()) {
            let (k, v) = param.split_once('=').unwrap_or((param, ""));
            let key = unescape(k)?;
            let val = unescape(v)?;
            match key.as_str() {
                "u" => geo.uncertainty = Some(parse_f64(&val, "u= uncertainty")?),
                "crs" => geo.crs = Some(val),
                _ => {
                    geo.other_params.insert(key, val);
                }
            }
        }

        if let Some(query) = raw_query.filter(|q| !q.is_empty()) {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                let key = unescape(k)?;
                let val = unescape(v)?;
                match key.as_str() {
                    "z" => {
                        geo.zoom = Some(val.parse().map_err(|e| {
                            IdError::InvalidGeoUri(format!("invalid zoom level: {}", e))
                        })?)
                    }
                    "q" => geo.query = Some(val),
                    _ => {
                        geo.query_params.entry(key).or_insert(val);
                    }
                }
            }
        }

        Ok(geo)
    }
}

impl fmt::Display for GeoUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "geo:{:.5},{:.5}", self.latitude, self.longitude)?;
        if let Some(alt) = self.altitude {
            write!(f, ",{:.3}", alt)?;
        }

        let mut params = Vec::new();
        if let Some(u) = self.uncertainty {
            params.push(format!("u={}", u));
        }
        if let Some(crs) = &self.crs {
            params.push(format!("crs={}", urlencoding::encode(crs)));
        }
        for (k, v) in &self.other_params {
            params.push(format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)));
        }
        params.sort();
        for p in params {
            write!(f, ";{}", p)?;
        }

        let mut query: BTreeMap<&str, String> = BTreeMap::new();
        if let Some(z) = self.zoom {
            query.insert("z", z.to_string());
        }
        if let Some(q) = &self.query {
            query.insert("q", q.clone());
        }
        for (k, v) in &self.query_params {
            query.entry(k.as_str()).or_insert_with(|| v.clone());
        }
        if !query.is_empty() {
            let encoded: Vec<String> = query
                .iter()
                .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                .collect();
            write!(f, "?{}", encoded.join("&"))?;
        }
        Ok(())
    }
}

/// Map a location uncertainty (meters) to the mesh's precision bits.
/// `None` means "precise location not shared" and maps to 0.
pub fn precision_bits(uncertainty: Option<f64>) -> u32 {
    let Some(m) = uncertainty else {
        return 0;
    };
    match m {
        m if m >= 23300.0 => 10,
        m if m >= 11700.0 => 11,
        m if m >= 5800.0 => 12,
        m if m >= 2900.0 => 13,
        m if m >= 1500.0 => 14,
        m if m >= 729.0 => 15,
        m if m >= 364.0 => 16,
        m if m >= 182.0 => 17,
        m if m >= 91.0 => 18,
        m if m >= 45.0 => 19,
        _ => 20,
    }
}

/// Approximate radius in meters covered by a position with the given precision bits
pub fn precision_in_meters(bits: u32) -> u32 {
    match bits {
        2 => 5_976_446,
        3 => 2_988_223,
        4 => 1_494_111,
        5 => 747_055,
        6 => 373_527,
        7 => 186_763,
        8 => 93_381,
        9 => 46_690,
        10 => 23_345,
        11 => 11_672, // Android LOW_PRECISION
        12 => 5_836,
        13 => 2_918,
        14 => 1_459,
        15 => 729,
        16 => 364, // Android MED_PRECISION
        17 => 182,
        18 => 91,
        19 => 45,
        20 => 22,
        21 => 11,
        22 => 5,
        23 => 2,
        24 => 1,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_uri() {
        let geo: GeoUri = "geo:48.2010,16.3695,183;u=35;crs=wgs84?z=12&q=Vienna"
            .parse()
            .unwrap();
        assert!((geo.latitude - 48.201).abs() < 1e-9);
        assert!((geo.longitude - 16.3695).abs() < 1e-9);
        assert_eq!(geo.altitude, Some(183.0));
        assert_eq!(geo.uncertainty, Some(35.0));
        assert_eq!(geo.crs.as_deref(), Some("wgs84"));
        assert_eq!(geo.zoom, Some(12));
        assert_eq!(geo.query.as_deref(), Some("Vienna"));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("48.2,16.3".parse::<GeoUri>().is_err());
        assert!("geo:48.2".parse::<GeoUri>().is_err());
        assert!("geo:1,2,3,4".parse::<GeoUri>().is_err());
        assert!("geo:north,16.3".parse::<GeoUri>().is_err());
        assert!("geo:1,2;u=wide".parse::<GeoUri>().is_err());
    }

    #[test]
    fn test_format() {
        let geo = GeoUri::new(48.2010, 16.3695)
            .with_altitude(183.0)
            .with_uncertainty(35.0);
        assert_eq!(geo.to_string(), "geo:48.20100,16.36950,183.000;u=35");
    }

    #[test]
    fn test_format_then_parse_keeps_extras() {
        let mut geo = GeoUri::new(-33.5, 151.25);
        geo.other_params.insert("label".into(), "my spot".into());
        geo.query = Some("coffee shop".into());
        let parsed: GeoUri = geo.to_string().parse().unwrap();
        assert_eq!(parsed.other_params.get("label").map(String::as_str), Some("my spot"));
        assert_eq!(parsed.query.as_deref(), Some("coffee shop"));
    }

    #[test]
    fn test_precision_bits_table() {
        assert_eq!(precision_bits(None), 0);
        assert_eq!(precision_bits(Some(50_000.0)), 10);
        assert_eq!(precision_bits(Some(23_300.0)), 10);
        assert_eq!(precision_bits(Some(11_700.0)), 11);
        assert_eq!(precision_bits(Some(364.0)), 16);
        assert_eq!(precision_bits(Some(45.0)), 19);
        assert_eq!(precision_bits(Some(3.0)), 20);
    }

    #[test]
    fn test_precision_in_meters() {
        assert_eq!(precision_in_meters(11), 11_672);
        assert_eq!(precision_in_meters(16), 364);
        assert_eq!(precision_in_meters(32), 0);
        assert_eq!(precision_in_meters(1), 0);
    }

    #[test]
    fn test_fixed_point_coordinates() {
        let geo = GeoUri::new(37.7749, -122.4194);
        assert_eq!(geo.latitude_i(), 377_749_000);
        assert_eq!(geo.longitude_i(), -1_224_194_000);
    }
}
