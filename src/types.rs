use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Real-valued raster band; masked pixels are NaN
pub type Band = Array2<f32>;

/// Name of the NDVI band
pub const NDVI: &str = "ndvi";
/// Continuous time band (fractional years since 1970-01-01)
pub const TIME: &str = "t";
/// Regression intercept band
pub const CONSTANT: &str = "constant";
/// Annual cosine basis band
pub const COS: &str = "cos";
/// Annual sine basis band
pub const SIN: &str = "sin";
/// Cloud probability band added by the join
pub const PROBABILITY: &str = "probability";

/// Independent variables of the harmonic model, in coefficient order
pub const HARMONIC_INDEPENDENTS: [&str; 4] = [CONSTANT, TIME, COS, SIN];

/// Geospatial bounding box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_lon <= other.max_lon
            && other.min_lon <= self.max_lon
            && self.min_lat <= other.max_lat
            && other.min_lat <= self.max_lat
    }
}

/// Geospatial transformation parameters (GDAL ordering)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// Map coordinates of the centre of pixel (row, col)
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        let c = col as f64 + 0.5;
        let r = row as f64 + 0.5;
        (
            self.top_left_x + c * self.pixel_width + r * self.rotation_x,
            self.top_left_y + c * self.rotation_y + r * self.pixel_height,
        )
    }
}

/// Area of interest: a closed lon/lat polygon ring.
///
/// Constructed once from configuration and shared read-only by every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aoi {
    ring: Vec<[f64; 2]>,
}

impl Aoi {
    /// Build an AOI from a polygon ring; the ring is closed if needed
    pub fn new(mut ring: Vec<[f64; 2]>) -> TrendResult<Self> {
        if ring.len() < 3 {
            return Err(TrendError::InvalidInput(format!(
                "AOI polygon needs at least 3 vertices, got {}",
                ring.len()
            )));
        }
        if ring.first() != ring.last() {
            let first = ring[0];
            ring.push(first);
        }
        Ok(Self { ring })
    }

    pub fn ring(&self) -> &[[f64; 2]] {
        &self.ring
    }

    pub fn bounding_box(&self) -> BoundingBox {
        let mut bbox = BoundingBox {
            min_lon: f64::INFINITY,
            max_lon: f64::NEG_INFINITY,
            min_lat: f64::INFINITY,
            max_lat: f64::NEG_INFINITY,
        };
        for [lon, lat] in &self.ring {
            bbox.min_lon = bbox.min_lon.min(*lon);
            bbox.max_lon = bbox.max_lon.max(*lon);
            bbox.min_lat = bbox.min_lat.min(*lat);
            bbox.max_lat = bbox.max_lat.max(*lat);
        }
        bbox
    }

    /// Coarse intersection test against a scene footprint
    pub fn intersects(&self, footprint: &BoundingBox) -> bool {
        self.bounding_box().intersects(footprint)
    }

    /// Even-odd ray casting point-in-polygon test
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        let mut inside = false;
        for edge in self.ring.windows(2) {
            let [x1, y1] = edge[0];
            let [x2, y2] = edge[1];
            if (y1 > lat) != (y2 > lat) {
                let x_cross = x1 + (lat - y1) * (x2 - x1) / (y2 - y1);
                if lon < x_cross {
                    inside = !inside;
                }
            }
        }
        inside
    }

    /// Boolean mask of the pixels whose centres fall inside the AOI
    pub fn pixel_mask(&self, transform: &GeoTransform, shape: (usize, usize)) -> Array2<bool> {
        Array2::from_shape_fn(shape, |(row, col)| {
            let (x, y) = transform.pixel_center(row, col);
            self.contains(x, y)
        })
    }
}

/// Optical scene with the two bands needed for NDVI (Sentinel-2 B8 and B4)
#[derive(Debug, Clone)]
pub struct SpectralScene {
    /// Acquisition index shared with the cloud probability collection
    pub system_index: String,
    pub acquired: DateTime<Utc>,
    pub footprint: BoundingBox,
    /// Scene-level cloud coverage metadata, percent
    pub cloud_coverage: f64,
    pub nir: Band,
    pub red: Band,
}

/// Per-pixel cloud probability image (0-100)
#[derive(Debug, Clone)]
pub struct CloudProbabilityScene {
    pub system_index: String,
    pub acquired: DateTime<Utc>,
    pub footprint: BoundingBox,
    pub probability: Band,
}

/// Coefficient raster produced by the harmonic regression.
///
/// One band per model term; pixels without a valid fit are NaN.
#[derive(Debug, Clone)]
pub struct CoefficientRaster {
    pub constant: Band,
    pub t: Band,
    pub cos: Band,
    pub sin: Band,
}

impl CoefficientRaster {
    pub fn band(&self, name: &str) -> Option<&Band> {
        match name {
            CONSTANT => Some(&self.constant),
            TIME => Some(&self.t),
            COS => Some(&self.cos),
            SIN => Some(&self.sin),
            _ => None,
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.constant.dim()
    }

    pub fn valid_pixel_count(&self) -> usize {
        self.constant.iter().filter(|v| v.is_finite()).count()
    }

    /// Seasonal amplitude sqrt(cos² + sin²) per pixel
    pub fn amplitude(&self) -> Band {
        ndarray::Zip::from(&self.cos)
            .and(&self.sin)
            .map_collect(|c, s| c.hypot(*s))
    }

    /// Seasonal phase atan2(sin, cos) per pixel, radians
    pub fn phase(&self) -> Band {
        ndarray::Zip::from(&self.cos)
            .and(&self.sin)
            .map_collect(|c, s| s.atan2(*c))
    }
}

/// Error types for the trend pipeline
#[derive(Debug, thiserror::Error)]
pub enum TrendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Remote service returned {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Image collection is empty after {0}")]
    EmptyCollection(String),

    #[error("Export failed after {attempts} attempt(s): {reason}")]
    ExportFailed { attempts: usize, reason: String },

    #[error("Export job {job} did not finish within {waited:?}")]
    Timeout { job: String, waited: Duration },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("File {filename} not found in remote folder {folder}")]
    ArtifactNotFound { folder: String, filename: String },
}

/// Result type for pipeline operations
pub type TrendResult<T> = Result<T, TrendError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Aoi {
        Aoi::new(vec![[26.0, 54.0], [27.0, 54.0], [27.0, 55.0], [26.0, 55.0]]).unwrap()
    }

    #[test]
    fn test_aoi_ring_is_closed() {
        let aoi = square();
        assert_eq!(aoi.ring().len(), 5);
        assert_eq!(aoi.ring().first(), aoi.ring().last());
    }

    #[test]
    fn test_aoi_contains() {
        let aoi = square();
        assert!(aoi.contains(26.5, 54.5));
        assert!(!aoi.contains(25.5, 54.5));
        assert!(!aoi.contains(26.5, 55.5));
    }

    #[test]
    fn test_aoi_pixel_mask() {
        let aoi = square();
        let transform = GeoTransform {
            top_left_x: 25.5,
            pixel_width: 0.5,
            rotation_x: 0.0,
            top_left_y: 55.5,
            rotation_y: 0.0,
            pixel_height: -0.5,
        };
        let mask = aoi.pixel_mask(&transform, (4, 4));
        // centres at 25.75, 26.25, 26.75, 27.25 / 55.25, 54.75, 54.25, 53.75
        assert!(mask[[1, 1]]);
        assert!(mask[[2, 2]]);
        assert!(!mask[[0, 0]]);
        assert!(!mask[[3, 3]]);
        assert_eq!(mask.iter().filter(|m| **m).count(), 4);
    }

    #[test]
    fn test_amplitude_and_phase() {
        let raster = CoefficientRaster {
            constant: Band::from_elem((1, 2), 0.5),
            t: Band::from_elem((1, 2), 0.01),
            cos: Band::from_shape_vec((1, 2), vec![3.0, f32::NAN]).unwrap(),
            sin: Band::from_shape_vec((1, 2), vec![4.0, 1.0]).unwrap(),
        };
        let amplitude = raster.amplitude();
        let phase = raster.phase();
        assert!((amplitude[[0, 0]] - 5.0).abs() < 1e-6);
        assert!((phase[[0, 0]] - 4.0_f32.atan2(3.0)).abs() < 1e-6);
        assert!(amplitude[[0, 1]].is_nan());
        assert!(phase[[0, 1]].is_nan());
    }

    #[test]
    fn test_degenerate_aoi_rejected() {
        assert!(Aoi::new(vec![[0.0, 0.0], [1.0, 1.0]]).is_err());
    }
}
