//! harmonic-trend: Sentinel-2 NDVI harmonic trend coefficients
//!
//! Builds a lazy Earth Engine expression that cloud-masks Sentinel-2 surface
//! reflectance over an area of interest, derives NDVI plus time and harmonic
//! features, and fits a robust linear regression per pixel. The coefficient
//! image is exported to Drive as a GeoTIFF (with one escalated retry) and
//! downloaded locally. The same model can be evaluated on in-memory rasters.

pub mod types;
pub mod config;
pub mod core;
pub mod io;
pub mod pipeline;

// Re-export main types and functions for easier access
pub use types::{
    Aoi, CloudProbabilityScene, CoefficientRaster, SpectralScene, TrendError, TrendResult,
};
pub use config::PipelineConfig;
pub use crate::core::{ExportOrchestrator, HarmonicTrendModel};
pub use io::{ArtifactLocator, DriveClient, EarthEngineClient};
pub use pipeline::{PipelineDriver, PipelineReport, Stage};
