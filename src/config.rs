//! Pipeline configuration.
//!
//! Loaded once at startup (TOML file or defaults) and handed to each
//! component constructor. Defaults reproduce the Narochansky National Park
//! deployment.

use crate::types::{Aoi, TrendError, TrendResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "harmonic-trend";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Earth Engine cloud project
    pub project: String,
    /// Table asset holding the AOI boundary
    pub aoi_asset: String,
    /// Inline AOI ring (lon, lat); takes precedence over `aoi_asset`
    pub aoi_polygon: Option<Vec<[f64; 2]>>,
    /// Exported file name, including extension
    pub raster_name: String,
    /// Remote folder the export is written to; also the local sub-directory
    pub drive_folder: String,
    /// Local directory under which `drive_folder` is created
    pub download_root: PathBuf,
    /// Cloud probability above which a pixel is masked
    pub cloud_threshold: f64,
    pub collections: CollectionConfig,
    pub season: SeasonWindow,
    pub index: IndexConfig,
    pub export: ExportSettings,
    pub polling: PollingConfig,
    pub auth: AuthConfig,
    pub endpoints: Endpoints,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            project: "ee-mkurzenkovotd14".to_string(),
            aoi_asset: "projects/ee-mkurzenkovotd14/assets/granica_np_narochanski".to_string(),
            aoi_polygon: None,
            raster_name: "s2_harmonic_trends_2023.tif".to_string(),
            drive_folder: "naroch".to_string(),
            download_root: PathBuf::from("."),
            cloud_threshold: 60.0,
            collections: CollectionConfig::default(),
            season: SeasonWindow::default(),
            index: IndexConfig::default(),
            export: ExportSettings::default(),
            polling: PollingConfig::default(),
            auth: AuthConfig::default(),
            endpoints: Endpoints::default(),
        }
    }
}

/// Source collections and metadata property names
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    pub surface_reflectance: String,
    pub cloud_probability: String,
    /// Scene-level cloud coverage property used for the metadata pre-filter
    pub cloud_coverage_property: String,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            surface_reflectance: "COPERNICUS/S2_SR_HARMONIZED".to_string(),
            cloud_probability: "COPERNICUS/S2_CLOUD_PROBABILITY".to_string(),
            cloud_coverage_property: "CLOUD_COVERAGE_ASSESSMENT".to_string(),
        }
    }
}

/// Multi-year growing-season window; both ranges are inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeasonWindow {
    pub start_year: i32,
    pub end_year: i32,
    pub start_month: u32,
    pub end_month: u32,
}

impl Default for SeasonWindow {
    fn default() -> Self {
        Self {
            start_year: 2017,
            end_year: 2023,
            start_month: 4,
            end_month: 11,
        }
    }
}

impl SeasonWindow {
    pub fn contains(&self, year: i32, month: u32) -> bool {
        (self.start_year..=self.end_year).contains(&year)
            && (self.start_month..=self.end_month).contains(&month)
    }
}

/// Vegetation index inputs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub nir_band: String,
    pub red_band: String,
    /// Additive offset applied to both bands before the normalized difference
    pub offset: f64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            nir_band: "B8".to_string(),
            red_band: "B4".to_string(),
            offset: 1000.0,
        }
    }
}

/// Export file format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileFormat {
    #[serde(rename = "GEO_TIFF", alias = "GeoTIFF")]
    GeoTiff,
}

impl FileFormat {
    pub fn api_name(&self) -> &'static str {
        match self {
            FileFormat::GeoTiff => "GEO_TIFF",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            FileFormat::GeoTiff => "image/tiff",
        }
    }
}

/// Fixed export parameters and the pixel ceiling escalation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// Ground sample distance, metres
    pub scale: f64,
    pub crs: String,
    pub file_format: FileFormat,
    pub initial_max_pixels: u64,
    /// Multiplier applied to the ceiling for the single retry
    pub escalation_factor: u64,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            scale: 10.0,
            crs: "EPSG:32635".to_string(),
            file_format: FileFormat::GeoTiff,
            initial_max_pixels: 100_000_000,
            escalation_factor: 10,
        }
    }
}

/// Status polling of the export job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_secs: f64,
    /// 1.0 keeps a fixed interval
    pub backoff_factor: f64,
    pub max_interval_secs: f64,
    /// Give up waiting after this long; `None` waits indefinitely
    pub max_wait_secs: Option<f64>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5.0,
            backoff_factor: 1.0,
            max_interval_secs: 60.0,
            max_wait_secs: Some(6.0 * 3600.0),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        saturating_duration(self.interval_secs)
    }

    pub fn max_interval(&self) -> Duration {
        saturating_duration(self.max_interval_secs)
    }

    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait_secs.map(saturating_duration)
    }
}

/// Seconds to `Duration`, clamped instead of panicking on unvalidated input
fn saturating_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(if secs > 0.0 {
        Duration::MAX
    } else {
        Duration::ZERO
    })
}

/// OAuth material for Earth Engine and Drive
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Authorized-user token cache (access + refresh token)
    pub token_file: PathBuf,
    /// OAuth client secrets, consulted when the token file lacks client fields
    pub credentials_file: PathBuf,
    pub scopes: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        let base = dirs::config_dir()
            .map(|dir| dir.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            token_file: base.join("token.json"),
            credentials_file: base.join("credentials.json"),
            scopes: vec![
                "https://www.googleapis.com/auth/drive".to_string(),
                "https://www.googleapis.com/auth/earthengine".to_string(),
            ],
        }
    }
}

/// REST endpoints, overridable for testing against a local stub
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub earth_engine: String,
    pub drive: String,
    pub request_timeout_secs: u64,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            earth_engine: "https://earthengine.googleapis.com/v1".to_string(),
            drive: "https://www.googleapis.com/drive/v3".to_string(),
            request_timeout_secs: 300,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file; missing keys take defaults
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> TrendResult<Self> {
        log::info!("Reading configuration: {}", path.as_ref().display());
        let content = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> TrendResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| TrendError::Config(format!("Invalid TOML configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Export basename: the raster name without its extension
    pub fn basename(&self) -> String {
        Path::new(&self.raster_name)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.raster_name.clone())
    }

    /// Local destination `{download_root}/{drive_folder}/{raster_name}`
    pub fn output_path(&self) -> PathBuf {
        self.download_root.join(&self.drive_folder).join(&self.raster_name)
    }

    pub fn aoi(&self) -> TrendResult<Option<Aoi>> {
        self.aoi_polygon.clone().map(Aoi::new).transpose()
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> TrendResult<()> {
        let season = &self.season;
        if season.start_year > season.end_year {
            return Err(TrendError::Config(format!(
                "season years inverted: {} > {}",
                season.start_year, season.end_year
            )));
        }
        for month in [season.start_month, season.end_month] {
            if !(1..=12).contains(&month) {
                return Err(TrendError::Config(format!("month {} outside 1-12", month)));
            }
        }
        if season.start_month > season.end_month {
            return Err(TrendError::Config(format!(
                "season months inverted: {} > {}",
                season.start_month, season.end_month
            )));
        }
        if !(0.0..=100.0).contains(&self.cloud_threshold) {
            return Err(TrendError::Config(format!(
                "cloud threshold {} outside 0-100",
                self.cloud_threshold
            )));
        }
        if !(self.export.scale > 0.0) {
            return Err(TrendError::Config("export scale must be positive".to_string()));
        }
        if self.export.initial_max_pixels == 0 {
            return Err(TrendError::Config("max pixels must be positive".to_string()));
        }
        if self.export.escalation_factor <= 1 {
            return Err(TrendError::Config(
                "escalation factor must be greater than 1".to_string(),
            ));
        }
        let backoff = self.polling.backoff_factor;
        if !(backoff >= 1.0 && backoff.is_finite()) {
            return Err(TrendError::Config(format!(
                "polling backoff factor {} must be finite and >= 1",
                backoff
            )));
        }
        let durations = [
            ("interval_secs", Some(self.polling.interval_secs)),
            ("max_interval_secs", Some(self.polling.max_interval_secs)),
            ("max_wait_secs", self.polling.max_wait_secs),
        ];
        for (name, secs) in durations {
            if let Some(secs) = secs {
                Duration::try_from_secs_f64(secs).map_err(|e| {
                    TrendError::Config(format!("polling {} = {}: {}", name, secs, e))
                })?;
            }
        }
        if self.raster_name.is_empty() || self.drive_folder.is_empty() {
            return Err(TrendError::Config(
                "raster name and drive folder are required".to_string(),
            ));
        }
        self.aoi()?;
        Ok(())
    }
}
