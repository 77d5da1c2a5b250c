//! Core harmonic trend modules

pub mod graph;
pub mod preprocess;
pub mod features;
pub mod regression;
pub mod trend;
pub mod export;

// Re-export main types
pub use graph::{Expression, Geometry, Image, ImageCollection};
pub use preprocess::{ImagePreprocessor, JoinedScene};
pub use features::{FeatureBuilder, FeatureImage, continuous_time, harmonic_basis, ndvi};
pub use regression::{HarmonicRegression, RegressionParams};
pub use trend::HarmonicTrendModel;
pub use export::{
    CancellationToken, ExportBackend, ExportJob, ExportOrchestrator, ExportOutcome, ExportRequest,
    JobHandle, JobState, PollPolicy, RemoteStatus,
};
