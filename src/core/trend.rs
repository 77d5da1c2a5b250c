use crate::config::PipelineConfig;
use crate::core::features::FeatureBuilder;
use crate::core::graph::{Expression, Geometry, Image};
use crate::core::preprocess::ImagePreprocessor;
use crate::core::regression::{HarmonicRegression, RegressionParams};
use crate::types::{CloudProbabilityScene, CoefficientRaster, SpectralScene, TrendResult};
use ndarray::Array2;

/// Preprocessor, feature builder and regression engine wired together
pub struct HarmonicTrendModel {
    preprocessor: ImagePreprocessor,
    features: FeatureBuilder,
    regression: HarmonicRegression,
}

impl HarmonicTrendModel {
    pub fn new(config: &PipelineConfig) -> TrendResult<Self> {
        Ok(Self {
            preprocessor: ImagePreprocessor::new(config)?,
            features: FeatureBuilder::new(&config.index),
            regression: HarmonicRegression::new(RegressionParams::default()),
        })
    }

    /// Export region
    pub fn region(&self) -> &Geometry {
        self.preprocessor.region()
    }

    /// Lazy coefficient image; nothing is evaluated until it is exported
    pub fn coefficients_graph(&self) -> Image {
        let aoi_mask = Image::constant(1.0).clip(self.region()).mask();
        let masked = self.preprocessor.build_collection();
        let features = self.features.build_graph(&masked);
        self.regression.build_graph(&features, &aoi_mask)
    }

    /// Pretty-printed REST expression of the coefficient image
    pub fn expression_json(&self) -> TrendResult<String> {
        let expression = Expression::encode(&self.coefficients_graph().0);
        Ok(serde_json::to_string_pretty(&expression.to_json())?)
    }

    /// Evaluate the same model on in-memory scenes
    pub fn compute_local(
        &self,
        scenes: Vec<SpectralScene>,
        clouds: Vec<CloudProbabilityScene>,
        aoi_mask: Option<&Array2<bool>>,
    ) -> TrendResult<CoefficientRaster> {
        let masked = self.preprocessor.preprocess(scenes, clouds, aoi_mask)?;
        let features = self.features.build_all(&masked);
        self.regression.fit(&features)
    }
}
