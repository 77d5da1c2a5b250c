use crate::config::{CollectionConfig, IndexConfig, PipelineConfig, SeasonWindow};
use crate::core::graph::{Filter, Geometry, Image, ImageCollection};
use crate::types::{
    Aoi, Band, CloudProbabilityScene, SpectralScene, TrendError, TrendResult, PROBABILITY,
};
use chrono::Datelike;
use ndarray::{Array2, Zip};
use std::collections::HashMap;

/// Property the save-first join stores the matching cloud image under
const JOIN_PROPERTY: &str = "cloud_probability";

/// Optical scene paired with its cloud probability image
#[derive(Debug, Clone)]
pub struct JoinedScene {
    pub scene: SpectralScene,
    pub probability: Band,
}

impl JoinedScene {
    /// Number of pixels still holding a finite NIR and red value
    pub fn valid_pixels(&self) -> usize {
        Zip::from(&self.scene.nir)
            .and(&self.scene.red)
            .fold(0, |acc, n, r| acc + usize::from(n.is_finite() && r.is_finite()))
    }
}

/// Image preprocessor: bounds/season filtering, cloud join and cloud masking
pub struct ImagePreprocessor {
    season: SeasonWindow,
    cloud_threshold: f64,
    collections: CollectionConfig,
    index: IndexConfig,
    region: Geometry,
    aoi: Option<Aoi>,
}

impl ImagePreprocessor {
    pub fn new(config: &PipelineConfig) -> TrendResult<Self> {
        let aoi = config.aoi()?;
        let region = match &aoi {
            Some(aoi) => Geometry::polygon(aoi.ring()),
            None => Geometry::from_table(&config.aoi_asset),
        };
        Ok(Self {
            season: config.season,
            cloud_threshold: config.cloud_threshold,
            collections: config.collections.clone(),
            index: config.index.clone(),
            region,
            aoi,
        })
    }

    pub fn region(&self) -> &Geometry {
        &self.region
    }

    /// Bounds and season filter applied to both source collections
    fn filter_bounds_date(&self, collection: &ImageCollection) -> ImageCollection {
        collection
            .filter_bounds(&self.region)
            .filter(&Filter::calendar_range(
                self.season.start_year as i64,
                self.season.end_year as i64,
                "year",
            ))
            .filter(&Filter::calendar_range(
                self.season.start_month as i64,
                self.season.end_month as i64,
                "month",
            ))
    }

    /// Build the remote graph of the cloud-masked, band-selected collection
    pub fn build_collection(&self) -> ImageCollection {
        log::debug!(
            "Building preprocessing graph: years {}-{}, months {}-{}, cloud threshold {}",
            self.season.start_year,
            self.season.end_year,
            self.season.start_month,
            self.season.end_month,
            self.cloud_threshold
        );

        let aoi_mask = Image::constant(1.0).clip(&self.region).mask();
        let bands = [self.index.nir_band.as_str(), self.index.red_band.as_str()];

        let reflectance = ImageCollection::load(&self.collections.surface_reflectance).filter(
            &Filter::less_than(&self.collections.cloud_coverage_property, self.cloud_threshold),
        );
        let reflectance = self
            .filter_bounds_date(&reflectance)
            .map(|image| image.update_mask(&aoi_mask))
            .select(&bands);

        let clouds = self
            .filter_bounds_date(&ImageCollection::load(&self.collections.cloud_probability))
            .map(|image| image.update_mask(&aoi_mask));

        let threshold = self.cloud_threshold;
        reflectance
            .save_first_join(&clouds, JOIN_PROPERTY)
            .map(|image| image.add_bands(&image.property_image(JOIN_PROPERTY)))
            .map(move |image| {
                let cloudy = image.select(&[PROBABILITY]).gt(threshold);
                image.update_mask(&cloudy.not())
            })
    }

    /// Keep scenes below the metadata cloud cover, inside the AOI and season
    pub fn filter_scenes(&self, scenes: Vec<SpectralScene>) -> Vec<SpectralScene> {
        let total = scenes.len();
        let kept: Vec<SpectralScene> = scenes
            .into_iter()
            .filter(|scene| scene.cloud_coverage < self.cloud_threshold)
            .filter(|scene| self.in_bounds_and_season(&scene.footprint, &scene.acquired))
            .collect();
        log::debug!("Scene filter kept {}/{} scenes", kept.len(), total);
        kept
    }

    pub fn filter_cloud_scenes(
        &self,
        clouds: Vec<CloudProbabilityScene>,
    ) -> Vec<CloudProbabilityScene> {
        clouds
            .into_iter()
            .filter(|cloud| self.in_bounds_and_season(&cloud.footprint, &cloud.acquired))
            .collect()
    }

    fn in_bounds_and_season(
        &self,
        footprint: &crate::types::BoundingBox,
        acquired: &chrono::DateTime<chrono::Utc>,
    ) -> bool {
        let in_bounds = self.aoi.as_ref().map_or(true, |aoi| aoi.intersects(footprint));
        in_bounds && self.season.contains(acquired.year(), acquired.month())
    }

    /// Pair each scene with the first cloud image sharing its `system:index`.
    ///
    /// Scenes without a partner are dropped.
    pub fn join(
        &self,
        scenes: Vec<SpectralScene>,
        clouds: Vec<CloudProbabilityScene>,
    ) -> TrendResult<Vec<JoinedScene>> {
        let mut by_index: HashMap<String, Band> = HashMap::new();
        for cloud in clouds {
            by_index.entry(cloud.system_index).or_insert(cloud.probability);
        }

        let mut joined = Vec::with_capacity(scenes.len());
        for scene in scenes {
            let Some(probability) = by_index.get(&scene.system_index) else {
                log::debug!("No cloud probability image for {}", scene.system_index);
                continue;
            };
            if probability.dim() != scene.nir.dim() || scene.red.dim() != scene.nir.dim() {
                return Err(TrendError::InvalidInput(format!(
                    "Scene {} bands are not on a common grid",
                    scene.system_index
                )));
            }
            joined.push(JoinedScene {
                probability: probability.clone(),
                scene,
            });
        }
        Ok(joined)
    }

    /// Mask pixels whose cloud probability is strictly above the threshold.
    ///
    /// Pixels with an undefined probability are masked as well. Applying the
    /// mask a second time changes nothing.
    pub fn mask_clouds(&self, mut joined: JoinedScene) -> JoinedScene {
        let threshold = self.cloud_threshold as f32;
        for band in [&mut joined.scene.nir, &mut joined.scene.red] {
            Zip::from(band).and(&joined.probability).for_each(|value, p| {
                if !(*p <= threshold) {
                    *value = f32::NAN;
                }
            });
        }
        joined
    }

    /// Local preprocessing: filter, join, AOI mask and cloud mask
    pub fn preprocess(
        &self,
        scenes: Vec<SpectralScene>,
        clouds: Vec<CloudProbabilityScene>,
        aoi_mask: Option<&Array2<bool>>,
    ) -> TrendResult<Vec<JoinedScene>> {
        log::info!(
            "Preprocessing {} scenes with {} cloud probability images",
            scenes.len(),
            clouds.len()
        );

        let scenes = self.filter_scenes(scenes);
        let clouds = self.filter_cloud_scenes(clouds);
        let joined = self.join(scenes, clouds)?;

        let masked: Vec<JoinedScene> = joined
            .into_iter()
            .map(|scene| match aoi_mask {
                Some(mask) => apply_pixel_mask(scene, mask),
                None => Ok(scene),
            })
            .map(|scene| scene.map(|s| self.mask_clouds(s)))
            .collect::<TrendResult<_>>()?;

        if masked.is_empty() {
            log::warn!("No scenes survived bounds, season and cloud filtering");
            return Err(TrendError::EmptyCollection(
                "bounds, season and cloud filtering".to_string(),
            ));
        }

        log::info!("Preprocessing kept {} scenes", masked.len());
        Ok(masked)
    }
}

/// Mask pixels outside a boolean footprint (true = keep)
fn apply_pixel_mask(mut joined: JoinedScene, mask: &Array2<bool>) -> TrendResult<JoinedScene> {
    if mask.dim() != joined.scene.nir.dim() {
        return Err(TrendError::InvalidInput(format!(
            "AOI mask shape {:?} does not match scene {} shape {:?}",
            mask.dim(),
            joined.scene.system_index,
            joined.scene.nir.dim()
        )));
    }
    for band in [&mut joined.scene.nir, &mut joined.scene.red] {
        Zip::from(band).and(mask).for_each(|value, keep| {
            if !*keep {
                *value = f32::NAN;
            }
        });
    }
    Ok(joined)
}
