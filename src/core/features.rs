use crate::config::IndexConfig;
use crate::core::graph::{Date, Image, ImageCollection};
use crate::core::preprocess::JoinedScene;
use crate::types::{Band, CONSTANT, COS, NDVI, SIN, TIME};
use chrono::{DateTime, Datelike, TimeZone, Utc};
use ndarray::Zip;
use num_traits::Float;
use std::f64::consts::PI;

/// Epoch of the continuous time coordinate
pub const TIME_EPOCH: &str = "1970-01-01";

/// Fractional years elapsed between 1970-01-01 and `date`.
///
/// Whole calendar years are counted exactly; the remainder is the elapsed
/// share of the date's own calendar year, so leap years stretch by a day.
pub fn continuous_time(date: DateTime<Utc>) -> f64 {
    let year = date.year();
    let start = year_start(year);
    let end = year_start(year + 1);
    let elapsed = (date - start).num_milliseconds() as f64;
    let length = (end - start).num_milliseconds() as f64;
    (year - 1970) as f64 + elapsed / length
}

fn year_start(year: i32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Annual harmonic basis `(cos 2πt, sin 2πt)`
pub fn harmonic_basis(t: f64) -> (f64, f64) {
    let radians = t * 2.0 * PI;
    (radians.cos(), radians.sin())
}

/// `(a - b) / (a + b)`, NaN when either input is masked or the sum is zero
pub fn normalized_difference<T: Float>(a: T, b: T) -> T {
    let sum = a + b;
    if a.is_nan() || b.is_nan() || sum == T::zero() {
        return T::nan();
    }
    (a - b) / sum
}

/// NDVI with the fixed reflectance offset added to both bands
pub fn ndvi(nir: &Band, red: &Band, offset: f32) -> Band {
    Zip::from(nir)
        .and(red)
        .map_collect(|n, r| normalized_difference(*n + offset, *r + offset))
}

/// Regression-ready image: NDVI band plus scalar time and basis terms
/// broadcast over the scene grid
#[derive(Debug, Clone)]
pub struct FeatureImage {
    pub system_index: String,
    pub acquired: DateTime<Utc>,
    pub ndvi: Band,
    pub t: f64,
    pub cos: f64,
    pub sin: f64,
}

impl FeatureImage {
    /// Independent variables in model order: constant, t, cos, sin
    pub fn independents(&self) -> [f64; 4] {
        [1.0, self.t, self.cos, self.sin]
    }

    pub fn dim(&self) -> (usize, usize) {
        self.ndvi.dim()
    }
}

/// Feature builder: NDVI, continuous time and harmonic basis per image
pub struct FeatureBuilder {
    index: IndexConfig,
}

impl FeatureBuilder {
    pub fn new(index: &IndexConfig) -> Self {
        Self {
            index: index.clone(),
        }
    }

    pub fn build(&self, joined: &JoinedScene) -> FeatureImage {
        let t = continuous_time(joined.scene.acquired);
        let (cos, sin) = harmonic_basis(t);
        FeatureImage {
            system_index: joined.scene.system_index.clone(),
            acquired: joined.scene.acquired,
            ndvi: ndvi(&joined.scene.nir, &joined.scene.red, self.index.offset as f32),
            t,
            cos,
            sin,
        }
    }

    pub fn build_all(&self, scenes: &[JoinedScene]) -> Vec<FeatureImage> {
        scenes.iter().map(|scene| self.build(scene)).collect()
    }

    /// Remote counterpart: add `ndvi`, `t`, `constant`, `cos` and `sin`
    pub fn build_graph(&self, masked: &ImageCollection) -> ImageCollection {
        let offset = self.index.offset;
        let nir = self.index.nir_band.clone();
        let red = self.index.red_band.clone();
        masked
            .map(move |image| {
                let years = image.date().difference(&Date::parse(TIME_EPOCH), "year");
                image
                    .add_bands(&image.add(offset).normalized_difference(&nir, &red).rename(&[NDVI]))
                    .add_bands(&Image::from_number(&years).rename(&[TIME]).to_float())
                    .add_bands(&Image::constant(1.0))
            })
            .select(&[NDVI, TIME, CONSTANT])
            .map(|image| {
                let radians = image.select(&[TIME]).to_float().multiply(2.0 * PI);
                image
                    .add_bands(&radians.cos().rename(&[COS]))
                    .add_bands(&radians.sin().rename(&[SIN]))
            })
    }
}
