mod common;

use approx::assert_abs_diff_eq;
use common::{clear_sky, date, init_logging, scene_with_ndvi};
use harmonic_trend::config::PipelineConfig;
use harmonic_trend::core::features::{continuous_time, harmonic_basis};
use harmonic_trend::core::preprocess::ImagePreprocessor;
use harmonic_trend::core::regression::{HarmonicRegression, RegressionParams};
use harmonic_trend::core::trend::HarmonicTrendModel;
use harmonic_trend::types::{CloudProbabilityScene, GeoTransform, SpectralScene, TrendError};
use ndarray::Array2;
use std::time::Instant;

const SHAPE: (usize, usize) = (3, 4);

fn model_value(t: f64, beta: [f64; 4]) -> f64 {
    let (cos, sin) = harmonic_basis(t);
    beta[0] + beta[1] * t + beta[2] * cos + beta[3] * sin
}

/// Monthly growing-season scenes 2017-2023 following `beta` exactly
fn synthetic_series(beta: [f64; 4]) -> (Vec<SpectralScene>, Vec<CloudProbabilityScene>) {
    let mut scenes = Vec::new();
    let mut clouds = Vec::new();
    for year in 2017..=2023 {
        for month in 4..=11 {
            let acquired = date(year, month, 15);
            let index = format!("{}{:02}15T094031_T35UMA", year, month);
            let y = model_value(continuous_time(acquired), beta);
            scenes.push(scene_with_ndvi(&index, acquired, y, SHAPE));
            clouds.push(clear_sky(&index, acquired, SHAPE));
        }
    }
    (scenes, clouds)
}

#[test]
fn test_zero_noise_recovery() {
    init_logging();
    let beta = [0.1, 0.01, 0.1, -0.05];
    let (scenes, clouds) = synthetic_series(beta);
    println!("Fitting {} synthetic scenes", scenes.len());

    let model = HarmonicTrendModel::new(&PipelineConfig::default()).expect("model");
    let start = Instant::now();
    let raster = model.compute_local(scenes, clouds, None).expect("fit");
    println!("Local fit took {:.3} s", start.elapsed().as_secs_f64());

    assert_eq!(raster.dim(), SHAPE);
    assert_eq!(raster.valid_pixel_count(), SHAPE.0 * SHAPE.1);
    for ((c, t), (cos, sin)) in raster
        .constant
        .iter()
        .zip(raster.t.iter())
        .zip(raster.cos.iter().zip(raster.sin.iter()))
    {
        assert_abs_diff_eq!(*c as f64, beta[0], epsilon = 1e-2);
        assert_abs_diff_eq!(*t as f64, beta[1], epsilon = 1e-3);
        assert_abs_diff_eq!(*cos as f64, beta[2], epsilon = 1e-3);
        assert_abs_diff_eq!(*sin as f64, beta[3], epsilon = 1e-3);
    }

    let amplitude = raster.amplitude();
    let phase = raster.phase();
    let expected_amplitude = beta[2].hypot(beta[3]);
    let expected_phase = beta[3].atan2(beta[2]);
    for (a, p) in amplitude.iter().zip(phase.iter()) {
        assert_abs_diff_eq!(*a as f64, expected_amplitude, epsilon = 2e-3);
        assert_abs_diff_eq!(*p as f64, expected_phase, epsilon = 2e-2);
    }
}

#[test]
fn test_outlier_is_downweighted() {
    init_logging();
    let beta = [0.2, 0.005, 0.15, 0.05];
    let mut xs = Vec::new();
    let mut ys = Vec::new();
    for year in 2017..=2023 {
        for month in 4..=11 {
            let t = continuous_time(date(year, month, 10));
            let (cos, sin) = harmonic_basis(t);
            xs.push([1.0, t, cos, sin]);
            ys.push(model_value(t, beta));
        }
    }
    // residual cloud shadow
    ys[17] -= 0.6;

    let fitted = HarmonicRegression::new(RegressionParams::default())
        .fit_pixel(&xs, &ys)
        .expect("fit");
    assert_abs_diff_eq!(fitted[1], beta[1], epsilon = 1e-6);
    assert_abs_diff_eq!(fitted[2], beta[2], epsilon = 1e-6);
    assert_abs_diff_eq!(fitted[3], beta[3], epsilon = 1e-6);
}

#[test]
fn test_continuous_time_is_monotonic() {
    let mut previous = f64::NEG_INFINITY;
    for year in [1970, 1999, 2000, 2016, 2020, 2023] {
        for month in 1..=12 {
            let t = continuous_time(date(year, month, 28));
            assert!(t > previous, "time not increasing at {}-{}", year, month);
            previous = t;
        }
    }
    assert_abs_diff_eq!(continuous_time(date(2023, 1, 1)), 53.0, epsilon = 1e-12);
}

#[test]
fn test_harmonic_basis_is_unit() {
    for step in 0..500 {
        let t = 47.0 + step as f64 * 0.0137;
        let (cos, sin) = harmonic_basis(t);
        assert_abs_diff_eq!(cos * cos + sin * sin, 1.0, epsilon = 1e-12);
    }
}

#[test]
fn test_cloud_mask_is_idempotent() {
    init_logging();
    let preprocessor = ImagePreprocessor::new(&PipelineConfig::default()).expect("preprocessor");
    let acquired = date(2021, 6, 1);
    let scene = scene_with_ndvi("a", acquired, 0.5, (2, 2));
    let mut cloud = clear_sky("a", acquired, (2, 2));
    cloud.probability = Array2::from_shape_vec((2, 2), vec![10.0, 60.0, 60.5, f32::NAN]).unwrap();

    let joined = preprocessor
        .join(vec![scene], vec![cloud])
        .expect("join")
        .remove(0);
    let once = preprocessor.mask_clouds(joined);
    let twice = preprocessor.mask_clouds(once.clone());

    let masked: Vec<bool> = once.scene.nir.iter().map(|v| v.is_nan()).collect();
    assert_eq!(masked, vec![false, false, true, true]);
    for (a, b) in once.scene.nir.iter().zip(twice.scene.nir.iter()) {
        assert!(a.to_bits() == b.to_bits());
    }
    assert_eq!(once.valid_pixels(), twice.valid_pixels());
}

#[test]
fn test_out_of_season_only_is_empty() {
    init_logging();
    let model = HarmonicTrendModel::new(&PipelineConfig::default()).expect("model");
    let acquired = date(2020, 1, 15);
    let result = model.compute_local(
        vec![scene_with_ndvi("w", acquired, 0.2, SHAPE)],
        vec![clear_sky("w", acquired, SHAPE)],
        None,
    );
    assert!(matches!(result, Err(TrendError::EmptyCollection(_))));
}

#[test]
fn test_aoi_mask_blanks_outside_pixels() {
    init_logging();
    let (scenes, clouds) = synthetic_series([0.1, 0.01, 0.1, -0.05]);
    let mut aoi = Array2::from_elem(SHAPE, true);
    aoi[[0, 0]] = false;
    aoi[[2, 3]] = false;

    let model = HarmonicTrendModel::new(&PipelineConfig::default()).expect("model");
    let raster = model.compute_local(scenes, clouds, Some(&aoi)).expect("fit");
    assert_eq!(raster.valid_pixel_count(), SHAPE.0 * SHAPE.1 - 2);
    assert!(raster.constant[[0, 0]].is_nan());
    assert!(raster.sin[[2, 3]].is_nan());
}

#[test]
fn test_configured_polygon_masks_grid() {
    init_logging();
    let (scenes, clouds) = synthetic_series([0.1, 0.01, 0.1, -0.05]);
    let mut config = PipelineConfig::default();
    config.aoi_polygon = Some(vec![[26.6, 54.7], [27.0, 54.7], [27.0, 55.0], [26.6, 55.0]]);
    let aoi = config.aoi().expect("aoi").expect("polygon set");

    // Pixel centres at lon 26.55..26.85 and lat 54.95..54.75; the first column lies west of the polygon
    let transform = GeoTransform {
        top_left_x: 26.5,
        pixel_width: 0.1,
        rotation_x: 0.0,
        top_left_y: 55.0,
        rotation_y: 0.0,
        pixel_height: -0.1,
    };
    let mask = aoi.pixel_mask(&transform, SHAPE);

    let model = HarmonicTrendModel::new(&config).expect("model");
    let raster = model.compute_local(scenes, clouds, Some(&mask)).expect("fit");
    assert_eq!(raster.valid_pixel_count(), SHAPE.0 * (SHAPE.1 - 1));
    for row in 0..SHAPE.0 {
        assert!(raster.constant[[row, 0]].is_nan());
        assert!(raster.constant[[row, 1]].is_finite());
    }
}
