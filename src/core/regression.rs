//! Harmonic regression engine.
//!
//! Fits `ndvi ≈ a + b·t + c·cos(2πt) + d·sin(2πt)` independently for every
//! pixel. Remotely this is `Reducer.robustLinearRegression`; locally the same
//! model is fitted with iteratively reweighted least squares using Tukey
//! bisquare weights, so residual clouds and shadows lose influence.

use crate::core::features::FeatureImage;
use crate::core::graph::{Image, ImageCollection, Reducer};
use crate::types::{Band, CoefficientRaster, TrendError, TrendResult, HARMONIC_INDEPENDENTS, NDVI};
use ndarray::Array2;

/// Number of model parameters
pub const NUM_PARAMS: usize = HARMONIC_INDEPENDENTS.len();

/// Robust fitting parameters
#[derive(Debug, Clone)]
pub struct RegressionParams {
    /// Bisquare tuning constant (95% efficiency under Gaussian noise)
    pub tuning_constant: f64,
    pub max_iterations: usize,
    /// Convergence threshold on the largest coefficient change
    pub tolerance: f64,
}

impl Default for RegressionParams {
    fn default() -> Self {
        Self {
            tuning_constant: 4.685,
            max_iterations: 50,
            tolerance: 1e-10,
        }
    }
}

/// Harmonic regression engine
pub struct HarmonicRegression {
    params: RegressionParams,
}

impl HarmonicRegression {
    pub fn new(params: RegressionParams) -> Self {
        Self { params }
    }

    /// Remote reduction: robust regression over `constant, t, cos, sin, ndvi`,
    /// flattened into one band per coefficient and clipped to the AOI mask
    pub fn build_graph(&self, features: &ImageCollection, aoi_mask: &Image) -> Image {
        let mut variables: Vec<&str> = HARMONIC_INDEPENDENTS.to_vec();
        variables.push(NDVI);

        features
            .select(&variables)
            .reduce(&Reducer::robust_linear_regression(NUM_PARAMS, 1))
            .select(&["coefficients"])
            .array_project(&[0])
            .array_flatten(&HARMONIC_INDEPENDENTS)
            .update_mask(aoi_mask)
    }

    /// Fit one pixel series. `None` when there are fewer finite observations
    /// than parameters or the design is singular.
    pub fn fit_pixel(&self, xs: &[[f64; NUM_PARAMS]], ys: &[f64]) -> Option<[f64; NUM_PARAMS]> {
        let (xs, ys): (Vec<[f64; NUM_PARAMS]>, Vec<f64>) = xs
            .iter()
            .zip(ys)
            .filter(|(x, y)| y.is_finite() && x.iter().all(|v| v.is_finite()))
            .map(|(x, y)| (*x, *y))
            .unzip();

        if ys.len() < NUM_PARAMS {
            return None;
        }

        let mut weights = vec![1.0; ys.len()];
        let mut beta = weighted_least_squares(&xs, &ys, &weights)?;

        for iteration in 0..self.params.max_iterations {
            let residuals: Vec<f64> = xs
                .iter()
                .zip(&ys)
                .map(|(x, y)| y - dot(x, &beta))
                .collect();

            let scale = mad_scale(&residuals);
            if scale <= 1e-9 * (1.0 + max_abs(&ys)) {
                // residuals are at rounding level: the fit is exact
                break;
            }

            let cutoff = self.params.tuning_constant * scale;
            for (w, r) in weights.iter_mut().zip(&residuals) {
                *w = bisquare(r / cutoff);
            }

            let Some(next) = weighted_least_squares(&xs, &ys, &weights) else {
                log::trace!("Weighted system singular at iteration {}, keeping previous fit", iteration);
                break;
            };
            let change = next
                .iter()
                .zip(&beta)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max);
            beta = next;
            if change < self.params.tolerance {
                break;
            }
        }

        Some(beta)
    }

    /// Fit every pixel of a feature stack into a coefficient raster
    pub fn fit(&self, features: &[FeatureImage]) -> TrendResult<CoefficientRaster> {
        let first = features.first().ok_or_else(|| {
            TrendError::EmptyCollection("feature construction".to_string())
        })?;
        let (rows, cols) = first.dim();
        if let Some(bad) = features.iter().find(|f| f.dim() != (rows, cols)) {
            return Err(TrendError::InvalidInput(format!(
                "Image {} has shape {:?}, expected {:?}",
                bad.system_index,
                bad.dim(),
                (rows, cols)
            )));
        }

        log::info!(
            "Fitting harmonic regression over {} images, {} x {} pixels",
            features.len(),
            rows,
            cols
        );

        let xs: Vec<[f64; NUM_PARAMS]> = features.iter().map(|f| f.independents()).collect();
        let fit_at = |index: usize| {
            let (i, j) = (index / cols, index % cols);
            let ys: Vec<f64> = features.iter().map(|f| f.ndvi[[i, j]] as f64).collect();
            self.fit_pixel(&xs, &ys)
        };

        #[cfg(feature = "parallel")]
        let fits: Vec<Option<[f64; NUM_PARAMS]>> = {
            use rayon::prelude::*;
            (0..rows * cols).into_par_iter().map(fit_at).collect()
        };
        #[cfg(not(feature = "parallel"))]
        let fits: Vec<Option<[f64; NUM_PARAMS]>> = (0..rows * cols).map(fit_at).collect();

        let band = |k: usize| -> Band {
            Array2::from_shape_fn((rows, cols), |(i, j)| {
                fits[i * cols + j].map_or(f32::NAN, |beta| beta[k] as f32)
            })
        };
        let raster = CoefficientRaster {
            constant: band(0),
            t: band(1),
            cos: band(2),
            sin: band(3),
        };

        log::info!(
            "Harmonic regression produced {} valid pixels of {}",
            raster.valid_pixel_count(),
            rows * cols
        );
        Ok(raster)
    }
}

impl Default for HarmonicRegression {
    fn default() -> Self {
        Self::new(RegressionParams::default())
    }
}

fn dot(x: &[f64; NUM_PARAMS], beta: &[f64; NUM_PARAMS]) -> f64 {
    x.iter().zip(beta).map(|(a, b)| a * b).sum()
}

fn max_abs(values: &[f64]) -> f64 {
    values.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()))
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

/// Normalized median absolute deviation of the residuals
fn mad_scale(residuals: &[f64]) -> f64 {
    let mut sorted = residuals.to_vec();
    let center = median(&mut sorted);
    let mut deviations: Vec<f64> = residuals.iter().map(|r| (r - center).abs()).collect();
    median(&mut deviations) / 0.6745
}

fn bisquare(u: f64) -> f64 {
    if u.abs() >= 1.0 {
        0.0
    } else {
        let v = 1.0 - u * u;
        v * v
    }
}

/// Solve the weighted normal equations `(XᵀWX) β = XᵀWy`
fn weighted_least_squares(
    xs: &[[f64; NUM_PARAMS]],
    ys: &[f64],
    weights: &[f64],
) -> Option<[f64; NUM_PARAMS]> {
    let mut a = [[0.0; NUM_PARAMS]; NUM_PARAMS];
    let mut b = [0.0; NUM_PARAMS];
    for ((x, y), w) in xs.iter().zip(ys).zip(weights) {
        for i in 0..NUM_PARAMS {
            b[i] += w * x[i] * y;
            for j in 0..NUM_PARAMS {
                a[i][j] += w * x[i] * x[j];
            }
        }
    }
    solve(a, b)
}

/// Gaussian elimination with partial pivoting
fn solve(
    mut a: [[f64; NUM_PARAMS]; NUM_PARAMS],
    mut b: [f64; NUM_PARAMS],
) -> Option<[f64; NUM_PARAMS]> {
    let norm = a.iter().flatten().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    if norm == 0.0 {
        return None;
    }
    let singular = norm * 1e-12;

    for col in 0..NUM_PARAMS {
        let pivot = (col..NUM_PARAMS)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() <= singular {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in col + 1..NUM_PARAMS {
            let factor = a[row][col] / a[col][col];
            for k in col..NUM_PARAMS {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = [0.0; NUM_PARAMS];
    for row in (0..NUM_PARAMS).rev() {
        let tail: f64 = (row + 1..NUM_PARAMS).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Some(x)
}
