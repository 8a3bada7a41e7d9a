//! Levenberg-Marquardt least squares for 1-D profile models.

use crate::config::ZFitConfig;
use nalgebra::{DMatrix, DVector};

/// Model that can be fitted to `(x, y)` samples.
pub trait LmModel<const N: usize> {
    fn evaluate(&self, x: f64, params: &[f64; N]) -> f64;

    fn jacobian_row(&self, x: f64, params: &[f64; N]) -> [f64; N];

    /// Applies parameter constraints after an update.
    fn constrain(&self, _params: &mut [f64; N]) {}
}

#[derive(Debug, Clone, Copy)]
pub struct LmResult<const N: usize> {
    pub params: [f64; N],
    pub chi2: f64,
    pub converged: bool,
    pub iterations: usize,
}

/// `a * exp(-(x - mu)^2 / (2 sigma^2))` with `[a, mu, sigma]` free.
pub struct Gaussian;

impl LmModel<3> for Gaussian {
    fn evaluate(&self, x: f64, p: &[f64; 3]) -> f64 {
        let [a, mu, sigma] = *p;
        a * (-(x - mu).powi(2) / (2.0 * sigma * sigma)).exp()
    }

    fn jacobian_row(&self, x: f64, p: &[f64; 3]) -> [f64; 3] {
        let [a, mu, sigma] = *p;
        let d = x - mu;
        let e = (-d * d / (2.0 * sigma * sigma)).exp();
        [e, a * e * d / (sigma * sigma), a * e * d * d / sigma.powi(3)]
    }

    fn constrain(&self, p: &mut [f64; 3]) {
        // sigma enters squared; keep the positive branch
        p[2] = p[2].abs().max(1e-6);
    }
}

/// Gaussian with amplitude and width fixed; only the centre is free.
pub struct GaussianCentre {
    pub amplitude: f64,
    pub sigma: f64,
}

impl LmModel<1> for GaussianCentre {
    fn evaluate(&self, x: f64, p: &[f64; 1]) -> f64 {
        Gaussian.evaluate(x, &[self.amplitude, p[0], self.sigma])
    }

    fn jacobian_row(&self, x: f64, p: &[f64; 1]) -> [f64; 1] {
        [Gaussian.jacobian_row(x, &[self.amplitude, p[0], self.sigma])[1]]
    }
}

pub fn optimize<const N: usize, M: LmModel<N>>(
    model: &M,
    xs: &[f64],
    ys: &[f64],
    initial: [f64; N],
    config: &ZFitConfig,
) -> LmResult<N> {
    let mut params = initial;
    let mut lambda = config.initial_lambda;
    let mut prev_chi2 = chi2(model, xs, ys, &params);
    let mut converged = false;
    let mut iterations = 0;

    for iter in 0..config.max_iterations {
        iterations = iter + 1;

        let mut hessian = DMatrix::<f64>::zeros(N, N);
        let mut gradient = DVector::<f64>::zeros(N);
        for (&x, &y) in xs.iter().zip(ys) {
            let row = model.jacobian_row(x, &params);
            let residual = y - model.evaluate(x, &params);
            for i in 0..N {
                gradient[i] += row[i] * residual;
                for j in 0..N {
                    hessian[(i, j)] += row[i] * row[j];
                }
            }
        }

        let mut damped = hessian;
        for i in 0..N {
            damped[(i, i)] *= 1.0 + lambda;
            if damped[(i, i)] == 0.0 {
                damped[(i, i)] = lambda;
            }
        }

        let Some(delta) = damped.lu().solve(&gradient) else {
            break;
        };

        let mut candidate = params;
        for (p, d) in candidate.iter_mut().zip(delta.iter()) {
            *p += d;
        }
        model.constrain(&mut candidate);

        let new_chi2 = chi2(model, xs, ys, &candidate);
        if new_chi2.is_finite() && new_chi2 < prev_chi2 {
            params = candidate;
            lambda *= config.lambda_down;
            prev_chi2 = new_chi2;

            let max_delta = delta.iter().fold(0.0f64, |m, d| m.max(d.abs()));
            if max_delta < config.convergence_threshold {
                converged = true;
                break;
            }
        } else {
            lambda *= config.lambda_up;
            if lambda > config.max_lambda {
                // no step reduces chi2 any further: a minimum at working precision
                converged = prev_chi2.is_finite();
                break;
            }
        }
    }

    LmResult {
        params,
        chi2: prev_chi2,
        converged,
        iterations,
    }
}

fn chi2<const N: usize, M: LmModel<N>>(model: &M, xs: &[f64], ys: &[f64], params: &[f64; N]) -> f64 {
    xs.iter()
        .zip(ys)
        .map(|(&x, &y)| (y - model.evaluate(x, params)).powi(2))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(a: f64, mu: f64, sigma: f64, n: usize) -> (Vec<f64>, Vec<f64>) {
        let xs: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let ys = xs
            .iter()
            .map(|&x| Gaussian.evaluate(x, &[a, mu, sigma]))
            .collect();
        (xs, ys)
    }

    #[test]
    fn test_recovers_gaussian_parameters() {
        let (xs, ys) = samples(1.0, 21.3, 2.5, 40);
        let result = optimize(&Gaussian, &xs, &ys, [1.0, 20.0, 1.0], &ZFitConfig::default());

        assert!(result.converged);
        assert!((result.params[0] - 1.0).abs() < 1e-6);
        assert!((result.params[1] - 21.3).abs() < 1e-6);
        assert!((result.params[2] - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_centre_only_fit() {
        let (xs, ys) = samples(0.8, 12.75, 3.0, 30);
        let model = GaussianCentre {
            amplitude: 0.8,
            sigma: 3.0,
        };
        let result = optimize(&model, &xs, &ys, [11.0], &ZFitConfig::default());

        assert!(result.converged);
        assert!((result.params[0] - 12.75).abs() < 1e-6);
    }
}
