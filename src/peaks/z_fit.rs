//! Axial position of beads from their focus profiles through a z-stack.
//!
//! Profiles are normalised and shifted so their maxima coincide, averaged into
//! a population reference and fitted with a Gaussian. Each bead is then
//! refitted with the reference amplitude and width fixed, leaving only its
//! centre free.

use super::lm::{optimize, Gaussian, GaussianCentre};
use super::Peak;
use crate::config::ZFitConfig;
use crate::data::ZStack;
use crate::error::RegistrationError;
use tracing::{debug, warn};

/// One profile placed in a buffer of twice its length with its maximum at the centre.
struct ShiftedProfile {
    values: Vec<f64>,
    shift: usize,
}

fn shift_profile(profile: &[f64]) -> Option<ShiftedProfile> {
    let n = profile.len();
    let min = profile.iter().copied().fold(f64::INFINITY, f64::min);
    let max = profile.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !(max - min).is_finite() || max - min <= 0.0 {
        return None;
    }
    let argmax = profile.iter().position(|&v| v == max)?;

    let len = 2 * n;
    let shift = n - argmax;
    let mut values = vec![0.0; len];
    for (i, &v) in profile.iter().enumerate() {
        values[shift + i] = (v - min) / (max - min);
    }
    // wrap the gaps by mirroring about the buffer origin
    for k in (0..shift).chain(shift + n..len) {
        values[k] = values[(len - k) % len];
    }
    Some(ShiftedProfile { values, shift })
}

fn check_profiles(profiles: &[Vec<f64>]) -> crate::Result<usize> {
    let n = profiles
        .first()
        .map(|p| p.len())
        .ok_or_else(|| RegistrationError::InvalidInput("no z-profiles given".to_string()))?;
    if n < 3 {
        return Err(RegistrationError::InvalidInput(format!(
            "z-profiles need at least 3 slices, got {n}"
        )));
    }
    if let Some(bad) = profiles.iter().position(|p| p.len() != n) {
        return Err(RegistrationError::InvalidInput(format!(
            "profile {bad} has {} slices, expected {n}",
            profiles[bad].len()
        )));
    }
    Ok(n)
}

/// Fitted z (slice index units) per profile.
///
/// The outer error covers unusable input and a failed reference fit; a failed
/// fit of a single profile only fails its own entry.
pub fn find_z_position(
    profiles: &[Vec<f64>],
    config: &ZFitConfig,
) -> crate::Result<Vec<crate::Result<f64>>> {
    let n = check_profiles(profiles)?;
    let len = 2 * n;
    let xs: Vec<f64> = (0..len).map(|i| i as f64).collect();

    let shifted: Vec<Option<ShiftedProfile>> = profiles.iter().map(|p| shift_profile(p)).collect();
    let usable: Vec<&ShiftedProfile> = shifted.iter().flatten().collect();
    if usable.is_empty() {
        return Err(RegistrationError::InvalidInput(
            "every z-profile is flat".to_string(),
        ));
    }

    let mut reference = vec![0.0; len];
    for profile in &usable {
        for (r, v) in reference.iter_mut().zip(&profile.values) {
            *r += v;
        }
    }
    reference.iter_mut().for_each(|r| *r /= usable.len() as f64);

    let population = optimize(
        &Gaussian,
        &xs,
        &reference,
        [1.0, n as f64, config.initial_sigma],
        config,
    );
    let [amplitude, centre, sigma] = population.params;
    if !population.converged || !population.params.iter().all(|p| p.is_finite()) {
        return Err(RegistrationError::FitConvergence {
            peak: None,
            reason: format!("no convergence after {} iterations", population.iterations),
        });
    }
    debug!(amplitude, centre, sigma, "Fitted reference z-profile");

    let model = GaussianCentre { amplitude, sigma };
    let results = shifted
        .iter()
        .enumerate()
        .map(|(peak, profile)| {
            let profile = profile.as_ref().ok_or_else(|| RegistrationError::FitConvergence {
                peak: Some(peak),
                reason: "profile is flat".to_string(),
            })?;
            let fit = optimize(&model, &xs, &profile.values, [centre], config);
            let mu = fit.params[0];
            if !fit.converged || !mu.is_finite() || !(0.0..len as f64).contains(&mu) {
                warn!(peak, iterations = fit.iterations, "z fit failed");
                return Err(RegistrationError::FitConvergence {
                    peak: Some(peak),
                    reason: format!("centre fit ended at {mu:.3} after {} iterations", fit.iterations),
                });
            }
            Ok(mu - profile.shift as f64)
        })
        .collect();
    Ok(results)
}

/// Intensity traces through `stack` at each peak's rounded position.
pub fn z_profiles(stack: &ZStack, peaks: &[Peak]) -> crate::Result<Vec<Vec<f64>>> {
    let (_, rows, cols) = stack.data.dim();
    peaks
        .iter()
        .map(|peak| {
            let row = peak.row.round();
            let col = peak.col.round();
            if row < 0.0 || col < 0.0 || row >= rows as f64 || col >= cols as f64 {
                return Err(RegistrationError::InvalidInput(format!(
                    "peak ({:.1}, {:.1}) lies outside the {}x{} stack",
                    peak.row, peak.col, rows, cols
                )));
            }
            Ok(stack.profile(row as usize, col as usize))
        })
        .collect()
}

/// Fits z for every peak and stores successful fits on the peak.
pub fn fit_peaks_z(
    stack: &ZStack,
    peaks: &mut [Peak],
    config: &ZFitConfig,
) -> crate::Result<Vec<crate::Result<f64>>> {
    let profiles = z_profiles(stack, peaks)?;
    let results = find_z_position(&profiles, config)?;
    for (peak, result) in peaks.iter_mut().zip(&results) {
        peak.z = result.as_ref().ok().copied();
    }
    Ok(results)
}
