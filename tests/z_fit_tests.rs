use clem_correlate::config::{PeakFindingConfig, ZFitConfig};
use clem_correlate::*;
use ndarray::Array3;

const SLICES: usize = 40;
const SIGMA: f64 = 3.0;

fn profile(centre: f64, amplitude: f64, background: f64) -> Vec<f64> {
    (0..SLICES)
        .map(|z| background + amplitude * (-(z as f64 - centre).powi(2) / (2.0 * SIGMA * SIGMA)).exp())
        .collect()
}

#[test]
fn test_recovers_known_centres() {
    let centres = [15.3, 20.7, 24.1, 18.0];
    let profiles: Vec<Vec<f64>> = centres
        .iter()
        .enumerate()
        .map(|(i, &c)| profile(c, 500.0 + 100.0 * i as f64, 20.0))
        .collect();

    let results = find_z_position(&profiles, &ZFitConfig::default()).unwrap();

    assert_eq!(results.len(), centres.len());
    for (result, expected) in results.iter().zip(centres) {
        let z = result.as_ref().unwrap();
        assert!((z - expected).abs() < 0.02, "fitted {} expected {}", z, expected);
    }
}

#[test]
fn test_flat_profile_fails_alone() {
    let profiles = vec![profile(19.4, 800.0, 0.0), vec![7.0; SLICES], profile(22.2, 600.0, 5.0)];

    let results = find_z_position(&profiles, &ZFitConfig::default()).unwrap();

    assert!((results[0].as_ref().unwrap() - 19.4).abs() < 0.02);
    assert_eq!(
        results[1].as_ref().unwrap_err(),
        &RegistrationError::FitConvergence {
            peak: Some(1),
            reason: "profile is flat".to_string()
        }
    );
    assert!((results[2].as_ref().unwrap() - 22.2).abs() < 0.02);
}

#[test]
fn test_all_flat_profiles_are_rejected() {
    let profiles = vec![vec![1.0; SLICES], vec![3.0; SLICES]];
    let err = find_z_position(&profiles, &ZFitConfig::default()).unwrap_err();
    assert!(matches!(err, RegistrationError::InvalidInput(_)));
}

#[test]
fn test_empty_input_is_rejected() {
    assert!(find_z_position(&[], &ZFitConfig::default()).is_err());
}

#[test]
fn test_fit_error_names_the_profile() {
    let err = RegistrationError::FitConvergence {
        peak: None,
        reason: "no convergence".to_string(),
    };
    assert_eq!(
        err.to_string(),
        "curve fit did not converge for the reference profile: no convergence"
    );
}

#[test]
fn test_fit_peaks_z_stores_positions() {
    let (rows, cols) = (12, 12);
    let mut data = Array3::<f32>::zeros((SLICES, rows, cols));
    let beads = [((3usize, 4usize), 17.6), ((8, 9), 23.2)];
    for &((r, c), centre) in &beads {
        for (z, v) in profile(centre, 1000.0, 10.0).into_iter().enumerate() {
            data[[z, r, c]] = v as f32;
        }
    }
    let stack = ZStack::new(data, 100.0, 300.0);
    assert!((stack.z_scale() - 3.0).abs() < 1e-12);

    let mut peaks = vec![Peak::new(3.2, 3.9), Peak::new(8.0, 9.1)];
    let results = fit_peaks_z(&stack, &mut peaks, &ZFitConfig::default()).unwrap();

    assert!(results.iter().all(|r| r.is_ok()));
    for (peak, (_, centre)) in peaks.iter().zip(beads) {
        let z = peak.z.unwrap();
        assert!((z - centre).abs() < 0.05, "fitted {} expected {}", z, centre);
    }
}

#[test]
fn test_stack_peaks_found_on_max_projection() {
    let (rows, cols) = (16, 16);
    let mut data = Array3::<f32>::from_elem((SLICES, rows, cols), 10.0);
    let beads = [((4usize, 5usize), 16.4), ((11, 10), 22.8)];
    for &((r, c), centre) in &beads {
        for (z, v) in profile(centre, 1000.0, 10.0).into_iter().enumerate() {
            for dr in 0..3 {
                for dc in 0..3 {
                    data[[z, r + dr - 1, c + dc - 1]] = v as f32;
                }
            }
        }
    }
    let stack = ZStack::new(data, 100.0, 200.0);

    let projection = stack.max_projection();
    assert_eq!(projection.shape(), (rows, cols));
    assert_eq!(projection.data[[0, 0]], 10.0);
    assert!(projection.data[[4, 5]] > 1000.0);

    let config = PeakFindingConfig {
        threshold: Some(100.0),
        pixel_lower: 4,
        pixel_upper: 50,
        ..Default::default()
    };
    let (detection, mut peaks, fits) =
        find_stack_peaks(&stack, &config, &ZFitConfig::default()).unwrap();

    assert_eq!(detection.outcomes.len(), 2);
    assert!(fits.iter().all(|f| f.is_ok()));
    peaks.sort_by(|a, b| a.row.total_cmp(&b.row));
    for (peak, ((r, c), centre)) in peaks.iter().zip(beads) {
        assert!((peak.row - r as f64).abs() < 1e-9 && (peak.col - c as f64).abs() < 1e-9);
        let z = peak.z.unwrap();
        assert!((z - centre).abs() < 0.05, "fitted {} expected {}", z, centre);
    }
}

#[test]
fn test_peak_outside_stack_is_rejected() {
    let stack = ZStack::new(Array3::<f32>::zeros((SLICES, 4, 4)), 1.0, 1.0);
    let err = z_profiles(&stack, &[Peak::new(10.0, 1.0)]).unwrap_err();
    assert!(matches!(err, RegistrationError::InvalidInput(_)));
}

#[test]
fn test_noisy_profiles_stay_close() {
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    let mut rng = StdRng::seed_from_u64(42);
    let noise = Normal::new(0.0, 5.0).unwrap();
    let centres = [14.4, 19.0, 21.6, 25.3, 17.8];
    let profiles: Vec<Vec<f64>> = centres
        .iter()
        .map(|&c| {
            profile(c, 1000.0, 50.0)
                .into_iter()
                .map(|v| v + noise.sample(&mut rng))
                .collect()
        })
        .collect();

    let results = find_z_position(&profiles, &ZFitConfig::default()).unwrap();
    for (result, expected) in results.iter().zip(centres) {
        let z = result.as_ref().unwrap();
        assert!((z - expected).abs() < 0.1, "fitted {} expected {}", z, expected);
    }
}
