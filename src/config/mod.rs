use crate::logging::LoggingConfig;
use crate::peaks::{Connectivity, OverlapPolicy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub peak_finding: PeakFindingConfig,
    pub z_fit: ZFitConfig,
    pub mosaic: MosaicConfig,
    pub registration: RegistrationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeakFindingConfig {
    /// Fixed intensity threshold; `None` derives it from the brightest pixels.
    pub threshold: Option<f64>,
    /// Fraction of the mean of the brightest pixels used as automatic threshold.
    pub threshold_fraction: f64,
    pub brightest_pixels: usize,
    /// Components smaller than this are noise.
    pub pixel_lower: usize,
    /// Components at least this large are treated as merged peaks.
    pub pixel_upper: usize,
    pub flood_steps: usize,
    /// Split into exactly two is rejected when the smaller part is below this size.
    pub roi_min_size: usize,
    /// Flooding stops at this fraction of the component maximum.
    pub flood_ceiling: f64,
    pub connectivity: Connectivity,
    pub overlap_policy: OverlapPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZFitConfig {
    pub max_iterations: usize,
    pub convergence_threshold: f64,
    pub initial_lambda: f64,
    pub lambda_up: f64,
    pub lambda_down: f64,
    /// Upper bound on the damping factor before a fit is declared failed.
    pub max_lambda: f64,
    pub initial_sigma: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MosaicConfig {
    /// Pixel-count reduction factor; the subsampling stride is its integer square root.
    pub downsampling: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub min_refine_points: usize,
    /// Convergence curves are only computed from this many pairs on.
    pub min_convergence_points: usize,
    pub fib_tilt_degrees: f64,
    /// Disables shear in grid definition.
    pub rotation_only: bool,
}

impl Default for PeakFindingConfig {
    fn default() -> Self {
        Self {
            threshold: None,
            threshold_fraction: 0.1,
            brightest_pixels: 100,
            pixel_lower: 50,
            pixel_upper: 200,
            flood_steps: 10,
            roi_min_size: 10,
            flood_ceiling: 0.95,
            connectivity: Connectivity::Four,
            overlap_policy: OverlapPolicy::Centroid,
        }
    }
}

impl Default for ZFitConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            convergence_threshold: 1e-8,
            initial_lambda: 1e-3,
            lambda_up: 10.0,
            lambda_down: 0.1,
            max_lambda: 1e10,
            initial_sigma: 1.0,
        }
    }
}

impl Default for MosaicConfig {
    fn default() -> Self {
        Self { downsampling: 1 }
    }
}

impl MosaicConfig {
    pub fn stride(&self) -> usize {
        (self.downsampling.max(1) as f64).sqrt().floor().max(1.0) as usize
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            min_refine_points: crate::transform::MIN_AFFINE_POINTS,
            min_convergence_points: 10,
            fib_tilt_degrees: crate::transform::DEFAULT_FIB_TILT_DEGREES,
            rotation_only: false,
        }
    }
}

impl RegistrationConfig {
    /// FIB geometry at the configured stage tilt.
    pub fn fib_geometry(&self, z_scale: f64, z_origin: f64) -> crate::transform::FibGeometry {
        crate::transform::FibGeometry {
            tilt_degrees: self.fib_tilt_degrees,
            z_scale,
            z_origin,
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;

        if content.trim_start().starts_with('{') {
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(toml::from_str(&content)?)
        }
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P, format: ConfigFormat) -> anyhow::Result<()> {
        let content = match format {
            ConfigFormat::Json => serde_json::to_string_pretty(self)?,
            ConfigFormat::Toml => toml::to_string_pretty(self)?,
        };

        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let peaks = &self.peak_finding;

        if peaks.pixel_lower >= peaks.pixel_upper {
            errors.push("peak_finding pixel_lower must be less than pixel_upper".to_string());
        }

        if peaks.flood_steps == 0 {
            errors.push("peak_finding flood_steps must be positive".to_string());
        }

        if peaks.brightest_pixels == 0 {
            errors.push("peak_finding brightest_pixels must be positive".to_string());
        }

        if !(0.0..=1.0).contains(&peaks.flood_ceiling) {
            errors.push("peak_finding flood_ceiling must lie in [0, 1]".to_string());
        }

        if matches!(peaks.threshold, Some(t) if t < 0.0) {
            errors.push("peak_finding threshold must be non-negative".to_string());
        }

        if self.z_fit.max_iterations == 0 {
            errors.push("z_fit max_iterations must be positive".to_string());
        }

        if self.z_fit.initial_sigma <= 0.0 {
            errors.push("z_fit initial_sigma must be positive".to_string());
        }

        if self.mosaic.downsampling == 0 {
            errors.push("mosaic downsampling must be at least 1".to_string());
        }

        if self.registration.min_refine_points < crate::transform::MIN_AFFINE_POINTS {
            errors.push(format!(
                "registration min_refine_points must be at least {}",
                crate::transform::MIN_AFFINE_POINTS
            ));
        }

        if self.registration.min_convergence_points < crate::transform::MIN_AFFINE_POINTS {
            errors.push(format!(
                "registration min_convergence_points must be at least {}",
                crate::transform::MIN_AFFINE_POINTS
            ));
        }

        if !(0.0..90.0).contains(&self.registration.fib_tilt_degrees) {
            errors.push("registration fib_tilt_degrees must lie in [0, 90)".to_string());
        }

        if let Err(logging_error) = self.logging.validate() {
            errors.push(format!("logging: {}", logging_error));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConfigFormat {
    Json,
    Toml,
}

pub fn load_config_or_default(config_path: Option<&str>) -> Config {
    match config_path {
        Some(path) => match Config::load_from_file(path) {
            Ok(config) => {
                if let Err(errors) = config.validate() {
                    tracing::warn!(path, "Configuration validation failed, using defaults");
                    for error in errors {
                        tracing::warn!("  - {}", error);
                    }
                    Config::default()
                } else {
                    config
                }
            }
            Err(e) => {
                tracing::warn!(path, error = %e, "Failed to load config, using defaults");
                Config::default()
            }
        },
        None => Config::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_mosaic_stride_is_integer_square_root() {
        assert_eq!(MosaicConfig { downsampling: 1 }.stride(), 1);
        assert_eq!(MosaicConfig { downsampling: 100 }.stride(), 10);
        assert_eq!(MosaicConfig { downsampling: 10 }.stride(), 3);
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = Config::default();
        config.peak_finding.pixel_lower = 300;
        config.peak_finding.flood_steps = 0;
        config.mosaic.downsampling = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_toml_and_json_round_trip() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.peak_finding.flood_steps = 7;
        config.registration.rotation_only = true;

        let toml_path = dir.path().join("config.toml");
        config.save_to_file(&toml_path, ConfigFormat::Toml).unwrap();
        let loaded = Config::load_from_file(&toml_path).unwrap();
        assert_eq!(loaded.peak_finding.flood_steps, 7);
        assert!(loaded.registration.rotation_only);

        let json_path = dir.path().join("config.json");
        config.save_to_file(&json_path, ConfigFormat::Json).unwrap();
        let loaded = Config::load_from_file(&json_path).unwrap();
        assert_eq!(loaded.peak_finding.flood_steps, 7);
    }

    #[test]
    fn test_partial_file_uses_section_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(&path, "[peak_finding]\npixel_upper = 120\n").unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.peak_finding.pixel_upper, 120);
        assert_eq!(config.peak_finding.pixel_lower, 50);
        assert_eq!(config.registration.min_convergence_points, 10);
    }

    #[test]
    fn test_fib_geometry_uses_configured_tilt() {
        let config = RegistrationConfig {
            fib_tilt_degrees: 38.0,
            ..Default::default()
        };
        let geometry = config.fib_geometry(2.5, 12.0);
        assert_eq!(geometry.tilt_degrees, 38.0);
        assert_eq!(geometry.z_scale, 2.5);
        assert_eq!(geometry.z_origin, 12.0);
    }

    #[test]
    fn test_invalid_file_falls_back_to_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[mosaic]\ndownsampling = 0\n").unwrap();

        let config = load_config_or_default(path.to_str());
        assert_eq!(config.mosaic.downsampling, 1);
    }
}
