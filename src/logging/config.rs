//! Logging configuration
//!
//! Per-component log levels, output destinations and file naming for the
//! registration core and the `correlate` binary.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Component names understood by [`LoggingConfig::get_component_level`].
pub const COMPONENTS: [&str; 4] = ["transform", "mosaic", "peaks", "registration"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Global log level (trace, debug, info, warn, error)
    pub global_level: String,

    /// Enable console output
    pub console_output: bool,

    /// Directory for daily rolling JSON log files (None = no file logging)
    pub log_directory: Option<PathBuf>,

    /// File name prefix of the rolling log files
    pub file_prefix: String,

    /// Include file location in console logs
    pub include_file_location: bool,

    /// Transform estimation and chain application
    pub transform_level: String,

    /// Montage assembly
    pub mosaic_level: String,

    /// Peak detection and z fitting
    pub peaks_level: String,

    /// Grid definition, refinement and precision
    pub registration_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            global_level: "info".to_string(),
            console_output: true,
            log_directory: None,
            file_prefix: "correlate.log".to_string(),
            include_file_location: false,
            transform_level: "info".to_string(),
            mosaic_level: "info".to_string(),
            peaks_level: "info".to_string(),
            registration_level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Verbose configuration writing JSON logs to `./logs`
    pub fn development() -> Self {
        Self {
            global_level: "debug".to_string(),
            log_directory: Some(PathBuf::from("logs")),
            include_file_location: true,
            transform_level: "debug".to_string(),
            mosaic_level: "debug".to_string(),
            peaks_level: "trace".to_string(),
            registration_level: "trace".to_string(),
            ..Self::default()
        }
    }

    /// Quiet configuration for batch runs
    pub fn production() -> Self {
        Self {
            global_level: "warn".to_string(),
            console_output: false,
            log_directory: Some(PathBuf::from("/var/log/clem-correlate")),
            transform_level: "warn".to_string(),
            mosaic_level: "warn".to_string(),
            peaks_level: "info".to_string(),
            registration_level: "info".to_string(),
            ..Self::default()
        }
    }

    /// Level for `-v` counts of the command line: 0 keeps the configured level.
    pub fn with_verbosity(mut self, verbose: u8) -> Self {
        let level = match verbose {
            0 => return self,
            1 => "debug",
            _ => "trace",
        };
        self.global_level = level.to_string();
        for component in COMPONENTS {
            self.set_component_level(component, level);
        }
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        let levels = [
            ("global_level", &self.global_level),
            ("transform_level", &self.transform_level),
            ("mosaic_level", &self.mosaic_level),
            ("peaks_level", &self.peaks_level),
            ("registration_level", &self.registration_level),
        ];
        for (name, level) in levels {
            if !VALID_LEVELS.contains(&level.as_str()) {
                return Err(format!(
                    "Invalid {}: {}. Must be one of: {:?}",
                    name, level, VALID_LEVELS
                ));
            }
        }

        if self.file_prefix.is_empty() {
            return Err("file_prefix must not be empty".to_string());
        }

        if let Some(ref log_dir) = self.log_directory {
            if let Some(parent) = log_dir.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    return Err(format!("Log directory parent does not exist: {:?}", parent));
                }
            }
        }

        Ok(())
    }

    /// Effective log level for a component; unknown names get the global level.
    pub fn get_component_level(&self, component: &str) -> &str {
        match component {
            "transform" => &self.transform_level,
            "mosaic" => &self.mosaic_level,
            "peaks" => &self.peaks_level,
            "registration" => &self.registration_level,
            _ => &self.global_level,
        }
    }

    fn set_component_level(&mut self, component: &str, level: &str) {
        let slot = match component {
            "transform" => &mut self.transform_level,
            "mosaic" => &mut self.mosaic_level,
            "peaks" => &mut self.peaks_level,
            "registration" => &mut self.registration_level,
            _ => &mut self.global_level,
        };
        *slot = level.to_string();
    }

    /// `EnvFilter` directives: the crate at the global level plus one per component module.
    pub fn filter_directives(&self) -> String {
        let krate = env!("CARGO_PKG_NAME").replace('-', "_");
        let mut directives = vec![format!("{}={}", krate, self.global_level)];
        for component in COMPONENTS {
            directives.push(format!(
                "{}::{}={}",
                krate,
                component,
                self.get_component_level(component)
            ));
        }
        directives.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.global_level, "info");
        assert!(config.console_output);
        assert!(config.log_directory.is_none());
        assert!(!config.include_file_location);
    }

    #[test]
    fn test_development_config() {
        let config = LoggingConfig::development();
        assert_eq!(config.global_level, "debug");
        assert_eq!(config.peaks_level, "trace");
        assert!(config.include_file_location);
        assert!(config.log_directory.is_some());
    }

    #[test]
    fn test_production_config() {
        let config = LoggingConfig::production();
        assert_eq!(config.global_level, "warn");
        assert!(!config.console_output);
    }

    #[test]
    fn test_config_validation() {
        let mut config = LoggingConfig::default();
        assert!(config.validate().is_ok());

        config.global_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.global_level = "debug".to_string();
        config.mosaic_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_component_level_selection() {
        let config = LoggingConfig::development();
        assert_eq!(config.get_component_level("registration"), "trace");
        assert_eq!(config.get_component_level("mosaic"), "debug");
        assert_eq!(config.get_component_level("unknown"), "debug");
    }

    #[test]
    fn test_verbosity_overrides_levels() {
        let config = LoggingConfig::default().with_verbosity(0);
        assert_eq!(config.global_level, "info");

        let config = LoggingConfig::default().with_verbosity(1);
        assert_eq!(config.global_level, "debug");
        assert_eq!(config.peaks_level, "debug");

        let config = LoggingConfig::default().with_verbosity(3);
        assert_eq!(config.registration_level, "trace");
    }

    #[test]
    fn test_filter_directives_cover_components() {
        let directives = LoggingConfig::default().filter_directives();
        assert!(directives.starts_with("clem_correlate=info"));
        assert!(directives.contains("clem_correlate::peaks=info"));
        assert!(directives.contains("clem_correlate::registration=info"));
    }
}
