pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod mosaic;
pub mod peaks;
pub mod registration;
pub mod transform;
pub mod visualization;

pub use data::*;
pub use error::RegistrationError;
pub use mosaic::*;
pub use peaks::{
    find_peaks, find_stack_peaks, find_z_position, fit_peaks_z, z_profiles, ComponentOutcome,
    OverlapPolicy, Peak, PeakDetection,
};
pub use registration::*;
pub use transform::*;

pub type Result<T, E = RegistrationError> = std::result::Result<T, E>;
