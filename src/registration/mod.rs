//! Grid-square registration, refinement from matched points and precision estimates.

pub mod grid;
pub mod precision;
pub mod refinement;
pub mod session;
pub mod snapshot;

pub use grid::{apply_transform, define_grid, GridDefinition, GridMode, GRID_CORNERS};
pub use precision::{convergence, estimate_precision, ConvergencePoint, PrecisionEstimate};
pub use refinement::{refine, undo_refine, MatchedPointPair, RefinementHistory, RefinementRound};
pub use session::{CorrelationSession, MergedImage, Modality, ModalityState, RegistrationState};
pub use snapshot::{ModalitySnapshot, SessionSnapshot};
