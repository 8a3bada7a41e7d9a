//! Serialisable session state: plain numbers only, images stay with the caller.

use super::grid::GridDefinition;
use super::refinement::{MatchedPointPair, RefinementHistory, RefinementRound};
use super::session::{CorrelationSession, Modality, ModalityState};
use crate::config::RegistrationConfig;
use crate::data::Image;
use crate::error::RegistrationError;
use crate::peaks::Peak;
use crate::transform::{FibGeometry, Orientation, Transform};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModalitySnapshot {
    pub modality: Modality,
    pub pixel_size: f64,
    /// `(rows, cols)` of the raw image the state belongs to.
    pub shape: (usize, usize),
    pub orientation: Orientation,
    pub grid: Option<GridDefinition>,
    pub transformed: bool,
    pub color_matrix: Option<Transform>,
    pub peaks: Vec<Peak>,
}

impl ModalitySnapshot {
    fn capture(state: &ModalityState) -> Self {
        Self {
            modality: state.modality,
            pixel_size: state.image.pixel_size,
            shape: state.image.shape(),
            orientation: state.orientation,
            grid: state.grid.clone(),
            transformed: state.transformed.is_some(),
            color_matrix: state.color_matrix,
            peaks: state.peaks.clone(),
        }
    }

    fn restore(&self, mut image: Image) -> crate::Result<ModalityState> {
        if image.shape() != self.shape {
            return Err(RegistrationError::InvalidInput(format!(
                "{:?} image has shape {:?}, snapshot expects {:?}",
                self.modality,
                image.shape(),
                self.shape
            )));
        }
        image.pixel_size = self.pixel_size;

        let transformed = match (&self.grid, self.transformed) {
            (Some(grid), true) => Some(super::grid::apply_transform(&image, grid)?),
            _ => None,
        };
        Ok(ModalityState {
            modality: self.modality,
            image,
            orientation: self.orientation,
            grid: self.grid.clone(),
            transformed,
            color_matrix: self.color_matrix,
            peaks: self.peaks.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub saved_at: DateTime<Utc>,
    pub source: ModalitySnapshot,
    pub target: ModalitySnapshot,
    pub fib_geometry: Option<FibGeometry>,
    pub pairs: Vec<MatchedPointPair>,
    pub history: Vec<RefinementRound>,
}

impl SessionSnapshot {
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("failed to write snapshot {}", path.as_ref().display()))?;
        Ok(())
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read snapshot {}", path.as_ref().display()))?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl CorrelationSession {
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id(),
            saved_at: Utc::now(),
            source: ModalitySnapshot::capture(self.source()),
            target: ModalitySnapshot::capture(self.target()),
            fib_geometry: self.fib_geometry().copied(),
            pairs: self.pairs().to_vec(),
            history: self.history().rounds().to_vec(),
        }
    }

    /// Rebuilds a session from a snapshot and the two raw images it was taken on.
    pub fn restore(
        snapshot: &SessionSnapshot,
        source_image: Image,
        target_image: Image,
        config: RegistrationConfig,
    ) -> crate::Result<Self> {
        let source = snapshot.source.restore(source_image)?;
        let target = snapshot.target.restore(target_image)?;
        CorrelationSession::from_parts(
            snapshot.session_id,
            source,
            target,
            snapshot.fib_geometry,
            snapshot.pairs.clone(),
            RefinementHistory::from_rounds(snapshot.history.clone()),
            config,
        )
    }
}
