use super::precision::{convergence, estimate_precision, PrecisionEstimate};
use crate::config::RegistrationConfig;
use crate::error::RegistrationError;
use crate::transform::{compose, estimate_affine, Point2, StageKind, Transform, TransformChain, TransformKind};
use serde::{Deserialize, Serialize};
use tracing::info;

/// A source point, its z for FIB targets, and where it was observed in the target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchedPointPair {
    pub source: Point2,
    #[serde(default)]
    pub z: Option<f64>,
    pub target: Point2,
}

impl MatchedPointPair {
    pub fn new(source: Point2, target: Point2) -> Self {
        Self {
            source,
            z: None,
            target,
        }
    }

    pub fn with_z(source: Point2, z: f64, target: Point2) -> Self {
        Self {
            source,
            z: Some(z),
            target,
        }
    }
}

/// One refinement step; kept so it can be undone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementRound {
    pub pairs: Vec<MatchedPointPair>,
    /// Pair sources through the chain as it was before this round.
    pub pre_refinement: Vec<Point2>,
    pub correction: Transform,
    /// This round's correction after all earlier ones.
    pub accumulated: Transform,
    pub precision: PrecisionEstimate,
}

/// Append-only stack of refinement rounds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefinementHistory {
    rounds: Vec<RefinementRound>,
}

impl RefinementHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rounds(rounds: Vec<RefinementRound>) -> Self {
        Self { rounds }
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    pub fn rounds(&self) -> &[RefinementRound] {
        &self.rounds
    }

    pub fn last(&self) -> Option<&RefinementRound> {
        self.rounds.last()
    }

    /// Total correction of all rounds; identity when empty.
    pub fn accumulated(&self) -> Transform {
        self.rounds
            .last()
            .map(|r| r.accumulated)
            .unwrap_or_else(Transform::identity)
    }

    pub fn precision(&self) -> Option<&PrecisionEstimate> {
        self.rounds.last().map(|r| &r.precision)
    }

    /// `base` with the accumulated correction as its refinement stage.
    pub fn chain(&self, base: &TransformChain) -> TransformChain {
        let mut chain = base.without(StageKind::Refinement);
        if !self.is_empty() {
            chain.set_planar(StageKind::Refinement, self.accumulated());
        }
        chain
    }
}

/// Fits a correction from the chain's current prediction onto the observed
/// target points and appends it to `history`.
///
/// `base` is the chain without any refinement stage; `pixel_size` is the
/// target's, used to express the precision in physical units.
pub fn refine<'a>(
    base: &TransformChain,
    history: &'a mut RefinementHistory,
    pairs: &[MatchedPointPair],
    pixel_size: f64,
    config: &RegistrationConfig,
) -> crate::Result<&'a RefinementRound> {
    let required = config.min_refine_points.max(crate::transform::MIN_AFFINE_POINTS);
    if pairs.len() < required {
        return Err(RegistrationError::insufficient(required, pairs.len()));
    }

    let current = history.chain(base);
    let pre_refinement = pairs
        .iter()
        .map(|pair| current.apply(pair.source, pair.z))
        .collect::<crate::Result<Vec<_>>>()?;
    let observed: Vec<Point2> = pairs.iter().map(|p| p.target).collect();

    let correction = estimate_affine(&pre_refinement, &observed)?;
    let correction = Transform::new(correction.matrix, TransformKind::Refinement);
    let accumulated = Transform::new(
        compose(&[correction, history.accumulated()]).matrix,
        TransformKind::Refinement,
    );

    let mut refined = base.without(StageKind::Refinement);
    refined.set_planar(StageKind::Refinement, accumulated);
    let mut precision = estimate_precision(&refined, pairs, pixel_size)?;
    precision.convergence = convergence(
        &pre_refinement,
        &observed,
        config.min_convergence_points,
        pixel_size,
    );

    info!(
        round = history.len() + 1,
        pairs = pairs.len(),
        rms = format!("{:.3}", precision.rms),
        "Refinement round applied"
    );

    history.rounds.push(RefinementRound {
        pairs: pairs.to_vec(),
        pre_refinement,
        correction,
        accumulated,
        precision,
    });
    history
        .rounds
        .last()
        .ok_or_else(|| RegistrationError::InvalidState("refinement round was not recorded".to_string()))
}

/// Removes the latest round; the history's accumulated correction and
/// precision fall back to the round before it.
pub fn undo_refine(history: &mut RefinementHistory) -> crate::Result<RefinementRound> {
    let round = history
        .rounds
        .pop()
        .ok_or_else(|| RegistrationError::InvalidState("no refinement to undo".to_string()))?;
    info!(remaining = history.len(), "Refinement round undone");
    Ok(round)
}
