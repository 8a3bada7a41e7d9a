use super::{compose, FibProjection, Point2, Transform};
use crate::error::RegistrationError;
use serde::{Deserialize, Serialize};

/// Named links of a transform chain, declared in application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StageKind {
    /// Per-channel alignment of the source image.
    ColorChannel,
    /// Flip/transpose/rotate state of the source image.
    Orientation,
    /// Source grid square onto the target's transformed grid square.
    Correspondence,
    /// `(x, y, z)` into FIB slice pixels.
    Fib,
    /// Accumulated point-pair refinement.
    Refinement,
    /// Back from the target's transformed frame into its raw pixels.
    TargetFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StageOp {
    Planar(Transform),
    Fib(FibProjection),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChainStage {
    pub kind: StageKind,
    pub op: StageOp,
}

/// Ordered list of named stages; composition order is decided here and nowhere else.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformChain {
    stages: Vec<ChainStage>,
}

impl TransformChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, kind: StageKind, op: StageOp) -> Self {
        self.set(kind, op);
        self
    }

    /// Inserts or replaces the stage of `kind`, keeping stages in application order.
    pub fn set(&mut self, kind: StageKind, op: StageOp) {
        let stage = ChainStage { kind, op };
        match self.stages.binary_search_by(|s| s.kind.cmp(&kind)) {
            Ok(idx) => self.stages[idx] = stage,
            Err(idx) => self.stages.insert(idx, stage),
        }
    }

    pub fn set_planar(&mut self, kind: StageKind, transform: Transform) {
        self.set(kind, StageOp::Planar(transform));
    }

    pub fn remove(&mut self, kind: StageKind) -> Option<ChainStage> {
        let idx = self.stages.iter().position(|s| s.kind == kind)?;
        Some(self.stages.remove(idx))
    }

    pub fn get(&self, kind: StageKind) -> Option<&ChainStage> {
        self.stages.iter().find(|s| s.kind == kind)
    }

    pub fn contains(&self, kind: StageKind) -> bool {
        self.get(kind).is_some()
    }

    pub fn stages(&self) -> &[ChainStage] {
        &self.stages
    }

    pub fn requires_z(&self) -> bool {
        self.stages.iter().any(|s| matches!(s.op, StageOp::Fib(_)))
    }

    /// Copy of the chain without the stage of `kind`.
    pub fn without(&self, kind: StageKind) -> Self {
        let mut chain = self.clone();
        chain.remove(kind);
        chain
    }

    pub fn apply(&self, point: Point2, z: Option<f64>) -> crate::Result<Point2> {
        apply_chain(self, point, z)
    }

    /// Single 3x3 matrix for chains without a FIB stage.
    pub fn planar_matrix(&self) -> crate::Result<Transform> {
        let planar = self
            .stages
            .iter()
            .rev()
            .map(|stage| match stage.op {
                StageOp::Planar(t) => Ok(t),
                StageOp::Fib(_) => Err(RegistrationError::InvalidState(
                    "a chain with a FIB stage has no planar matrix".to_string(),
                )),
            })
            .collect::<crate::Result<Vec<_>>>()?;
        Ok(compose(&planar))
    }

    /// Maps a point from the chain's output space back into its input space.
    pub fn inverse_apply(&self, point: Point2) -> crate::Result<Point2> {
        Ok(self.planar_matrix()?.inverse()?.apply(point))
    }
}

/// Applies every stage of `chain` to `point` in declared order.
///
/// `z` is required once the chain contains a FIB stage.
pub fn apply_chain(chain: &TransformChain, point: Point2, z: Option<f64>) -> crate::Result<Point2> {
    chain.stages.iter().try_fold(point, |p, stage| match stage.op {
        StageOp::Planar(t) => Ok(t.apply(p)),
        StageOp::Fib(projection) => {
            let z = z.ok_or_else(|| {
                RegistrationError::InvalidInput(
                    "a z position is required to map into a FIB slice".to_string(),
                )
            })?;
            Ok(projection.apply(p, z))
        }
    })
}
