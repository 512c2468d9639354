//! Mel filterbank and the fixed mel ↔ linear projection.

mod mel;
mod projector;

pub use mel::*;
pub use projector::MelPseudoInverseProjector;
