//! Fixed table of multi-scale smoothness pooling schedules.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Mel2SpecError, Result};

/// One time-axis pooling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolSpec {
    /// Window length in frames.
    pub kernel: i32,
    /// Hop between windows in frames.
    pub stride: i32,
}

impl fmt::Display for PoolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.kernel, self.stride)
    }
}

const fn p(kernel: i32, stride: i32) -> PoolSpec {
    PoolSpec { kernel, stride }
}

const MODE_COUNT: usize = 10;

static MODES: [&[PoolSpec]; MODE_COUNT] = [
    &[p(5, 2), p(15, 5)],
    &[p(5, 2)],
    &[p(3, 1)],
    &[p(3, 1), p(5, 2)],
    &[p(3, 1), p(5, 2), p(7, 3)],
    &[p(15, 5)],
    &[p(3, 1), p(5, 2), p(7, 3), p(15, 5), p(25, 10)],
    &[p(1, 1)],
    &[
        p(1, 1),
        p(3, 1),
        p(5, 2),
        p(15, 5),
        p(7, 3),
        p(25, 10),
        p(9, 4),
        p(20, 5),
        p(5, 3),
    ],
    &[p(6, 2), p(10, 4)],
];

/// A resolved loss mode: its id and pooling schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossMode {
    id: i32,
    pairs: &'static [PoolSpec],
}

impl LossMode {
    /// Number of defined modes; ids run from zero.
    pub const COUNT: i32 = MODE_COUNT as i32;

    /// Resolve a mode id.
    pub fn from_id(id: i32) -> Result<Self> {
        usize::try_from(id)
            .ok()
            .and_then(|i| MODES.get(i))
            .map(|pairs| Self { id, pairs: *pairs })
            .ok_or_else(|| {
                Mel2SpecError::Config(format!(
                    "unknown loss mode {id}, expected 0..{}",
                    Self::COUNT
                ))
            })
    }

    /// Every defined mode, in id order.
    pub fn all() -> impl Iterator<Item = Self> {
        MODES
            .iter()
            .enumerate()
            .map(|(i, pairs)| Self {
                id: i as i32,
                pairs: *pairs,
            })
    }

    /// Mode id.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Pooling windows, in table order.
    pub fn pairs(&self) -> &'static [PoolSpec] {
        self.pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_mode_is_well_formed() {
        for id in 0..LossMode::COUNT {
            let mode = LossMode::from_id(id).unwrap();
            assert_eq!(mode.id(), id);
            assert!(!mode.pairs().is_empty());
            assert!(mode.pairs().len() <= 9);
            for pair in mode.pairs() {
                assert!(pair.stride > 0 && pair.kernel >= pair.stride, "{pair:?}");
            }
        }
    }

    #[test]
    fn test_unknown_ids_fail() {
        assert!(matches!(LossMode::from_id(10), Err(Mel2SpecError::Config(_))));
        assert!(matches!(LossMode::from_id(-1), Err(Mel2SpecError::Config(_))));
    }

    #[test]
    fn test_default_mode() {
        let mode = LossMode::from_id(0).unwrap();
        assert_eq!(mode.pairs(), &[p(5, 2), p(15, 5)]);
        assert_eq!(mode.pairs()[1].to_string(), "15_5");
        assert_eq!(LossMode::all().count(), 10);
    }
}
