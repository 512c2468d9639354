//! Inverted dropout with explicit random keys.

use mlx_rs::Array;

use crate::error::Result;

/// Zeroes each element with probability `p` and rescales survivors by
/// `1 / (1 - p)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dropout {
    /// Drop probability in `[0, 1)`.
    pub p: f32,
}

impl Dropout {
    /// Apply dropout using `key` for the mask. Outside training this is the
    /// identity.
    pub fn forward(&self, x: &Array, key: &Array, training: bool) -> Result<Array> {
        if !training || self.p <= 0.0 {
            return Ok(x.clone());
        }
        let draws = mlx_rs::random::uniform::<_, f32>(0.0_f32, 1.0_f32, x.shape(), Some(key))?;
        let mask = draws.gt(&Array::from_f32(self.p))?.as_type::<f32>()?;
        let scale = Array::from_f32(1.0 / (1.0 - self.p));
        Ok(x.multiply(&mask)?.multiply(&scale)?)
    }
}
