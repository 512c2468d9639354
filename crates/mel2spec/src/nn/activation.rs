//! Pointwise activations selectable per stack.

use mlx_rs::{nn, Array};

use crate::config::ActivationType;
use crate::error::Result;

/// Negative slope of the leaky ReLU.
const LEAKY_SLOPE: f32 = 0.1;

/// Stateless activation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activation(pub ActivationType);

impl Activation {
    /// Apply the activation elementwise.
    pub fn forward(&self, x: &Array) -> Result<Array> {
        let y = match self.0 {
            ActivationType::None => return Ok(x.clone()),
            ActivationType::Sigmoid => nn::sigmoid(x)?,
            ActivationType::Relu => nn::relu(x)?,
            ActivationType::Lrelu => nn::leaky_relu(x, LEAKY_SLOPE)?,
            ActivationType::Selu => nn::selu(x)?,
        };
        Ok(y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(kind: ActivationType, values: &[f32]) -> Vec<f32> {
        let x = Array::from_slice(values, &[values.len() as i32]);
        let y = Activation(kind).forward(&x).unwrap();
        y.eval().unwrap();
        y.as_slice::<f32>().to_vec()
    }

    fn close(a: &[f32], b: &[f32]) -> bool {
        a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-5)
    }

    #[test]
    fn test_relu_and_identity() {
        assert!(close(&apply(ActivationType::Relu, &[-2.0, 0.0, 3.0]), &[0.0, 0.0, 3.0]));
        assert!(close(&apply(ActivationType::None, &[-2.0, 0.5]), &[-2.0, 0.5]));
    }

    #[test]
    fn test_leaky_relu_slope() {
        assert!(close(&apply(ActivationType::Lrelu, &[-2.0, 4.0]), &[-0.2, 4.0]));
    }

    #[test]
    fn test_sigmoid_midpoint() {
        assert!(close(&apply(ActivationType::Sigmoid, &[0.0]), &[0.5]));
    }

    #[test]
    fn test_selu() {
        // scale = 1.0507, scale * alpha * (e^-1 - 1) = -1.1113
        let y = apply(ActivationType::Selu, &[1.0, -1.0, 0.0]);
        assert!(close(&y[..1], &[1.050_701]), "{y:?}");
        assert!((y[1] + 1.111_330_7).abs() < 1e-4, "{y:?}");
        assert!(y[2].abs() < 1e-6);
    }
}
