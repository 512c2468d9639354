//! Strided 2D convolutions over `[batch, channels, frequency, time]` tensors.
//!
//! Kernels are stored in the conventional layouts (`[out, in, kh, kw]` for
//! convolutions, `[in, out, kh, kw]` for transposed convolutions) and only
//! rearranged into MLX's channels-last layout at call time. Either kind can
//! be weight-normalised: `W = g * (v / ||v||)` with one magnitude per
//! leading-dim slice.

use mlx_rs::macros::ModuleParameters;
use mlx_rs::module::Param;
use mlx_rs::Array;

use crate::error::{Mel2SpecError, Result};
use crate::types::Device;

/// Bias value every convolution starts from.
const BIAS_INIT: f32 = 0.01;

/// Kernel parameters as `(weight, weight_v, weight_g)`: either a plain
/// weight, or a direction and per-slice magnitude.
type KernelParams = (
    Param<Option<Array>>,
    Param<Option<Array>>,
    Param<Option<Array>>,
);

/// Draw a kernel from `Normal(0, gain / sqrt(fan))`, where `fan` is the
/// product of dims 1..3 of the stored layout.
fn init_kernel(shape: [i32; 4], gain: f32, seed: u64, weight_norm: bool) -> Result<KernelParams> {
    let fan = shape[1] * shape[2] * shape[3];
    let std = gain / (fan as f32).sqrt();
    let key = mlx_rs::random::key(seed)?;
    let v = mlx_rs::random::normal::<f32>(&shape, None, Some(std), Some(&key))?;

    if weight_norm {
        let g = slice_norm(&v)?;
        Ok((Param::new(None), Param::new(Some(v)), Param::new(Some(g))))
    } else {
        Ok((Param::new(Some(v)), Param::new(None), Param::new(None)))
    }
}

/// Effective weights in the stored layout: `W = g * (v / ||v||)` when
/// weight-normalised.
fn effective_weight(
    weight: &Param<Option<Array>>,
    weight_v: &Param<Option<Array>>,
    weight_g: &Param<Option<Array>>,
) -> Result<Array> {
    match (&weight.value, &weight_v.value, &weight_g.value) {
        (Some(w), _, _) => Ok(w.clone()),
        (None, Some(v), Some(g)) => {
            let direction = v.divide(&slice_norm(v)?)?;
            Ok(direction.multiply(g)?)
        }
        _ => Err(Mel2SpecError::WeightLoad(
            "convolution has neither a weight nor a weight_v/weight_g pair".to_string(),
        )),
    }
}

fn kernel_shape<'a>(
    weight: &'a Param<Option<Array>>,
    weight_v: &'a Param<Option<Array>>,
) -> &'a [i32] {
    weight
        .value
        .as_ref()
        .or(weight_v.value.as_ref())
        .map(Array::shape)
        .unwrap_or(&[])
}

/// L2 norm over dims 1..3, shaped `[d0, 1, 1, 1]` for broadcasting.
fn slice_norm(weight: &Array) -> Result<Array> {
    let sum_sq = weight.square()?.sum_axes(&[1, 2, 3], Some(true))?;
    let eps = Array::from_f32(1e-12);
    Ok(sum_sq.sqrt()?.add(&eps)?)
}

/// Replication padding on the frequency (axis 2) and time (axis 3) axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationPad2d {
    /// Rows repeated before the first frequency bin.
    pub top: i32,
    /// Rows repeated after the last frequency bin.
    pub bottom: i32,
    /// Columns repeated before the first frame.
    pub left: i32,
    /// Columns repeated after the last frame.
    pub right: i32,
}

impl ReplicationPad2d {
    /// Pad `[B, C, F, T]` to `[B, C, F + top + bottom, T + left + right]`.
    pub fn forward(&self, x: &Array) -> Result<Array> {
        let x = replicate_edges(x, 2, self.top, self.bottom)?;
        replicate_edges(&x, 3, self.left, self.right)
    }
}

fn replicate_edges(x: &Array, axis: i32, before: i32, after: i32) -> Result<Array> {
    if before == 0 && after == 0 {
        return Ok(x.clone());
    }
    let len = x.dim(axis);
    let indices: Vec<i32> = std::iter::repeat(0)
        .take(before as usize)
        .chain(0..len)
        .chain(std::iter::repeat(len - 1).take(after as usize))
        .collect();
    let indices = Array::from_slice(&indices, &[indices.len() as i32]);
    Ok(x.take_axis(&indices, axis)?)
}

/// Convolution without implicit padding.
///
/// The kernel is stored `[out, in, kh, kw]`, either as `weight` or as the
/// weight-normalised pair `weight_v` / `weight_g`.
#[derive(Debug, ModuleParameters)]
pub struct Conv2d {
    /// Plain kernel.
    #[param]
    pub weight: Param<Option<Array>>,
    /// Direction parameter (unnormalised weights).
    #[param]
    pub weight_v: Param<Option<Array>>,
    /// Magnitude, `[out, 1, 1, 1]`.
    #[param]
    pub weight_g: Param<Option<Array>>,
    /// Bias, `[out]`.
    #[param]
    pub bias: Param<Array>,
    /// Stride along (frequency, time).
    pub stride: (i32, i32),
}

impl Conv2d {
    /// Create a convolution with normal-initialised weights.
    pub fn new(
        in_channels: i32,
        out_channels: i32,
        kernel_size: (i32, i32),
        stride: (i32, i32),
        gain: f32,
        seed: u64,
        weight_norm: bool,
    ) -> Result<Self> {
        let (weight, weight_v, weight_g) = init_kernel(
            [out_channels, in_channels, kernel_size.0, kernel_size.1],
            gain,
            seed,
            weight_norm,
        )?;

        Ok(Self {
            weight,
            weight_v,
            weight_g,
            bias: Param::new(constant(out_channels, BIAS_INIT)?),
            stride,
        })
    }

    /// Effective kernel, `[out, in, kh, kw]`.
    pub fn kernel(&self) -> Result<Array> {
        effective_weight(&self.weight, &self.weight_v, &self.weight_g)
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// * `x` - Input tensor [batch, in_channels, freq, time]
    ///
    /// # Returns
    /// Output tensor [batch, out_channels, (freq - kh) / sh + 1, (time - kw) / sw + 1]
    pub fn forward(&self, x: &Array, device: Device) -> Result<Array> {
        let weight = self.kernel()?;
        check_channels(x, weight.dim(1))?;

        // [out, in, kh, kw] -> [out, kh, kw, in]
        let weight = weight.transpose_axes(&[0, 2, 3, 1])?;
        let output = conv_nchw(x, &weight, self.stride, (0, 0), device)?;
        add_bias(&output, self.bias.as_ref())
    }
}

/// Transposed convolution, computed as zero insertion followed by a
/// convolution with the spatially flipped kernel.
///
/// The kernel is stored `[in, out, kh, kw]`.
#[derive(Debug, ModuleParameters)]
pub struct ConvTranspose2d {
    /// Plain kernel.
    #[param]
    pub weight: Param<Option<Array>>,
    /// Direction parameter (unnormalised weights).
    #[param]
    pub weight_v: Param<Option<Array>>,
    /// Magnitude, `[in, 1, 1, 1]`.
    #[param]
    pub weight_g: Param<Option<Array>>,
    /// Bias, `[out]`.
    #[param]
    pub bias: Param<Array>,
    /// Stride along (frequency, time).
    pub stride: (i32, i32),
    /// Padding along (frequency, time).
    pub padding: (i32, i32),
}

impl ConvTranspose2d {
    /// Create a transposed convolution with normal-initialised weights.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: i32,
        out_channels: i32,
        kernel_size: (i32, i32),
        stride: (i32, i32),
        padding: (i32, i32),
        gain: f32,
        seed: u64,
        weight_norm: bool,
    ) -> Result<Self> {
        if padding.0 > kernel_size.0 - 1 || padding.1 > kernel_size.1 - 1 {
            return Err(Mel2SpecError::Config(format!(
                "transposed conv padding {padding:?} exceeds kernel {kernel_size:?} - 1"
            )));
        }
        let (weight, weight_v, weight_g) = init_kernel(
            [in_channels, out_channels, kernel_size.0, kernel_size.1],
            gain,
            seed,
            weight_norm,
        )?;

        Ok(Self {
            weight,
            weight_v,
            weight_g,
            bias: Param::new(constant(out_channels, BIAS_INIT)?),
            stride,
            padding,
        })
    }

    /// Effective kernel, `[in, out, kh, kw]`.
    pub fn kernel(&self) -> Result<Array> {
        effective_weight(&self.weight, &self.weight_v, &self.weight_g)
    }

    /// Stored kernel shape, `[in, out, kh, kw]`.
    pub fn kernel_shape(&self) -> &[i32] {
        kernel_shape(&self.weight, &self.weight_v)
    }

    /// Output extent along one axis for an input extent `len`.
    pub fn output_len(&self, len: i32, axis: usize) -> i32 {
        let (stride, padding) = match axis {
            0 => (self.stride.0, self.padding.0),
            _ => (self.stride.1, self.padding.1),
        };
        let kernel = self.kernel_shape().get(2 + axis.min(1)).copied().unwrap_or(0);
        (len - 1) * stride - 2 * padding + kernel
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// * `x` - Input tensor [batch, in_channels, freq, time]
    ///
    /// # Returns
    /// Output tensor [batch, out_channels, (freq-1)*sh - 2*ph + kh, (time-1)*sw - 2*pw + kw]
    pub fn forward(&self, x: &Array, device: Device) -> Result<Array> {
        let weight = self.kernel()?;
        check_channels(x, weight.dim(0))?;
        let (kh, kw) = (weight.dim(2), weight.dim(3));

        // [in, out, kh, kw] -> [out, in, kh, kw], flipped, then [out, kh, kw, in]
        let weight = weight.transpose_axes(&[1, 0, 2, 3])?;
        let weight = flip_axis(&flip_axis(&weight, 2)?, 3)?;
        let weight = weight.transpose_axes(&[0, 2, 3, 1])?;

        let upsampled = insert_zeros(x, 2, self.stride.0)?;
        let upsampled = insert_zeros(&upsampled, 3, self.stride.1)?;

        let padding = (kh - 1 - self.padding.0, kw - 1 - self.padding.1);
        let output = conv_nchw(&upsampled, &weight, (1, 1), padding, device)?;
        add_bias(&output, self.bias.as_ref())
    }
}

fn constant(len: i32, value: f32) -> Result<Array> {
    Ok(mlx_rs::ops::ones::<f32>(&[len])?.multiply(&Array::from_f32(value))?)
}

fn check_channels(x: &Array, channels: i32) -> Result<()> {
    if x.ndim() != 4 || x.dim(1) != channels {
        return Err(Mel2SpecError::ShapeMismatch {
            expected: vec![-1, channels, -1, -1],
            actual: x.shape().to_vec(),
        });
    }
    Ok(())
}

/// Run MLX's channels-last conv2d on an NCHW tensor.
fn conv_nchw(
    x: &Array,
    weight_ohwi: &Array,
    stride: (i32, i32),
    padding: (i32, i32),
    device: Device,
) -> Result<Array> {
    let x_nhwc = x.transpose_axes(&[0, 2, 3, 1])?;
    let output = mlx_rs::ops::conv2d_device(
        &x_nhwc,
        weight_ohwi,
        stride,
        padding,
        (1, 1),
        1,
        device.stream(),
    )?;
    Ok(output.transpose_axes(&[0, 3, 1, 2])?)
}

fn add_bias(output: &Array, bias: &Array) -> Result<Array> {
    let bias = bias.reshape(&[1, -1, 1, 1])?;
    Ok(output.add(&bias)?)
}

/// Flip array along an axis by reversing the indices.
fn flip_axis(arr: &Array, axis: i32) -> Result<Array> {
    let axis_len = arr.dim(axis);
    let indices: Vec<i32> = (0..axis_len).rev().collect();
    let indices_arr = Array::from_slice(&indices, &[axis_len]);
    arr.take_axis(&indices_arr, axis).map_err(Into::into)
}

/// Insert `stride - 1` zeros between consecutive entries along `axis`.
fn insert_zeros(x: &Array, axis: usize, stride: i32) -> Result<Array> {
    if stride == 1 {
        return Ok(x.clone());
    }
    let shape = x.shape().to_vec();
    let len = shape[axis];

    let mut expanded = shape.clone();
    expanded.insert(axis + 1, 1);
    let mut gap = shape.clone();
    gap.insert(axis + 1, stride - 1);

    let x = x.reshape(&expanded)?;
    let zeros = mlx_rs::ops::zeros::<f32>(&gap)?;
    let interleaved = mlx_rs::ops::concatenate_axis(&[&x, &zeros], axis as i32 + 1)?;

    let mut flat = shape;
    flat[axis] = len * stride;
    let interleaved = interleaved.reshape(&flat)?;

    // Trim the trailing zeros after the last entry.
    let keep: Vec<i32> = (0..(len - 1) * stride + 1).collect();
    let keep = Array::from_slice(&keep, &[keep.len() as i32]);
    Ok(interleaved.take_axis(&keep, axis as i32)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_rs::module::ModuleParameters;

    fn to_vec(a: &Array) -> Vec<f32> {
        a.eval().unwrap();
        a.as_slice::<f32>().to_vec()
    }

    #[test]
    fn test_replication_pad() {
        let x = Array::from_slice(&[1.0f32, 2.0, 3.0, 4.0], &[1, 1, 2, 2]);
        let pad = ReplicationPad2d {
            top: 1,
            bottom: 2,
            left: 1,
            right: 1,
        };
        let y = pad.forward(&x).unwrap();
        assert_eq!(y.shape(), &[1, 1, 5, 4]);
        #[rustfmt::skip]
        let expected = vec![
            1.0, 1.0, 2.0, 2.0,
            1.0, 1.0, 2.0, 2.0,
            3.0, 3.0, 4.0, 4.0,
            3.0, 3.0, 4.0, 4.0,
            3.0, 3.0, 4.0, 4.0,
        ];
        assert_eq!(to_vec(&y), expected);
    }

    #[test]
    fn test_conv2d_halves_frequency() {
        let conv = Conv2d::new(1, 4, (5, 3), (2, 1), 1.0, 0, false).unwrap();
        let pad = ReplicationPad2d {
            top: 1,
            bottom: 2,
            left: 1,
            right: 1,
        };
        let x = mlx_rs::random::normal::<f32>(&[2, 1, 513, 7], None, None, None).unwrap();
        let y = conv.forward(&pad.forward(&x).unwrap(), Device::Cpu).unwrap();
        assert_eq!(y.shape(), &[2, 4, 256, 7]);
    }

    #[test]
    fn test_conv2d_rejects_wrong_channels() {
        let conv = Conv2d::new(2, 4, (5, 3), (2, 1), 1.0, 0, false).unwrap();
        let x = mlx_rs::ops::zeros::<f32>(&[1, 3, 16, 4]).unwrap();
        assert!(matches!(
            conv.forward(&x, Device::Cpu),
            Err(Mel2SpecError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_conv_transpose2d_shapes() {
        let x = mlx_rs::random::normal::<f32>(&[1, 8, 16, 5], None, None, None).unwrap();

        let up = ConvTranspose2d::new(8, 4, (4, 3), (2, 1), (1, 1), 1.0, 0, false).unwrap();
        let y = up.forward(&x, Device::Cpu).unwrap();
        assert_eq!(y.shape(), &[1, 4, 32, 5]);
        assert_eq!(up.output_len(16, 0), 32);

        let last = ConvTranspose2d::new(8, 1, (5, 3), (2, 1), (1, 1), 1.0, 0, false).unwrap();
        let y = last.forward(&x, Device::Cpu).unwrap();
        assert_eq!(y.shape(), &[1, 1, 33, 5]);
        assert_eq!(last.output_len(16, 0), 33);
    }

    #[test]
    fn test_conv_transpose2d_matches_scatter() {
        // Direct definition: every input cell scatters the kernel into the
        // output at (i * stride - padding + k).
        let (f_in, t_in, kh, kw) = (3, 2, 4, 3);
        let x: Vec<f32> = (0..f_in * t_in).map(|i| i as f32 + 1.0).collect();
        let x_arr = Array::from_slice(&x, &[1, 1, f_in, t_in]);

        let mut conv = ConvTranspose2d::new(1, 1, (kh, kw), (2, 1), (1, 1), 1.0, 0, false).unwrap();
        let w: Vec<f32> = (0..kh * kw).map(|i| (i as f32 * 0.37).sin()).collect();
        conv.weight = Param::new(Some(Array::from_slice(&w, &[1, 1, kh, kw])));
        conv.bias = Param::new(mlx_rs::ops::zeros::<f32>(&[1]).unwrap());

        let f_out = (f_in - 1) * 2 - 2 + kh;
        let t_out = t_in - 2 + kw;
        let mut expected = vec![0.0f32; (f_out * t_out) as usize];
        for i in 0..f_in {
            for j in 0..t_in {
                for a in 0..kh {
                    for b in 0..kw {
                        let of = i * 2 - 1 + a;
                        let ot = j - 1 + b;
                        if (0..f_out).contains(&of) && (0..t_out).contains(&ot) {
                            expected[(of * t_out + ot) as usize] +=
                                x[(i * t_in + j) as usize] * w[(a * kw + b) as usize];
                        }
                    }
                }
            }
        }

        let y = conv.forward(&x_arr, Device::Cpu).unwrap();
        assert_eq!(y.shape(), &[1, 1, f_out, t_out]);
        for (got, want) in to_vec(&y).iter().zip(&expected) {
            assert!((got - want).abs() < 1e-4, "{got} vs {want}");
        }
    }

    #[test]
    fn test_weight_norm_starts_at_v() {
        let conv = Conv2d::new(2, 4, (5, 3), (2, 1), 1.0, 7, true).unwrap();
        assert!(conv.weight.value.is_none());
        let v = conv.weight_v.value.as_ref().unwrap();
        let g = conv.weight_g.value.as_ref().unwrap();
        assert_eq!(g.shape(), &[4, 1, 1, 1]);

        let w = conv.kernel().unwrap();
        let diff = w.subtract(v).unwrap().abs().unwrap().max(None).unwrap();
        assert!(diff.item::<f32>() < 1e-5);
    }

    #[test]
    fn test_init_std_follows_fan() {
        // [out, in, kh, kw] = [64, 8, 5, 3]: fan 120
        let conv = Conv2d::new(8, 64, (5, 3), (2, 1), 2.0, 3, false).unwrap();
        let w = conv.kernel().unwrap();
        let var = w.square().unwrap().mean(None).unwrap().item::<f32>();
        let expected = 4.0 / 120.0;
        assert!((var - expected).abs() < 0.1 * expected, "var {var}");
    }

    #[test]
    fn test_parameter_names() {
        let conv = Conv2d::new(1, 4, (5, 3), (2, 1), 1.0, 0, true).unwrap();
        let mut names: Vec<String> = conv
            .parameters()
            .flatten()
            .keys()
            .map(|k| k.to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["bias", "weight_g", "weight_v"]);

        let deconv = ConvTranspose2d::new(4, 1, (5, 3), (2, 1), (1, 1), 1.0, 0, false).unwrap();
        let mut names: Vec<String> = deconv
            .parameters()
            .flatten()
            .keys()
            .map(|k| k.to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["bias", "weight"]);
        assert_eq!(deconv.kernel_shape(), &[4, 1, 5, 3]);
    }
}
