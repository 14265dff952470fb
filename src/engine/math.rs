//! f32 math primitives for the forward pass.

use crate::model::gguf::Tensor;

/// `y = W x` for a weight tensor of shape `[in_dim, out_dim]` stored with
/// the input dimension contiguous (GGUF layout).
pub fn matmul_vec(weight: &Tensor, x: &[f32]) -> Vec<f32> {
    let in_dim = weight.dims[0];
    let out_dim = weight.dims[1];
    debug_assert_eq!(x.len(), in_dim);

    let mut out = vec![0.0f32; out_dim];
    for (o, slot) in out.iter_mut().enumerate() {
        let row = &weight.data[o * in_dim..(o + 1) * in_dim];
        *slot = row.iter().zip(x).map(|(w, v)| w * v).sum();
    }
    out
}

/// RMS normalization with a learned per-channel gain.
pub fn rms_norm(x: &[f32], weight: &[f32], eps: f32) -> Vec<f32> {
    let mean_sq = x.iter().map(|v| v * v).sum::<f32>() / x.len() as f32;
    let inv_rms = 1.0 / (mean_sq + eps).sqrt();
    x.iter()
        .zip(weight)
        .map(|(v, w)| v * inv_rms * w)
        .collect()
}

/// In-place numerically stable softmax.
pub fn softmax(scores: &mut [f32]) {
    if scores.is_empty() {
        return;
    }
    let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for s in scores.iter_mut() {
        *s = (*s - max).exp();
        sum += *s;
    }
    if sum > 0.0 {
        for s in scores.iter_mut() {
            *s /= sum;
        }
    }
}

/// SiLU (swish) activation.
pub fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// Rotary position embedding applied in place to one head vector.
///
/// Rotates consecutive pairs `(x[2i], x[2i+1])` by position-dependent
/// angles derived from `freq_base`.
pub fn rope_rotate(head: &mut [f32], position: usize, freq_base: f32) {
    let head_dim = head.len();
    for i in 0..head_dim / 2 {
        let exponent = 2.0 * i as f32 / head_dim as f32;
        let theta = position as f32 / freq_base.powf(exponent);
        let (sin, cos) = theta.sin_cos();
        let a = head[2 * i];
        let b = head[2 * i + 1];
        head[2 * i] = a * cos - b * sin;
        head[2 * i + 1] = a * sin + b * cos;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(dims: Vec<usize>, data: Vec<f32>) -> Tensor {
        Tensor { dims, data }
    }

    #[test]
    fn matmul_identity() {
        // 3x3 identity, shape [in=3, out=3].
        let w = tensor(
            vec![3, 3],
            vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
        );
        let x = [2.0, -1.0, 0.5];
        assert_eq!(matmul_vec(&w, &x), x.to_vec());
    }

    #[test]
    fn matmul_rectangular() {
        // in=2, out=3: rows [1,2],[3,4],[5,6].
        let w = tensor(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let y = matmul_vec(&w, &[1.0, 1.0]);
        assert_eq!(y, vec![3.0, 7.0, 11.0]);
    }

    #[test]
    fn rms_norm_unit_gain() {
        let x = [3.0, 4.0];
        let w = [1.0, 1.0];
        let y = rms_norm(&x, &w, 0.0);
        // rms of [3,4] is sqrt(12.5)
        let rms = 12.5f32.sqrt();
        assert!((y[0] - 3.0 / rms).abs() < 1e-6);
        assert!((y[1] - 4.0 / rms).abs() < 1e-6);
    }

    #[test]
    fn softmax_sums_to_one() {
        let mut s = vec![1.0, 2.0, 3.0];
        softmax(&mut s);
        assert!((s.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(s[2] > s[1] && s[1] > s[0]);
    }

    #[test]
    fn rope_identity_at_position_zero() {
        let mut head = vec![1.0, 2.0, 3.0, 4.0];
        let original = head.clone();
        rope_rotate(&mut head, 0, 10_000.0);
        for (a, b) in head.iter().zip(&original) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn rope_preserves_pair_norms() {
        let mut head = vec![1.0, 2.0, 3.0, 4.0];
        rope_rotate(&mut head, 17, 10_000.0);
        let n0 = (head[0] * head[0] + head[1] * head[1]).sqrt();
        let n1 = (head[2] * head[2] + head[3] * head[3]).sqrt();
        assert!((n0 - 5f32.sqrt()).abs() < 1e-4);
        assert!((n1 - 25f32.sqrt()).abs() < 1e-4);
    }
}
