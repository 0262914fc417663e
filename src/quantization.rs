//! Scalar quantization helpers shared by the encoder and the Tier-1
//! post-processing path.

/// Dead-zone scalar quantization: `q = sign(x) * floor(|x| / delta)`.
pub fn quantize_scalar(coeff: f32, step_size: f32) -> i32 {
    if step_size <= 0.0 {
        return coeff as i32;
    }
    let sign = if coeff >= 0.0 { 1.0 } else { -1.0 };
    (sign * (coeff.abs() / step_size).floor()) as i32
}

/// Mid-point reconstruction: `x = sign(q) * (|q| + 0.5) * delta`,
/// zero stays zero.
pub fn dequantize_scalar(q: i32, step_size: f32) -> f32 {
    if q == 0 {
        return 0.0;
    }
    let sign = if q > 0 { 1.0 } else { -1.0 };
    (q.abs() as f32 + 0.5) * step_size * sign
}

/// Undo an ROI upshift: magnitudes at or above `1 << roishift` were
/// boosted by the shift and scale back down; others are untouched.
pub fn roi_shift_down(value: i32, roishift: u8) -> i32 {
    if roishift == 0 {
        return value;
    }
    let thresh = 1i32 << roishift;
    let mag = value.unsigned_abs() as i32;
    if mag >= thresh {
        let mag = mag >> roishift;
        if value < 0 {
            -mag
        } else {
            mag
        }
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_dequantize_stays_within_one_step() {
        let val = 10.5;
        let step = 2.0;
        let q = quantize_scalar(val, step);
        assert_eq!(q, 5);
        let recon = dequantize_scalar(q, step);
        assert!((val - recon).abs() <= step);
    }

    #[test]
    fn zero_reconstructs_to_zero() {
        assert_eq!(dequantize_scalar(0, 0.5), 0.0);
    }

    #[test]
    fn negative_values_keep_sign() {
        let q = quantize_scalar(-7.9, 2.0);
        assert_eq!(q, -3);
        assert!(dequantize_scalar(q, 2.0) < 0.0);
    }

    #[test]
    fn roi_shift_only_affects_boosted_magnitudes() {
        assert_eq!(roi_shift_down(0x40, 4), 4);
        assert_eq!(roi_shift_down(-0x40, 4), -4);
        assert_eq!(roi_shift_down(7, 4), 7);
        assert_eq!(roi_shift_down(123, 0), 123);
    }
}
