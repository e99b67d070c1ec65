//! 梯度裁剪
//!
//! 按全局范数裁剪：所有参数的梯度视为一个向量，范数超过阈值时统一缩放。

use crate::parameters::ParamId;
use crate::tensor::TensorExt;
use ndarray::ArrayD;
use std::collections::HashMap;

/// 计算全局梯度范数
///
/// ||g|| = sqrt(Σ_i ||g_i||²)
pub fn global_norm<'a>(grads: impl IntoIterator<Item = &'a ArrayD<f32>>) -> f32 {
    grads.into_iter().map(|g| g.sq_norm()).sum::<f32>().sqrt()
}

/// 按全局范数原地裁剪
///
/// 返回裁剪前的范数。范数不超过 `max_norm` 时梯度保持不变。
pub fn clip_by_global_norm(grads: &mut HashMap<ParamId, ArrayD<f32>>, max_norm: f32) -> f32 {
    let norm = global_norm(grads.values());

    if norm > max_norm && norm > 0.0 {
        let scale = max_norm / norm;
        for grad in grads.values_mut() {
            grad.mapv_inplace(|g| g * scale);
        }
    }

    norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, Array1};
    use proptest::prelude::*;

    #[test]
    fn test_global_norm() {
        let a = arr2(&[[3.0f32, 0.0], [0.0, 0.0]]).into_dyn();
        let b = arr1(&[4.0f32]).into_dyn();
        // sqrt(3^2 + 4^2) = 5.0
        assert!((global_norm([&a, &b]) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_clip_scales_all_gradients() {
        let mut grads = HashMap::new();
        grads.insert(ParamId(0), arr1(&[3.0f32, 0.0]).into_dyn());
        grads.insert(ParamId(1), arr1(&[4.0f32]).into_dyn());

        // norm = 5.0, max_norm = 2.5, scale = 0.5
        let norm = clip_by_global_norm(&mut grads, 2.5);
        assert!((norm - 5.0).abs() < 1e-6);
        assert!((grads[&ParamId(0)][[0]] - 1.5).abs() < 1e-6);
        assert!((grads[&ParamId(1)][[0]] - 2.0).abs() < 1e-6);
        assert!((global_norm(grads.values()) - 2.5).abs() < 1e-5);
    }

    #[test]
    fn test_no_clip_below_threshold() {
        let mut grads = HashMap::new();
        grads.insert(ParamId(0), arr1(&[1.0f32, 1.0]).into_dyn());

        // norm = sqrt(2) < 2.5, 不应该裁剪
        let norm = clip_by_global_norm(&mut grads, 2.5);
        assert!((norm - 2.0f32.sqrt()).abs() < 1e-6);
        assert_eq!(grads[&ParamId(0)], arr1(&[1.0f32, 1.0]).into_dyn());
    }

    #[test]
    fn test_zero_gradients() {
        let mut grads = HashMap::new();
        grads.insert(ParamId(0), arr1(&[0.0f32, 0.0]).into_dyn());
        assert_eq!(clip_by_global_norm(&mut grads, 1.0), 0.0);
    }

    proptest! {
        #[test]
        fn prop_clipped_norm_within_bound(
            values in prop::collection::vec(prop::collection::vec(-1.0e4f32..1.0e4, 1..8), 1..5),
            max_norm in 0.01f32..10.0,
        ) {
            let mut grads: HashMap<ParamId, ArrayD<f32>> = values
                .into_iter()
                .enumerate()
                .map(|(i, v)| (ParamId(i), Array1::from(v).into_dyn()))
                .collect();
            clip_by_global_norm(&mut grads, max_norm);
            prop_assert!(global_norm(grads.values()) <= max_norm * (1.0 + 1e-4));
        }
    }
}
