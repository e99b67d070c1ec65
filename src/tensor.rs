//! 张量操作扩展和工具函数
//!
//! 图中所有浮点值都是 `ArrayD<f32>`，这里提供初始化、维度转换和 softmax。

use crate::error::{Seq2TreeError, Seq2TreeResult};
use ndarray::{Array2, ArrayD, ArrayView1, ArrayView2, ArrayView3, Axis, Ix1, Ix2, Ix3, IxDyn};
use rand::distributions::uniform::SampleUniform;
use rand::Rng;

/// 张量扩展 trait
pub trait TensorExt<T> {
    /// 对称均匀分布 U(-limit, limit)
    fn random_uniform<R: Rng>(shape: &[usize], limit: T, rng: &mut R) -> ArrayD<T>
    where
        T: num_traits::Float + SampleUniform;

    /// Xavier/Glorot 均匀初始化，fan 取前两维（一维时两者相同）
    fn random_xavier<R: Rng>(shape: &[usize], rng: &mut R) -> ArrayD<T>
    where
        T: num_traits::Float + SampleUniform;

    /// 元素平方和
    fn sq_norm(&self) -> T
    where
        T: num_traits::Float;

    /// 视为矩阵
    fn as_matrix(&self, op: &'static str) -> Seq2TreeResult<ArrayView2<'_, T>>;

    /// 视为向量
    fn as_vector(&self, op: &'static str) -> Seq2TreeResult<ArrayView1<'_, T>>;

    /// 视为 [batch, time, dim] 三维张量
    fn as_cube(&self, op: &'static str) -> Seq2TreeResult<ArrayView3<'_, T>>;
}

impl TensorExt<f32> for ArrayD<f32> {
    fn random_uniform<R: Rng>(shape: &[usize], limit: f32, rng: &mut R) -> ArrayD<f32> {
        ArrayD::from_shape_fn(IxDyn(shape), |_| rng.gen_range(-limit..limit))
    }

    fn random_xavier<R: Rng>(shape: &[usize], rng: &mut R) -> ArrayD<f32> {
        let (fan_in, fan_out) = match shape {
            [] => (1, 1),
            [n] => (*n, *n),
            [a, b, ..] => (*a, *b),
        };
        let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
        Self::random_uniform(shape, limit, rng)
    }

    fn sq_norm(&self) -> f32 {
        self.iter().map(|x| x * x).sum()
    }

    fn as_matrix(&self, op: &'static str) -> Seq2TreeResult<ArrayView2<'_, f32>> {
        self.view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| Seq2TreeError::shape(op, format!("expected a matrix, got shape {:?}", self.shape())))
    }

    fn as_vector(&self, op: &'static str) -> Seq2TreeResult<ArrayView1<'_, f32>> {
        self.view()
            .into_dimensionality::<Ix1>()
            .map_err(|_| Seq2TreeError::shape(op, format!("expected a vector, got shape {:?}", self.shape())))
    }

    fn as_cube(&self, op: &'static str) -> Seq2TreeResult<ArrayView3<'_, f32>> {
        self.view()
            .into_dimensionality::<Ix3>()
            .map_err(|_| Seq2TreeError::shape(op, format!("expected a 3-d tensor, got shape {:?}", self.shape())))
    }
}

/// 按行 softmax（减去最大值以提高数值稳定性）
pub fn softmax_rows(x: &ArrayView2<f32>) -> Array2<f32> {
    let max = x.fold_axis(Axis(1), f32::NEG_INFINITY, |a, &b| a.max(b));
    let max_view = max.insert_axis(Axis(1));

    let exp = (x - &max_view).mapv(|v| v.exp());
    let sum = exp.sum_axis(Axis(1)).insert_axis(Axis(1));

    exp / sum
}

/// 带掩码的按行 softmax
///
/// 掩码为 0 的位置概率为 0；整行都被屏蔽时该行全为 0。
pub fn masked_softmax_rows(x: &ArrayView2<f32>, mask: &ArrayView2<f32>) -> Array2<f32> {
    let mut out = Array2::zeros(x.dim());
    for (b, mut row) in out.rows_mut().into_iter().enumerate() {
        let max = x
            .row(b)
            .iter()
            .zip(mask.row(b).iter())
            .filter(|(_, &m)| m != 0.0)
            .fold(f32::NEG_INFINITY, |acc, (&v, _)| acc.max(v));
        if max == f32::NEG_INFINITY {
            continue;
        }

        let mut total = 0.0;
        for t in 0..x.ncols() {
            if mask[[b, t]] != 0.0 {
                let e = (x[[b, t]] - max).exp();
                row[t] = e;
                total += e;
            }
        }
        row.mapv_inplace(|v| v / total);
    }
    out
}

/// 每行最大值所在的列
pub fn argmax_rows(x: &ArrayView2<f32>) -> Vec<usize> {
    x.rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
                .0
        })
        .collect()
}
