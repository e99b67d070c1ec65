//! 基础层
//!
//! 层在构建时从参数表取得（或创建）参数，之后可以在任意多个计算图中使用；
//! 不同 bucket 的图引用的是同一组参数。

use crate::error::Seq2TreeResult;
use crate::graph::{Graph, NodeId};
use crate::parameters::{Initializer, ParamId, ParameterStore};

/// 全连接层
///
/// ```text
/// y = xW + b
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Linear {
    /// [in_dim, out_dim]
    weight: ParamId,
    /// [out_dim]
    bias: ParamId,
    in_dim: usize,
    out_dim: usize,
}

impl Linear {
    /// 创建（或复用）名为 `{scope}/weight`、`{scope}/bias` 的参数
    ///
    /// 偏置初始化为常数 `bias_init`。
    pub fn new(
        store: &mut ParameterStore,
        scope: &str,
        in_dim: usize,
        out_dim: usize,
        bias_init: f32,
    ) -> Seq2TreeResult<Self> {
        let weight = store.get_or_create(&format!("{scope}/weight"), &[in_dim, out_dim], Initializer::Xavier)?;
        let bias = store.get_or_create(&format!("{scope}/bias"), &[out_dim], Initializer::Constant(bias_init))?;
        Ok(Self {
            weight,
            bias,
            in_dim,
            out_dim,
        })
    }

    pub fn forward(&self, g: &mut Graph, x: NodeId) -> NodeId {
        let w = g.param(self.weight);
        let b = g.param(self.bias);
        let h = g.matmul(x, w);
        g.add_bias(h, b)
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }
}

/// 只在训练图中且 keep_prob < 1 时插入 dropout
pub fn dropout(g: &mut Graph, x: NodeId, keep_prob: f32, training: bool) -> NodeId {
    if training && keep_prob < 1.0 {
        g.dropout(x, keep_prob)
    } else {
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::{forward, Feed};
    use crate::graph::Op;
    use ndarray::arr2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_linear_forward() {
        let mut store = ParameterStore::new(0);
        let layer = Linear::new(&mut store, "proj", 2, 3, 1.0).unwrap();
        store.get_mut(layer.weight).fill(0.5);

        let mut g = Graph::new();
        let x = g.float_slot("x");
        let y = layer.forward(&mut g, x);

        let mut feed = Feed::new();
        feed.insert(x, arr2(&[[1.0f32, 2.0]]));
        let mut rng = StdRng::seed_from_u64(0);
        let eval = forward(&g, &store, &feed, &[y], &mut rng).unwrap();

        // 0.5 * (1 + 2) + 1
        let y = eval.float(y).unwrap();
        assert_eq!(y.shape(), &[1, 3]);
        assert!((y[[0, 2]] - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_linear_shares_parameters() {
        let mut store = ParameterStore::new(0);
        let a = Linear::new(&mut store, "cell", 4, 4, 0.0).unwrap();
        let b = Linear::new(&mut store, "cell", 4, 4, 0.0).unwrap();
        assert_eq!(a.weight, b.weight);
        assert_eq!(store.len(), 2);
        assert_eq!((a.in_dim(), a.out_dim()), (4, 4));
    }

    #[test]
    fn test_dropout_only_when_training() {
        let mut g = Graph::new();
        let x = g.float_slot("x");
        assert_eq!(dropout(&mut g, x, 0.5, false), x);
        assert_eq!(dropout(&mut g, x, 1.0, true), x);
        let d = dropout(&mut g, x, 0.5, true);
        assert!(matches!(g.node(d).op, Op::Dropout { .. }));
    }
}
