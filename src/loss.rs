//! 序列损失
//!
//! ```text
//! loss_b = Σ_t crossent(logits_t, target_t) * w_t  /  (Σ_t w_t + 1e-12)
//! ```
//!
//! 每个样本一个损失，按有效（权重为 1）的位置数归一化。

use crate::embedding::OutputProjection;
use crate::graph::{Graph, NodeId};

/// 全零权重时防止除零
pub const WEIGHT_EPSILON: f32 = 1e-12;

/// 是否使用 sampled softmax：0 < num_samples < vocab
pub fn use_sampled_softmax(num_samples: usize, vocab_size: usize) -> bool {
    num_samples > 0 && num_samples < vocab_size
}

/// 逐步损失的计算方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftmaxLoss {
    /// 完整 softmax 交叉熵
    Full,
    /// 采样 `num_samples` 个负类近似完整 softmax
    Sampled { num_samples: usize, num_classes: usize },
}

impl SoftmaxLoss {
    pub fn select(num_samples: usize, vocab_size: usize) -> Self {
        if use_sampled_softmax(num_samples, vocab_size) {
            SoftmaxLoss::Sampled {
                num_samples,
                num_classes: vocab_size,
            }
        } else {
            SoftmaxLoss::Full
        }
    }

    pub fn is_sampled(&self) -> bool {
        matches!(self, SoftmaxLoss::Sampled { .. })
    }

    /// 一步的交叉熵 [batch]
    ///
    /// 完整 softmax 使用投影后的 `logits`；sampled softmax 使用解码器输出
    /// 和转置后的投影矩阵。
    pub fn crossent(
        &self,
        g: &mut Graph,
        output: NodeId,
        logits: NodeId,
        target: NodeId,
        projection: OutputProjection,
    ) -> NodeId {
        match *self {
            SoftmaxLoss::Full => g.softmax_cross_entropy(logits, target),
            SoftmaxLoss::Sampled {
                num_samples,
                num_classes,
            } => {
                let w = g.param(projection.weight);
                let w_t = g.transpose(w);
                let b = g.param(projection.bias);
                g.sampled_softmax_loss(w_t, b, output, target, num_samples, num_classes)
            }
        }
    }
}

/// 按权重掩码、按长度归一化的序列损失，每个样本一个值 [batch]
///
/// `crossents` 和 `weights` 逐步对齐；多出的权重被忽略。
pub fn sequence_loss(g: &mut Graph, crossents: &[NodeId], weights: &[NodeId]) -> NodeId {
    let steps = crossents.len().min(weights.len());
    let weighted: Vec<NodeId> = (0..steps).map(|t| g.mul(crossents[t], weights[t])).collect();
    let log_perps = g.add_n(weighted);
    let total = g.add_n(weights[..steps].to_vec());
    let total = g.add_scalar(total, WEIGHT_EPSILON);
    g.div(log_perps, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::{forward, Feed};
    use crate::parameters::ParameterStore;
    use ndarray::{arr1, arr2, Array2};
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Fixture {
        graph: Graph,
        logits: Vec<NodeId>,
        targets: Vec<NodeId>,
        weights: Vec<NodeId>,
        loss: NodeId,
    }

    fn full_softmax_fixture(steps: usize) -> Fixture {
        let mut g = Graph::new();
        let logits: Vec<NodeId> = (0..steps).map(|t| g.float_slot(format!("logits{t}"))).collect();
        let targets: Vec<NodeId> = (0..steps).map(|t| g.id_slot(format!("target{t}"))).collect();
        let weights: Vec<NodeId> = (0..steps).map(|t| g.float_slot(format!("weight{t}"))).collect();
        let crossents: Vec<NodeId> = (0..steps)
            .map(|t| g.softmax_cross_entropy(logits[t], targets[t]))
            .collect();
        let loss = sequence_loss(&mut g, &crossents, &weights);
        Fixture {
            graph: g,
            logits,
            targets,
            weights,
            loss,
        }
    }

    fn eval_loss(fx: &Fixture, feed: &Feed) -> Vec<f32> {
        let store = ParameterStore::new(0);
        let mut rng = StdRng::seed_from_u64(0);
        let eval = forward(&fx.graph, &store, feed, &[fx.loss], &mut rng).unwrap();
        eval.float(fx.loss).unwrap().iter().copied().collect()
    }

    #[test]
    fn test_selection_boundaries() {
        assert!(!use_sampled_softmax(0, 100));
        assert!(use_sampled_softmax(1, 100));
        assert!(use_sampled_softmax(99, 100));
        assert!(!use_sampled_softmax(100, 100));
        assert!(!use_sampled_softmax(512, 100));
        assert_eq!(SoftmaxLoss::select(0, 100), SoftmaxLoss::Full);
        assert!(SoftmaxLoss::select(10, 100).is_sampled());
    }

    #[test]
    fn test_loss_is_length_normalized() {
        let fx = full_softmax_fixture(2);
        let mut feed = Feed::new();
        // 均匀 logits，交叉熵为 ln 4
        for t in 0..2 {
            feed.insert(fx.logits[t], Array2::<f32>::zeros((1, 4)));
            feed.insert(fx.targets[t], arr1(&[1usize]));
        }
        feed.insert(fx.weights[0], arr1(&[1.0f32]));
        feed.insert(fx.weights[1], arr1(&[1.0f32]));

        let loss = eval_loss(&fx, &feed);
        assert!((loss[0] - 4.0f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_all_padding_example_has_zero_loss() {
        let fx = full_softmax_fixture(2);
        let mut feed = Feed::new();
        for t in 0..2 {
            feed.insert(fx.logits[t], Array2::<f32>::zeros((2, 3)));
            feed.insert(fx.targets[t], arr1(&[0usize, 2]));
            feed.insert(fx.weights[t], arr1(&[0.0f32, 1.0]));
        }

        let loss = eval_loss(&fx, &feed);
        assert_eq!(loss[0], 0.0);
        assert!(loss[1].is_finite() && loss[1] > 0.0);
    }

    proptest! {
        #[test]
        fn prop_padding_logits_do_not_change_loss(
            noise in prop::collection::vec(-50.0f32..50.0, 3),
            pad_target in 0usize..3,
        ) {
            let fx = full_softmax_fixture(3);
            let base = |last_logits: Array2<f32>, last_target: usize| {
                let mut feed = Feed::new();
                feed.insert(fx.logits[0], arr2(&[[0.5f32, -0.3, 1.2]]));
                feed.insert(fx.logits[1], arr2(&[[2.0f32, 0.1, -1.0]]));
                feed.insert(fx.logits[2], last_logits);
                feed.insert(fx.targets[0], arr1(&[2usize]));
                feed.insert(fx.targets[1], arr1(&[0usize]));
                feed.insert(fx.targets[2], arr1(&[last_target]));
                feed.insert(fx.weights[0], arr1(&[1.0f32]));
                feed.insert(fx.weights[1], arr1(&[1.0f32]));
                feed.insert(fx.weights[2], arr1(&[0.0f32]));
                eval_loss(&fx, &feed)[0]
            };

            let reference = base(Array2::zeros((1, 3)), 0);
            let noisy = base(arr2(&[[noise[0], noise[1], noise[2]]]), pad_target);
            prop_assert!((reference - noisy).abs() < 1e-5);
        }

        #[test]
        fn prop_sampled_iff_strictly_between(num_samples in 0usize..300, vocab in 1usize..200) {
            let sampled = SoftmaxLoss::select(num_samples, vocab).is_sampled();
            prop_assert_eq!(sampled, num_samples > 0 && num_samples < vocab);
        }
    }
}
