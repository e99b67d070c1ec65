//! 编码器
//!
//! 读入嵌入后的源序列，给出每一步的输出和概括整个序列的最终状态。

use crate::error::{Seq2TreeError, Seq2TreeResult};
use crate::graph::{Graph, NodeId};
use crate::parameters::ParameterStore;
use crate::rnn::{CellKind, StackedCell};

/// 编码结果
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// 每个时间步一个 [batch, dim]
    pub outputs: Vec<NodeId>,
    /// [batch, state_size]
    pub state: NodeId,
}

/// 编码器接口
pub trait Encoder {
    /// `embedded` 为每个时间步的 [batch, dim]；dropout 只在 `training` 时生效
    fn encode(&self, g: &mut Graph, embedded: &[NodeId], training: bool) -> Seq2TreeResult<EncoderOutput>;

    fn state_size(&self) -> usize;

    fn name(&self) -> &str;
}

fn run_cell(cell: &StackedCell, g: &mut Graph, embedded: &[NodeId], training: bool) -> Seq2TreeResult<EncoderOutput> {
    let first = *embedded
        .first()
        .ok_or_else(|| Seq2TreeError::shape("encode", "empty source sequence"))?;
    let mut state = cell.zero_state(g, first);
    let mut outputs = Vec::with_capacity(embedded.len());
    for &x in embedded {
        let (output, next) = cell.step(g, x, state, training);
        outputs.push(output);
        state = next;
    }
    Ok(EncoderOutput { outputs, state })
}

/// 单向循环编码器
#[derive(Debug, Clone)]
pub struct RnnEncoder {
    cell: StackedCell,
}

impl RnnEncoder {
    pub fn new(cell: StackedCell) -> Self {
        Self { cell }
    }
}

impl Encoder for RnnEncoder {
    fn encode(&self, g: &mut Graph, embedded: &[NodeId], training: bool) -> Seq2TreeResult<EncoderOutput> {
        run_cell(&self.cell, g, embedded, training)
    }

    fn state_size(&self) -> usize {
        self.cell.state_size()
    }

    fn name(&self) -> &str {
        "rnn"
    }
}

/// 双向循环编码器
///
/// 前向、后向两组单元各自读一遍序列；同一位置的输出相加，最终状态也相加，
/// 所以输出形状与单向编码器相同。
#[derive(Debug, Clone)]
pub struct BiRnnEncoder {
    forward: StackedCell,
    backward: StackedCell,
}

impl BiRnnEncoder {
    pub fn new(forward: StackedCell, backward: StackedCell) -> Self {
        Self { forward, backward }
    }
}

impl Encoder for BiRnnEncoder {
    fn encode(&self, g: &mut Graph, embedded: &[NodeId], training: bool) -> Seq2TreeResult<EncoderOutput> {
        let fw = run_cell(&self.forward, g, embedded, training)?;
        let reversed: Vec<NodeId> = embedded.iter().rev().copied().collect();
        let bw = run_cell(&self.backward, g, &reversed, training)?;

        let outputs = fw
            .outputs
            .iter()
            .zip(bw.outputs.iter().rev())
            .map(|(&f, &b)| g.add(f, b))
            .collect();
        let state = g.add(fw.state, bw.state);
        Ok(EncoderOutput { outputs, state })
    }

    fn state_size(&self) -> usize {
        self.forward.state_size()
    }

    fn name(&self) -> &str {
        "birnn"
    }
}

/// 编码器拓扑
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    Rnn,
    BiRnn,
}

impl EncoderKind {
    pub fn parse(name: &str) -> Seq2TreeResult<Self> {
        match name {
            "rnn" => Ok(EncoderKind::Rnn),
            "birnn" => Ok(EncoderKind::BiRnn),
            other => Err(Seq2TreeError::UnknownEncoder(other.to_string())),
        }
    }

    pub fn build(
        self,
        store: &mut ParameterStore,
        cell: CellKind,
        dim: usize,
        num_layers: usize,
        keep_probs: (f32, f32),
    ) -> Seq2TreeResult<Box<dyn Encoder>> {
        let (input_keep, output_keep) = keep_probs;
        let stack = |store: &mut ParameterStore, scope: &str| {
            StackedCell::new(store, scope, cell, dim, dim, num_layers)
                .map(|c| c.with_dropout(input_keep, output_keep))
        };
        Ok(match self {
            EncoderKind::Rnn => Box::new(RnnEncoder::new(stack(store, "encoder")?)),
            EncoderKind::BiRnn => Box::new(BiRnnEncoder::new(
                stack(store, "encoder/fw")?,
                stack(store, "encoder/bw")?,
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::{forward, Feed};
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn encode_with(kind: EncoderKind) -> (Vec<Vec<usize>>, Vec<usize>) {
        let mut store = ParameterStore::new(0);
        let encoder = kind.build(&mut store, CellKind::Gru, 4, 2, (1.0, 1.0)).unwrap();
        let mut g = Graph::new();
        let xs: Vec<NodeId> = (0..3).map(|i| g.float_slot(format!("x{i}"))).collect();
        let out = encoder.encode(&mut g, &xs, false).unwrap();
        assert_eq!(out.outputs.len(), 3);

        let mut feed = Feed::new();
        for &x in &xs {
            feed.insert(x, Array2::<f32>::ones((2, 4)));
        }
        let mut targets = out.outputs.clone();
        targets.push(out.state);
        let mut rng = StdRng::seed_from_u64(0);
        let eval = forward(&g, &store, &feed, &targets, &mut rng).unwrap();
        (
            out.outputs
                .iter()
                .map(|&o| eval.float(o).unwrap().shape().to_vec())
                .collect(),
            eval.float(out.state).unwrap().shape().to_vec(),
        )
    }

    #[test]
    fn test_rnn_encoder_shapes() {
        let (outputs, state) = encode_with(EncoderKind::Rnn);
        assert!(outputs.iter().all(|s| s == &vec![2, 4]));
        assert_eq!(state, vec![2, 8]);
    }

    #[test]
    fn test_birnn_matches_rnn_shapes() {
        let (outputs, state) = encode_with(EncoderKind::BiRnn);
        assert!(outputs.iter().all(|s| s == &vec![2, 4]));
        assert_eq!(state, vec![2, 8]);
    }

    #[test]
    fn test_birnn_uses_separate_parameters() {
        let mut store = ParameterStore::new(0);
        EncoderKind::BiRnn.build(&mut store, CellKind::Gru, 4, 1, (1.0, 1.0)).unwrap();
        assert!(store.exists("encoder/fw/cell_0/gru/gates/weight"));
        assert!(store.exists("encoder/bw/cell_0/gru/gates/weight"));
    }

    #[test]
    fn test_empty_source_is_an_error() {
        let mut store = ParameterStore::new(0);
        let encoder = EncoderKind::Rnn.build(&mut store, CellKind::Lstm, 4, 1, (1.0, 1.0)).unwrap();
        let mut g = Graph::new();
        assert!(encoder.encode(&mut g, &[], false).is_err());
    }

    #[test]
    fn test_unknown_encoder() {
        assert!(matches!(
            EncoderKind::parse("transformer"),
            Err(Seq2TreeError::UnknownEncoder(name)) if name == "transformer"
        ));
    }
}
