//! 解码器
//!
//! 树结构解码器按树的线性化顺序逐步输出。每一步在两种转移之间选择：
//! 纵向（父节点 → 第一个子节点）和横向（兄弟 → 下一个兄弟）。上一步的输入
//! 是 `NO_EXPAND_ID`（子树结束）时走横向转移，否则走纵向转移。

use crate::attention::LuongAttention;
use crate::dataset::NO_EXPAND_ID;
use crate::embedding::OutputProjection;
use crate::error::{Seq2TreeError, Seq2TreeResult};
use crate::graph::{Graph, NodeId};
use crate::layers::Linear;
use crate::parameters::{ParamId, ParameterStore};
use crate::rnn::{CellKind, StackedCell};

/// 拷贝机制的输入
#[derive(Debug, Clone)]
pub struct CopySignals {
    /// 原始（未替换）源 token，与编码器输入同序（已反转）；按目标端嵌入表查找，必须在目标词表内
    pub original_source: Vec<NodeId>,
    /// 可拷贝位置为 1 的掩码 id 槽
    pub copy_masks: Vec<NodeId>,
}

/// 解码器的一次调用
#[derive(Debug, Clone, Copy)]
pub struct DecoderInputs<'a> {
    /// 编码器的最终状态
    pub initial_state: NodeId,
    /// 每一步的目标 token id 槽
    pub inputs: &'a [NodeId],
    /// 目标端嵌入表
    pub embeddings: ParamId,
    /// 注意力上下文 [batch, T, dim]
    pub attention_states: Option<NodeId>,
    pub copy: Option<&'a CopySignals>,
    /// 为 true 时 t > 0 的输入取上一步预测
    pub feed_previous: bool,
    pub training: bool,
}

#[derive(Debug, Clone)]
pub struct DecoderOutput {
    /// 每一步 [batch, dim]
    pub outputs: Vec<NodeId>,
    pub state: NodeId,
}

/// 解码器接口
pub trait Decoder {
    fn decode(&self, g: &mut Graph, inputs: DecoderInputs<'_>) -> Seq2TreeResult<DecoderOutput>;

    fn name(&self) -> &str;
}

/// 基本树解码器
#[derive(Debug, Clone)]
pub struct BasicTreeDecoder {
    vertical: StackedCell,
    horizontal: StackedCell,
    attention: Option<LuongAttention>,
    /// 拷贝门 σ([o; c_copy] W + b)
    copy_gate: Option<Linear>,
    projection: OutputProjection,
}

impl BasicTreeDecoder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: &mut ParameterStore,
        cell: CellKind,
        dim: usize,
        num_layers: usize,
        keep_probs: (f32, f32),
        use_attention: bool,
        use_copy: bool,
        projection: OutputProjection,
    ) -> Seq2TreeResult<Self> {
        let (input_keep, output_keep) = keep_probs;
        let vertical = StackedCell::new(store, "decoder/vertical", cell, dim, dim, num_layers)?
            .with_dropout(input_keep, output_keep);
        let horizontal = StackedCell::new(store, "decoder/horizontal", cell, dim, dim, num_layers)?
            .with_dropout(input_keep, output_keep);
        let attention = if use_attention {
            Some(LuongAttention::new(store, "decoder", dim)?)
        } else {
            None
        };
        let copy_gate = if use_copy {
            Some(Linear::new(store, "decoder/copy_gate", 2 * dim, dim, 0.0)?)
        } else {
            None
        };
        Ok(Self {
            vertical,
            horizontal,
            attention,
            copy_gate,
            projection,
        })
    }

    /// 上一步输出投影到词表后取 argmax
    fn predict(&self, g: &mut Graph, output: NodeId) -> NodeId {
        let w = g.param(self.projection.weight);
        let b = g.param(self.projection.bias);
        let h = g.matmul(output, w);
        let logits = g.add_bias(h, b);
        g.argmax(logits)
    }

    /// 源端原始 token 的目标端嵌入 [batch, T, dim] 和拷贝掩码 [batch, T]
    fn copy_memory(&self, g: &mut Graph, table: NodeId, copy: &CopySignals) -> (NodeId, NodeId) {
        let embedded: Vec<NodeId> = copy.original_source.iter().map(|&ids| g.gather(table, ids)).collect();
        let memory = g.stack(embedded);
        let masks: Vec<NodeId> = copy.copy_masks.iter().map(|&m| g.to_float(m)).collect();
        let mask = g.stack(masks);
        (memory, mask)
    }
}

impl Decoder for BasicTreeDecoder {
    fn decode(&self, g: &mut Graph, inputs: DecoderInputs<'_>) -> Seq2TreeResult<DecoderOutput> {
        if inputs.inputs.is_empty() {
            return Err(Seq2TreeError::shape("decode", "empty target sequence"));
        }
        if self.attention.is_some() && inputs.attention_states.is_none() {
            return Err(Seq2TreeError::shape("decode", "attention enabled but no attention states given"));
        }
        let copy = match (self.copy_gate, inputs.copy) {
            (Some(_), None) => return Err(Seq2TreeError::MissingCopyInputs("decoder")),
            (Some(gate), Some(signals)) => Some((gate, signals)),
            (None, _) => None,
        };

        let table = g.param(inputs.embeddings);
        let copy_memory = copy.map(|(gate, signals)| {
            let (memory, mask) = self.copy_memory(g, table, signals);
            (gate, memory, mask)
        });

        let mut state = inputs.initial_state;
        let mut outputs: Vec<NodeId> = Vec::with_capacity(inputs.inputs.len());
        let mut prev_ids: Option<NodeId> = None;

        for &slot in inputs.inputs {
            let ids = match (prev_ids, outputs.last()) {
                (Some(_), Some(&prev_out)) if inputs.feed_previous => self.predict(g, prev_out),
                _ => slot,
            };
            let x = g.gather(table, ids);

            let (mut output, next_state) = match prev_ids {
                None => self.vertical.step(g, x, state, inputs.training),
                Some(prev) => {
                    let (v_out, v_state) = self.vertical.step(g, x, state, inputs.training);
                    let (h_out, h_state) = self.horizontal.step(g, x, state, inputs.training);
                    let sibling = g.is_any_of(prev, vec![NO_EXPAND_ID]);
                    (g.select(sibling, h_out, v_out), g.select(sibling, h_state, v_state))
                }
            };

            if let (Some(attention), Some(states)) = (self.attention, inputs.attention_states) {
                output = attention.attend(g, output, states);
            }

            if let Some((gate, memory, mask)) = copy_memory {
                let keys = inputs.attention_states.unwrap_or(memory);
                let copied = g.attention(output, keys, memory, Some(mask));
                let joined = g.concat_cols(vec![output, copied]);
                let z = gate.forward(g, joined);
                let z = g.sigmoid(z);
                let keep = g.one_minus(z);
                let generated = g.mul(keep, output);
                let pasted = g.mul(z, copied);
                output = g.add(generated, pasted);
            }

            outputs.push(output);
            state = next_state;
            prev_ids = Some(ids);
        }

        Ok(DecoderOutput { outputs, state })
    }

    fn name(&self) -> &str {
        "basic_tree"
    }
}

/// 解码器拓扑
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderKind {
    BasicTree,
}

impl DecoderKind {
    pub fn parse(name: &str) -> Seq2TreeResult<Self> {
        match name {
            "basic_tree" => Ok(DecoderKind::BasicTree),
            other => Err(Seq2TreeError::UnknownDecoder(other.to_string())),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn build(
        self,
        store: &mut ParameterStore,
        cell: CellKind,
        dim: usize,
        num_layers: usize,
        keep_probs: (f32, f32),
        use_attention: bool,
        use_copy: bool,
        projection: OutputProjection,
    ) -> Seq2TreeResult<Box<dyn Decoder>> {
        match self {
            DecoderKind::BasicTree => Ok(Box::new(BasicTreeDecoder::new(
                store,
                cell,
                dim,
                num_layers,
                keep_probs,
                use_attention,
                use_copy,
                projection,
            )?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::{forward, Feed};
    use crate::embedding::SharedParameters;
    use crate::graph::Op;
    use ndarray::{arr1, Array2, Array3};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Fixture {
        store: ParameterStore,
        decoder: Box<dyn Decoder>,
        embeddings: ParamId,
    }

    fn fixture(use_attention: bool, use_copy: bool) -> Fixture {
        let mut store = ParameterStore::new(0);
        let mut shared = SharedParameters::new(10, 10, 4);
        let embeddings = shared.target_embeddings(&mut store).unwrap();
        let projection = shared.output_projection(&mut store).unwrap();
        let decoder = DecoderKind::BasicTree
            .build(&mut store, CellKind::Gru, 4, 1, (1.0, 1.0), use_attention, use_copy, projection)
            .unwrap();
        Fixture {
            store,
            decoder,
            embeddings,
        }
    }

    #[test]
    fn test_teacher_forcing_shapes() {
        let fx = fixture(true, false);
        let mut g = Graph::new();
        let s0 = g.float_slot("state");
        let states = g.float_slot("attention");
        let slots: Vec<NodeId> = (0..3).map(|i| g.id_slot(format!("decoder{i}"))).collect();
        let out = fx
            .decoder
            .decode(
                &mut g,
                DecoderInputs {
                    initial_state: s0,
                    inputs: &slots,
                    embeddings: fx.embeddings,
                    attention_states: Some(states),
                    copy: None,
                    feed_previous: false,
                    training: false,
                },
            )
            .unwrap();
        assert_eq!(out.outputs.len(), 3);

        let mut feed = Feed::new();
        feed.insert(s0, Array2::<f32>::zeros((2, 4)));
        feed.insert(states, Array3::<f32>::ones((2, 5, 4)).into_dyn());
        feed.insert(slots[0], arr1(&[3usize, 3]));
        feed.insert(slots[1], arr1(&[NO_EXPAND_ID, 6]));
        feed.insert(slots[2], arr1(&[7usize, 8]));
        let mut rng = StdRng::seed_from_u64(0);
        let eval = forward(&g, &fx.store, &feed, &out.outputs, &mut rng).unwrap();
        for &o in &out.outputs {
            assert_eq!(eval.float(o).unwrap().shape(), &[2, 4]);
        }
    }

    #[test]
    fn test_horizontal_transition_follows_no_expand() {
        let mut fx = fixture(false, false);
        let mut g = Graph::new();
        let s0 = g.float_slot("state");
        let slots: Vec<NodeId> = (0..4).map(|i| g.id_slot(format!("decoder{i}"))).collect();
        let out = fx
            .decoder
            .decode(
                &mut g,
                DecoderInputs {
                    initial_state: s0,
                    inputs: &slots,
                    embeddings: fx.embeddings,
                    attention_states: None,
                    copy: None,
                    feed_previous: false,
                    training: false,
                },
            )
            .unwrap();

        let mut feed = Feed::new();
        feed.insert(s0, Array2::<f32>::from_elem((2, 4), 0.5));
        feed.insert(slots[0], arr1(&[3usize, 3]));
        feed.insert(slots[1], arr1(&[5usize, 5]));
        feed.insert(slots[2], arr1(&[NO_EXPAND_ID, 6]));
        feed.insert(slots[3], arr1(&[6usize, 7]));

        let run = |store: &ParameterStore| {
            let mut rng = StdRng::seed_from_u64(0);
            let eval = forward(&g, store, &feed, &out.outputs, &mut rng).unwrap();
            out.outputs.iter().map(|&o| eval.float(o).unwrap().clone()).collect::<Vec<_>>()
        };
        let before = run(&fx.store);

        let horizontal: Vec<ParamId> = fx
            .store
            .ids()
            .filter(|&id| fx.store.name(id).starts_with("decoder/horizontal"))
            .collect();
        assert!(!horizontal.is_empty());
        for id in horizontal {
            fx.store.get_mut(id).fill(0.0);
        }
        let after = run(&fx.store);

        // 只有紧跟在 NO_EXPAND_ID 之后的那一步（第 3 步第 0 行）走横向转移
        for t in 0..4 {
            for row in 0..2 {
                let changed = before[t].index_axis(ndarray::Axis(0), row) != after[t].index_axis(ndarray::Axis(0), row);
                assert_eq!(changed, t == 3 && row == 0, "step {t} row {row}");
            }
        }
    }

    #[test]
    fn test_feed_previous_ignores_later_inputs() {
        let fx = fixture(false, false);
        let mut g = Graph::new();
        let s0 = g.float_slot("state");
        let slots: Vec<NodeId> = (0..3).map(|i| g.id_slot(format!("decoder{i}"))).collect();
        let out = fx
            .decoder
            .decode(
                &mut g,
                DecoderInputs {
                    initial_state: s0,
                    inputs: &slots,
                    embeddings: fx.embeddings,
                    attention_states: None,
                    copy: None,
                    feed_previous: true,
                    training: false,
                },
            )
            .unwrap();

        // 只喂第一步的输入，后续步来自预测
        let mut feed = Feed::new();
        feed.insert(s0, Array2::<f32>::zeros((1, 4)));
        feed.insert(slots[0], arr1(&[3usize]));
        let mut rng = StdRng::seed_from_u64(0);
        let eval = forward(&g, &fx.store, &feed, &out.outputs, &mut rng).unwrap();
        assert_eq!(eval.float(out.outputs[2]).unwrap().shape(), &[1, 4]);
        assert!((0..g.len()).any(|i| matches!(g.node(NodeId(i)).op, Op::Argmax(_))));
    }

    #[test]
    fn test_copy_requires_signals() {
        let fx = fixture(true, true);
        let mut g = Graph::new();
        let s0 = g.float_slot("state");
        let states = g.float_slot("attention");
        let slots = vec![g.id_slot("decoder0")];
        let result = fx.decoder.decode(
            &mut g,
            DecoderInputs {
                initial_state: s0,
                inputs: &slots,
                embeddings: fx.embeddings,
                attention_states: Some(states),
                copy: None,
                feed_previous: false,
                training: false,
            },
        );
        assert!(matches!(result, Err(Seq2TreeError::MissingCopyInputs(_))));
    }

    #[test]
    fn test_copy_mode_outputs() {
        let fx = fixture(true, true);
        let mut g = Graph::new();
        let s0 = g.float_slot("state");
        let states = g.float_slot("attention");
        let slots: Vec<NodeId> = (0..2).map(|i| g.id_slot(format!("decoder{i}"))).collect();
        let copy = CopySignals {
            original_source: (0..3).map(|i| g.id_slot(format!("original_encoder{i}"))).collect(),
            copy_masks: (0..3).map(|i| g.id_slot(format!("copy_mask{i}"))).collect(),
        };
        let out = fx
            .decoder
            .decode(
                &mut g,
                DecoderInputs {
                    initial_state: s0,
                    inputs: &slots,
                    embeddings: fx.embeddings,
                    attention_states: Some(states),
                    copy: Some(&copy),
                    feed_previous: false,
                    training: false,
                },
            )
            .unwrap();

        let mut feed = Feed::new();
        feed.insert(s0, Array2::<f32>::zeros((2, 4)));
        feed.insert(states, Array3::<f32>::ones((2, 3, 4)).into_dyn());
        for (i, &slot) in slots.iter().enumerate() {
            feed.insert(slot, arr1(&[i + 3, i + 5]));
        }
        for i in 0..3 {
            feed.insert(copy.original_source[i], arr1(&[i + 1, 9]));
            feed.insert(copy.copy_masks[i], arr1(&[usize::from(i == 1), 0]));
        }
        let mut rng = StdRng::seed_from_u64(0);
        let eval = forward(&g, &fx.store, &feed, &out.outputs, &mut rng).unwrap();
        assert!(eval.float(out.outputs[1]).unwrap().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_unknown_decoder() {
        assert!(matches!(DecoderKind::parse("seq"), Err(Seq2TreeError::UnknownDecoder(_))));
    }
}
