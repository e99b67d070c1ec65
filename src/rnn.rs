//! 循环单元
//!
//! GRU 和 LSTM 单元，以及把多层单元叠成一个单元的 [`StackedCell`]。
//! 多层单元的状态是各层状态按列拼接；LSTM 单层状态为 `[c, h]`。

use crate::error::{Seq2TreeError, Seq2TreeResult};
use crate::graph::{Graph, NodeId};
use crate::layers::{dropout, Linear};
use crate::parameters::ParameterStore;

/// GRU 门的偏置初值、LSTM 遗忘门偏置
const GATE_BIAS: f32 = 1.0;

/// 循环单元类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Gru,
    Lstm,
}

impl CellKind {
    pub fn parse(name: &str) -> Seq2TreeResult<Self> {
        match name {
            "gru" => Ok(CellKind::Gru),
            "lstm" => Ok(CellKind::Lstm),
            other => Err(Seq2TreeError::UnknownCell(other.to_string())),
        }
    }
}

/// 单层循环单元
#[derive(Debug, Clone)]
pub struct RecurrentCell {
    kind: CellKind,
    /// GRU: [r, u] 两个门；LSTM: [i, j, f, o]
    gates: Linear,
    /// 只有 GRU 使用的候选状态变换
    candidate: Option<Linear>,
    dim: usize,
}

impl RecurrentCell {
    pub fn new(
        store: &mut ParameterStore,
        scope: &str,
        kind: CellKind,
        input_dim: usize,
        dim: usize,
    ) -> Seq2TreeResult<Self> {
        let (gates, candidate) = match kind {
            CellKind::Gru => (
                Linear::new(store, &format!("{scope}/gru/gates"), input_dim + dim, 2 * dim, GATE_BIAS)?,
                Some(Linear::new(store, &format!("{scope}/gru/candidate"), input_dim + dim, dim, 0.0)?),
            ),
            CellKind::Lstm => (
                Linear::new(store, &format!("{scope}/lstm/gates"), input_dim + dim, 4 * dim, 0.0)?,
                None,
            ),
        };
        Ok(Self {
            kind,
            gates,
            candidate,
            dim,
        })
    }

    pub fn output_size(&self) -> usize {
        self.dim
    }

    pub fn state_size(&self) -> usize {
        match self.kind {
            CellKind::Gru => self.dim,
            CellKind::Lstm => 2 * self.dim,
        }
    }

    /// 一个时间步，返回 (输出, 新状态)
    pub fn step(&self, g: &mut Graph, x: NodeId, state: NodeId) -> (NodeId, NodeId) {
        let d = self.dim;
        match (self.kind, self.candidate) {
            (CellKind::Gru, Some(candidate)) => {
                // r, u = σ([x, h] W + b)
                // c = tanh([x, r ⊙ h] Wc + bc)
                // h' = u ⊙ h + (1 - u) ⊙ c
                let xh = g.concat_cols(vec![x, state]);
                let gates = self.gates.forward(g, xh);
                let gates = g.sigmoid(gates);
                let r = g.slice_cols(gates, 0, d);
                let u = g.slice_cols(gates, d, 2 * d);

                let rh = g.mul(r, state);
                let xrh = g.concat_cols(vec![x, rh]);
                let c = candidate.forward(g, xrh);
                let c = g.tanh(c);

                let keep = g.mul(u, state);
                let not_u = g.one_minus(u);
                let update = g.mul(not_u, c);
                let h = g.add(keep, update);
                (h, h)
            }
            _ => {
                // c' = c ⊙ σ(f + 1) + σ(i) ⊙ tanh(j)
                // h' = tanh(c') ⊙ σ(o)
                let c = g.slice_cols(state, 0, d);
                let h = g.slice_cols(state, d, 2 * d);
                let xh = g.concat_cols(vec![x, h]);
                let z = self.gates.forward(g, xh);

                let i = g.slice_cols(z, 0, d);
                let j = g.slice_cols(z, d, 2 * d);
                let f = g.slice_cols(z, 2 * d, 3 * d);
                let o = g.slice_cols(z, 3 * d, 4 * d);

                let f = g.add_scalar(f, GATE_BIAS);
                let f = g.sigmoid(f);
                let i = g.sigmoid(i);
                let j = g.tanh(j);
                let o = g.sigmoid(o);

                let kept = g.mul(c, f);
                let written = g.mul(i, j);
                let new_c = g.add(kept, written);
                let squashed = g.tanh(new_c);
                let new_h = g.mul(squashed, o);
                let new_state = g.concat_cols(vec![new_c, new_h]);
                (new_h, new_state)
            }
        }
    }
}

/// 多层循环单元，带输入/输出 dropout
#[derive(Debug, Clone)]
pub struct StackedCell {
    layers: Vec<RecurrentCell>,
    input_keep_prob: f32,
    output_keep_prob: f32,
}

impl StackedCell {
    /// 第一层输入维度为 `input_dim`，其余层为 `dim`
    pub fn new(
        store: &mut ParameterStore,
        scope: &str,
        kind: CellKind,
        input_dim: usize,
        dim: usize,
        num_layers: usize,
    ) -> Seq2TreeResult<Self> {
        let layers = (0..num_layers.max(1))
            .map(|l| {
                let in_dim = if l == 0 { input_dim } else { dim };
                RecurrentCell::new(store, &format!("{scope}/cell_{l}"), kind, in_dim, dim)
            })
            .collect::<Seq2TreeResult<Vec<_>>>()?;
        Ok(Self {
            layers,
            input_keep_prob: 1.0,
            output_keep_prob: 1.0,
        })
    }

    pub fn with_dropout(mut self, input_keep_prob: f32, output_keep_prob: f32) -> Self {
        self.input_keep_prob = input_keep_prob;
        self.output_keep_prob = output_keep_prob;
        self
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn output_size(&self) -> usize {
        self.layers.last().map_or(0, RecurrentCell::output_size)
    }

    pub fn state_size(&self) -> usize {
        self.layers.iter().map(RecurrentCell::state_size).sum()
    }

    /// 与 `like` 同 batch 的全零初始状态
    pub fn zero_state(&self, g: &mut Graph, like: NodeId) -> NodeId {
        g.zeros(like, self.state_size())
    }

    /// 一个时间步；dropout 只在 `training` 时生效
    pub fn step(&self, g: &mut Graph, x: NodeId, state: NodeId, training: bool) -> (NodeId, NodeId) {
        let mut input = dropout(g, x, self.input_keep_prob, training);
        let mut states = Vec::with_capacity(self.layers.len());
        let mut offset = 0;

        for layer in &self.layers {
            let size = layer.state_size();
            let layer_state = if self.layers.len() == 1 {
                state
            } else {
                g.slice_cols(state, offset, offset + size)
            };
            offset += size;

            let (output, new_state) = layer.step(g, input, layer_state);
            states.push(new_state);
            input = output;
        }

        let output = dropout(g, input, self.output_keep_prob, training);
        (output, g.concat_cols(states))
    }
}
