//! 注意力
//!
//! 解码器每一步用当前输出去读编码器的全部输出。
//!
//! ```text
//! α = softmax(h_t · s_i)
//! c = Σ α_i s_i
//! o = tanh([h_t; c] W + b)
//! ```

use crate::error::Seq2TreeResult;
use crate::graph::{Graph, NodeId};
use crate::layers::Linear;
use crate::parameters::ParameterStore;

/// 把每一步的编码器输出 [batch, dim] 堆叠成注意力上下文 [batch, T, dim]
pub fn attention_states(g: &mut Graph, encoder_outputs: &[NodeId]) -> NodeId {
    g.stack(encoder_outputs.to_vec())
}

/// Luong 风格的注意力读出层
#[derive(Debug, Clone, Copy)]
pub struct LuongAttention {
    /// [2 * dim, dim]
    combine: Linear,
}

impl LuongAttention {
    pub fn new(store: &mut ParameterStore, scope: &str, dim: usize) -> Seq2TreeResult<Self> {
        Ok(Self {
            combine: Linear::new(store, &format!("{scope}/attention/combine"), 2 * dim, dim, 0.0)?,
        })
    }

    /// 上下文向量 c
    pub fn context(&self, g: &mut Graph, query: NodeId, states: NodeId, mask: Option<NodeId>) -> NodeId {
        g.attention(query, states, states, mask)
    }

    /// 注意力后的输出 tanh([h; c] W + b)
    pub fn attend(&self, g: &mut Graph, query: NodeId, states: NodeId) -> NodeId {
        let context = self.context(g, query, states, None);
        let joined = g.concat_cols(vec![query, context]);
        let combined = self.combine.forward(g, joined);
        g.tanh(combined)
    }
}
