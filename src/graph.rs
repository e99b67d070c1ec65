//! 计算图
//!
//! 模型在构建阶段把所有运算记录成节点，运行阶段再把具体数组绑定到输入槽
//! 并求值。节点按创建顺序编号，编号即拓扑序。

use crate::parameters::ParamId;
use std::collections::HashMap;

/// 图节点句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// 节点输出的类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// 浮点张量
    Float,
    /// token id 向量 [batch]
    Ids,
}

/// 图中的运算
#[derive(Debug, Clone)]
pub enum Op {
    /// token id 输入槽 [batch]
    IdSlot { name: String },
    /// 浮点输入槽
    FloatSlot { name: String },
    /// 共享参数
    Param(ParamId),
    /// 与 `like` 同 batch 大小的零矩阵 [batch, cols]
    Zeros { like: NodeId, cols: usize },
    /// 按 id 取表的行：[V, d] x [batch] -> [batch, d]，越界 id 得到零行
    Gather { table: NodeId, ids: NodeId },
    MatMul(NodeId, NodeId),
    /// [batch, n] + [n]
    AddBias(NodeId, NodeId),
    Add(NodeId, NodeId),
    Mul(NodeId, NodeId),
    Div(NodeId, NodeId),
    /// 1 - x
    OneMinus(NodeId),
    AddScalar(NodeId, f32),
    Tanh(NodeId),
    Sigmoid(NodeId),
    Transpose(NodeId),
    /// 沿列拼接
    ConcatCols(Vec<NodeId>),
    /// 取列区间 [start, end)
    SliceCols { input: NodeId, start: usize, end: usize },
    /// 在第 1 维上堆叠：[batch, ...] x T -> [batch, T, ...]
    Stack(Vec<NodeId>),
    /// 仅在训练图中插入
    Dropout { input: NodeId, keep_prob: f32 },
    /// 点积注意力：query [b, d]，keys [b, T, d]，values [b, T, e]，mask [b, T]
    Attention {
        query: NodeId,
        keys: NodeId,
        values: NodeId,
        mask: Option<NodeId>,
    },
    /// 按行选择：cond 非零的行取 on_true
    Select {
        cond: NodeId,
        on_true: NodeId,
        on_false: NodeId,
    },
    /// id 是否属于给定集合，输出 0/1 的 id 向量
    IsAnyOf { ids: NodeId, candidates: Vec<usize> },
    /// 每行最大值的列号
    Argmax(NodeId),
    /// id 向量转浮点
    ToFloat(NodeId),
    /// 每个样本的 softmax 交叉熵 [batch]
    SoftmaxCrossEntropy { logits: NodeId, labels: NodeId },
    /// 每个样本的 sampled softmax 损失 [batch]
    SampledSoftmaxLoss {
        /// [V, d]（投影矩阵的转置）
        weights: NodeId,
        /// [V]
        biases: NodeId,
        /// [batch, d]
        inputs: NodeId,
        labels: NodeId,
        num_sampled: usize,
        num_classes: usize,
    },
    AddN(Vec<NodeId>),
    /// 全部元素的平均值（标量）
    Mean(NodeId),
}

impl Op {
    /// 运算的直接输入
    pub fn inputs(&self) -> Vec<NodeId> {
        match self {
            Op::IdSlot { .. } | Op::FloatSlot { .. } | Op::Param(_) => Vec::new(),
            Op::Zeros { like, .. } => vec![*like],
            Op::Gather { table, ids } => vec![*table, *ids],
            Op::MatMul(a, b) | Op::AddBias(a, b) | Op::Add(a, b) | Op::Mul(a, b) | Op::Div(a, b) => {
                vec![*a, *b]
            }
            Op::OneMinus(a)
            | Op::AddScalar(a, _)
            | Op::Tanh(a)
            | Op::Sigmoid(a)
            | Op::Transpose(a)
            | Op::Argmax(a)
            | Op::ToFloat(a)
            | Op::Mean(a) => vec![*a],
            Op::ConcatCols(xs) | Op::Stack(xs) | Op::AddN(xs) => xs.clone(),
            Op::SliceCols { input, .. } | Op::Dropout { input, .. } => vec![*input],
            Op::Attention {
                query,
                keys,
                values,
                mask,
            } => {
                let mut v = vec![*query, *keys, *values];
                v.extend(mask.iter().copied());
                v
            }
            Op::Select {
                cond,
                on_true,
                on_false,
            } => vec![*cond, *on_true, *on_false],
            Op::IsAnyOf { ids, .. } => vec![*ids],
            Op::SoftmaxCrossEntropy { logits, labels } => vec![*logits, *labels],
            Op::SampledSoftmaxLoss {
                weights,
                biases,
                inputs,
                labels,
                ..
            } => vec![*weights, *biases, *inputs, *labels],
        }
    }

    fn kind(&self) -> ValueKind {
        match self {
            Op::IdSlot { .. } | Op::IsAnyOf { .. } | Op::Argmax(_) => ValueKind::Ids,
            _ => ValueKind::Float,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Op::IdSlot { .. } => "IdSlot",
            Op::FloatSlot { .. } => "FloatSlot",
            Op::Param(_) => "Param",
            Op::Zeros { .. } => "Zeros",
            Op::Gather { .. } => "Gather",
            Op::MatMul(..) => "MatMul",
            Op::AddBias(..) => "AddBias",
            Op::Add(..) => "Add",
            Op::Mul(..) => "Mul",
            Op::Div(..) => "Div",
            Op::OneMinus(_) => "OneMinus",
            Op::AddScalar(..) => "AddScalar",
            Op::Tanh(_) => "Tanh",
            Op::Sigmoid(_) => "Sigmoid",
            Op::Transpose(_) => "Transpose",
            Op::ConcatCols(_) => "ConcatCols",
            Op::SliceCols { .. } => "SliceCols",
            Op::Stack(_) => "Stack",
            Op::Dropout { .. } => "Dropout",
            Op::Attention { .. } => "Attention",
            Op::Select { .. } => "Select",
            Op::IsAnyOf { .. } => "IsAnyOf",
            Op::Argmax(_) => "Argmax",
            Op::ToFloat(_) => "ToFloat",
            Op::SoftmaxCrossEntropy { .. } => "SoftmaxCrossEntropy",
            Op::SampledSoftmaxLoss { .. } => "SampledSoftmaxLoss",
            Op::AddN(_) => "AddN",
            Op::Mean(_) => "Mean",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub op: Op,
    pub kind: ValueKind,
}

/// 计算图
///
/// 只增不改：构建完成后形状不再变化，运行时只有输入槽接收新值。
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    slots: HashMap<String, NodeId>,
    params: HashMap<ParamId, NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn kind(&self, id: NodeId) -> ValueKind {
        self.nodes[id.0].kind
    }

    /// 按名字查找输入槽
    pub fn slot(&self, name: &str) -> Option<NodeId> {
        self.slots.get(name).copied()
    }

    /// 图中引用到的全部参数
    pub fn param_nodes(&self) -> impl Iterator<Item = (ParamId, NodeId)> + '_ {
        self.params.iter().map(|(&p, &n)| (p, n))
    }

    fn push(&mut self, op: Op) -> NodeId {
        for input in op.inputs() {
            debug_assert!(input.0 < self.nodes.len(), "{} refers to a later node", op.name());
        }
        let kind = op.kind();
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node { op, kind });
        id
    }

    /// token id 输入槽；同名槽只创建一次
    pub fn id_slot(&mut self, name: impl Into<String>) -> NodeId {
        let name = name.into();
        if let Some(id) = self.slot(&name) {
            return id;
        }
        let id = self.push(Op::IdSlot { name: name.clone() });
        self.slots.insert(name, id);
        id
    }

    /// 浮点输入槽；同名槽只创建一次
    pub fn float_slot(&mut self, name: impl Into<String>) -> NodeId {
        let name = name.into();
        if let Some(id) = self.slot(&name) {
            return id;
        }
        let id = self.push(Op::FloatSlot { name: name.clone() });
        self.slots.insert(name, id);
        id
    }

    /// 参数节点；每个参数在图中只有一个节点
    pub fn param(&mut self, param: ParamId) -> NodeId {
        if let Some(&id) = self.params.get(&param) {
            return id;
        }
        let id = self.push(Op::Param(param));
        self.params.insert(param, id);
        id
    }

    pub fn zeros(&mut self, like: NodeId, cols: usize) -> NodeId {
        self.push(Op::Zeros { like, cols })
    }

    pub fn gather(&mut self, table: NodeId, ids: NodeId) -> NodeId {
        self.push(Op::Gather { table, ids })
    }

    pub fn matmul(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.push(Op::MatMul(a, b))
    }

    pub fn add_bias(&mut self, a: NodeId, bias: NodeId) -> NodeId {
        self.push(Op::AddBias(a, bias))
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.push(Op::Add(a, b))
    }

    pub fn mul(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.push(Op::Mul(a, b))
    }

    pub fn div(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.push(Op::Div(a, b))
    }

    pub fn one_minus(&mut self, a: NodeId) -> NodeId {
        self.push(Op::OneMinus(a))
    }

    pub fn add_scalar(&mut self, a: NodeId, c: f32) -> NodeId {
        self.push(Op::AddScalar(a, c))
    }

    pub fn tanh(&mut self, a: NodeId) -> NodeId {
        self.push(Op::Tanh(a))
    }

    pub fn sigmoid(&mut self, a: NodeId) -> NodeId {
        self.push(Op::Sigmoid(a))
    }

    pub fn transpose(&mut self, a: NodeId) -> NodeId {
        self.push(Op::Transpose(a))
    }

    pub fn concat_cols(&mut self, xs: Vec<NodeId>) -> NodeId {
        if xs.len() == 1 {
            return xs[0];
        }
        self.push(Op::ConcatCols(xs))
    }

    pub fn slice_cols(&mut self, input: NodeId, start: usize, end: usize) -> NodeId {
        self.push(Op::SliceCols { input, start, end })
    }

    pub fn stack(&mut self, xs: Vec<NodeId>) -> NodeId {
        self.push(Op::Stack(xs))
    }

    pub fn dropout(&mut self, input: NodeId, keep_prob: f32) -> NodeId {
        self.push(Op::Dropout { input, keep_prob })
    }

    pub fn attention(&mut self, query: NodeId, keys: NodeId, values: NodeId, mask: Option<NodeId>) -> NodeId {
        self.push(Op::Attention {
            query,
            keys,
            values,
            mask,
        })
    }

    pub fn select(&mut self, cond: NodeId, on_true: NodeId, on_false: NodeId) -> NodeId {
        self.push(Op::Select {
            cond,
            on_true,
            on_false,
        })
    }

    pub fn is_any_of(&mut self, ids: NodeId, candidates: Vec<usize>) -> NodeId {
        self.push(Op::IsAnyOf { ids, candidates })
    }

    pub fn argmax(&mut self, logits: NodeId) -> NodeId {
        self.push(Op::Argmax(logits))
    }

    pub fn to_float(&mut self, ids: NodeId) -> NodeId {
        self.push(Op::ToFloat(ids))
    }

    pub fn softmax_cross_entropy(&mut self, logits: NodeId, labels: NodeId) -> NodeId {
        self.push(Op::SoftmaxCrossEntropy { logits, labels })
    }

    pub fn sampled_softmax_loss(
        &mut self,
        weights: NodeId,
        biases: NodeId,
        inputs: NodeId,
        labels: NodeId,
        num_sampled: usize,
        num_classes: usize,
    ) -> NodeId {
        self.push(Op::SampledSoftmaxLoss {
            weights,
            biases,
            inputs,
            labels,
            num_sampled,
            num_classes,
        })
    }

    pub fn add_n(&mut self, xs: Vec<NodeId>) -> NodeId {
        if xs.len() == 1 {
            return xs[0];
        }
        self.push(Op::AddN(xs))
    }

    pub fn mean(&mut self, a: NodeId) -> NodeId {
        self.push(Op::Mean(a))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_are_unique() {
        let mut g = Graph::new();
        let a = g.id_slot("encoder0");
        let b = g.id_slot("encoder0");
        assert_eq!(a, b);
        assert_eq!(g.slot("encoder0"), Some(a));
        assert_eq!(g.kind(a), ValueKind::Ids);
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn test_param_node_shared() {
        let mut g = Graph::new();
        let a = g.param(ParamId(3));
        let b = g.param(ParamId(3));
        assert_eq!(a, b);
        assert_eq!(g.param_nodes().count(), 1);
    }

    #[test]
    fn test_node_kinds() {
        let mut g = Graph::new();
        let x = g.float_slot("x");
        let ids = g.argmax(x);
        let f = g.to_float(ids);
        assert_eq!(g.kind(ids), ValueKind::Ids);
        assert_eq!(g.kind(f), ValueKind::Float);
        assert_eq!(g.node(f).op.inputs(), vec![ids]);
    }
}
