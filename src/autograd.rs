//! 自动求导
//!
//! 前向：把喂入的数组绑定到输入槽，按节点编号顺序只计算目标所需的节点。
//! 反向：从标量损失出发，逆序把梯度传回每个参数节点。

use crate::error::{Seq2TreeError, Seq2TreeResult};
use crate::graph::{Graph, NodeId, Op};
use crate::parameters::{ParamId, ParameterStore};
use crate::sampling::LogUniformSampler;
use crate::tensor::{argmax_rows, masked_softmax_rows, softmax_rows, TensorExt};
use ndarray::{arr0, s, Array1, Array2, Array3, ArrayD, ArrayViewD, Axis};
use rand::Rng;
use std::collections::HashMap;

/// sampled softmax 中与真实标签重合的负类所加的惩罚
const ACCIDENTAL_HIT_PENALTY: f32 = -1e9;

/// 图中流动的值
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Float(ArrayD<f32>),
    Ids(Array1<usize>),
}

impl Value {
    pub fn as_float(&self) -> Option<&ArrayD<f32>> {
        match self {
            Value::Float(a) => Some(a),
            Value::Ids(_) => None,
        }
    }

    pub fn as_ids(&self) -> Option<&Array1<usize>> {
        match self {
            Value::Ids(a) => Some(a),
            Value::Float(_) => None,
        }
    }

    /// 第 0 维大小
    pub fn batch_size(&self) -> usize {
        match self {
            Value::Float(a) => a.shape().first().copied().unwrap_or(1),
            Value::Ids(a) => a.len(),
        }
    }
}

impl From<ArrayD<f32>> for Value {
    fn from(a: ArrayD<f32>) -> Self {
        Value::Float(a)
    }
}

impl From<Array1<f32>> for Value {
    fn from(a: Array1<f32>) -> Self {
        Value::Float(a.into_dyn())
    }
}

impl From<Array2<f32>> for Value {
    fn from(a: Array2<f32>) -> Self {
        Value::Float(a.into_dyn())
    }
}

impl From<Array1<usize>> for Value {
    fn from(a: Array1<usize>) -> Self {
        Value::Ids(a)
    }
}

/// 输入槽到具体数组的绑定
#[derive(Debug, Clone, Default)]
pub struct Feed {
    values: HashMap<NodeId, Value>,
}

impl Feed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, slot: NodeId, value: impl Into<Value>) {
        self.values.insert(slot, value.into());
    }

    pub fn get(&self, slot: NodeId) -> Option<&Value> {
        self.values.get(&slot)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// 反向传播需要的前向中间结果
#[derive(Debug, Clone)]
enum Aux {
    /// dropout 掩码（已除以 keep_prob）
    Mask(ArrayD<f32>),
    /// softmax 概率
    Probs(Array2<f32>),
    /// 注意力权重 [batch, T]
    Alpha(Array2<f32>),
    /// 采样的负类和 [真实类, 负类...] 上的概率
    Sampled { classes: Vec<usize>, probs: Array2<f32> },
}

/// 一次前向计算的结果
#[derive(Debug)]
pub struct Evaluation {
    values: Vec<Option<Value>>,
    aux: Vec<Option<Aux>>,
}

impl Evaluation {
    pub fn value(&self, id: NodeId) -> Option<&Value> {
        self.values.get(id.0).and_then(|v| v.as_ref())
    }

    pub fn float(&self, id: NodeId) -> Seq2TreeResult<&ArrayD<f32>> {
        float_input(&self.values, id, "fetch")
    }
}

fn float_input<'a>(values: &'a [Option<Value>], id: NodeId, op: &'static str) -> Seq2TreeResult<&'a ArrayD<f32>> {
    match values.get(id.0).and_then(|v| v.as_ref()) {
        Some(Value::Float(a)) => Ok(a),
        Some(Value::Ids(_)) => Err(Seq2TreeError::shape(op, format!("node {} holds ids, expected floats", id.0))),
        None => Err(Seq2TreeError::shape(op, format!("node {} was not evaluated", id.0))),
    }
}

fn ids_input<'a>(values: &'a [Option<Value>], id: NodeId, op: &'static str) -> Seq2TreeResult<&'a Array1<usize>> {
    match values.get(id.0).and_then(|v| v.as_ref()) {
        Some(Value::Ids(a)) => Ok(a),
        Some(Value::Float(_)) => Err(Seq2TreeError::shape(op, format!("node {} holds floats, expected ids", id.0))),
        None => Err(Seq2TreeError::shape(op, format!("node {} was not evaluated", id.0))),
    }
}

fn same_shape(op: &'static str, a: &ArrayD<f32>, b: &ArrayD<f32>) -> Seq2TreeResult<()> {
    if a.shape() != b.shape() {
        return Err(Seq2TreeError::shape(op, format!("{:?} vs {:?}", a.shape(), b.shape())));
    }
    Ok(())
}

/// 前向计算
///
/// 只计算 `targets` 依赖的节点；随机运算（dropout、负类采样）从 `rng` 取数。
pub fn forward<R: Rng>(
    graph: &Graph,
    params: &ParameterStore,
    feed: &Feed,
    targets: &[NodeId],
    rng: &mut R,
) -> Seq2TreeResult<Evaluation> {
    let mut needed = vec![false; graph.len()];
    let mut stack: Vec<NodeId> = targets.to_vec();
    while let Some(id) = stack.pop() {
        if needed[id.0] {
            continue;
        }
        needed[id.0] = true;
        stack.extend(graph.node(id).op.inputs());
    }

    let mut values: Vec<Option<Value>> = vec![None; graph.len()];
    let mut aux: Vec<Option<Aux>> = vec![None; graph.len()];
    for i in 0..graph.len() {
        if !needed[i] {
            continue;
        }
        let id = NodeId(i);
        let (value, extra) = eval_op(&graph.node(id).op, id, &values, params, feed, rng)?;
        values[i] = Some(value);
        aux[i] = extra;
    }

    Ok(Evaluation { values, aux })
}

fn eval_op<R: Rng>(
    op: &Op,
    id: NodeId,
    values: &[Option<Value>],
    params: &ParameterStore,
    feed: &Feed,
    rng: &mut R,
) -> Seq2TreeResult<(Value, Option<Aux>)> {
    let name = op.name();
    let f = |n: NodeId| float_input(values, n, name);
    let ids = |n: NodeId| ids_input(values, n, name);

    let value = match op {
        Op::IdSlot { name: slot } => match feed.get(id) {
            Some(v @ Value::Ids(_)) => v.clone(),
            Some(Value::Float(_)) => {
                return Err(Seq2TreeError::shape("IdSlot", format!("slot '{slot}' fed with floats")))
            }
            None => return Err(Seq2TreeError::MissingFeed(slot.clone())),
        },
        Op::FloatSlot { name: slot } => match feed.get(id) {
            Some(v @ Value::Float(_)) => v.clone(),
            Some(Value::Ids(_)) => {
                return Err(Seq2TreeError::shape("FloatSlot", format!("slot '{slot}' fed with ids")))
            }
            None => return Err(Seq2TreeError::MissingFeed(slot.clone())),
        },
        Op::Param(p) => Value::Float(params.get(*p).clone()),
        Op::Zeros { like, cols } => {
            let batch = values[like.0]
                .as_ref()
                .map(Value::batch_size)
                .ok_or_else(|| Seq2TreeError::shape(name, "reference node was not evaluated"))?;
            Value::Float(Array2::<f32>::zeros((batch, *cols)).into_dyn())
        }
        Op::Gather { table, ids: id_node } => {
            let table = f(*table)?.as_matrix(name)?;
            let ids = ids(*id_node)?;
            let mut out = Array2::zeros((ids.len(), table.ncols()));
            for (row, &token) in ids.iter().enumerate() {
                if token >= table.nrows() {
                    return Err(Seq2TreeError::IdOutOfRange {
                        id: token,
                        vocab_size: table.nrows(),
                    });
                }
                out.row_mut(row).assign(&table.row(token));
            }
            Value::Float(out.into_dyn())
        }
        Op::MatMul(a, b) => {
            let a = f(*a)?.as_matrix(name)?;
            let b = f(*b)?.as_matrix(name)?;
            if a.ncols() != b.nrows() {
                return Err(Seq2TreeError::shape(name, format!("{:?} x {:?}", a.dim(), b.dim())));
            }
            Value::Float(a.dot(&b).into_dyn())
        }
        Op::AddBias(a, bias) => {
            let a = f(*a)?.as_matrix(name)?;
            let bias = f(*bias)?.as_vector(name)?;
            if a.ncols() != bias.len() {
                return Err(Seq2TreeError::shape(name, format!("{:?} + [{}]", a.dim(), bias.len())));
            }
            Value::Float((&a + &bias).into_dyn())
        }
        Op::Add(a, b) => {
            let (a, b) = (f(*a)?, f(*b)?);
            same_shape(name, a, b)?;
            Value::Float(a + b)
        }
        Op::Mul(a, b) => {
            let (a, b) = (f(*a)?, f(*b)?);
            same_shape(name, a, b)?;
            Value::Float(a * b)
        }
        Op::Div(a, b) => {
            let (a, b) = (f(*a)?, f(*b)?);
            same_shape(name, a, b)?;
            Value::Float(a / b)
        }
        Op::OneMinus(a) => Value::Float(f(*a)?.mapv(|x| 1.0 - x)),
        Op::AddScalar(a, c) => Value::Float(f(*a)? + *c),
        Op::Tanh(a) => Value::Float(f(*a)?.mapv(f32::tanh)),
        Op::Sigmoid(a) => Value::Float(f(*a)?.mapv(|x| 1.0 / (1.0 + (-x).exp()))),
        Op::Transpose(a) => Value::Float(f(*a)?.as_matrix(name)?.t().to_owned().into_dyn()),
        Op::ConcatCols(xs) => {
            let views = xs
                .iter()
                .map(|&x| f(x).and_then(|a| a.as_matrix(name)))
                .collect::<Seq2TreeResult<Vec<_>>>()?;
            let out = ndarray::concatenate(Axis(1), &views)
                .map_err(|e| Seq2TreeError::shape(name, e.to_string()))?;
            Value::Float(out.into_dyn())
        }
        Op::SliceCols { input, start, end } => {
            let a = f(*input)?.as_matrix(name)?;
            if *start > *end || *end > a.ncols() {
                return Err(Seq2TreeError::shape(name, format!("columns {start}..{end} of {:?}", a.dim())));
            }
            Value::Float(a.slice(s![.., *start..*end]).to_owned().into_dyn())
        }
        Op::Stack(xs) => {
            let views = xs
                .iter()
                .map(|&x| f(x).map(|a| a.view()))
                .collect::<Seq2TreeResult<Vec<ArrayViewD<f32>>>>()?;
            let out = ndarray::stack(Axis(1), &views).map_err(|e| Seq2TreeError::shape(name, e.to_string()))?;
            Value::Float(out)
        }
        Op::Dropout { input, keep_prob } => {
            let a = f(*input)?;
            let keep = *keep_prob;
            let mask = ArrayD::from_shape_fn(a.raw_dim(), |_| if rng.gen::<f32>() < keep { 1.0 / keep } else { 0.0 });
            let out = a * &mask;
            return Ok((Value::Float(out), Some(Aux::Mask(mask))));
        }
        Op::Attention {
            query,
            keys,
            values: vals,
            mask,
        } => {
            let q = f(*query)?.as_matrix(name)?;
            let k = f(*keys)?.as_cube(name)?;
            let v = f(*vals)?.as_cube(name)?;
            let (batch, steps, dim) = k.dim();
            if q.dim() != (batch, dim) || v.dim().0 != batch || v.dim().1 != steps {
                return Err(Seq2TreeError::shape(
                    name,
                    format!("query {:?}, keys {:?}, values {:?}", q.dim(), k.dim(), v.dim()),
                ));
            }

            let mut scores = Array2::zeros((batch, steps));
            for b in 0..batch {
                for t in 0..steps {
                    scores[[b, t]] = (0..dim).map(|d| k[[b, t, d]] * q[[b, d]]).sum();
                }
            }
            let alpha = match mask {
                Some(m) => {
                    let m = f(*m)?.as_matrix(name)?;
                    if m.dim() != (batch, steps) {
                        return Err(Seq2TreeError::shape(name, format!("mask {:?}", m.dim())));
                    }
                    masked_softmax_rows(&scores.view(), &m)
                }
                None => softmax_rows(&scores.view()),
            };

            let width = v.dim().2;
            let mut out = Array2::zeros((batch, width));
            for b in 0..batch {
                for t in 0..steps {
                    let w = alpha[[b, t]];
                    if w != 0.0 {
                        for e in 0..width {
                            out[[b, e]] += w * v[[b, t, e]];
                        }
                    }
                }
            }
            return Ok((Value::Float(out.into_dyn()), Some(Aux::Alpha(alpha))));
        }
        Op::Select {
            cond,
            on_true,
            on_false,
        } => {
            let cond = ids(*cond)?;
            let (t, fl) = (f(*on_true)?, f(*on_false)?);
            same_shape(name, t, fl)?;
            if t.shape().first() != Some(&cond.len()) {
                return Err(Seq2TreeError::shape(name, format!("condition of length {} for {:?}", cond.len(), t.shape())));
            }
            let mut out = fl.clone();
            for (row, &c) in cond.iter().enumerate() {
                if c != 0 {
                    out.index_axis_mut(Axis(0), row).assign(&t.index_axis(Axis(0), row));
                }
            }
            Value::Float(out)
        }
        Op::IsAnyOf { ids: id_node, candidates } => {
            Value::Ids(ids(*id_node)?.mapv(|i| usize::from(candidates.contains(&i))))
        }
        Op::Argmax(a) => Value::Ids(Array1::from(argmax_rows(&f(*a)?.as_matrix(name)?))),
        Op::ToFloat(a) => Value::Float(ids(*a)?.mapv(|i| i as f32).into_dyn()),
        Op::SoftmaxCrossEntropy { logits, labels } => {
            let logits = f(*logits)?.as_matrix(name)?;
            let labels = ids(*labels)?;
            if logits.nrows() != labels.len() {
                return Err(Seq2TreeError::shape(name, format!("{} labels for {:?}", labels.len(), logits.dim())));
            }
            let probs = softmax_rows(&logits);
            let mut loss = Array1::zeros(labels.len());
            for (b, &label) in labels.iter().enumerate() {
                if label >= logits.ncols() {
                    return Err(Seq2TreeError::LabelOutOfRange {
                        label,
                        num_classes: logits.ncols(),
                    });
                }
                loss[b] = -probs[[b, label]].max(f32::MIN_POSITIVE).ln();
            }
            return Ok((Value::Float(loss.into_dyn()), Some(Aux::Probs(probs))));
        }
        Op::SampledSoftmaxLoss {
            weights,
            biases,
            inputs,
            labels,
            num_sampled,
            num_classes,
        } => {
            let w = f(*weights)?.as_matrix(name)?;
            let bias = f(*biases)?.as_vector(name)?;
            let x = f(*inputs)?.as_matrix(name)?;
            let labels = ids(*labels)?;
            if w.nrows() != *num_classes || bias.len() != *num_classes || w.ncols() != x.ncols() {
                return Err(Seq2TreeError::shape(
                    name,
                    format!("weights {:?}, biases [{}], inputs {:?}", w.dim(), bias.len(), x.dim()),
                ));
            }

            let sampler = LogUniformSampler::new(*num_classes);
            let sampled = sampler.sample_unique(*num_sampled, rng);
            let log_q = |class: usize| sampler.expected_count(class, sampled.num_tries).ln() as f32;
            let sampled_log_q: Vec<f32> = sampled.classes.iter().map(|&c| log_q(c)).collect();

            let batch = x.nrows();
            let width = sampled.classes.len() + 1;
            let mut logits = Array2::zeros((batch, width));
            for (b, &label) in labels.iter().enumerate() {
                if label >= *num_classes {
                    return Err(Seq2TreeError::LabelOutOfRange {
                        label,
                        num_classes: *num_classes,
                    });
                }
                let row = x.row(b);
                logits[[b, 0]] = row.dot(&w.row(label)) + bias[label] - log_q(label);
                for (j, &class) in sampled.classes.iter().enumerate() {
                    let mut logit = row.dot(&w.row(class)) + bias[class] - sampled_log_q[j];
                    if class == label {
                        logit += ACCIDENTAL_HIT_PENALTY;
                    }
                    logits[[b, j + 1]] = logit;
                }
            }
            let probs = softmax_rows(&logits.view());
            let loss = probs.column(0).mapv(|p| -p.max(f32::MIN_POSITIVE).ln());
            return Ok((
                Value::Float(loss.into_dyn()),
                Some(Aux::Sampled {
                    classes: sampled.classes,
                    probs,
                }),
            ));
        }
        Op::AddN(xs) => {
            let first = f(xs[0])?;
            let mut total = first.clone();
            for &x in &xs[1..] {
                let a = f(x)?;
                same_shape(name, first, a)?;
                total += a;
            }
            Value::Float(total)
        }
        Op::Mean(a) => Value::Float(arr0(f(*a)?.mean().unwrap_or(0.0)).into_dyn()),
    };

    Ok((value, None))
}

fn accumulate(grads: &mut [Option<ArrayD<f32>>], id: NodeId, g: ArrayD<f32>) {
    match &mut grads[id.0] {
        Some(existing) => *existing += &g,
        slot @ None => *slot = Some(g),
    }
}

/// 反向传播
///
/// 返回损失对每个参与计算的参数的梯度；与损失无关的参数不出现在结果中。
pub fn backward(graph: &Graph, eval: &Evaluation, loss: NodeId) -> Seq2TreeResult<HashMap<ParamId, ArrayD<f32>>> {
    let values = &eval.values;
    let loss_value = float_input(values, loss, "backward")?;

    let mut grads: Vec<Option<ArrayD<f32>>> = vec![None; loss.0 + 1];
    grads[loss.0] = Some(ArrayD::ones(loss_value.raw_dim()));
    let mut result = HashMap::new();

    for i in (0..=loss.0).rev() {
        let g = match grads[i].take() {
            Some(g) => g,
            None => continue,
        };
        let op = &graph.node(NodeId(i)).op;
        let name = op.name();
        let f = |n: NodeId| float_input(values, n, name);

        match op {
            Op::Param(p) => {
                result.insert(*p, g);
            }
            Op::Gather { table, ids } => {
                let t = f(*table)?;
                let ids = ids_input(values, *ids, name)?;
                let g2 = g.as_matrix(name)?;
                let mut gt = Array2::<f32>::zeros((t.shape()[0], t.shape()[1]));
                for (row, &token) in ids.iter().enumerate() {
                    if token < gt.nrows() {
                        let mut target = gt.row_mut(token);
                        target += &g2.row(row);
                    }
                }
                accumulate(&mut grads, *table, gt.into_dyn());
            }
            Op::MatMul(a, b) => {
                let g2 = g.as_matrix(name)?;
                let a2 = f(*a)?.as_matrix(name)?;
                let b2 = f(*b)?.as_matrix(name)?;
                let ga = g2.dot(&b2.t()).into_dyn();
                let gb = a2.t().dot(&g2).into_dyn();
                accumulate(&mut grads, *a, ga);
                accumulate(&mut grads, *b, gb);
            }
            Op::AddBias(a, bias) => {
                let gb = g.as_matrix(name)?.sum_axis(Axis(0)).into_dyn();
                accumulate(&mut grads, *bias, gb);
                accumulate(&mut grads, *a, g);
            }
            Op::Add(a, b) => {
                accumulate(&mut grads, *a, g.clone());
                accumulate(&mut grads, *b, g);
            }
            Op::Mul(a, b) => {
                let ga = &g * f(*b)?;
                let gb = &g * f(*a)?;
                accumulate(&mut grads, *a, ga);
                accumulate(&mut grads, *b, gb);
            }
            Op::Div(a, b) => {
                let (av, bv) = (f(*a)?, f(*b)?);
                let ga = &g / bv;
                let gb = -(&g * av) / (bv * bv);
                accumulate(&mut grads, *a, ga);
                accumulate(&mut grads, *b, gb);
            }
            Op::OneMinus(a) => accumulate(&mut grads, *a, -g),
            Op::AddScalar(a, _) => accumulate(&mut grads, *a, g),
            Op::Tanh(a) => {
                let y = f(NodeId(i))?;
                accumulate(&mut grads, *a, g * &y.mapv(|v| 1.0 - v * v));
            }
            Op::Sigmoid(a) => {
                let y = f(NodeId(i))?;
                accumulate(&mut grads, *a, g * &y.mapv(|v| v * (1.0 - v)));
            }
            Op::Transpose(a) => {
                let gt = g.as_matrix(name)?.t().to_owned().into_dyn();
                accumulate(&mut grads, *a, gt);
            }
            Op::ConcatCols(xs) => {
                let g2 = g.as_matrix(name)?;
                let mut offset = 0;
                for &x in xs {
                    let width = f(x)?.shape()[1];
                    let part = g2.slice(s![.., offset..offset + width]).to_owned().into_dyn();
                    accumulate(&mut grads, x, part);
                    offset += width;
                }
            }
            Op::SliceCols { input, start, end } => {
                let shape = f(*input)?.shape().to_vec();
                let mut gi = Array2::<f32>::zeros((shape[0], shape[1]));
                gi.slice_mut(s![.., *start..*end]).assign(&g.as_matrix(name)?);
                accumulate(&mut grads, *input, gi.into_dyn());
            }
            Op::Stack(xs) => {
                for (t, &x) in xs.iter().enumerate() {
                    accumulate(&mut grads, x, g.index_axis(Axis(1), t).to_owned());
                }
            }
            Op::Dropout { input, .. } => {
                if let Some(Aux::Mask(mask)) = &eval.aux[i] {
                    accumulate(&mut grads, *input, g * mask);
                }
            }
            Op::Attention {
                query,
                keys,
                values: vals,
                ..
            } => {
                let alpha = match &eval.aux[i] {
                    Some(Aux::Alpha(alpha)) => alpha,
                    _ => return Err(Seq2TreeError::shape(name, "missing attention weights")),
                };
                let g2 = g.as_matrix(name)?;
                let q = f(*query)?.as_matrix(name)?;
                let k = f(*keys)?.as_cube(name)?;
                let v = f(*vals)?.as_cube(name)?;
                let (batch, steps, dim) = k.dim();
                let width = v.dim().2;

                let mut g_alpha = Array2::<f32>::zeros((batch, steps));
                let mut gv = Array3::<f32>::zeros((batch, steps, width));
                for b in 0..batch {
                    for t in 0..steps {
                        let mut acc = 0.0;
                        for e in 0..width {
                            acc += g2[[b, e]] * v[[b, t, e]];
                            gv[[b, t, e]] = alpha[[b, t]] * g2[[b, e]];
                        }
                        g_alpha[[b, t]] = acc;
                    }
                }

                // softmax 反向：ds = α ⊙ (dα - Σ α dα)
                let mut gq = Array2::<f32>::zeros((batch, dim));
                let mut gk = Array3::<f32>::zeros((batch, steps, dim));
                for b in 0..batch {
                    let inner: f32 = (0..steps).map(|t| alpha[[b, t]] * g_alpha[[b, t]]).sum();
                    for t in 0..steps {
                        let ds = alpha[[b, t]] * (g_alpha[[b, t]] - inner);
                        if ds == 0.0 {
                            continue;
                        }
                        for d in 0..dim {
                            gq[[b, d]] += ds * k[[b, t, d]];
                            gk[[b, t, d]] += ds * q[[b, d]];
                        }
                    }
                }

                accumulate(&mut grads, *query, gq.into_dyn());
                accumulate(&mut grads, *keys, gk.into_dyn());
                accumulate(&mut grads, *vals, gv.into_dyn());
            }
            Op::Select {
                cond,
                on_true,
                on_false,
            } => {
                let cond = ids_input(values, *cond, name)?;
                let mut gt = ArrayD::<f32>::zeros(g.raw_dim());
                let mut gf = g.clone();
                for (row, &c) in cond.iter().enumerate() {
                    if c != 0 {
                        gt.index_axis_mut(Axis(0), row).assign(&g.index_axis(Axis(0), row));
                        gf.index_axis_mut(Axis(0), row).fill(0.0);
                    }
                }
                accumulate(&mut grads, *on_true, gt);
                accumulate(&mut grads, *on_false, gf);
            }
            Op::SoftmaxCrossEntropy { logits, labels } => {
                let probs = match &eval.aux[i] {
                    Some(Aux::Probs(p)) => p,
                    _ => return Err(Seq2TreeError::shape(name, "missing softmax probabilities")),
                };
                let labels = ids_input(values, *labels, name)?;
                let g1 = g.as_vector(name)?;
                let mut gl = probs.clone();
                for (b, &label) in labels.iter().enumerate() {
                    gl[[b, label]] -= 1.0;
                    gl.row_mut(b).mapv_inplace(|x| x * g1[b]);
                }
                accumulate(&mut grads, *logits, gl.into_dyn());
            }
            Op::SampledSoftmaxLoss {
                weights,
                biases,
                inputs,
                labels,
                ..
            } => {
                let (classes, probs) = match &eval.aux[i] {
                    Some(Aux::Sampled { classes, probs }) => (classes, probs),
                    _ => return Err(Seq2TreeError::shape(name, "missing sampled candidates")),
                };
                let w = f(*weights)?.as_matrix(name)?;
                let x = f(*inputs)?.as_matrix(name)?;
                let labels = ids_input(values, *labels, name)?;
                let g1 = g.as_vector(name)?;

                let mut gw = Array2::<f32>::zeros(w.dim());
                let mut gb = Array1::<f32>::zeros(w.nrows());
                let mut gx = Array2::<f32>::zeros(x.dim());
                for (b, &label) in labels.iter().enumerate() {
                    let candidates = std::iter::once(label).chain(classes.iter().copied());
                    for (j, class) in candidates.enumerate() {
                        let target = if j == 0 { 1.0 } else { 0.0 };
                        let dl = (probs[[b, j]] - target) * g1[b];
                        if dl == 0.0 {
                            continue;
                        }
                        let mut gx_row = gx.row_mut(b);
                        gx_row.scaled_add(dl, &w.row(class));
                        let mut gw_row = gw.row_mut(class);
                        gw_row.scaled_add(dl, &x.row(b));
                        gb[class] += dl;
                    }
                }
                accumulate(&mut grads, *weights, gw.into_dyn());
                accumulate(&mut grads, *biases, gb.into_dyn());
                accumulate(&mut grads, *inputs, gx.into_dyn());
            }
            Op::AddN(xs) => {
                for &x in xs {
                    accumulate(&mut grads, x, g.clone());
                }
            }
            Op::Mean(a) => {
                let input = f(*a)?;
                let n = input.len().max(1) as f32;
                let scale = g.iter().next().copied().unwrap_or(0.0) / n;
                accumulate(&mut grads, *a, ArrayD::from_elem(input.raw_dim(), scale));
            }
            // 输入槽和离散运算没有梯度
            Op::IdSlot { .. }
            | Op::FloatSlot { .. }
            | Op::Zeros { .. }
            | Op::IsAnyOf { .. }
            | Op::Argmax(_)
            | Op::ToFloat(_) => {}
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::Initializer;
    use ndarray::{arr1, arr2};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// 有限差分检查某个参数的梯度
    fn check_gradient(graph: &Graph, store: &mut ParameterStore, feed: &Feed, loss: NodeId, param: ParamId) {
        let mut rng = StdRng::seed_from_u64(0);
        let eval = forward(graph, store, feed, &[loss], &mut rng).unwrap();
        let grads = backward(graph, &eval, loss).unwrap();
        let analytic = grads.get(&param).expect("parameter has no gradient").as_standard_layout().to_owned();

        let eps = 1e-2;
        let original = store.get(param).clone();
        for idx in 0..original.len() {
            let mut plus = original.clone();
            plus.as_slice_mut().unwrap()[idx] += eps;
            *store.get_mut(param) = plus;
            let mut rng = StdRng::seed_from_u64(0);
            let lp = forward(graph, store, feed, &[loss], &mut rng).unwrap().float(loss).unwrap().sum();

            let mut minus = original.clone();
            minus.as_slice_mut().unwrap()[idx] -= eps;
            *store.get_mut(param) = minus;
            let mut rng = StdRng::seed_from_u64(0);
            let lm = forward(graph, store, feed, &[loss], &mut rng).unwrap().float(loss).unwrap().sum();

            let numeric = (lp - lm) / (2.0 * eps);
            let got = analytic.as_slice().unwrap()[idx];
            assert!(
                (numeric - got).abs() < 2e-2,
                "{} [{}]: numeric {} vs analytic {}",
                store.name(param),
                idx,
                numeric,
                got
            );
        }
        *store.get_mut(param) = original;
    }

    #[test]
    fn test_missing_feed() {
        let mut g = Graph::new();
        let x = g.id_slot("encoder0");
        let store = ParameterStore::new(0);
        let mut rng = StdRng::seed_from_u64(0);
        let err = forward(&g, &store, &Feed::new(), &[x], &mut rng).unwrap_err();
        assert!(matches!(err, Seq2TreeError::MissingFeed(name) if name == "encoder0"));
    }

    #[test]
    fn test_only_needed_nodes_are_evaluated() {
        let mut g = Graph::new();
        let x = g.float_slot("x");
        let y = g.float_slot("unfed");
        let t = g.tanh(x);
        let _unused = g.tanh(y);

        let mut feed = Feed::new();
        feed.insert(x, arr1(&[0.0f32, 1.0]));
        let store = ParameterStore::new(0);
        let mut rng = StdRng::seed_from_u64(0);
        let eval = forward(&g, &store, &feed, &[t], &mut rng).unwrap();

        assert!(eval.value(y).is_none());
        assert!((eval.float(t).unwrap()[[1]] - 1.0f32.tanh()).abs() < 1e-6);
    }

    #[test]
    fn test_gather_rejects_out_of_range_id() {
        let mut store = ParameterStore::new(0);
        let table = store.get_or_create("emb", &[3, 2], Initializer::Constant(1.0)).unwrap();
        let mut g = Graph::new();
        let ids = g.id_slot("ids");
        let t = g.param(table);
        let out = g.gather(t, ids);

        let mut feed = Feed::new();
        feed.insert(ids, arr1(&[2usize, 0]));
        let mut rng = StdRng::seed_from_u64(0);
        let eval = forward(&g, &store, &feed, &[out], &mut rng).unwrap();
        assert_eq!(eval.float(out).unwrap()[[0, 0]], 1.0);

        feed.insert(ids, arr1(&[2usize, 7]));
        assert!(matches!(
            forward(&g, &store, &feed, &[out], &mut rng),
            Err(Seq2TreeError::IdOutOfRange { id: 7, vocab_size: 3 })
        ));
    }

    #[test]
    fn test_matmul_shape_error() {
        let mut g = Graph::new();
        let a = g.float_slot("a");
        let b = g.float_slot("b");
        let c = g.matmul(a, b);
        let mut feed = Feed::new();
        feed.insert(a, Array2::<f32>::zeros((2, 3)));
        feed.insert(b, Array2::<f32>::zeros((2, 3)));
        let store = ParameterStore::new(0);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            forward(&g, &store, &feed, &[c], &mut rng),
            Err(Seq2TreeError::Shape { op: "MatMul", .. })
        ));
    }

    #[test]
    fn test_linear_softmax_gradients() {
        let mut store = ParameterStore::new(7);
        let w = store.get_or_create("w", &[3, 4], Initializer::Xavier).unwrap();
        let b = store.get_or_create("b", &[4], Initializer::Uniform(0.5)).unwrap();

        let mut g = Graph::new();
        let x = g.float_slot("x");
        let labels = g.id_slot("labels");
        let wn = g.param(w);
        let bn = g.param(b);
        let h = g.matmul(x, wn);
        let logits = g.add_bias(h, bn);
        let xent = g.softmax_cross_entropy(logits, labels);
        let loss = g.mean(xent);

        let mut feed = Feed::new();
        feed.insert(x, arr2(&[[0.5f32, -1.0, 2.0], [1.5, 0.3, -0.7]]));
        feed.insert(labels, arr1(&[1usize, 3]));

        check_gradient(&g, &mut store, &feed, loss, w);
        check_gradient(&g, &mut store, &feed, loss, b);
    }

    #[test]
    fn test_recurrent_style_gradients() {
        let mut store = ParameterStore::new(3);
        let emb = store.get_or_create("emb", &[5, 3], Initializer::Uniform(1.0)).unwrap();
        let w = store.get_or_create("w", &[6, 6], Initializer::Xavier).unwrap();

        let mut g = Graph::new();
        let ids = g.id_slot("ids");
        let sel = g.id_slot("sel");
        let table = g.param(emb);
        let wn = g.param(w);
        let x = g.gather(table, ids);
        let h0 = g.zeros(ids, 3);
        let xh = g.concat_cols(vec![x, h0]);
        let z = g.matmul(xh, wn);
        let gate = g.slice_cols(z, 0, 3);
        let cand = g.slice_cols(z, 3, 6);
        let gate = g.sigmoid(gate);
        let cand = g.tanh(cand);
        let keep = g.one_minus(gate);
        let a = g.mul(gate, cand);
        let b = g.mul(keep, x);
        let h = g.add(a, b);
        let shifted = g.add_scalar(h, 0.5);
        let picked = g.select(sel, h, shifted);
        let ones = g.float_slot("ones");
        let labels = g.id_slot("labels");
        let logits = g.div(picked, ones);
        let xent = g.softmax_cross_entropy(logits, labels);
        let loss = g.mean(xent);

        let mut feed = Feed::new();
        feed.insert(ids, arr1(&[1usize, 4]));
        feed.insert(sel, arr1(&[1usize, 0]));
        feed.insert(ones, Array2::<f32>::from_elem((2, 3), 2.0));
        feed.insert(labels, arr1(&[0usize, 2]));

        check_gradient(&g, &mut store, &feed, loss, emb);
        check_gradient(&g, &mut store, &feed, loss, w);
    }

    #[test]
    fn test_attention_gradients() {
        let mut store = ParameterStore::new(11);
        let q = store.get_or_create("q", &[2, 3], Initializer::Uniform(1.0)).unwrap();
        let s0 = store.get_or_create("s0", &[2, 3], Initializer::Uniform(1.0)).unwrap();
        let s1 = store.get_or_create("s1", &[2, 3], Initializer::Uniform(1.0)).unwrap();

        let mut g = Graph::new();
        let mask = g.float_slot("mask");
        let labels = g.id_slot("labels");
        let qn = g.param(q);
        let a = g.param(s0);
        let b = g.param(s1);
        let states = g.stack(vec![a, b]);
        let plain = g.attention(qn, states, states, None);
        let masked = g.attention(qn, states, states, Some(mask));
        let both = g.add(plain, masked);
        let xent = g.softmax_cross_entropy(both, labels);
        let loss = g.mean(xent);

        let mut feed = Feed::new();
        feed.insert(mask, arr2(&[[1.0f32, 1.0], [0.0, 1.0]]));
        feed.insert(labels, arr1(&[2usize, 0]));

        check_gradient(&g, &mut store, &feed, loss, q);
        check_gradient(&g, &mut store, &feed, loss, s0);
        check_gradient(&g, &mut store, &feed, loss, s1);
    }

    #[test]
    fn test_sampled_softmax_gradients() {
        let mut store = ParameterStore::new(5);
        let w = store.get_or_create("proj_w", &[3, 12], Initializer::Xavier).unwrap();
        let b = store.get_or_create("proj_b", &[12], Initializer::Uniform(0.1)).unwrap();
        let x = store.get_or_create("x", &[2, 3], Initializer::Uniform(1.0)).unwrap();

        let mut g = Graph::new();
        let labels = g.id_slot("labels");
        let wn = g.param(w);
        let wt = g.transpose(wn);
        let bn = g.param(b);
        let xn = g.param(x);
        let per_example = g.sampled_softmax_loss(wt, bn, xn, labels, 4, 12);
        let loss = g.mean(per_example);

        let mut feed = Feed::new();
        feed.insert(labels, arr1(&[3usize, 9]));

        // 固定种子保证扰动前后抽到同一组负类
        check_gradient(&g, &mut store, &feed, loss, w);
        check_gradient(&g, &mut store, &feed, loss, b);
        check_gradient(&g, &mut store, &feed, loss, x);
    }

    #[test]
    fn test_dropout_mask_is_reused_in_backward() {
        let mut store = ParameterStore::new(2);
        let p = store.get_or_create("p", &[4, 3], Initializer::Uniform(1.0)).unwrap();
        let mut g = Graph::new();
        let labels = g.id_slot("labels");
        let pn = g.param(p);
        let dropped = g.dropout(pn, 0.5);
        let xent = g.softmax_cross_entropy(dropped, labels);
        let loss = g.mean(xent);

        let mut feed = Feed::new();
        feed.insert(labels, arr1(&[0usize, 1, 2, 0]));
        check_gradient(&g, &mut store, &feed, loss, p);
    }
}
