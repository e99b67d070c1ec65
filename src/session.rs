//! 执行会话
//!
//! 持有共享参数表、优化器和随机数源。一次 `run` 只做一遍前向计算，
//! 需要更新时再做一遍反向、全局范数裁剪和参数更新。

use crate::autograd::{backward, forward, Feed, Value};
use crate::error::{Seq2TreeError, Seq2TreeResult};
use crate::gradient_clip::clip_by_global_norm;
use crate::graph::{Graph, NodeId};
use crate::optimizer::Optimizer;
use crate::parameters::ParameterStore;
use log::debug;
use ndarray::ArrayD;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;

/// 更新操作：对 `loss` 求梯度，裁剪到 `max_gradient_norm` 后应用
#[derive(Debug, Clone, Copy)]
pub struct UpdateOp {
    pub loss: NodeId,
    pub max_gradient_norm: f32,
}

/// 要取回的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetch {
    /// 图中某个节点的值
    Tensor(NodeId),
    /// 执行第 i 个更新操作
    Update(usize),
    /// 第 i 个更新操作裁剪前的梯度范数
    GradientNorm(usize),
}

/// 取回的结果，与 [`Fetch`] 一一对应
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    Tensor(Value),
    Updated,
    Norm(f32),
}

impl Fetched {
    pub fn into_float(self) -> Option<ArrayD<f32>> {
        match self {
            Fetched::Tensor(Value::Float(a)) => Some(a),
            _ => None,
        }
    }

    pub fn norm(&self) -> Option<f32> {
        match self {
            Fetched::Norm(n) => Some(*n),
            _ => None,
        }
    }
}

pub struct Session {
    params: ParameterStore,
    optimizer: Option<Box<dyn Optimizer>>,
    rng: StdRng,
}

impl Session {
    /// `optimizer` 为 `None` 时会话只能做前向计算
    pub fn new(params: ParameterStore, optimizer: Option<Box<dyn Optimizer>>, seed: u64) -> Self {
        Self {
            params,
            optimizer,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn params(&self) -> &ParameterStore {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ParameterStore {
        &mut self.params
    }

    pub fn optimizer(&self) -> Option<&dyn Optimizer> {
        self.optimizer.as_deref()
    }

    pub fn optimizer_mut(&mut self) -> Option<&mut (dyn Optimizer + 'static)> {
        self.optimizer.as_deref_mut()
    }

    /// 绑定输入并取回 `fetches`
    pub fn run(
        &mut self,
        graph: &Graph,
        updates: &[UpdateOp],
        feed: &Feed,
        fetches: &[Fetch],
    ) -> Seq2TreeResult<Vec<Fetched>> {
        let mut targets = Vec::new();
        let mut wanted_updates: Vec<usize> = Vec::new();
        for fetch in fetches {
            match *fetch {
                Fetch::Tensor(id) => targets.push(id),
                Fetch::Update(i) | Fetch::GradientNorm(i) => {
                    let update = updates
                        .get(i)
                        .ok_or_else(|| Seq2TreeError::shape("Session::run", format!("no update op {i}")))?;
                    if !wanted_updates.contains(&i) {
                        wanted_updates.push(i);
                    }
                    targets.push(update.loss);
                }
            }
        }

        let eval = forward(graph, &self.params, feed, &targets, &mut self.rng)?;

        let mut norms: HashMap<usize, f32> = HashMap::new();
        for &i in &wanted_updates {
            let update = updates[i];
            let mut grads = backward(graph, &eval, update.loss)?;
            let norm = clip_by_global_norm(&mut grads, update.max_gradient_norm);
            debug!("update {}: gradient norm {:.4}", i, norm);
            norms.insert(i, norm);

            if fetches.contains(&Fetch::Update(i)) {
                let optimizer = self.optimizer.as_mut().ok_or(Seq2TreeError::NotTrainable)?;
                optimizer.apply(&mut self.params, &grads);
            }
        }

        fetches
            .iter()
            .map(|fetch| match *fetch {
                Fetch::Tensor(id) => eval
                    .value(id)
                    .cloned()
                    .map(Fetched::Tensor)
                    .ok_or_else(|| Seq2TreeError::shape("Session::run", format!("node {} was not evaluated", id.index()))),
                Fetch::Update(_) => Ok(Fetched::Updated),
                Fetch::GradientNorm(i) => Ok(Fetched::Norm(norms[&i])),
            })
            .collect()
    }
}
