//! 优化器
//!
//! 梯度下降（SGD）和自适应矩估计（Adam）。状态按参数名字保存，
//! 所以各个 bucket 的更新共享同一份动量。

use crate::error::{Seq2TreeError, Seq2TreeResult};
use crate::parameters::{ParamId, ParameterStore};
use log::info;
use ndarray::ArrayD;
use std::collections::HashMap;

/// 优化器 trait
pub trait Optimizer {
    /// 一次更新开始前调用（Adam 在这里推进时间步）
    fn begin_update(&mut self) {}

    /// 更新单个参数
    fn step(&mut self, param: &mut ArrayD<f32>, grad: &ArrayD<f32>, param_name: &str);

    /// 获取当前学习率
    fn lr(&self) -> f32;

    /// 设置学习率
    fn set_lr(&mut self, lr: f32);

    /// 优化器名称
    fn name(&self) -> &str;

    /// 把一组梯度应用到参数表
    fn apply(&mut self, params: &mut ParameterStore, grads: &HashMap<ParamId, ArrayD<f32>>) {
        self.begin_update();
        let mut ids: Vec<_> = grads.keys().copied().collect();
        ids.sort();
        for id in ids {
            let name = params.name(id).to_string();
            self.step(params.get_mut(id), &grads[&id], &name);
        }
    }
}

/// SGD（随机梯度下降）
///
/// ```text
/// param = param - lr * grad
/// ```
#[derive(Debug, Clone)]
pub struct SGD {
    lr: f32,
}

impl SGD {
    pub fn new(lr: f32) -> Self {
        Self { lr }
    }
}

impl Optimizer for SGD {
    fn step(&mut self, param: &mut ArrayD<f32>, grad: &ArrayD<f32>, _param_name: &str) {
        param.scaled_add(-self.lr, grad);
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn name(&self) -> &str {
        "SGD"
    }
}

/// Adam 优化器
///
/// ```text
/// m = β1 * m + (1 - β1) * grad
/// v = β2 * v + (1 - β2) * grad²
/// m_hat = m / (1 - β1^t)
/// v_hat = v / (1 - β2^t)
/// param = param - lr * m_hat / (√v_hat + ε)
/// ```
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f32,
    /// β1：一阶矩估计的指数衰减率
    beta1: f32,
    /// β2：二阶矩估计的指数衰减率
    beta2: f32,
    /// ε：数值稳定性常数
    eps: f32,
    m: HashMap<String, ArrayD<f32>>,
    v: HashMap<String, ArrayD<f32>>,
    /// 时间步（每次 apply 加一）
    step: usize,
}

impl Adam {
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            m: HashMap::new(),
            v: HashMap::new(),
            step: 0,
        }
    }

    pub fn timestep(&self) -> usize {
        self.step
    }
}

impl Optimizer for Adam {
    fn begin_update(&mut self) {
        self.step += 1;
    }

    fn step(&mut self, param: &mut ArrayD<f32>, grad: &ArrayD<f32>, param_name: &str) {
        // 未经 apply 直接调用时也至少从 t = 1 开始
        let t = self.step.max(1) as i32;
        let (beta1, beta2) = (self.beta1, self.beta2);

        let m = self
            .m
            .entry(param_name.to_string())
            .or_insert_with(|| ArrayD::zeros(param.raw_dim()));
        m.zip_mut_with(grad, |m, &g| *m = beta1 * *m + (1.0 - beta1) * g);

        let v = self
            .v
            .entry(param_name.to_string())
            .or_insert_with(|| ArrayD::zeros(param.raw_dim()));
        v.zip_mut_with(grad, |v, &g| *v = beta2 * *v + (1.0 - beta2) * g * g);

        // 偏差修正
        let m_scale = 1.0 / (1.0 - beta1.powi(t));
        let v_scale = 1.0 / (1.0 - beta2.powi(t));
        let (lr, eps) = (self.lr, self.eps);

        ndarray::Zip::from(param)
            .and(&*m)
            .and(&*v)
            .for_each(|p, &m, &v| *p -= lr * (m * m_scale) / ((v * v_scale).sqrt() + eps));
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn name(&self) -> &str {
        "Adam"
    }
}

/// 优化器选择
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

impl OptimizerKind {
    /// 解析配置中的优化器名字
    pub fn parse(name: &str) -> Seq2TreeResult<Self> {
        match name {
            "sgd" => Ok(OptimizerKind::Sgd),
            "adam" => Ok(OptimizerKind::Adam),
            other => Err(Seq2TreeError::UnknownOptimizer(other.to_string())),
        }
    }

    pub fn build(self, lr: f32) -> Box<dyn Optimizer> {
        info!("using {:?} optimizer (lr = {})", self, lr);
        match self {
            OptimizerKind::Sgd => Box::new(SGD::new(lr)),
            OptimizerKind::Adam => Box::new(Adam::new(lr)),
        }
    }
}
