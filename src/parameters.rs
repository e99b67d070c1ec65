//! 共享参数表
//!
//! 模型中的每个可训练参数只存一份，按名字索引。所有 bucket 的计算图
//! 都通过 [`ParamId`] 引用这里的同一份存储。

use crate::error::{Seq2TreeError, Seq2TreeResult};
use crate::tensor::TensorExt;
use log::debug;
use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 参数句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(pub(crate) usize);

impl ParamId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// 参数初始化方式
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Initializer {
    /// U(-limit, limit)
    Uniform(f32),
    /// Xavier 均匀初始化
    Xavier,
    /// 常数
    Constant(f32),
}

impl Initializer {
    fn init(&self, shape: &[usize], rng: &mut StdRng) -> ArrayD<f32> {
        match *self {
            Initializer::Uniform(limit) => ArrayD::random_uniform(shape, limit, rng),
            Initializer::Xavier => ArrayD::random_xavier(shape, rng),
            Initializer::Constant(c) => ArrayD::from_elem(IxDyn(shape), c),
        }
    }
}

/// 可训练参数
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub value: ArrayD<f32>,
}

/// 共享参数表
#[derive(Debug)]
pub struct ParameterStore {
    params: Vec<Parameter>,
    by_name: HashMap<String, ParamId>,
    rng: StdRng,
}

impl ParameterStore {
    pub fn new(seed: u64) -> Self {
        Self {
            params: Vec::new(),
            by_name: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// 名字是否已存在
    pub fn exists(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// 按名字查找
    pub fn find(&self, name: &str) -> Option<ParamId> {
        self.by_name.get(name).copied()
    }

    /// 获取或创建参数
    ///
    /// 名字已存在时直接复用（不重新初始化），形状必须一致。
    pub fn get_or_create(
        &mut self,
        name: &str,
        shape: &[usize],
        initializer: Initializer,
    ) -> Seq2TreeResult<ParamId> {
        if let Some(id) = self.find(name) {
            let existing = self.params[id.0].value.shape();
            if existing != shape {
                return Err(Seq2TreeError::ParameterShape {
                    name: name.to_string(),
                    existing: existing.to_vec(),
                    requested: shape.to_vec(),
                });
            }
            debug!("reusing parameter {} {:?}", name, shape);
            return Ok(id);
        }

        debug!("creating parameter {} {:?}", name, shape);
        let value = initializer.init(shape, &mut self.rng);
        let id = ParamId(self.params.len());
        self.params.push(Parameter {
            name: name.to_string(),
            value,
        });
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn get(&self, id: ParamId) -> &ArrayD<f32> {
        &self.params[id.0].value
    }

    pub fn get_mut(&mut self, id: ParamId) -> &mut ArrayD<f32> {
        &mut self.params[id.0].value
    }

    pub fn name(&self, id: ParamId) -> &str {
        &self.params[id.0].name
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// 所有可训练参数（按创建顺序）
    pub fn ids(&self) -> impl Iterator<Item = ParamId> + '_ {
        (0..self.params.len()).map(ParamId)
    }

    /// 参数总数
    pub fn param_count(&self) -> usize {
        self.params.iter().map(|p| p.value.len()).sum()
    }

    /// 导出全部参数的快照（供外部持久化使用）
    pub fn snapshot(&self) -> ParameterSnapshot {
        ParameterSnapshot {
            params: self
                .params
                .iter()
                .map(|p| NamedArray {
                    name: p.name.clone(),
                    array: SerializableArray::from_array(&p.value),
                })
                .collect(),
        }
    }

    /// 按名字载入快照
    ///
    /// 快照中的每个参数必须已经存在且形状一致。先检查全部条目，
    /// 任何一项不合法时参数表保持不变。
    pub fn restore(&mut self, snapshot: &ParameterSnapshot) -> Seq2TreeResult<()> {
        let mut staged = Vec::with_capacity(snapshot.params.len());
        for entry in &snapshot.params {
            let id = self
                .find(&entry.name)
                .ok_or_else(|| Seq2TreeError::UnknownParameter(entry.name.clone()))?;
            let value = entry.array.to_array()?;
            let existing = self.params[id.0].value.shape();
            if existing != value.shape() {
                return Err(Seq2TreeError::ParameterShape {
                    name: entry.name.clone(),
                    existing: existing.to_vec(),
                    requested: value.shape().to_vec(),
                });
            }
            staged.push((id, value));
        }

        for (id, value) in staged {
            self.params[id.0].value = value;
        }
        Ok(())
    }
}

/// 可序列化的 ArrayD 包装器
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializableArray {
    /// 数据（行优先）
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl SerializableArray {
    pub fn from_array(arr: &ArrayD<f32>) -> Self {
        Self {
            data: arr.iter().copied().collect(),
            shape: arr.shape().to_vec(),
        }
    }

    pub fn to_array(&self) -> Seq2TreeResult<ArrayD<f32>> {
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.data.clone()).map_err(|e| {
            Seq2TreeError::shape("snapshot", format!("shape {:?}: {}", self.shape, e))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedArray {
    pub name: String,
    pub array: SerializableArray,
}

/// 参数快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSnapshot {
    pub params: Vec<NamedArray>,
}

impl ParameterSnapshot {
    pub fn to_json(&self) -> Seq2TreeResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Seq2TreeResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// 二进制格式（更紧凑）
    pub fn to_bytes(&self) -> Seq2TreeResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Seq2TreeResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
