//! 超参数配置
//!
//! 模型构建所需的全部超参数，支持从 JSON 读取。

use crate::error::{Seq2TreeError, Seq2TreeResult};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// 一个 bucket：(最大源长度, 最大目标长度)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub source_len: usize,
    pub target_len: usize,
}

impl Bucket {
    pub fn new(source_len: usize, target_len: usize) -> Self {
        Self {
            source_len,
            target_len,
        }
    }

    /// 序列是否能放进该 bucket
    pub fn fits(&self, source_len: usize, target_len: usize) -> bool {
        source_len <= self.source_len && target_len <= self.target_len
    }
}

impl From<(usize, usize)> for Bucket {
    fn from((source_len, target_len): (usize, usize)) -> Self {
        Self::new(source_len, target_len)
    }
}

/// 模型超参数
///
/// 拓扑、单元和优化器以字符串给出，在模型构建时解析；
/// 未识别的取值是构建期错误。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperParams {
    /// 源词表大小
    pub source_vocab_size: usize,
    /// 目标词表大小
    pub target_vocab_size: usize,
    /// 隐藏层维度（同时是嵌入维度）
    pub dim: usize,
    /// RNN 层数
    pub num_layers: usize,
    /// "gru" 或 "lstm"
    pub rnn_cell: String,
    /// "rnn" 或 "birnn"
    pub encoder_topology: String,
    /// "basic_tree"
    pub decoder_topology: String,
    /// "sgd" 或 "adam"
    pub optimizer: String,
    pub use_attention: bool,
    pub use_copy: bool,
    pub batch_size: usize,
    /// 输入 dropout 保留概率（仅训练时生效）
    pub input_keep_prob: f32,
    /// 输出 dropout 保留概率（仅训练时生效）
    pub output_keep_prob: f32,
    /// 全局梯度范数上限
    pub max_gradient_norm: f32,
    /// sampled softmax 的采样数，0 表示使用完整 softmax
    pub num_samples: usize,
    pub max_source_length: usize,
    pub max_target_length: usize,
    pub learning_rate: f32,
    pub learning_rate_decay_factor: f32,
    /// 参数初始化、dropout 和采样的随机种子
    pub seed: u64,
}

impl Default for HyperParams {
    fn default() -> Self {
        Self {
            source_vocab_size: 1000,
            target_vocab_size: 1000,
            dim: 128,
            num_layers: 1,
            rnn_cell: "gru".to_string(),
            encoder_topology: "rnn".to_string(),
            decoder_topology: "basic_tree".to_string(),
            optimizer: "adam".to_string(),
            use_attention: true,
            use_copy: false,
            batch_size: 32,
            input_keep_prob: 1.0,
            output_keep_prob: 1.0,
            max_gradient_norm: 5.0,
            num_samples: 0,
            max_source_length: 40,
            max_target_length: 60,
            learning_rate: 0.001,
            learning_rate_decay_factor: 0.95,
            seed: 42,
        }
    }
}

impl HyperParams {
    /// 从 JSON 字符串读取
    pub fn from_json_str(json: &str) -> Seq2TreeResult<Self> {
        let params: HyperParams = serde_json::from_str(json)?;
        Ok(params)
    }

    /// 从 JSON 文件读取
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Seq2TreeResult<Self> {
        let reader = BufReader::new(File::open(path)?);
        let params: HyperParams = serde_json::from_reader(reader)?;
        Ok(params)
    }

    /// 序列化为 JSON
    pub fn to_json(&self) -> Seq2TreeResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// 检查数值型超参数
    pub fn validate(&self) -> Seq2TreeResult<()> {
        let sizes = [
            ("source_vocab_size", self.source_vocab_size),
            ("target_vocab_size", self.target_vocab_size),
            ("dim", self.dim),
            ("num_layers", self.num_layers),
            ("batch_size", self.batch_size),
            ("max_source_length", self.max_source_length),
            ("max_target_length", self.max_target_length),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(Seq2TreeError::InvalidConfig(format!("{name} must be positive")));
            }
        }

        for (name, p) in [
            ("input_keep_prob", self.input_keep_prob),
            ("output_keep_prob", self.output_keep_prob),
        ] {
            if !(p > 0.0 && p <= 1.0) {
                return Err(Seq2TreeError::InvalidConfig(format!(
                    "{name} must be in (0, 1], got {p}"
                )));
            }
        }

        if !(self.max_gradient_norm > 0.0) {
            return Err(Seq2TreeError::InvalidConfig(
                "max_gradient_norm must be positive".to_string(),
            ));
        }
        if !(self.learning_rate > 0.0) {
            return Err(Seq2TreeError::InvalidConfig(
                "learning_rate must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// 检查 bucket 列表：非空、两维均升序、不超过最大长度
    pub fn validate_buckets(&self, buckets: &[Bucket]) -> Seq2TreeResult<()> {
        if buckets.is_empty() {
            return Err(Seq2TreeError::InvalidConfig("bucket list is empty".to_string()));
        }
        for pair in buckets.windows(2) {
            if pair[1].source_len < pair[0].source_len || pair[1].target_len < pair[0].target_len {
                return Err(Seq2TreeError::InvalidConfig(format!(
                    "buckets must be sorted ascending, {:?} follows {:?}",
                    pair[1], pair[0]
                )));
            }
        }
        for bucket in buckets {
            if bucket.source_len == 0 || bucket.target_len == 0 {
                return Err(Seq2TreeError::InvalidConfig(format!("empty bucket {bucket:?}")));
            }
            if bucket.source_len > self.max_source_length || bucket.target_len > self.max_target_length {
                return Err(Seq2TreeError::InvalidConfig(format!(
                    "bucket {:?} exceeds maximum lengths ({}, {})",
                    bucket, self.max_source_length, self.max_target_length
                )));
            }
        }
        Ok(())
    }
}
