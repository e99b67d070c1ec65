//! 错误类型
//!
//! 构建期错误（配置、拓扑选择）与运行期错误（形状、喂入数据）共用一个枚举。

use thiserror::Error;

/// seq2tree 的错误类型
#[derive(Debug, Error)]
pub enum Seq2TreeError {
    /// 未知的编码器拓扑
    #[error("Unrecognized encoder type: '{0}'")]
    UnknownEncoder(String),

    /// 未知的解码器拓扑
    #[error("Unrecognized decoder type: '{0}'")]
    UnknownDecoder(String),

    /// 未知的优化器
    #[error("Unrecognized optimizer type: '{0}'")]
    UnknownOptimizer(String),

    /// 未知的 RNN 单元
    #[error("Unrecognized rnn cell type: '{0}'")]
    UnknownCell(String),

    /// 配置值非法
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// 输入长度与 bucket 不一致
    #[error("{what} length must be equal to the one in bucket, {actual} != {expected}.")]
    LengthMismatch {
        what: &'static str,
        actual: usize,
        expected: usize,
    },

    /// bucket 编号越界
    #[error("Bucket id {bucket_id} out of range ({num_buckets} buckets)")]
    UnknownBucket { bucket_id: usize, num_buckets: usize },

    /// 模型以 forward-only 方式构建，没有更新操作
    #[error("Model was built forward-only, no update operations exist for a training step")]
    NotTrainable,

    /// copy 模式下缺少原始序列或 copy mask
    #[error("Copy mode is enabled but {0} is missing")]
    MissingCopyInputs(&'static str),

    /// bucket 中没有样本
    #[error("Bucket {0} has no examples to sample from")]
    EmptyBucket(usize),

    /// 复用参数时形状不一致
    #[error("Parameter '{name}' already exists with shape {existing:?}, requested {requested:?}")]
    ParameterShape {
        name: String,
        existing: Vec<usize>,
        requested: Vec<usize>,
    },

    /// 快照中的参数不存在
    #[error("Unknown parameter '{0}'")]
    UnknownParameter(String),

    /// 图执行时输入槽未被喂入
    #[error("No value fed for input slot '{0}'")]
    MissingFeed(String),

    /// 图执行时形状不匹配
    #[error("Shape error in {op}: {detail}")]
    Shape { op: &'static str, detail: String },

    /// 标签超出词表范围
    #[error("Label {label} is outside of the {num_classes}-class vocabulary")]
    LabelOutOfRange { label: usize, num_classes: usize },

    /// 输入 token id 超出嵌入表范围
    #[error("Token id {id} is outside of the {vocab_size}-entry embedding table")]
    IdOutOfRange { id: usize, vocab_size: usize },

    /// JSON 解析/序列化错误
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// 二进制快照错误
    #[error("Snapshot encoding error: {0}")]
    Bincode(#[from] bincode::Error),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// seq2tree 操作的结果类型
pub type Seq2TreeResult<T> = Result<T, Seq2TreeError>;

impl Seq2TreeError {
    pub(crate) fn shape(op: &'static str, detail: impl Into<String>) -> Self {
        Seq2TreeError::Shape {
            op,
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_mismatch_message() {
        let err = Seq2TreeError::LengthMismatch {
            what: "Encoder",
            actual: 3,
            expected: 4,
        };
        assert_eq!(
            err.to_string(),
            "Encoder length must be equal to the one in bucket, 3 != 4."
        );
    }

    #[test]
    fn test_json_error_conversion() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Seq2TreeError = parse.unwrap_err().into();
        assert!(matches!(err, Seq2TreeError::Json(_)));
    }
}
