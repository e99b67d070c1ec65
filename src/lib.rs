//! # Seq2Tree
//!
//! 基于 ndarray 从零实现的序列到树编码器-解码器，支持注意力、复制机制和 sampled softmax。
//!
//! ## 架构概览
//!
//! ```text
//! source ids → Embedding → Encoder (rnn / birnn) ─┐
//!                                                 │ state, attention states
//! target ids → Embedding → Tree Decoder ←─────────┘
//!     ├── vertical / horizontal cell（由上一个符号选择）
//!     ├── Luong Attention
//!     └── Copy Gate
//!          → Output Projection → Sequence Loss (full / sampled softmax)
//!          → Global Norm Clipping → Optimizer (sgd / adam)
//! ```
//!
//! 模型为每个 bucket 建一张计算图，所有图共享同一张参数表。

pub mod config;
pub mod error;
pub mod tensor;
pub mod parameters;
pub mod graph;
pub mod autograd;
pub mod session;
pub mod embedding;
pub mod layers;
pub mod rnn;
pub mod attention;
pub mod encoder;
pub mod decoder;
pub mod loss;
pub mod sampling;
pub mod gradient_clip;
pub mod optimizer;
pub mod dataset;
pub mod seq2tree;

pub use config::{Bucket, HyperParams};
pub use error::{Seq2TreeError, Seq2TreeResult};
pub use tensor::TensorExt;
pub use parameters::{Initializer, ParamId, ParameterSnapshot, ParameterStore};
pub use graph::{Graph, NodeId};
pub use autograd::{backward, forward, Feed, Value};
pub use session::{Fetch, Fetched, Session, UpdateOp};
pub use embedding::{OutputProjection, SharedParameters};
pub use layers::Linear;
pub use rnn::{CellKind, RecurrentCell, StackedCell};
pub use attention::{attention_states, LuongAttention};
pub use encoder::{BiRnnEncoder, Encoder, EncoderKind, EncoderOutput, RnnEncoder};
pub use decoder::{BasicTreeDecoder, CopySignals, Decoder, DecoderInputs, DecoderKind, DecoderOutput};
pub use loss::{sequence_loss, use_sampled_softmax, SoftmaxLoss};
pub use sampling::LogUniformSampler;
pub use gradient_clip::{clip_by_global_norm, global_norm};
pub use optimizer::{Adam, Optimizer, OptimizerKind, SGD};
pub use dataset::{BatchFormatter, CopyAnnotation, CopyInputs, Example, FormattedBatch, EOS_ID, GO_ID, NO_EXPAND_ID, PAD_ID, UNK_ID};
pub use seq2tree::{BucketGraph, Seq2TreeModel, StepOutcome};

/// 预设配置
pub mod configs {
    use super::{Bucket, HyperParams};

    /// 小型模型（用于快速测试）
    pub fn tiny() -> HyperParams {
        HyperParams {
            source_vocab_size: 64,
            target_vocab_size: 64,
            dim: 16,
            num_layers: 1,
            batch_size: 4,
            max_source_length: 10,
            max_target_length: 12,
            learning_rate: 0.01,
            ..HyperParams::default()
        }
    }

    /// 基础模型
    pub fn base() -> HyperParams {
        HyperParams {
            source_vocab_size: 5000,
            target_vocab_size: 5000,
            dim: 256,
            num_layers: 2,
            encoder_topology: "birnn".to_string(),
            use_copy: true,
            batch_size: 64,
            input_keep_prob: 0.8,
            output_keep_prob: 0.8,
            num_samples: 512,
            ..HyperParams::default()
        }
    }

    /// 与 `base()` 的最大长度配套的 bucket
    pub fn default_buckets() -> Vec<Bucket> {
        vec![Bucket::new(10, 20), Bucket::new(20, 40), Bucket::new(40, 60)]
    }
}
