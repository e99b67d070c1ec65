//! 词嵌入表和输出投影
//!
//! 源端、目标端嵌入表和输出投影在所有 bucket 之间共享。第一次请求时创建，
//! 之后的请求返回同一份存储，不会重新初始化。

use crate::error::Seq2TreeResult;
use crate::parameters::{Initializer, ParamId, ParameterStore};

/// 嵌入表的初始化半宽：U(-√3, √3) 方差为 1
pub fn embedding_init_limit() -> f32 {
    3.0f32.sqrt()
}

pub const SOURCE_EMBEDDING: &str = "source_embeddings/embedding";
pub const TARGET_EMBEDDING: &str = "target_embeddings/embedding";
pub const PROJECTION_WEIGHT: &str = "output_projection/proj_w";
pub const PROJECTION_BIAS: &str = "output_projection/proj_b";

/// 输出投影 (W, b)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputProjection {
    /// [dim, target_vocab]
    pub weight: ParamId,
    /// [target_vocab]
    pub bias: ParamId,
}

/// 共享参数句柄
///
/// 句柄为 `None` 表示对应参数尚未创建。
#[derive(Debug, Clone, Default)]
pub struct SharedParameters {
    source_vocab_size: usize,
    target_vocab_size: usize,
    dim: usize,
    source_embeddings: Option<ParamId>,
    target_embeddings: Option<ParamId>,
    projection: Option<OutputProjection>,
}

impl SharedParameters {
    pub fn new(source_vocab_size: usize, target_vocab_size: usize, dim: usize) -> Self {
        Self {
            source_vocab_size,
            target_vocab_size,
            dim,
            ..Self::default()
        }
    }

    /// 源端嵌入表 [source_vocab, dim]
    pub fn source_embeddings(&mut self, store: &mut ParameterStore) -> Seq2TreeResult<ParamId> {
        if let Some(id) = self.source_embeddings {
            return Ok(id);
        }
        let id = store.get_or_create(
            SOURCE_EMBEDDING,
            &[self.source_vocab_size, self.dim],
            Initializer::Uniform(embedding_init_limit()),
        )?;
        self.source_embeddings = Some(id);
        Ok(id)
    }

    /// 目标端嵌入表 [target_vocab, dim]
    pub fn target_embeddings(&mut self, store: &mut ParameterStore) -> Seq2TreeResult<ParamId> {
        if let Some(id) = self.target_embeddings {
            return Ok(id);
        }
        let id = store.get_or_create(
            TARGET_EMBEDDING,
            &[self.target_vocab_size, self.dim],
            Initializer::Uniform(embedding_init_limit()),
        )?;
        self.target_embeddings = Some(id);
        Ok(id)
    }

    /// 输出投影；已存在时直接复用参数表中的同名参数
    pub fn output_projection(&mut self, store: &mut ParameterStore) -> Seq2TreeResult<OutputProjection> {
        if let Some(projection) = self.projection {
            return Ok(projection);
        }
        let weight = store.get_or_create(PROJECTION_WEIGHT, &[self.dim, self.target_vocab_size], Initializer::Xavier)?;
        let bias = store.get_or_create(PROJECTION_BIAS, &[self.target_vocab_size], Initializer::Constant(0.0))?;
        let projection = OutputProjection { weight, bias };
        self.projection = Some(projection);
        Ok(projection)
    }

    pub fn is_created(&self) -> bool {
        self.source_embeddings.is_some() && self.target_embeddings.is_some() && self.projection.is_some()
    }
}
