//! 批数据格式化
//!
//! 把按样本存放的 id 序列整理成按时间步排列的批数据：每个时间步一个
//! 长度为 batch 的向量。编码器输入先补齐再反转，解码器输入只补齐。

use crate::config::{Bucket, HyperParams};
use crate::error::{Seq2TreeError, Seq2TreeResult};
use log::warn;
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// 保留 id
pub const PAD_ID: usize = 0;
/// 解码起始符
pub const GO_ID: usize = 1;
pub const EOS_ID: usize = 2;
pub const UNK_ID: usize = 3;
/// 子树结束标记
pub const NO_EXPAND_ID: usize = 4;

/// 拷贝机制需要的附加序列
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyAnnotation {
    /// 替换前的源序列
    pub original_source: Vec<usize>,
    /// 与源序列对齐，可拷贝的位置为 true
    pub copy_mask: Vec<bool>,
}

/// 一个训练样本
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    pub source: Vec<usize>,
    pub target: Vec<usize>,
    pub copy: Option<CopyAnnotation>,
}

impl Example {
    pub fn new(source: Vec<usize>, target: Vec<usize>) -> Self {
        Self {
            source,
            target,
            copy: None,
        }
    }

    pub fn with_copy(mut self, copy: CopyAnnotation) -> Self {
        self.copy = Some(copy);
        self
    }
}

/// 拷贝模式下的附加输入（按时间步排列）
#[derive(Debug, Clone, PartialEq)]
pub struct CopyInputs {
    /// 与编码器输入一样补齐并反转
    pub original_encoder_inputs: Vec<Array1<usize>>,
    /// 0/1，与编码器输入一样补齐并反转
    pub copy_masks: Vec<Array1<usize>>,
}

/// 按时间步排列的一批数据
#[derive(Debug, Clone, PartialEq)]
pub struct FormattedBatch {
    pub encoder_inputs: Vec<Array1<usize>>,
    pub decoder_inputs: Vec<Array1<usize>>,
    pub target_weights: Vec<Array1<f32>>,
    pub copy: Option<CopyInputs>,
}

impl FormattedBatch {
    pub fn batch_size(&self) -> usize {
        self.encoder_inputs
            .first()
            .or_else(|| self.decoder_inputs.first())
            .map_or(0, |v| v.len())
    }
}

/// 目标权重
///
/// 第 t 步的目标是 `decoder_inputs[t + 1]`；最后一步或目标为 `PAD_ID` 时权重为 0。
pub fn target_weights(decoder_inputs: &[Array1<usize>]) -> Vec<Array1<f32>> {
    let size = decoder_inputs.len();
    (0..size)
        .map(|t| {
            let batch = decoder_inputs[t].len();
            if t + 1 == size {
                return Array1::zeros(batch);
            }
            decoder_inputs[t + 1].mapv(|target| if target == PAD_ID { 0.0 } else { 1.0 })
        })
        .collect()
}

/// 右侧补 `pad` 到 `len`，过长时截断
fn pad_to(seq: &[usize], len: usize, pad: usize, what: &str) -> Vec<usize> {
    if seq.len() > len {
        warn!("{} of length {} truncated to {}", what, seq.len(), len);
    }
    let mut out: Vec<usize> = seq.iter().copied().take(len).collect();
    out.resize(len, pad);
    out
}

fn pad_reversed(seq: &[usize], len: usize, pad: usize, what: &str) -> Vec<usize> {
    let mut out = pad_to(seq, len, pad, what);
    out.reverse();
    out
}

/// 按样本的序列转为按时间步的向量
fn time_major(rows: &[Vec<usize>], len: usize) -> Vec<Array1<usize>> {
    (0..len)
        .map(|t| rows.iter().map(|row| row[t]).collect::<Array1<usize>>())
        .collect()
}

/// 批数据格式化器
///
/// 三种取数方式：单个样本、按 bucket 随机采样、整个 bucket。
#[derive(Debug)]
pub struct BatchFormatter {
    buckets: Vec<Bucket>,
    max_source_length: usize,
    max_target_length: usize,
    batch_size: usize,
    use_copy: bool,
    rng: StdRng,
}

impl BatchFormatter {
    pub fn new(hparams: &HyperParams, buckets: &[Bucket]) -> Self {
        Self {
            buckets: buckets.to_vec(),
            max_source_length: hparams.max_source_length,
            max_target_length: hparams.max_target_length,
            batch_size: hparams.batch_size,
            use_copy: hparams.use_copy,
            rng: StdRng::seed_from_u64(hparams.seed),
        }
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// bucket 的长度上限；未给 bucket 时使用配置的最大长度
    pub fn bounds(&self, bucket_id: Option<usize>) -> Seq2TreeResult<Bucket> {
        match bucket_id {
            Some(id) => self.buckets.get(id).copied().ok_or(Seq2TreeError::UnknownBucket {
                bucket_id: id,
                num_buckets: self.buckets.len(),
            }),
            None => Ok(Bucket::new(self.max_source_length, self.max_target_length)),
        }
    }

    /// 格式化单个样本（batch 大小为 1）
    pub fn format_example(&self, example: &Example, bucket_id: Option<usize>) -> Seq2TreeResult<FormattedBatch> {
        let bounds = self.bounds(bucket_id)?;
        self.assemble(&[example], bounds)
    }

    /// 从 bucket 中有放回地随机抽取 batch_size 个样本
    pub fn get_batch(&mut self, data: &[Vec<Example>], bucket_id: usize) -> Seq2TreeResult<FormattedBatch> {
        let bounds = self.bounds(Some(bucket_id))?;
        let pool = data.get(bucket_id).map(Vec::as_slice).unwrap_or_default();
        if pool.is_empty() {
            return Err(Seq2TreeError::EmptyBucket(bucket_id));
        }
        let picked: Vec<&Example> = (0..self.batch_size)
            .map(|_| &pool[self.rng.gen_range(0..pool.len())])
            .collect();
        self.assemble(&picked, bounds)
    }

    /// bucket 中的全部样本，按存放顺序
    pub fn get_bucket(&self, data: &[Vec<Example>], bucket_id: usize) -> Seq2TreeResult<FormattedBatch> {
        let bounds = self.bounds(Some(bucket_id))?;
        let pool = data.get(bucket_id).map(Vec::as_slice).unwrap_or_default();
        if pool.is_empty() {
            return Err(Seq2TreeError::EmptyBucket(bucket_id));
        }
        let all: Vec<&Example> = pool.iter().collect();
        self.assemble(&all, bounds)
    }

    fn assemble(&self, examples: &[&Example], bounds: Bucket) -> Seq2TreeResult<FormattedBatch> {
        let Bucket {
            source_len,
            target_len,
        } = bounds;

        let encoder_rows: Vec<Vec<usize>> = examples
            .iter()
            .map(|e| pad_reversed(&e.source, source_len, PAD_ID, "source"))
            .collect();
        let decoder_rows: Vec<Vec<usize>> = examples
            .iter()
            .map(|e| pad_to(&e.target, target_len, PAD_ID, "target"))
            .collect();

        let decoder_inputs = time_major(&decoder_rows, target_len);
        let target_weights = target_weights(&decoder_inputs);

        let copy = if self.use_copy {
            let mut original_encoder = Vec::with_capacity(examples.len());
            let mut masks = Vec::with_capacity(examples.len());
            for example in examples {
                let annotation = example
                    .copy
                    .as_ref()
                    .ok_or(Seq2TreeError::MissingCopyInputs("example"))?;
                original_encoder.push(pad_reversed(&annotation.original_source, source_len, PAD_ID, "original source"));
                let mask: Vec<usize> = annotation.copy_mask.iter().map(|&m| usize::from(m)).collect();
                masks.push(pad_reversed(&mask, source_len, 0, "copy mask"));
            }
            Some(CopyInputs {
                original_encoder_inputs: time_major(&original_encoder, source_len),
                copy_masks: time_major(&masks, source_len),
            })
        } else {
            None
        };

        Ok(FormattedBatch {
            encoder_inputs: time_major(&encoder_rows, source_len),
            decoder_inputs,
            target_weights,
            copy,
        })
    }
}
