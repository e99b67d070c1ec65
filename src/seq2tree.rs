//! Seq2Tree 模型
//!
//! 构建阶段为每个 bucket 建一张计算图（或在没有 bucket 时建一张最大长度的图），
//! 所有图引用同一张共享参数表。运行阶段每次 `step` 喂入一批格式化好的数据，
//! 训练时取回 (梯度范数, 损失)，推理时取回 (损失, 每一步的 logits)。

use crate::attention::attention_states;
use crate::autograd::Feed;
use crate::config::{Bucket, HyperParams};
use crate::dataset::{BatchFormatter, FormattedBatch};
use crate::decoder::{CopySignals, Decoder, DecoderInputs, DecoderKind};
use crate::embedding::SharedParameters;
use crate::encoder::{Encoder, EncoderKind};
use crate::error::{Seq2TreeError, Seq2TreeResult};
use crate::graph::{Graph, NodeId};
use crate::loss::{sequence_loss, SoftmaxLoss};
use crate::optimizer::OptimizerKind;
use crate::parameters::{ParameterSnapshot, ParameterStore};
use crate::rnn::CellKind;
use crate::session::{Fetch, Fetched, Session, UpdateOp};
use crate::tensor::TensorExt;
use log::{debug, info};
use ndarray::{Array1, Array2};

/// 一个 bucket 的输入槽
#[derive(Debug, Clone)]
struct BucketSlots {
    encoder: Vec<NodeId>,
    /// 比目标长度多一个，最后一个只作为移位后的目标
    decoder: Vec<NodeId>,
    weights: Vec<NodeId>,
    copy: Option<CopySignals>,
}

/// 一个 bucket 的计算图
#[derive(Debug)]
pub struct BucketGraph {
    pub bucket: Bucket,
    graph: Graph,
    slots: BucketSlots,
    /// 每一步投影后的 logits [batch, target_vocab]
    outputs: Vec<NodeId>,
    /// 标量损失
    loss: NodeId,
    /// 只读模型为空
    updates: Vec<UpdateOp>,
}

impl BucketGraph {
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }
}

/// `step` 的结果
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// 训练时裁剪前的全局梯度范数
    pub gradient_norm: Option<f32>,
    pub loss: f32,
    /// 推理时每一步的 logits
    pub outputs: Option<Vec<Array2<f32>>>,
}

/// 构建阶段的上下文
struct Assembly<'a> {
    hparams: &'a HyperParams,
    store: &'a mut ParameterStore,
    shared: &'a mut SharedParameters,
    encoder: &'a dyn Encoder,
    decoder: &'a dyn Decoder,
    softmax_loss: SoftmaxLoss,
    forward_only: bool,
}

impl Assembly<'_> {
    fn define_bucket(&mut self, bucket: Bucket) -> Seq2TreeResult<BucketGraph> {
        let mut g = Graph::new();
        let Bucket {
            source_len,
            target_len,
        } = bucket;

        let encoder = (0..source_len).map(|i| g.id_slot(format!("encoder{i}"))).collect();
        let decoder = (0..=target_len).map(|i| g.id_slot(format!("decoder{i}"))).collect();
        let weights = (0..target_len).map(|i| g.float_slot(format!("weight{i}"))).collect();
        let copy = self.hparams.use_copy.then(|| CopySignals {
            original_source: (0..source_len).map(|i| g.id_slot(format!("original_encoder{i}"))).collect(),
            copy_masks: (0..source_len).map(|i| g.id_slot(format!("copy_mask{i}"))).collect(),
        });
        let slots = BucketSlots {
            encoder,
            decoder,
            weights,
            copy,
        };

        let (outputs, loss) = self.encode_decode(&mut g, &slots)?;
        let updates = if self.forward_only {
            Vec::new()
        } else {
            vec![UpdateOp {
                loss,
                max_gradient_norm: self.hparams.max_gradient_norm,
            }]
        };
        debug!("bucket ({}, {}) graph has {} nodes", source_len, target_len, g.len());

        Ok(BucketGraph {
            bucket,
            graph: g,
            slots,
            outputs,
            loss,
            updates,
        })
    }

    /// 编码、解码、投影并计算损失，返回 (每步 logits, 标量损失)
    fn encode_decode(&mut self, g: &mut Graph, slots: &BucketSlots) -> Seq2TreeResult<(Vec<NodeId>, NodeId)> {
        let training = !self.forward_only;
        let source_table = self.shared.source_embeddings(self.store)?;
        let target_table = self.shared.target_embeddings(self.store)?;
        let projection = self.shared.output_projection(self.store)?;

        let table = g.param(source_table);
        let embedded: Vec<NodeId> = slots.encoder.iter().map(|&ids| g.gather(table, ids)).collect();
        let encoded = self.encoder.encode(g, &embedded, training)?;

        let attention = if self.hparams.use_attention {
            Some(attention_states(g, &encoded.outputs))
        } else {
            None
        };

        let target_len = slots.weights.len();
        let decoded = self.decoder.decode(
            g,
            DecoderInputs {
                initial_state: encoded.state,
                inputs: &slots.decoder[..target_len],
                embeddings: target_table,
                attention_states: attention,
                copy: slots.copy.as_ref(),
                feed_previous: self.forward_only,
                training,
            },
        )?;

        let w = g.param(projection.weight);
        let b = g.param(projection.bias);
        let mut logits = Vec::with_capacity(target_len);
        let mut crossents = Vec::with_capacity(target_len);
        for (t, &output) in decoded.outputs.iter().enumerate() {
            let h = g.matmul(output, w);
            let step_logits = g.add_bias(h, b);
            // 目标是右移一位的解码器输入
            let target = slots.decoder[t + 1];
            crossents.push(self.softmax_loss.crossent(g, output, step_logits, target, projection));
            logits.push(step_logits);
        }

        let per_example = sequence_loss(g, &crossents, &slots.weights);
        let loss = g.mean(per_example);
        Ok((logits, loss))
    }
}

/// Seq2Tree 模型
pub struct Seq2TreeModel {
    hparams: HyperParams,
    buckets: Vec<Bucket>,
    forward_only: bool,
    softmax_loss: SoftmaxLoss,
    shared: SharedParameters,
    bucket_graphs: Vec<BucketGraph>,
    /// 没有 bucket 时按最大长度建的图
    full_graph: Option<BucketGraph>,
    session: Session,
    learning_rate: f32,
    global_epoch: usize,
}

impl Seq2TreeModel {
    /// 构建模型
    ///
    /// 编码器、解码器和单元类型在这里解析；训练模型还会解析优化器。
    /// 未识别的取值是构建期错误。
    pub fn new(hparams: HyperParams, buckets: &[Bucket], forward_only: bool) -> Seq2TreeResult<Self> {
        hparams.validate()?;
        if !buckets.is_empty() {
            hparams.validate_buckets(buckets)?;
        }

        let cell = CellKind::parse(&hparams.rnn_cell)?;
        let encoder_kind = EncoderKind::parse(&hparams.encoder_topology)?;
        let decoder_kind = DecoderKind::parse(&hparams.decoder_topology)?;
        let optimizer_kind = if forward_only {
            None
        } else {
            Some(OptimizerKind::parse(&hparams.optimizer)?)
        };
        let softmax_loss = SoftmaxLoss::select(hparams.num_samples, hparams.target_vocab_size);

        let mut store = ParameterStore::new(hparams.seed);
        let mut shared = SharedParameters::new(hparams.source_vocab_size, hparams.target_vocab_size, hparams.dim);
        let projection = shared.output_projection(&mut store)?;
        let keep_probs = (hparams.input_keep_prob, hparams.output_keep_prob);

        let encoder = encoder_kind.build(&mut store, cell, hparams.dim, hparams.num_layers, keep_probs)?;
        let decoder = decoder_kind.build(
            &mut store,
            cell,
            hparams.dim,
            hparams.num_layers,
            keep_probs,
            hparams.use_attention,
            hparams.use_copy,
            projection,
        )?;

        let mut assembly = Assembly {
            hparams: &hparams,
            store: &mut store,
            shared: &mut shared,
            encoder: encoder.as_ref(),
            decoder: decoder.as_ref(),
            softmax_loss,
            forward_only,
        };

        let mut bucket_graphs = Vec::with_capacity(buckets.len());
        let full_graph = if buckets.is_empty() {
            info!(
                "creating unbucketed graph ({}, {})...",
                hparams.max_source_length, hparams.max_target_length
            );
            Some(assembly.define_bucket(Bucket::new(hparams.max_source_length, hparams.max_target_length))?)
        } else {
            for (bucket_id, &bucket) in buckets.iter().enumerate() {
                info!("creating bucket {} ({}, {})...", bucket_id, bucket.source_len, bucket.target_len);
                bucket_graphs.push(assembly.define_bucket(bucket)?);
            }
            None
        };

        let optimizer = optimizer_kind.map(|kind| kind.build(hparams.learning_rate));
        info!(
            "model built: {} parameters in {} tensors, {} softmax",
            store.param_count(),
            store.len(),
            if softmax_loss.is_sampled() { "sampled" } else { "full" }
        );
        let session = Session::new(store, optimizer, hparams.seed);

        Ok(Self {
            learning_rate: hparams.learning_rate,
            hparams,
            buckets: buckets.to_vec(),
            forward_only,
            softmax_loss,
            shared,
            bucket_graphs,
            full_graph,
            session,
            global_epoch: 0,
        })
    }

    /// 运行一步
    ///
    /// `bucket_id` 为 `None` 时输入长度必须等于配置的最大长度（不满足时 panic）；
    /// 给定 bucket 时长度不符返回 [`Seq2TreeError::LengthMismatch`]。
    pub fn step(
        &mut self,
        batch: &FormattedBatch,
        bucket_id: Option<usize>,
        forward_only: bool,
    ) -> Seq2TreeResult<StepOutcome> {
        if !forward_only && self.forward_only {
            return Err(Seq2TreeError::NotTrainable);
        }

        let bucket_graph = match bucket_id {
            None => {
                assert_eq!(
                    batch.encoder_inputs.len(),
                    self.hparams.max_source_length,
                    "encoder input length must equal max_source_length"
                );
                assert_eq!(
                    batch.decoder_inputs.len(),
                    self.hparams.max_target_length,
                    "decoder input length must equal max_target_length"
                );
                assert_eq!(
                    batch.target_weights.len(),
                    self.hparams.max_target_length,
                    "target weight length must equal max_target_length"
                );
                self.full_graph.as_ref().ok_or_else(|| {
                    Seq2TreeError::InvalidConfig("model was built with buckets, a bucket id is required".to_string())
                })?
            }
            Some(id) => {
                let bucket_graph = self.bucket_graphs.get(id).ok_or(Seq2TreeError::UnknownBucket {
                    bucket_id: id,
                    num_buckets: self.buckets.len(),
                })?;
                let Bucket {
                    source_len,
                    target_len,
                } = bucket_graph.bucket;
                check_length("Encoder", batch.encoder_inputs.len(), source_len)?;
                check_length("Decoder", batch.decoder_inputs.len(), target_len)?;
                check_length("Weights", batch.target_weights.len(), target_len)?;
                bucket_graph
            }
        };

        let feed = bind_inputs(bucket_graph, batch, self.hparams.use_copy)?;

        let fetches: Vec<Fetch> = if forward_only {
            std::iter::once(Fetch::Tensor(bucket_graph.loss))
                .chain(bucket_graph.outputs.iter().map(|&o| Fetch::Tensor(o)))
                .collect()
        } else {
            vec![Fetch::Update(0), Fetch::GradientNorm(0), Fetch::Tensor(bucket_graph.loss)]
        };

        let mut results = self
            .session
            .run(&bucket_graph.graph, &bucket_graph.updates, &feed, &fetches)?
            .into_iter();

        if forward_only {
            let loss = scalar(results.next())?;
            let outputs = results
                .map(|fetched| {
                    fetched
                        .into_float()
                        .ok_or_else(|| Seq2TreeError::shape("step", "logits fetch returned no tensor"))
                        .and_then(|a| a.as_matrix("step").map(|m| m.to_owned()))
                })
                .collect::<Seq2TreeResult<Vec<_>>>()?;
            debug!("forward step: loss {:.4}", loss);
            Ok(StepOutcome {
                gradient_norm: None,
                loss,
                outputs: Some(outputs),
            })
        } else {
            let _updated = results.next();
            let gradient_norm = results.next().and_then(|f| f.norm());
            let loss = scalar(results.next())?;
            debug!("training step: loss {:.4}, gradient norm {:?}", loss, gradient_norm);
            Ok(StepOutcome {
                gradient_norm,
                loss,
                outputs: None,
            })
        }
    }

    /// 与模型配置一致的批数据格式化器
    pub fn batch_formatter(&self) -> BatchFormatter {
        BatchFormatter::new(&self.hparams, &self.buckets)
    }

    pub fn hparams(&self) -> &HyperParams {
        &self.hparams
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn bucket_graph(&self, bucket_id: usize) -> Option<&BucketGraph> {
        self.bucket_graphs.get(bucket_id)
    }

    pub fn is_trainable(&self) -> bool {
        !self.forward_only
    }

    pub fn use_sampled_softmax(&self) -> bool {
        self.softmax_loss.is_sampled()
    }

    pub fn use_attention(&self) -> bool {
        self.hparams.use_attention
    }

    pub fn use_copy(&self) -> bool {
        self.hparams.use_copy
    }

    pub fn source_vocab_size(&self) -> usize {
        self.hparams.source_vocab_size
    }

    pub fn target_vocab_size(&self) -> usize {
        self.hparams.target_vocab_size
    }

    pub fn dim(&self) -> usize {
        self.hparams.dim
    }

    pub fn num_layers(&self) -> usize {
        self.hparams.num_layers
    }

    pub fn batch_size(&self) -> usize {
        self.hparams.batch_size
    }

    pub fn max_source_length(&self) -> usize {
        self.hparams.max_source_length
    }

    pub fn max_target_length(&self) -> usize {
        self.hparams.max_target_length
    }

    pub fn shared_parameters(&self) -> &SharedParameters {
        &self.shared
    }

    /// 全部可训练参数（供外部保存检查点）
    pub fn params(&self) -> &ParameterStore {
        self.session.params()
    }

    pub fn snapshot(&self) -> ParameterSnapshot {
        self.session.params().snapshot()
    }

    pub fn restore(&mut self, snapshot: &ParameterSnapshot) -> Seq2TreeResult<()> {
        self.session.params_mut().restore(snapshot)
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
        if let Some(optimizer) = self.session.optimizer_mut() {
            optimizer.set_lr(lr);
        }
    }

    /// 学习率乘以 `learning_rate_decay_factor`
    pub fn decay_learning_rate(&mut self) -> f32 {
        let lr = self.learning_rate * self.hparams.learning_rate_decay_factor;
        info!("learning rate decayed: {} -> {}", self.learning_rate, lr);
        self.set_learning_rate(lr);
        lr
    }

    pub fn global_epoch(&self) -> usize {
        self.global_epoch
    }

    pub fn increment_global_epoch(&mut self) -> usize {
        self.global_epoch += 1;
        self.global_epoch
    }
}

fn check_length(what: &'static str, actual: usize, expected: usize) -> Seq2TreeResult<()> {
    if actual != expected {
        return Err(Seq2TreeError::LengthMismatch { what, actual, expected });
    }
    Ok(())
}

fn scalar(fetched: Option<Fetched>) -> Seq2TreeResult<f32> {
    fetched
        .and_then(Fetched::into_float)
        .and_then(|a| a.iter().next().copied())
        .ok_or_else(|| Seq2TreeError::shape("step", "loss fetch returned no value"))
}

fn bind_ids(feed: &mut Feed, slots: &[NodeId], values: &[Array1<usize>]) {
    for (&slot, value) in slots.iter().zip(values) {
        feed.insert(slot, value.clone());
    }
}

/// 绑定全部输入槽，包括超出目标长度一位的全零解码器槽
fn bind_inputs(bucket_graph: &BucketGraph, batch: &FormattedBatch, use_copy: bool) -> Seq2TreeResult<Feed> {
    let slots = &bucket_graph.slots;
    let mut feed = Feed::new();

    bind_ids(&mut feed, &slots.encoder, &batch.encoder_inputs);
    bind_ids(&mut feed, &slots.decoder, &batch.decoder_inputs);
    for (&slot, weight) in slots.weights.iter().zip(&batch.target_weights) {
        feed.insert(slot, weight.clone());
    }

    if use_copy {
        let copy = batch.copy.as_ref().ok_or(Seq2TreeError::MissingCopyInputs("batch"))?;
        if let Some(signals) = &slots.copy {
            bind_ids(&mut feed, &signals.original_source, &copy.original_encoder_inputs);
            bind_ids(&mut feed, &signals.copy_masks, &copy.copy_masks);
        }
    }

    let beyond_last = slots.decoder[bucket_graph.bucket.target_len];
    feed.insert(beyond_last, Array1::<usize>::zeros(batch.batch_size()));
    Ok(feed)
}
