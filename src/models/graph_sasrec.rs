//! Self-attentive sequence model over fused graph embeddings.
//!
//! Input ids are embedded by fusing their graph embeddings and adding a
//! learned positional embedding. A [`SequenceEncoder`] supplied by the caller
//! turns the embeddings into hidden states, which are layer-normalized and
//! then either
//!
//! - trained against fused label embeddings with a binary cross-entropy loss
//!   on the masked positions, or
//! - used at the final position to score a candidate set.
use std::sync::Arc;

use ndarray::{aview1, Array2, ArrayView1, Axis};
use rand;
use rand::distributions::{Distribution, Normal};
use rand::{Rng, SeedableRng, XorShiftRng};
use serde_json;

use wyrm;
use wyrm::{Arr, HogwildParameter};

use super::fusion::{sigmoid, EmbeddingTables, FusionInputs, FusionParameters};
use super::head::PredictionHead;
use super::{ConfigError, HeadType, ImplicitUser, MergeType, ModelError};
use masking::{EvalExample, SpecialTokens, TrainExample};
use {ItemId, OnlineRankingModel, PredictionError};

const LOSS_EPSILON: f32 = 1e-24;
const LAYER_NORM_EPSILON: f32 = 1e-5;

fn embedding_init<T: Rng>(rows: usize, cols: usize, rng: &mut T) -> Arr {
    let normal = Normal::new(0.0, 1.0 / cols as f64);
    Arr::zeros((rows, cols)).map(|_| normal.sample(rng) as f32)
}

fn random_rng() -> XorShiftRng {
    XorShiftRng::from_seed(rand::thread_rng().gen())
}

fn dot(first: ArrayView1<f32>, second: ArrayView1<f32>) -> f32 {
    match (first.as_slice(), second.as_slice()) {
        (Some(first), Some(second)) => wyrm::simd_dot(first, second),
        _ => first.dot(&second),
    }
}

/// The transformer body, supplied by the caller.
pub trait SequenceEncoder {
    /// Map `max_len x hidden_dim` input embeddings to hidden states of the
    /// same shape. `attention_mask[(i, j)]` is true when position `i` may
    /// attend to position `j`.
    fn encode(&self, embeddings: &Arr, attention_mask: &Array2<bool>) -> Arr;
}

/// Encoder returning its input unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityEncoder;

impl SequenceEncoder for IdentityEncoder {
    fn encode(&self, embeddings: &Arr, _: &Array2<bool>) -> Arr {
        embeddings.clone()
    }
}

impl<'a, T: SequenceEncoder> SequenceEncoder for &'a T {
    fn encode(&self, embeddings: &Arr, attention_mask: &Array2<bool>) -> Arr {
        (**self).encode(embeddings, attention_mask)
    }
}

/// Causal attention mask over non-padding positions.
pub fn attention_mask(tokens: &[ItemId]) -> Array2<bool> {
    Array2::from_shape_fn((tokens.len(), tokens.len()), |(query, key)| {
        key <= query && tokens[key] > 0
    })
}

fn default_merge_type() -> MergeType {
    MergeType::Gate
}

fn default_head_type() -> HeadType {
    HeadType::Dot
}

fn default_embedding_dim() -> usize {
    64
}

fn default_dropout() -> f32 {
    0.0
}

/// Inverted dropout: zero each value with probability `rate` and scale the
/// survivors by `1 / (1 - rate)`.
fn dropout<R: Rng>(mut x: Arr, rate: f32, rng: &mut R) -> Arr {
    if rate <= 0.0 {
        return x;
    }

    let keep = 1.0 - rate;

    for value in x.iter_mut() {
        *value = if rng.gen::<f32>() < keep {
            *value / keep
        } else {
            0.0
        };
    }

    x
}

/// Hyperparameters describing the model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hyperparameters {
    num_items: usize,
    max_len: usize,
    #[serde(default = "default_embedding_dim")]
    embedding_dim: usize,
    #[serde(default)]
    attribute_dim: Option<usize>,
    #[serde(default = "default_merge_type")]
    merge_type: MergeType,
    #[serde(default = "default_head_type")]
    head_type: HeadType,
    #[serde(default = "default_dropout")]
    dropout: f32,
    #[serde(default = "random_rng")]
    rng: XorShiftRng,
}

impl Hyperparameters {
    /// Build new hyperparameters.
    pub fn new(num_items: usize, max_len: usize) -> Self {
        Hyperparameters {
            num_items: num_items,
            max_len: max_len,
            embedding_dim: default_embedding_dim(),
            attribute_dim: None,
            merge_type: default_merge_type(),
            head_type: default_head_type(),
            dropout: default_dropout(),
            rng: random_rng(),
        }
    }

    /// Read hyperparameters from a JSON run configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(ConfigError::Parse)
    }

    /// Set the width of the graph embeddings.
    pub fn embedding_dim(mut self, embedding_dim: usize) -> Self {
        self.embedding_dim = embedding_dim;
        self
    }

    /// Set the width of the raw attribute table. Defaults to three times the
    /// embedding width.
    pub fn attribute_dim(mut self, attribute_dim: usize) -> Self {
        self.attribute_dim = Some(attribute_dim);
        self
    }

    /// Set the merge strategy.
    pub fn merge_type(mut self, merge_type: MergeType) -> Self {
        self.merge_type = merge_type;
        self
    }

    /// Set the prediction head.
    pub fn head_type(mut self, head_type: HeadType) -> Self {
        self.head_type = head_type;
        self
    }

    /// Set the dropout rate applied to the input embeddings during
    /// training. Must lie in `[0, 1)`.
    pub fn dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Set the random number generator.
    pub fn rng(mut self, rng: XorShiftRng) -> Self {
        self.rng = rng;
        self
    }

    /// Set the random number generator from seed.
    pub fn from_seed(mut self, seed: [u8; 16]) -> Self {
        self.rng = XorShiftRng::from_seed(seed);
        self
    }

    /// Width of the hidden states.
    pub fn hidden_dim(&self) -> usize {
        self.merge_type.output_dim(self.embedding_dim)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("num_items", self.num_items),
            ("max_len", self.max_len),
            ("embedding_dim", self.embedding_dim),
            ("attribute_dim", self.attribute_dim.unwrap_or(1)),
        ];

        for &(name, value) in &positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    name: name,
                    reason: "must be positive".to_owned(),
                });
            }
        }

        if !(self.dropout >= 0.0 && self.dropout < 1.0) {
            return Err(ConfigError::InvalidValue {
                name: "dropout",
                reason: format!("{} is outside [0, 1)", self.dropout),
            });
        }

        Ok(())
    }

    /// Build the model on top of the given embedding tables.
    pub fn build(mut self, tables: EmbeddingTables) -> Result<GraphSequenceModel, ModelError> {
        self.validate()?;

        let special_tokens = SpecialTokens::new(self.num_items);
        let attribute_dim = self.attribute_dim.unwrap_or(3 * self.embedding_dim);
        let hidden_dim = self.hidden_dim();

        let fusion = FusionParameters::new(
            self.merge_type,
            self.embedding_dim,
            attribute_dim,
            &mut self.rng,
        );
        tables.validate(special_tokens.vocab_size(), &fusion)?;

        let positional = Arc::new(HogwildParameter::new(embedding_init(
            self.max_len,
            hidden_dim,
            &mut self.rng,
        )));
        let layer_norm = LayerNorm::new(hidden_dim);
        let head = PredictionHead::new(
            self.head_type,
            hidden_dim,
            special_tokens.vocab_size(),
            &mut self.rng,
        );

        debug!(
            "Built {} model: {} ids, hidden width {}",
            self.merge_type,
            special_tokens.vocab_size(),
            hidden_dim
        );

        Ok(GraphSequenceModel {
            hyper: self,
            special_tokens: special_tokens,
            tables: tables,
            fusion: fusion,
            positional: positional,
            layer_norm: layer_norm,
            head: head,
        })
    }
}

#[derive(Debug)]
struct LayerNorm {
    gain: Arc<HogwildParameter>,
    bias: Arc<HogwildParameter>,
}

impl Clone for LayerNorm {
    fn clone(&self) -> Self {
        LayerNorm {
            gain: Arc::new(self.gain.as_ref().clone()),
            bias: Arc::new(self.bias.as_ref().clone()),
        }
    }
}

impl LayerNorm {
    fn new(dim: usize) -> Self {
        LayerNorm {
            gain: Arc::new(HogwildParameter::new(Arr::ones((1, dim)))),
            bias: Arc::new(HogwildParameter::new(Arr::zeros((1, dim)))),
        }
    }

    fn forward(&self, mut x: Arr) -> Arr {
        let gain = self.gain.value().row(0);
        let bias = self.bias.value().row(0);

        for mut row in x.outer_iter_mut() {
            let n = row.len() as f32;
            let mean = row.scalar_sum() / n;
            let variance = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
            let inv_std = 1.0 / (variance + LAYER_NORM_EPSILON).sqrt();

            for (value, &g, &b) in izip!(row.iter_mut(), gain.iter(), bias.iter()) {
                *value = g * (*value - mean) * inv_std + b;
            }
        }

        x
    }

    fn parameters(&self) -> Vec<Arc<HogwildParameter>> {
        vec![self.gain.clone(), self.bias.clone()]
    }
}

/// Binary cross-entropy loss averaged over supervised positions.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Loss {
    /// Mean loss; `0.0` when nothing was supervised.
    pub value: f32,
    /// Number of supervised positions.
    pub count: usize,
}

impl Loss {
    /// Loss over no positions.
    pub fn empty() -> Self {
        Loss {
            value: 0.0,
            count: 0,
        }
    }

    /// Combine with another loss, weighting each by its count.
    pub fn merge(self, other: Loss) -> Loss {
        let count = self.count + other.count;

        if count == 0 {
            return Loss::empty();
        }

        Loss {
            value: (self.value * self.count as f32 + other.value * other.count as f32)
                / count as f32,
            count: count,
        }
    }
}

/// A batch passed to [`GraphSequenceModel::forward`].
#[derive(Debug)]
pub enum Batch<'a> {
    /// Training examples and one negative label per position of each.
    Train {
        /// The examples.
        examples: &'a [TrainExample],
        /// Negative ids aligned with each example's labels.
        negative_labels: &'a [Vec<ItemId>],
        /// Source of the input dropout masks.
        rng: &'a mut XorShiftRng,
    },
    /// Evaluation examples.
    Eval(&'a [EvalExample]),
}

/// Result of a forward pass.
#[derive(Clone, Debug)]
pub struct ModelOutput {
    /// Hidden states, one `max_len x hidden_dim` array per example.
    pub logits: Vec<Arr>,
    /// Batch loss when training.
    pub loss: Option<Loss>,
    /// Candidate scores per example when evaluating.
    pub scores: Option<Vec<Vec<f32>>>,
}

/// Sequence model over fused graph embeddings.
#[derive(Clone, Debug)]
pub struct GraphSequenceModel {
    hyper: Hyperparameters,
    special_tokens: SpecialTokens,
    tables: EmbeddingTables,
    fusion: FusionParameters,
    positional: Arc<HogwildParameter>,
    layer_norm: LayerNorm,
    head: PredictionHead,
}

impl GraphSequenceModel {
    /// The hyperparameters the model was built with.
    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyper
    }

    /// Padding and mask ids.
    pub fn special_tokens(&self) -> SpecialTokens {
        self.special_tokens
    }

    /// The fusion parameters.
    pub fn fusion(&self) -> &FusionParameters {
        &self.fusion
    }

    /// Width of the hidden states.
    pub fn hidden_dim(&self) -> usize {
        self.fusion.output_dim()
    }

    /// Prepare the embedding tables for one forward pass.
    pub fn fusion_inputs(&self) -> FusionInputs {
        self.fusion.prepare(&self.tables)
    }

    /// Fused embeddings of `tokens` plus positional embeddings.
    pub fn input_embeddings(&self, inputs: &FusionInputs, tokens: &[ItemId]) -> Result<Arr, ModelError> {
        if tokens.len() != self.hyper.max_len {
            return Err(ModelError::ShapeMismatch {
                name: "tokens",
                expected: self.hyper.max_len,
                actual: tokens.len(),
            });
        }

        Ok(inputs.embed(tokens, &self.fusion)? + self.positional.value())
    }

    /// Hidden states for one example of `max_len` tokens.
    pub fn hidden_states<E: SequenceEncoder>(
        &self,
        encoder: &E,
        inputs: &FusionInputs,
        tokens: &[ItemId],
    ) -> Result<Arr, ModelError> {
        let embeddings = self.input_embeddings(inputs, tokens)?;
        self.encode(encoder, embeddings, tokens)
    }

    fn encode<E: SequenceEncoder>(
        &self,
        encoder: &E,
        embeddings: Arr,
        tokens: &[ItemId],
    ) -> Result<Arr, ModelError> {
        let encoded = encoder.encode(&embeddings, &attention_mask(tokens));

        if encoded.dim() != embeddings.dim() {
            return Err(ModelError::ShapeMismatch {
                name: "encoder output",
                expected: embeddings.len(),
                actual: encoded.len(),
            });
        }

        Ok(self.layer_norm.forward(encoded))
    }

    /// Loss of one example.
    ///
    /// Only positions with a positive label contribute. At each of them the
    /// hidden state is scored against the fused embeddings of the label and
    /// of the negative label:
    /// ```text
    /// loss = -ln(sigmoid(h . pos)) - ln(1 - sigmoid(h . neg))
    /// ```
    pub fn loss(
        &self,
        inputs: &FusionInputs,
        hidden: &Arr,
        labels: &[ItemId],
        negative_labels: &[ItemId],
    ) -> Result<Loss, ModelError> {
        for &(name, len) in &[("labels", labels.len()), ("negative labels", negative_labels.len())] {
            if len != hidden.rows() {
                return Err(ModelError::ShapeMismatch {
                    name: name,
                    expected: hidden.rows(),
                    actual: len,
                });
            }
        }

        let valid: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|&(_, &label)| label > 0)
            .map(|(idx, _)| idx)
            .collect();

        if valid.is_empty() {
            return Ok(Loss::empty());
        }

        let positives: Vec<ItemId> = valid.iter().map(|&idx| labels[idx]).collect();
        let negatives: Vec<ItemId> = valid.iter().map(|&idx| negative_labels[idx]).collect();

        let positive_embeddings = inputs.embed(&positives, &self.fusion)?;
        let negative_embeddings = inputs.embed(&negatives, &self.fusion)?;
        let hidden = hidden.select(Axis(0), &valid);

        if positive_embeddings.cols() != hidden.cols() {
            return Err(ModelError::ShapeMismatch {
                name: "hidden state",
                expected: positive_embeddings.cols(),
                actual: hidden.cols(),
            });
        }

        let mut positive_logits = Arr::zeros((valid.len(), 1));
        let mut negative_logits = Arr::zeros((valid.len(), 1));

        for (row, state, positive, negative) in izip!(
            0..valid.len(),
            hidden.outer_iter(),
            positive_embeddings.outer_iter(),
            negative_embeddings.outer_iter()
        ) {
            positive_logits[(row, 0)] = dot(state, positive);
            negative_logits[(row, 0)] = dot(state, negative);
        }

        let positive_probs = sigmoid(positive_logits);
        let negative_probs = sigmoid(negative_logits);

        let total: f32 = positive_probs
            .iter()
            .zip(negative_probs.iter())
            .map(|(&pos, &neg)| -(pos + LOSS_EPSILON).ln() - (1.0 - neg + LOSS_EPSILON).ln())
            .sum();

        Ok(Loss {
            value: total / valid.len() as f32,
            count: valid.len(),
        })
    }

    /// Scores of `candidates` against the hidden state at the final position.
    pub fn scores(
        &self,
        inputs: &FusionInputs,
        hidden: &Arr,
        candidates: &[ItemId],
    ) -> Result<Vec<f32>, ModelError> {
        if hidden.rows() == 0 {
            return Err(ModelError::ShapeMismatch {
                name: "hidden states",
                expected: self.hyper.max_len,
                actual: 0,
            });
        }

        let last = hidden.row(hidden.rows() - 1);
        let embeddings = inputs.embed(candidates, &self.fusion)?;

        if embeddings.cols() != last.len() {
            return Err(ModelError::ShapeMismatch {
                name: "hidden state",
                expected: embeddings.cols(),
                actual: last.len(),
            });
        }

        Ok(embeddings
            .outer_iter()
            .map(|embedding| dot(last, embedding))
            .collect())
    }

    /// Scores of every id in the vocabulary at the final position, from the
    /// prediction head.
    pub fn vocabulary_scores<E: SequenceEncoder>(
        &self,
        encoder: &E,
        tokens: &[ItemId],
    ) -> Result<Vec<f32>, ModelError> {
        let inputs = self.fusion_inputs();
        let hidden = self.hidden_states(encoder, &inputs, tokens)?;
        let last = hidden.select(Axis(0), &[hidden.rows() - 1]);

        Ok(self.head
            .scores(last.view(), &inputs, &self.fusion)?
            .iter()
            .cloned()
            .collect())
    }

    /// Run a batch through the model.
    ///
    /// The attribute table is projected once and shared by every example in
    /// the batch. Training batches apply input dropout; evaluation batches
    /// are deterministic.
    pub fn forward<E: SequenceEncoder>(&self, encoder: &E, batch: Batch) -> Result<ModelOutput, ModelError> {
        let inputs = self.fusion_inputs();

        match batch {
            Batch::Train {
                examples,
                negative_labels,
                rng,
            } => {
                if examples.len() != negative_labels.len() {
                    return Err(ModelError::ShapeMismatch {
                        name: "negative labels",
                        expected: examples.len(),
                        actual: negative_labels.len(),
                    });
                }

                let mut logits = Vec::with_capacity(examples.len());
                let mut loss = Loss::empty();

                for (example, negatives) in examples.iter().zip(negative_labels.iter()) {
                    let embeddings = dropout(
                        self.input_embeddings(&inputs, &example.tokens)?,
                        self.hyper.dropout,
                        &mut *rng,
                    );
                    let hidden = self.encode(encoder, embeddings, &example.tokens)?;
                    loss = loss.merge(self.loss(&inputs, &hidden, &example.labels, negatives)?);
                    logits.push(hidden);
                }

                Ok(ModelOutput {
                    logits: logits,
                    loss: Some(loss),
                    scores: None,
                })
            }
            Batch::Eval(examples) => {
                let mut logits = Vec::with_capacity(examples.len());
                let mut scores = Vec::with_capacity(examples.len());

                for example in examples {
                    let hidden = self.hidden_states(encoder, &inputs, &example.tokens)?;
                    scores.push(self.scores(&inputs, &hidden, &example.candidates)?);
                    logits.push(hidden);
                }

                Ok(ModelOutput {
                    logits: logits,
                    loss: None,
                    scores: Some(scores),
                })
            }
        }
    }

    /// Every learnable parameter, for an external optimizer.
    pub fn parameters(&self) -> Vec<Arc<HogwildParameter>> {
        let mut parameters = self.fusion.parameters();
        parameters.push(self.positional.clone());
        parameters.extend(self.layer_norm.parameters());
        parameters.extend(self.head.parameters());
        parameters
    }

    /// Bind the model to an encoder for online ranking.
    pub fn with_encoder<'a, E: SequenceEncoder>(&'a self, encoder: &'a E) -> RankingModel<'a, E> {
        RankingModel {
            model: self,
            encoder: encoder,
        }
    }
}

/// A model bound to its encoder.
#[derive(Debug)]
pub struct RankingModel<'a, E: 'a> {
    model: &'a GraphSequenceModel,
    encoder: &'a E,
}

impl<'a, E: SequenceEncoder> OnlineRankingModel for RankingModel<'a, E> {
    type UserRepresentation = ImplicitUser;
    fn user_representation(
        &self,
        item_ids: &[ItemId],
    ) -> Result<Self::UserRepresentation, PredictionError> {
        let max_len = self.model.hyper.max_len;

        // Keep room for the mask at the end.
        let item_ids = &item_ids[item_ids.len().saturating_sub(max_len - 1)..];

        let mut tokens = vec![self.model.special_tokens.padding; max_len - 1 - item_ids.len()];
        tokens.extend_from_slice(item_ids);
        tokens.push(self.model.special_tokens.mask);

        let inputs = self.model.fusion_inputs();
        let hidden = self.model.hidden_states(self.encoder, &inputs, &tokens)?;
        let last = hidden.row(hidden.rows() - 1);

        Ok(ImplicitUser {
            user_embedding: last.iter().cloned().collect(),
        })
    }

    fn predict(
        &self,
        user: &Self::UserRepresentation,
        item_ids: &[ItemId],
    ) -> Result<Vec<f32>, PredictionError> {
        let inputs = self.model.fusion_inputs();
        let embeddings = inputs.embed(item_ids, &self.model.fusion)?;
        let user = aview1(&user.user_embedding);

        if embeddings.cols() != user.len() {
            return Err(ModelError::ShapeMismatch {
                name: "user representation",
                expected: embeddings.cols(),
                actual: user.len(),
            }.into());
        }

        embeddings
            .outer_iter()
            .map(|embedding| {
                let prediction = dot(user, embedding);

                if prediction.is_finite() {
                    Ok(prediction)
                } else {
                    Err(PredictionError::InvalidPredictionValue)
                }
            })
            .collect()
    }
}
