//! Fusion of the graph embedding sources.
//!
//! Every id is represented by three rows of the same width:
//!
//! - `graph1`, the item-side table of the buy graph,
//! - `graph2`, the user-side table of the buy graph, and
//! - `attribute`, the knowledge-graph attribute table after a learned
//!   projection.
//!
//! Merging happens in two stages. The buy pair is always combined through a
//! learned gate:
//! ```text
//! gate = sigmoid(W1 graph1 + W2 graph2)
//! buy = gate * graph1 + (1 - gate) * graph2
//! ```
//! and the [`MergeType`](../enum.MergeType.html) then decides how `buy` and
//! `attribute` become the final embedding. The `attention` and `add`
//! strategies are the exception: they mix the three raw sources and skip the
//! buy gate altogether.
//!
//! The same [`fuse`] function produces the input embeddings, the label
//! embeddings of the loss, and the candidate embeddings used for scoring.
use std::sync::Arc;

use ndarray::{ArrayView2, Axis};
use rand::distributions::{Distribution, Normal};
use rand::Rng;

use wyrm::{Arr, HogwildParameter};

use super::{MergeType, ModelError};
use ItemId;

fn dense_init<T: Rng>(rows: usize, cols: usize, rng: &mut T) -> Arr {
    let normal = Normal::new(0.0, (2.0 / (rows + cols) as f64).sqrt());
    Arr::zeros((rows, cols)).map(|_| normal.sample(rng) as f32)
}

pub(crate) fn sigmoid(x: Arr) -> Arr {
    x.mapv(|v| 1.0 / (1.0 + (-v).exp()))
}

/// Affine layer computing `x W + b` row by row.
#[derive(Debug)]
pub struct Linear {
    weight: Arc<HogwildParameter>,
    bias: Arc<HogwildParameter>,
}

impl Clone for Linear {
    fn clone(&self) -> Self {
        Linear {
            weight: Arc::new(self.weight.as_ref().clone()),
            bias: Arc::new(self.bias.as_ref().clone()),
        }
    }
}

impl Linear {
    /// Randomly initialized layer with zero bias.
    pub fn new<R: Rng>(input_dim: usize, output_dim: usize, rng: &mut R) -> Self {
        Linear {
            weight: Arc::new(HogwildParameter::new(dense_init(input_dim, output_dim, rng))),
            bias: Arc::new(HogwildParameter::new(Arr::zeros((1, output_dim)))),
        }
    }

    /// Layer from an `input_dim x output_dim` weight and a `1 x output_dim` bias.
    pub fn from_weights(weight: Arr, bias: Arr) -> Result<Self, ModelError> {
        if bias.rows() != 1 {
            return Err(ModelError::ShapeMismatch {
                name: "bias rows",
                expected: 1,
                actual: bias.rows(),
            });
        }
        if bias.cols() != weight.cols() {
            return Err(ModelError::ShapeMismatch {
                name: "bias width",
                expected: weight.cols(),
                actual: bias.cols(),
            });
        }

        Ok(Linear {
            weight: Arc::new(HogwildParameter::new(weight)),
            bias: Arc::new(HogwildParameter::new(bias)),
        })
    }

    /// Width of the inputs.
    pub fn input_dim(&self) -> usize {
        self.weight.value().rows()
    }

    /// Width of the outputs.
    pub fn output_dim(&self) -> usize {
        self.weight.value().cols()
    }

    /// Apply the layer to every row of `x`.
    pub fn forward(&self, x: ArrayView2<f32>) -> Arr {
        x.dot(self.weight.value()) + self.bias.value()
    }

    /// The learnable parameters: weight, then bias.
    pub fn parameters(&self) -> Vec<Arc<HogwildParameter>> {
        vec![self.weight.clone(), self.bias.clone()]
    }
}

/// Scores one source for the attention strategy: `score(tanh(projection(x)))`.
#[derive(Clone, Debug)]
pub struct AttentionScorer {
    projection: Linear,
    score: Linear,
}

impl AttentionScorer {
    fn new<R: Rng>(embedding_dim: usize, rng: &mut R) -> Self {
        AttentionScorer {
            projection: Linear::new(embedding_dim, embedding_dim, rng),
            score: Linear::new(embedding_dim, 1, rng),
        }
    }

    fn scores(&self, source: ArrayView2<f32>) -> Arr {
        let hidden = self.projection.forward(source).mapv(f32::tanh);
        self.score.forward(hidden.view())
    }

    fn parameters(&self) -> Vec<Arc<HogwildParameter>> {
        let mut parameters = self.projection.parameters();
        parameters.extend(self.score.parameters());
        parameters
    }
}

/// The final merge stage, with the parameters each strategy needs.
#[derive(Clone, Debug)]
pub enum MergeParameters {
    /// Learned gate between `buy` and `attribute`.
    Gate {
        /// Gate contribution of the buy embedding.
        buy: Linear,
        /// Gate contribution of the attribute embedding.
        attribute: Linear,
    },
    /// `buy` only.
    RmKgat,
    /// `attribute` only.
    RmLightgcn,
    /// `buy` and `attribute` concatenated along the channel axis.
    Concat,
    /// Softmax-weighted sum of `graph1`, `graph2` and `attribute`.
    Attention([AttentionScorer; 3]),
    /// `graph1 + graph2 + attribute`.
    Add,
}

impl MergeParameters {
    fn new<R: Rng>(merge_type: MergeType, embedding_dim: usize, rng: &mut R) -> Self {
        match merge_type {
            MergeType::Gate => MergeParameters::Gate {
                buy: Linear::new(embedding_dim, embedding_dim, rng),
                attribute: Linear::new(embedding_dim, embedding_dim, rng),
            },
            MergeType::RmKgat => MergeParameters::RmKgat,
            MergeType::RmLightgcn => MergeParameters::RmLightgcn,
            MergeType::Concat => MergeParameters::Concat,
            MergeType::Attention => MergeParameters::Attention([
                AttentionScorer::new(embedding_dim, rng),
                AttentionScorer::new(embedding_dim, rng),
                AttentionScorer::new(embedding_dim, rng),
            ]),
            MergeType::Add => MergeParameters::Add,
        }
    }

    /// The strategy these parameters implement.
    pub fn merge_type(&self) -> MergeType {
        match *self {
            MergeParameters::Gate { .. } => MergeType::Gate,
            MergeParameters::RmKgat => MergeType::RmKgat,
            MergeParameters::RmLightgcn => MergeType::RmLightgcn,
            MergeParameters::Concat => MergeType::Concat,
            MergeParameters::Attention(_) => MergeType::Attention,
            MergeParameters::Add => MergeType::Add,
        }
    }

    fn parameters(&self) -> Vec<Arc<HogwildParameter>> {
        match *self {
            MergeParameters::Gate {
                ref buy,
                ref attribute,
            } => {
                let mut parameters = buy.parameters();
                parameters.extend(attribute.parameters());
                parameters
            }
            MergeParameters::Attention(ref scorers) => scorers
                .iter()
                .flat_map(|scorer| scorer.parameters())
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Learned parameters of the fusion engine.
#[derive(Clone, Debug)]
pub struct FusionParameters {
    embedding_dim: usize,
    buy_item_gate: Linear,
    buy_user_gate: Linear,
    attribute_projection: Linear,
    merge: MergeParameters,
}

impl FusionParameters {
    /// Initialize parameters for sources of width `embedding_dim` and a raw
    /// attribute table of width `attribute_dim`.
    pub fn new<R: Rng>(
        merge_type: MergeType,
        embedding_dim: usize,
        attribute_dim: usize,
        rng: &mut R,
    ) -> Self {
        FusionParameters {
            embedding_dim: embedding_dim,
            buy_item_gate: Linear::new(embedding_dim, embedding_dim, rng),
            buy_user_gate: Linear::new(embedding_dim, embedding_dim, rng),
            attribute_projection: Linear::new(attribute_dim, embedding_dim, rng),
            merge: MergeParameters::new(merge_type, embedding_dim, rng),
        }
    }

    /// The configured strategy.
    pub fn merge_type(&self) -> MergeType {
        self.merge.merge_type()
    }

    /// Width of each source.
    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    /// Width of the raw attribute table.
    pub fn attribute_dim(&self) -> usize {
        self.attribute_projection.input_dim()
    }

    /// Width of the fused embedding.
    pub fn output_dim(&self) -> usize {
        self.merge_type().output_dim(self.embedding_dim)
    }

    /// Project the raw attribute table. Done once per forward pass; the
    /// result is shared by every fusion in that pass.
    pub fn prepare<'a>(&self, tables: &'a EmbeddingTables) -> FusionInputs<'a> {
        FusionInputs {
            item_buy: &tables.item_buy,
            user_buy: &tables.user_buy,
            attribute: self.attribute_projection.forward(tables.attribute.view()),
        }
    }

    /// The first merge stage: gated combination of the buy pair.
    pub fn buy(&self, graph1: ArrayView2<f32>, graph2: ArrayView2<f32>) -> Arr {
        let gate = sigmoid(self.buy_item_gate.forward(graph1) + &self.buy_user_gate.forward(graph2));
        gated_sum(gate, graph1, graph2)
    }

    /// Every learnable parameter, for an external optimizer.
    pub fn parameters(&self) -> Vec<Arc<HogwildParameter>> {
        let mut parameters = self.buy_item_gate.parameters();
        parameters.extend(self.buy_user_gate.parameters());
        parameters.extend(self.attribute_projection.parameters());
        parameters.extend(self.merge.parameters());
        parameters
    }
}

fn gated_sum(gate: Arr, first: ArrayView2<f32>, second: ArrayView2<f32>) -> Arr {
    let complement = gate.mapv(|g| 1.0 - g);
    gate * &first + &(complement * &second)
}

fn concatenate(first: ArrayView2<f32>, second: ArrayView2<f32>) -> Arr {
    let mut output = Arr::zeros((first.rows(), first.cols() + second.cols()));

    for (mut row, first_row, second_row) in izip!(
        output.outer_iter_mut(),
        first.outer_iter(),
        second.outer_iter()
    ) {
        for (out, &value) in row.iter_mut().zip(first_row.iter().chain(second_row.iter())) {
            *out = value;
        }
    }

    output
}

fn attend<'a>(
    scorers: &[AttentionScorer; 3],
    graph1: ArrayView2<'a, f32>,
    graph2: ArrayView2<'a, f32>,
    attribute: ArrayView2<'a, f32>,
) -> Arr {
    let sources = [graph1, graph2, attribute];
    let scores: Vec<Arr> = scorers
        .iter()
        .zip(sources.iter())
        .map(|(scorer, source)| scorer.scores(source.view()))
        .collect();

    let mut output = Arr::zeros(graph1.dim());

    for (row_idx, mut row) in output.outer_iter_mut().enumerate() {
        let logits = [
            scores[0][(row_idx, 0)],
            scores[1][(row_idx, 0)],
            scores[2][(row_idx, 0)],
        ];
        let max = logits.iter().cloned().fold(::std::f32::NEG_INFINITY, f32::max);
        let exps = [
            (logits[0] - max).exp(),
            (logits[1] - max).exp(),
            (logits[2] - max).exp(),
        ];
        let total: f32 = exps.iter().sum();

        for (&weight, source) in exps.iter().zip(sources.iter()) {
            row.scaled_add(weight / total, &source.row(row_idx));
        }
    }

    output
}

/// Merge the three sources, one row per id, under the configured strategy.
///
/// All three inputs must have the same shape; the attribute rows must
/// already be projected (see [`FusionParameters::prepare`]). The output has
/// `parameters.output_dim()` columns.
pub fn fuse<'a>(
    graph1: ArrayView2<'a, f32>,
    graph2: ArrayView2<'a, f32>,
    attribute: ArrayView2<'a, f32>,
    parameters: &FusionParameters,
) -> Result<Arr, ModelError> {
    for &(name, source) in &[("graph2", &graph2), ("attribute", &attribute)] {
        if source.rows() != graph1.rows() {
            return Err(ModelError::ShapeMismatch {
                name: name,
                expected: graph1.rows(),
                actual: source.rows(),
            });
        }
    }
    for &(name, source) in &[("graph1", &graph1), ("graph2", &graph2), ("attribute", &attribute)] {
        if source.cols() != parameters.embedding_dim {
            return Err(ModelError::ShapeMismatch {
                name: name,
                expected: parameters.embedding_dim,
                actual: source.cols(),
            });
        }
    }

    let fused = match parameters.merge {
        MergeParameters::Gate {
            buy: ref buy_gate,
            attribute: ref attribute_gate,
        } => {
            let buy = parameters.buy(graph1, graph2);
            let gate = sigmoid(buy_gate.forward(buy.view()) + &attribute_gate.forward(attribute));
            gated_sum(gate, buy.view(), attribute)
        }
        MergeParameters::RmKgat => parameters.buy(graph1, graph2),
        MergeParameters::RmLightgcn => attribute.to_owned(),
        MergeParameters::Concat => {
            let buy = parameters.buy(graph1, graph2);
            concatenate(buy.view(), attribute)
        }
        MergeParameters::Attention(ref scorers) => attend(scorers, graph1, graph2, attribute),
        MergeParameters::Add => &(&graph1 + &graph2) + &attribute,
    };

    Ok(fused)
}

/// The externally trained embedding tables, indexed by id.
#[derive(Clone, Debug)]
pub struct EmbeddingTables {
    item_buy: Arc<Arr>,
    user_buy: Arc<Arr>,
    attribute: Arc<Arr>,
}

impl EmbeddingTables {
    /// Wrap the buy-graph item and user tables and the raw attribute table.
    pub fn new(item_buy: Arr, user_buy: Arr, attribute: Arr) -> Self {
        EmbeddingTables {
            item_buy: Arc::new(item_buy),
            user_buy: Arc::new(user_buy),
            attribute: Arc::new(attribute),
        }
    }

    /// Check that every table covers `vocab_size` ids and has the widths
    /// the fusion parameters expect.
    pub fn validate(&self, vocab_size: usize, parameters: &FusionParameters) -> Result<(), ModelError> {
        let tables = [
            ("item_buy", &self.item_buy, parameters.embedding_dim()),
            ("user_buy", &self.user_buy, parameters.embedding_dim()),
            ("attribute", &self.attribute, parameters.attribute_dim()),
        ];

        for &(name, table, width) in &tables {
            if table.rows() < vocab_size {
                return Err(ModelError::ShapeMismatch {
                    name: name,
                    expected: vocab_size,
                    actual: table.rows(),
                });
            }
            if table.rows() > vocab_size {
                warn!(
                    "The {} table has {} rows; only the first {} are addressable",
                    name,
                    table.rows(),
                    vocab_size
                );
            }
            if table.cols() != width {
                return Err(ModelError::ShapeMismatch {
                    name: name,
                    expected: width,
                    actual: table.cols(),
                });
            }
        }

        Ok(())
    }
}

/// Tables ready for fusion during one forward pass.
#[derive(Debug)]
pub struct FusionInputs<'a> {
    item_buy: &'a Arr,
    user_buy: &'a Arr,
    attribute: Arr,
}

fn lookup(table: &Arr, name: &'static str, ids: &[ItemId]) -> Result<Arr, ModelError> {
    if let Some(&id) = ids.iter().find(|&&id| id >= table.rows()) {
        return Err(ModelError::UnknownId {
            id: id,
            table: name,
            rows: table.rows(),
        });
    }

    Ok(table.select(Axis(0), ids))
}

impl<'a> FusionInputs<'a> {
    /// Look up `ids` in all three tables and fuse them: one output row per id.
    pub fn embed(&self, ids: &[ItemId], parameters: &FusionParameters) -> Result<Arr, ModelError> {
        let graph1 = lookup(self.item_buy, "item_buy", ids)?;
        let graph2 = lookup(self.user_buy, "user_buy", ids)?;
        let attribute = lookup(&self.attribute, "attribute", ids)?;

        fuse(graph1.view(), graph2.view(), attribute.view(), parameters)
    }
}
