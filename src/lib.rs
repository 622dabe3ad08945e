#![deny(missing_docs)]
//! # gsbr
//!
//! `gsbr` implements a sequence-based recommender whose item representations
//! are fused from precomputed graph embeddings: a pair of user/item tables from
//! a collaborative-filtering ("buy") graph model and an attribute table from a
//! knowledge-graph attention model.
//!
//! The crate covers two pieces:
//!
//! - the [masking](masking/index.html) pipeline, which turns per-user item
//!   sequences into fixed-length training and evaluation examples using a
//!   seeded, checkpointable random stream, and
//! - the [fusion](models/fusion/index.html) engine, which merges the three
//!   embedding sources under a configurable strategy and is shared by the
//!   input embedding, the training loss and candidate scoring.
//!
//! The transformer body itself is supplied by the caller through the
//! [`SequenceEncoder`](models/graph_sasrec/trait.SequenceEncoder.html) trait.
//!
//! ## Example
//!
//! ```rust
//! # extern crate gsbr;
//! # extern crate rand;
//! # extern crate wyrm;
//! # use rand::SeedableRng;
//! use gsbr::data::{Interaction, Interactions, LeaveOneOut};
//! use gsbr::masking::{EvalDataset, MaskingParameters, SpecialTokens};
//! use gsbr::models::graph_sasrec::{Hyperparameters, IdentityEncoder};
//! use gsbr::models::fusion::EmbeddingTables;
//! use gsbr::models::MergeType;
//! use gsbr::sampling::sample_evaluation_negatives;
//!
//! let interactions: Vec<Interaction> = (0..8)
//!     .flat_map(|user| (0..6).map(move |t| Interaction::new(user, 1 + (user + t) % 10, t)))
//!     .collect();
//! let data = Interactions::from(interactions).to_compressed();
//! let split = LeaveOneOut::from(&data);
//!
//! let mut rng = rand::XorShiftRng::from_seed([42; 16]);
//! let negatives = sample_evaluation_negatives(&data, 3, &mut rng);
//! let tokens = SpecialTokens::new(data.num_items());
//! let masking = MaskingParameters::new(5);
//! let test = EvalDataset::new(&data, &masking, tokens, &negatives, split.test());
//!
//! let embedding_dim = 4;
//! let vocab = tokens.vocab_size();
//! let tables = EmbeddingTables::new(
//!     wyrm::Arr::from_elem((vocab, embedding_dim), 0.1),
//!     wyrm::Arr::from_elem((vocab, embedding_dim), 0.2),
//!     wyrm::Arr::from_elem((vocab, 3 * embedding_dim), 0.3),
//! );
//!
//! let model = Hyperparameters::new(data.num_items(), 5)
//!     .embedding_dim(embedding_dim)
//!     .merge_type(MergeType::Gate)
//!     .rng(rng)
//!     .build(tables)
//!     .unwrap();
//!
//! let metrics = gsbr::evaluation::evaluate(&model, &IdentityEncoder, &test, &[1, 5]).unwrap();
//! println!("{:?}", metrics);
//! ```
#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate itertools;

#[macro_use]
extern crate failure;
#[macro_use]
extern crate log;

extern crate csv;
extern crate ndarray;
extern crate rand;
extern crate rayon;
extern crate serde;
extern crate serde_json;

extern crate wyrm;

pub mod data;
pub mod evaluation;
pub mod masking;
pub mod models;
pub mod sampling;

/// Alias for user indices.
pub type UserId = usize;
/// Alias for item indices.
///
/// Item ids start at 1: id 0 is reserved for padding.
pub type ItemId = usize;
/// Alias for timestamps.
pub type Timestamp = usize;

/// Prediction error types.
#[derive(Debug, Fail)]
pub enum PredictionError {
    /// Failed prediction due to numerical issues.
    #[fail(display = "Invalid prediction value: non-finite or not a number.")]
    InvalidPredictionValue,
    /// The model could not produce a representation.
    #[fail(display = "Model error: {}", _0)]
    Model(#[cause] models::ModelError),
}

impl From<models::ModelError> for PredictionError {
    fn from(error: models::ModelError) -> Self {
        PredictionError::Model(error)
    }
}

/// Trait describing models that can compute predictions given
/// a user's sequences of past interactions.
pub trait OnlineRankingModel {
    /// The representation the model computes from past interactions.
    type UserRepresentation: std::fmt::Debug;
    /// Compute a user representation from past interactions.
    fn user_representation(
        &self,
        item_ids: &[ItemId],
    ) -> Result<Self::UserRepresentation, PredictionError>;
    /// Given a user representation, rank `item_ids` according
    /// to how likely the user is to interact with them in the future.
    fn predict(
        &self,
        user: &Self::UserRepresentation,
        item_ids: &[ItemId],
    ) -> Result<Vec<f32>, PredictionError>;
}
