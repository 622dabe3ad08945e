//! Models module.
use std::fmt;
use std::str::FromStr;

use serde::de;
use serde::{Deserialize, Deserializer};
use serde_json;

pub mod fusion;
pub mod graph_sasrec;
pub mod head;

use ItemId;

/// Configuration error types.
#[derive(Debug, Fail)]
pub enum ConfigError {
    /// Merge strategy not among the known ones.
    #[fail(display = "Unknown merge type: {}.", _0)]
    UnknownMergeType(String),
    /// Prediction head not among the known ones.
    #[fail(display = "Unknown head type: {}.", _0)]
    UnknownHeadType(String),
    /// A parameter value that cannot be used.
    #[fail(display = "Invalid value for {}: {}.", name, reason)]
    InvalidValue {
        /// The parameter.
        name: &'static str,
        /// Why it was rejected.
        reason: String,
    },
    /// The configuration could not be parsed.
    #[fail(display = "Malformed configuration: {}.", _0)]
    Parse(#[cause] serde_json::Error),
}

/// Model error types.
#[derive(Debug, Fail)]
pub enum ModelError {
    /// Invalid configuration.
    #[fail(display = "{}", _0)]
    Config(#[cause] ConfigError),
    /// An id with no row in an embedding table.
    #[fail(display = "Id {} outside the {} table of {} rows.", id, table, rows)]
    UnknownId {
        /// The id.
        id: ItemId,
        /// The table.
        table: &'static str,
        /// Rows in the table.
        rows: usize,
    },
    /// Array dimensions that do not line up.
    #[fail(display = "Shape mismatch for {}: expected {}, got {}.", name, expected, actual)]
    ShapeMismatch {
        /// What was being checked.
        name: &'static str,
        /// Expected size.
        expected: usize,
        /// Actual size.
        actual: usize,
    },
}

impl From<ConfigError> for ModelError {
    fn from(error: ConfigError) -> Self {
        ModelError::Config(error)
    }
}

/// Strategy for merging the buy-graph and attribute embeddings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeType {
    /// Learned sigmoid gate between the buy and attribute embeddings.
    Gate,
    /// Buy embedding only; drops the attribute embedding.
    RmKgat,
    /// Attribute embedding only; drops the buy embedding.
    RmLightgcn,
    /// Buy and attribute embeddings side by side.
    Concat,
    /// Softmax attention over the three raw sources.
    Attention,
    /// Sum of the three raw sources.
    Add,
}

impl MergeType {
    /// All strategies.
    pub fn all() -> [MergeType; 6] {
        [
            MergeType::Gate,
            MergeType::RmKgat,
            MergeType::RmLightgcn,
            MergeType::Concat,
            MergeType::Attention,
            MergeType::Add,
        ]
    }

    /// Width of the merged embedding for sources of width `embedding_dim`.
    pub fn output_dim(&self, embedding_dim: usize) -> usize {
        match *self {
            MergeType::Concat => 2 * embedding_dim,
            _ => embedding_dim,
        }
    }

    fn name(&self) -> &'static str {
        match *self {
            MergeType::Gate => "gate",
            MergeType::RmKgat => "rm_kgat",
            MergeType::RmLightgcn => "rm_lightgcn",
            MergeType::Concat => "concat",
            MergeType::Attention => "attention",
            MergeType::Add => "add",
        }
    }
}

impl fmt::Display for MergeType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for MergeType {
    type Err = ConfigError;
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        MergeType::all()
            .iter()
            .find(|merge_type| merge_type.name() == value)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownMergeType(value.to_owned()))
    }
}

/// Prediction head used for full-vocabulary scoring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadType {
    /// Dot product with the fused item embeddings.
    Dot,
    /// Learned projection onto the vocabulary.
    Linear,
}

impl fmt::Display for HeadType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            HeadType::Dot => write!(f, "dot"),
            HeadType::Linear => write!(f, "linear"),
        }
    }
}

impl FromStr for HeadType {
    type Err = ConfigError;
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "dot" => Ok(HeadType::Dot),
            "linear" => Ok(HeadType::Linear),
            _ => Err(ConfigError::UnknownHeadType(value.to_owned())),
        }
    }
}

impl<'de> Deserialize<'de> for MergeType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for HeadType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(de::Error::custom)
    }
}

/// The user representation used by sequence models: the final hidden state.
#[derive(Clone, Debug)]
pub struct ImplicitUser {
    user_embedding: Vec<f32>,
}

impl ImplicitUser {
    /// The hidden state.
    pub fn embedding(&self) -> &[f32] {
        &self.user_embedding
    }
}
