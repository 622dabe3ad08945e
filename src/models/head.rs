//! Prediction heads scoring hidden states against the whole vocabulary.
use std::sync::Arc;

use ndarray::ArrayView2;
use rand::Rng;

use wyrm::{Arr, HogwildParameter};

use super::fusion::{FusionInputs, FusionParameters, Linear};
use super::{HeadType, ModelError};

/// A prediction head.
#[derive(Debug)]
pub enum PredictionHead {
    /// Dot product with the fused embedding of every id, plus a per-id bias.
    Dot {
        /// `1 x vocab_size` bias.
        bias: Arc<HogwildParameter>,
    },
    /// Learned `hidden_dim x vocab_size` projection.
    Linear(Linear),
}

impl Clone for PredictionHead {
    fn clone(&self) -> Self {
        match *self {
            PredictionHead::Dot { ref bias } => PredictionHead::Dot {
                bias: Arc::new(bias.as_ref().clone()),
            },
            PredictionHead::Linear(ref linear) => PredictionHead::Linear(linear.clone()),
        }
    }
}

impl PredictionHead {
    /// Build a head of the given type.
    pub fn new<R: Rng>(head_type: HeadType, hidden_dim: usize, vocab_size: usize, rng: &mut R) -> Self {
        match head_type {
            HeadType::Dot => PredictionHead::Dot {
                bias: Arc::new(HogwildParameter::new(Arr::zeros((1, vocab_size)))),
            },
            HeadType::Linear => PredictionHead::Linear(Linear::new(hidden_dim, vocab_size, rng)),
        }
    }

    /// The head type.
    pub fn head_type(&self) -> HeadType {
        match *self {
            PredictionHead::Dot { .. } => HeadType::Dot,
            PredictionHead::Linear(_) => HeadType::Linear,
        }
    }

    /// Score every row of `hidden` against ids `0..vocab_size`.
    pub fn scores(
        &self,
        hidden: ArrayView2<f32>,
        inputs: &FusionInputs,
        fusion: &FusionParameters,
    ) -> Result<Arr, ModelError> {
        match *self {
            PredictionHead::Dot { ref bias } => {
                let vocab: Vec<_> = (0..bias.value().cols()).collect();
                let embeddings = inputs.embed(&vocab, fusion)?;

                if embeddings.cols() != hidden.cols() {
                    return Err(ModelError::ShapeMismatch {
                        name: "hidden state",
                        expected: embeddings.cols(),
                        actual: hidden.cols(),
                    });
                }

                Ok(hidden.dot(&embeddings.t()) + bias.value())
            }
            PredictionHead::Linear(ref linear) => {
                if linear.input_dim() != hidden.cols() {
                    return Err(ModelError::ShapeMismatch {
                        name: "hidden state",
                        expected: linear.input_dim(),
                        actual: hidden.cols(),
                    });
                }

                Ok(linear.forward(hidden))
            }
        }
    }

    /// The learnable parameters.
    pub fn parameters(&self) -> Vec<Arc<HogwildParameter>> {
        match *self {
            PredictionHead::Dot { ref bias } => vec![bias.clone()],
            PredictionHead::Linear(ref linear) => linear.parameters(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::fusion::EmbeddingTables;
    use models::MergeType;
    use rand::{SeedableRng, XorShiftRng};

    #[test]
    fn dot_head_matches_fused_embeddings() {
        let mut rng = XorShiftRng::from_seed([3; 16]);
        let fusion = FusionParameters::new(MergeType::Add, 2, 6, &mut rng);
        let tables = EmbeddingTables::new(
            Arr::from_shape_vec((3, 2), vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0]).unwrap(),
            Arr::zeros((3, 2)),
            Arr::zeros((3, 6)),
        );
        let inputs = fusion.prepare(&tables);
        let head = PredictionHead::new(HeadType::Dot, 2, 3, &mut rng);

        let hidden = Arr::from_shape_vec((1, 2), vec![2.0, -1.0]).unwrap();
        let scores = head.scores(hidden.view(), &inputs, &fusion).unwrap();
        let fused = inputs.embed(&[0, 1, 2], &fusion).unwrap();

        assert_eq!(scores.dim(), (1, 3));
        for id in 0..3 {
            let expected = hidden.row(0).dot(&fused.row(id));
            assert!((scores[(0, id)] - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn linear_head_shapes() {
        let mut rng = XorShiftRng::from_seed([4; 16]);
        let fusion = FusionParameters::new(MergeType::Concat, 2, 6, &mut rng);
        let tables = EmbeddingTables::new(Arr::zeros((5, 2)), Arr::zeros((5, 2)), Arr::zeros((5, 6)));
        let inputs = fusion.prepare(&tables);
        let head = PredictionHead::new(HeadType::Linear, 4, 5, &mut rng);

        assert_eq!(head.head_type(), HeadType::Linear);
        assert_eq!(head.parameters().len(), 2);

        let scores = head.scores(Arr::zeros((3, 4)).view(), &inputs, &fusion).unwrap();
        assert_eq!(scores.dim(), (3, 5));
        assert!(head.scores(Arr::zeros((3, 2)).view(), &inputs, &fusion).is_err());
    }
}
