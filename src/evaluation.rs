//! Ranking metrics over sampled candidate sets.
//!
//! Every evaluation example scores its positive item at candidate index 0
//! followed by the sampled negatives. The rank of the positive is the number
//! of candidates scoring at least as high as it, so ties count against the
//! model.
use std::collections::BTreeMap;
use std::fmt;

use failure;
use rayon::prelude::*;

use masking::EvalDataset;
use models::graph_sasrec::{Batch, GraphSequenceModel, SequenceEncoder};
use PredictionError;

/// Averaged ranking metrics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Recall@k, keyed by k.
    pub recall: BTreeMap<usize, f32>,
    /// NDCG@k, keyed by k.
    pub ndcg: BTreeMap<usize, f32>,
    /// Mean reciprocal rank.
    pub mrr: f32,
    /// Number of examples averaged over.
    pub num_examples: usize,
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (k, recall) in &self.recall {
            write!(f, "Recall@{}: {:.4} ", k, recall)?;
        }
        for (k, ndcg) in &self.ndcg {
            write!(f, "NDCG@{}: {:.4} ", k, ndcg)?;
        }
        write!(f, "MRR: {:.4} ({} examples)", self.mrr, self.num_examples)
    }
}

/// One-based rank of the candidate at index 0.
pub fn rank_of_positive(scores: &[f32]) -> Result<usize, PredictionError> {
    let positive = match scores.first() {
        Some(&score) => score,
        None => return Err(PredictionError::InvalidPredictionValue),
    };

    let mut rank = 0;

    for &score in scores {
        if !score.is_finite() {
            return Err(PredictionError::InvalidPredictionValue);
        }

        if score >= positive {
            rank += 1;
        }
    }

    Ok(rank)
}

/// Compute Recall@k and NDCG@k for each of `ks`, and MRR, averaged over
/// the rows of `scores`.
pub fn ranking_metrics(scores: &[Vec<f32>], ks: &[usize]) -> Result<Metrics, PredictionError> {
    let ranks = scores
        .par_iter()
        .map(|row| rank_of_positive(row))
        .collect::<Result<Vec<_>, _>>()?;

    let mut metrics = Metrics {
        num_examples: ranks.len(),
        ..Default::default()
    };

    if ranks.is_empty() {
        return Ok(metrics);
    }

    let num_examples = ranks.len() as f32;

    for &k in ks {
        let (hits, gain) = ranks
            .par_iter()
            .filter(|&&rank| rank <= k)
            .map(|&rank| (1.0f32, 1.0 / (rank as f32 + 1.0).log2()))
            .reduce(|| (0.0, 0.0), |a, b| (a.0 + b.0, a.1 + b.1));

        metrics.recall.insert(k, hits / num_examples);
        metrics.ndcg.insert(k, gain / num_examples);
    }

    metrics.mrr = ranks.par_iter().map(|&rank| 1.0 / rank as f32).sum::<f32>() / num_examples;

    Ok(metrics)
}

/// Score every example of `dataset` with `model` and compute its ranking
/// metrics.
pub fn evaluate<E: SequenceEncoder>(
    model: &GraphSequenceModel,
    encoder: &E,
    dataset: &EvalDataset,
    ks: &[usize],
) -> Result<Metrics, failure::Error> {
    let examples = (0..dataset.len())
        .map(|idx| dataset.get(idx))
        .collect::<Result<Vec<_>, _>>()?;

    let output = model.forward(encoder, Batch::Eval(&examples))?;
    let scores = output.scores.unwrap_or_default();
    let metrics = ranking_metrics(&scores, ks)?;

    info!("{}", metrics);

    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(actual: f32, expected: f32) -> bool {
        (actual - expected).abs() < 1e-5
    }

    #[test]
    fn ties_rank_pessimistically() {
        assert_eq!(rank_of_positive(&[0.5, 0.1, 0.2]).unwrap(), 1);
        assert_eq!(rank_of_positive(&[0.5, 0.9, 0.5]).unwrap(), 3);
        assert_eq!(rank_of_positive(&[0.0]).unwrap(), 1);
    }

    #[test]
    fn invalid_scores_are_rejected() {
        assert!(rank_of_positive(&[]).is_err());
        assert!(rank_of_positive(&[0.5, ::std::f32::NAN]).is_err());
        assert!(ranking_metrics(&[vec![0.1, 0.2], vec![::std::f32::INFINITY]], &[1]).is_err());
    }

    #[test]
    fn metrics_from_known_ranks() {
        // Ranks 1, 2 and 4.
        let scores = vec![
            vec![0.9, 0.1, 0.2, 0.3],
            vec![0.5, 0.6, 0.1, 0.2],
            vec![0.1, 0.2, 0.3, 0.4],
        ];

        let metrics = ranking_metrics(&scores, &[1, 2, 10]).unwrap();

        assert_eq!(metrics.num_examples, 3);
        assert!(close(metrics.recall[&1], 1.0 / 3.0));
        assert!(close(metrics.recall[&2], 2.0 / 3.0));
        assert!(close(metrics.recall[&10], 1.0));

        assert!(close(metrics.ndcg[&1], 1.0 / 3.0));
        assert!(close(metrics.ndcg[&2], (1.0 + 1.0 / 3f32.log2()) / 3.0));
        assert!(close(
            metrics.ndcg[&10],
            (1.0 + 1.0 / 3f32.log2() + 1.0 / 5f32.log2()) / 3.0
        ));

        assert!(close(metrics.mrr, (1.0 + 0.5 + 0.25) / 3.0));
    }

    #[test]
    fn no_examples_give_empty_metrics() {
        let metrics = ranking_metrics(&[], &[5]).unwrap();

        assert_eq!(metrics, Metrics::default());
    }

    #[test]
    fn display_lists_every_cutoff() {
        let metrics = ranking_metrics(&[vec![1.0, 0.0]], &[1, 5]).unwrap();
        let display = metrics.to_string();

        assert!(display.contains("Recall@1: 1.0000"));
        assert!(display.contains("NDCG@5: 1.0000"));
        assert!(display.contains("MRR: 1.0000 (1 examples)"));
    }

    #[test]
    fn evaluate_ranks_every_test_user() {
        use data::{Interactions, LeaveOneOut};
        use masking::{MaskingParameters, SpecialTokens};
        use models::fusion::EmbeddingTables;
        use models::graph_sasrec::{Hyperparameters, IdentityEncoder};
        use models::MergeType;
        use sampling::{rng_from_seed, sample_evaluation_negatives};
        use wyrm::Arr;

        let data = Interactions::from_sequences(&[
            vec![1, 2, 3, 4],
            vec![5, 6, 7, 8, 1],
            vec![2, 3],
            vec![8, 7, 6, 5],
        ]).to_compressed();
        let split = LeaveOneOut::from(&data);
        let negatives = sample_evaluation_negatives(&data, 3, &mut rng_from_seed(7));
        let special_tokens = SpecialTokens::new(data.num_items());
        let parameters = MaskingParameters::new(4);
        let test = EvalDataset::new(&data, &parameters, special_tokens, &negatives, split.test());

        let vocab = special_tokens.vocab_size();
        let table = Arr::from_shape_fn((vocab, 2), |(row, col)| (row * (col + 1)) as f32 * 0.01);
        let attribute = Arr::from_shape_fn((vocab, 6), |(row, col)| ((row + col) % 3) as f32 * 0.1);
        let model = Hyperparameters::new(data.num_items(), 4)
            .embedding_dim(2)
            .merge_type(MergeType::RmKgat)
            .rng(rng_from_seed(3))
            .build(EmbeddingTables::new(table.clone(), table, attribute))
            .unwrap();

        let metrics = evaluate(&model, &IdentityEncoder, &test, &[1, 4]).unwrap();

        // The user with two items is not split.
        assert_eq!(metrics.num_examples, 3);
        assert!(close(metrics.recall[&4], 1.0));
        assert!(metrics.mrr > 0.0 && metrics.mrr <= 1.0);
        assert!(metrics.ndcg[&1] <= metrics.ndcg[&4]);
    }
}
