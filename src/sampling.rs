//! Seeded random streams used by the data pipeline.
//!
//! Every random decision the datasets make goes through an explicit
//! `XorShiftRng` handle. The masking stream can be checkpointed with
//! [`MaskingRng::get_state`] and restored with [`MaskingRng::set_state`],
//! so data loading resumes bit-for-bit after a restart.
use std::collections::{HashMap, HashSet};

use rand::distributions::{Distribution, Uniform};
use rand::{Rng, SeedableRng, XorShiftRng};
use serde_json;

use data::{CompressedInteractions, DataError};
use {ItemId, UserId};

/// Build a generator from a 64-bit seed.
pub fn rng_from_seed(seed: u64) -> XorShiftRng {
    let mut bytes = [0; 16];

    for (idx, byte) in bytes.iter_mut().enumerate() {
        // Little-endian seed bytes, repeated.
        *byte = (seed >> (8 * (idx % 8))) as u8;
    }

    XorShiftRng::from_seed(bytes)
}

/// A saved position in a random stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RngState(XorShiftRng);

impl RngState {
    /// Serialize the state, e.g. into a checkpoint.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a state written by `to_json`.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// The single random stream driving training-example masking.
#[derive(Clone, Debug)]
pub struct MaskingRng {
    rng: XorShiftRng,
}

impl MaskingRng {
    /// Wrap an existing generator.
    pub fn new(rng: XorShiftRng) -> Self {
        MaskingRng { rng }
    }

    /// Build the stream from a 64-bit seed.
    pub fn from_seed(seed: u64) -> Self {
        MaskingRng::new(rng_from_seed(seed))
    }

    /// Capture the current state of the stream.
    pub fn get_state(&self) -> RngState {
        RngState(self.rng.clone())
    }

    /// Rewind (or fast-forward) the stream to a captured state.
    pub fn set_state(&mut self, state: RngState) {
        self.rng = state.0;
    }

    /// Uniform draw from `[0, 1)`.
    pub fn uniform(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    /// Uniform item id in `[1, num_items]`.
    pub fn item(&mut self, num_items: usize) -> ItemId {
        self.rng.gen_range(1, num_items + 1)
    }
}

/// Draws one negative item per supervised position of a training example.
#[derive(Clone, Debug)]
pub struct UniformNegativeSampler {
    num_items: usize,
    range: Uniform<usize>,
    rng: XorShiftRng,
}

impl UniformNegativeSampler {
    /// Build a sampler over items `[1, num_items]`.
    pub fn new(num_items: usize, rng: XorShiftRng) -> Result<Self, DataError> {
        if num_items == 0 {
            return Err(DataError::NoItems);
        }

        Ok(UniformNegativeSampler {
            num_items: num_items,
            range: Uniform::new(1, num_items + 1),
            rng: rng,
        })
    }

    /// Negative labels aligned with `labels`: `0` wherever the label is `0`,
    /// otherwise a uniformly drawn item different from the label.
    ///
    /// With a single item there is nothing else to draw, and the label
    /// itself is returned.
    pub fn negative_labels(&mut self, labels: &[ItemId]) -> Vec<ItemId> {
        labels
            .iter()
            .map(|&label| {
                if label == 0 {
                    return 0;
                }

                if self.num_items < 2 {
                    return self.range.sample(&mut self.rng);
                }

                loop {
                    let negative = self.range.sample(&mut self.rng);

                    if negative != label {
                        return negative;
                    }
                }
            })
            .collect()
    }
}

/// Sample `num_negatives` distinct items per user, uniformly from the items
/// the user has never interacted with.
///
/// Users are visited in id order, so the output depends only on the data and
/// the state of `rng`. If a user has seen nearly every item, fewer negatives
/// than requested are returned.
pub fn sample_evaluation_negatives<R: Rng>(
    interactions: &CompressedInteractions,
    num_negatives: usize,
    rng: &mut R,
) -> HashMap<UserId, Vec<ItemId>> {
    let num_items = interactions.num_items();
    let mut negatives = HashMap::with_capacity(interactions.num_users());

    if num_items == 0 {
        return negatives;
    }

    let range = Uniform::new(1, num_items + 1);

    for user in interactions.iter_users() {
        let seen: HashSet<ItemId> = user.item_ids.iter().cloned().collect();
        let available = num_items - seen.iter().filter(|&&item| item >= 1 && item <= num_items).count();
        let wanted = num_negatives.min(available);

        if wanted < num_negatives {
            warn!(
                "User {} has only {} unseen items; sampling {} of {} negatives",
                user.user_id, available, wanted, num_negatives
            );
        }

        let mut sampled = HashSet::with_capacity(wanted);
        let mut user_negatives = Vec::with_capacity(wanted);

        while user_negatives.len() < wanted {
            let item = range.sample(rng);

            if seen.contains(&item) || !sampled.insert(item) {
                continue;
            }

            user_negatives.push(item);
        }

        negatives.insert(user.user_id, user_negatives);
    }

    negatives
}

#[cfg(test)]
mod tests {
    use super::*;
    use data::Interactions;

    #[test]
    fn state_round_trip_replays_stream() {
        let mut stream = MaskingRng::from_seed(98765);
        let state = stream.get_state();

        let first: Vec<f64> = (0..20).map(|_| stream.uniform()).collect();

        stream.set_state(state);
        let second: Vec<f64> = (0..20).map(|_| stream.uniform()).collect();

        assert_eq!(first, second);
    }

    #[test]
    fn state_survives_serialization() {
        let mut stream = MaskingRng::from_seed(1);
        stream.uniform();

        let json = stream.get_state().to_json().unwrap();
        let expected: Vec<ItemId> = (0..10).map(|_| stream.item(50)).collect();

        let mut restored = MaskingRng::from_seed(2);
        restored.set_state(RngState::from_json(&json).unwrap());
        let replayed: Vec<ItemId> = (0..10).map(|_| restored.item(50)).collect();

        assert_eq!(expected, replayed);
    }

    #[test]
    fn item_draws_stay_in_range() {
        let mut stream = MaskingRng::from_seed(3);

        for _ in 0..1000 {
            let item = stream.item(7);
            assert!(item >= 1 && item <= 7);
        }
    }

    #[test]
    fn negative_labels_follow_labels() {
        let mut sampler = UniformNegativeSampler::new(5, rng_from_seed(4)).unwrap();
        let labels = vec![0, 3, 0, 5, 1];

        for _ in 0..100 {
            let negatives = sampler.negative_labels(&labels);

            assert_eq!(negatives.len(), labels.len());
            for (&label, &negative) in labels.iter().zip(negatives.iter()) {
                if label == 0 {
                    assert_eq!(negative, 0);
                } else {
                    assert!(negative != label);
                    assert!(negative >= 1 && negative <= 5);
                }
            }
        }
    }

    #[test]
    fn negative_sampler_needs_items() {
        assert!(UniformNegativeSampler::new(0, rng_from_seed(5)).is_err());
    }

    #[test]
    fn evaluation_negatives_are_unseen_and_distinct() {
        let data = Interactions::from_sequences(&[vec![1, 2, 3], vec![4, 5, 6, 7, 8, 9, 10]])
            .to_compressed();
        let negatives = sample_evaluation_negatives(&data, 4, &mut rng_from_seed(6));

        let first = &negatives[&0];
        assert_eq!(first.len(), 4);
        assert!(first.iter().all(|item| *item > 3 && *item <= 10));
        let distinct: HashSet<_> = first.iter().collect();
        assert_eq!(distinct.len(), 4);

        // Only items 1, 2 and 3 are unseen for the second user.
        let mut second = negatives[&1].clone();
        second.sort();
        assert_eq!(second, vec![1, 2, 3]);
    }

    #[test]
    fn evaluation_negatives_are_reproducible() {
        let data = Interactions::from_sequences(&[vec![1, 2], vec![3, 4], vec![5]]).to_compressed();

        let first = sample_evaluation_negatives(&data, 2, &mut rng_from_seed(7));
        let second = sample_evaluation_negatives(&data, 2, &mut rng_from_seed(7));

        assert_eq!(first, second);
    }
}
