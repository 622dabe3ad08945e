//! Masked-sequence datasets.
//!
//! Training examples are built cloze-style: a random subset of positions is
//! hidden behind the MASK sentinel (or corrupted, or left intact) and the
//! original ids become the supervision labels. Evaluation examples mask only
//! the final position and pair it with a fixed list of negative candidates.
//!
//! All sequences are left-padded with id `0` to `max_len`.
use std::collections::HashMap;

use data::{CompressedInteractions, DataError};
use sampling::{MaskingRng, RngState};
use {ItemId, UserId};

/// Reserved ids surrounding the item vocabulary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokens {
    /// Padding id.
    pub padding: ItemId,
    /// Id standing in for a position the model has to predict.
    pub mask: ItemId,
}

impl SpecialTokens {
    /// Tokens for a vocabulary of items `1..=num_items`.
    pub fn new(num_items: usize) -> Self {
        SpecialTokens {
            padding: 0,
            mask: num_items + 1,
        }
    }

    /// Number of distinct ids, including padding and the mask.
    pub fn vocab_size(&self) -> usize {
        self.mask + 1
    }
}

/// Parameters of the masking pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MaskingParameters {
    max_len: usize,
    mask_prob: f64,
    train_window: usize,
    seed: u64,
}

impl MaskingParameters {
    /// Build new parameters for sequences of at most `max_len` items.
    pub fn new(max_len: usize) -> Self {
        MaskingParameters {
            max_len: max_len,
            mask_prob: 0.2,
            train_window: 0,
            seed: 42,
        }
    }

    /// Set the probability of selecting a position for prediction.
    pub fn mask_prob(mut self, mask_prob: f64) -> Self {
        self.mask_prob = mask_prob;
        self
    }

    /// Set the stride between training windows of a user. `0` disables
    /// windowing.
    pub fn train_window(mut self, train_window: usize) -> Self {
        self.train_window = train_window;
        self
    }

    /// Set the seed of the masking stream.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Maximum sequence length.
    pub fn max_len(&self) -> usize {
        self.max_len
    }
}

/// Dense map from example index to `(user, exclusive offset)`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TrainingIndex {
    entries: Vec<(UserId, usize)>,
}

/// Offsets generated for one training target: `position`, then receding by
/// `window` for as long as the offset is at least `max_len`.
///
/// A zero window, or a position too short to produce any offset, yields the
/// position alone.
pub fn window_offsets(position: usize, max_len: usize, window: usize) -> Vec<usize> {
    if window == 0 {
        return vec![position];
    }

    let mut offsets = Vec::new();
    let mut offset = position;

    while offset >= max_len {
        offsets.push(offset);

        if offset < window {
            break;
        }
        offset -= window;
    }

    if offsets.is_empty() {
        offsets.push(position);
    }

    offsets
}

impl TrainingIndex {
    /// Expand `(user, offset)` targets into windowed training examples.
    pub fn new(targets: &[(UserId, usize)], max_len: usize, window: usize) -> Self {
        let entries: Vec<_> = targets
            .iter()
            .flat_map(|&(user_id, position)| {
                window_offsets(position, max_len, window)
                    .into_iter()
                    .map(move |offset| (user_id, offset))
            })
            .collect();

        debug!(
            "Built {} training examples from {} targets",
            entries.len(),
            targets.len()
        );

        TrainingIndex { entries }
    }

    /// Number of examples.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The `(user, offset)` pair of an example.
    pub fn get(&self, index: usize) -> Option<(UserId, usize)> {
        self.entries.get(index).cloned()
    }
}

fn left_pad(mut ids: Vec<ItemId>, len: usize) -> Vec<ItemId> {
    if ids.len() >= len {
        let excess = ids.len() - len;
        return ids.split_off(excess);
    }

    let mut padded = vec![0; len - ids.len()];
    padded.append(&mut ids);
    padded
}

/// One training example.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainExample {
    /// Masked input ids, left-padded to `max_len`.
    pub tokens: Vec<ItemId>,
    /// Original ids at masked positions, `0` elsewhere.
    pub labels: Vec<ItemId>,
    /// The unmasked sequence without its final item, left-padded to `max_len`.
    pub decoder_tokens: Vec<ItemId>,
}

/// Training examples with randomized masking.
pub struct TrainDataset<'a> {
    interactions: &'a CompressedInteractions,
    index: TrainingIndex,
    max_len: usize,
    mask_prob: f64,
    num_items: usize,
    special_tokens: SpecialTokens,
    rng: MaskingRng,
}

impl<'a> TrainDataset<'a> {
    /// Build the dataset over `targets`, pairs of user and exclusive offset.
    ///
    /// Fails when there are no items to draw random replacements from.
    pub fn new(
        interactions: &'a CompressedInteractions,
        parameters: &MaskingParameters,
        special_tokens: SpecialTokens,
        targets: &[(UserId, usize)],
    ) -> Result<Self, DataError> {
        if interactions.num_items() == 0 {
            return Err(DataError::NoItems);
        }

        Ok(TrainDataset {
            interactions: interactions,
            index: TrainingIndex::new(targets, parameters.max_len, parameters.train_window),
            max_len: parameters.max_len,
            mask_prob: parameters.mask_prob,
            num_items: interactions.num_items(),
            special_tokens: special_tokens,
            rng: MaskingRng::from_seed(parameters.seed),
        })
    }

    /// Replace the masking stream.
    pub fn with_rng(mut self, rng: MaskingRng) -> Self {
        self.rng = rng;
        self
    }

    /// Number of examples.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the dataset is empty.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// The windowed example index.
    pub fn index(&self) -> &TrainingIndex {
        &self.index
    }

    /// Capture the masking stream.
    pub fn get_rng_state(&self) -> RngState {
        self.rng.get_state()
    }

    /// Restore the masking stream.
    pub fn set_rng_state(&mut self, state: RngState) {
        self.rng.set_state(state)
    }

    /// Build example `index`, advancing the masking stream.
    ///
    /// Each position draws one uniform value; a position replaced by a random
    /// item draws a second one.
    pub fn get(&mut self, index: usize) -> Result<TrainExample, DataError> {
        let (user_id, offset) = self.index.get(index).ok_or_else(|| DataError::IndexOutOfRange {
            index: index,
            len: self.index.len(),
        })?;
        let user = self.interactions
            .get_user(user_id)
            .ok_or_else(|| DataError::UnknownUser { user_id })?;

        if offset > user.len() {
            return Err(DataError::PositionOutOfRange {
                user_id: user_id,
                position: offset,
                len: user.len(),
            });
        }

        let start = offset.saturating_sub(self.max_len);
        let sequence = &user.item_ids[start..offset];

        let mut tokens = Vec::with_capacity(sequence.len());
        let mut labels = Vec::with_capacity(sequence.len());

        for &item_id in sequence {
            let prob = self.rng.uniform();

            if prob < self.mask_prob {
                let prob = prob / self.mask_prob;

                let token = if prob < 0.8 {
                    self.special_tokens.mask
                } else if prob < 0.9 {
                    self.rng.item(self.num_items)
                } else {
                    item_id
                };

                tokens.push(token);
                labels.push(item_id);
            } else {
                tokens.push(item_id);
                labels.push(0);
            }
        }

        let decoder_tokens = sequence[..sequence.len().saturating_sub(1)].to_vec();

        Ok(TrainExample {
            tokens: left_pad(tokens, self.max_len),
            labels: left_pad(labels, self.max_len),
            decoder_tokens: left_pad(decoder_tokens, self.max_len),
        })
    }
}

/// One evaluation example.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalExample {
    /// Input ids ending in the MASK sentinel, left-padded to `max_len`.
    pub tokens: Vec<ItemId>,
    /// The held-out item followed by the user's negatives.
    pub candidates: Vec<ItemId>,
    /// `1` for the held-out item, `0` for every negative.
    pub labels: Vec<usize>,
    /// `tokens` shifted right by one position, dropping the MASK sentinel.
    pub decoder_tokens: Vec<ItemId>,
}

/// Evaluation examples at fixed `(user, position)` targets.
pub struct EvalDataset<'a> {
    interactions: &'a CompressedInteractions,
    negatives: &'a HashMap<UserId, Vec<ItemId>>,
    positions: &'a [(UserId, usize)],
    max_len: usize,
    special_tokens: SpecialTokens,
}

impl<'a> EvalDataset<'a> {
    /// Build the dataset. `positions` are inclusive positions of the item to
    /// predict.
    pub fn new(
        interactions: &'a CompressedInteractions,
        parameters: &MaskingParameters,
        special_tokens: SpecialTokens,
        negatives: &'a HashMap<UserId, Vec<ItemId>>,
        positions: &'a [(UserId, usize)],
    ) -> Self {
        EvalDataset {
            interactions,
            negatives,
            positions,
            max_len: parameters.max_len,
            special_tokens,
        }
    }

    /// Number of examples.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Whether the dataset is empty.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Build example `index`.
    pub fn get(&self, index: usize) -> Result<EvalExample, DataError> {
        let &(user_id, position) = self.positions.get(index).ok_or_else(|| {
            DataError::IndexOutOfRange {
                index: index,
                len: self.positions.len(),
            }
        })?;
        let user = self.interactions
            .get_user(user_id)
            .ok_or_else(|| DataError::UnknownUser { user_id })?;

        if position >= user.len() {
            return Err(DataError::PositionOutOfRange {
                user_id: user_id,
                position: position,
                len: user.len(),
            });
        }

        let negatives = self.negatives
            .get(&user_id)
            .ok_or_else(|| DataError::MissingNegatives { user_id })?;

        let start = (position + 1).saturating_sub(self.max_len);
        let mut sequence = user.item_ids[start..position + 1].to_vec();

        let answer = sequence[sequence.len() - 1];
        let mut candidates = Vec::with_capacity(1 + negatives.len());
        candidates.push(answer);
        candidates.extend_from_slice(negatives);

        let mut labels = vec![0; candidates.len()];
        labels[0] = 1;

        let last = sequence.len() - 1;
        sequence[last] = self.special_tokens.mask;
        let tokens = left_pad(sequence, self.max_len);

        let decoder_tokens = left_pad(
            tokens[..tokens.len().saturating_sub(1)].to_vec(),
            self.max_len,
        );

        Ok(EvalExample {
            tokens,
            candidates,
            labels,
            decoder_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data::Interactions;

    fn fixture() -> CompressedInteractions {
        Interactions::from_sequences(&[
            vec![3, 5, 7, 9, 11],
            (1..30).collect(),
            vec![],
            vec![8],
        ]).to_compressed()
    }

    #[test]
    fn window_offsets_recede() {
        assert_eq!(window_offsets(20, 5, 3), vec![20, 17, 14, 11, 8, 5]);
        assert_eq!(window_offsets(20, 5, 0), vec![20]);
        assert_eq!(window_offsets(3, 5, 2), vec![3]);
        assert_eq!(window_offsets(5, 5, 10), vec![5]);
        assert_eq!(window_offsets(4, 0, 2), vec![4, 2, 0]);
    }

    #[test]
    fn training_index_is_dense() {
        let index = TrainingIndex::new(&[(0, 20), (1, 3)], 5, 3);

        assert_eq!(index.len(), 7);
        assert_eq!(index.get(0), Some((0, 20)));
        assert_eq!(index.get(5), Some((0, 5)));
        assert_eq!(index.get(6), Some((1, 3)));
        assert_eq!(index.get(7), None);
    }

    #[test]
    fn training_examples_have_fixed_length() {
        let data = fixture();
        let parameters = MaskingParameters::new(8).mask_prob(0.5).train_window(4);
        let tokens = SpecialTokens::new(data.num_items());
        let targets = [(0, 3), (1, 27), (2, 0), (3, 1)];
        let mut dataset = TrainDataset::new(&data, &parameters, tokens, &targets).unwrap();

        assert!(dataset.len() > targets.len());

        for index in 0..dataset.len() {
            let example = dataset.get(index).unwrap();

            assert_eq!(example.tokens.len(), 8);
            assert_eq!(example.labels.len(), 8);
            assert_eq!(example.decoder_tokens.len(), 8);
        }
    }

    #[test]
    fn masked_positions_follow_the_replacement_split() {
        let data = fixture();
        let num_items = data.num_items();
        let parameters = MaskingParameters::new(10).mask_prob(1.0).seed(11);
        let special_tokens = SpecialTokens::new(num_items);
        let mut dataset = TrainDataset::new(&data, &parameters, special_tokens, &[(1, 25)]).unwrap();

        // The unmasked inputs are items 16..=25.
        let original: Vec<ItemId> = (16..26).collect();
        let (mut masked, mut kept, mut replaced) = (0, 0, 0);

        for _ in 0..500 {
            let example = dataset.get(0).unwrap();
            assert_eq!(example.labels, original);

            for (&token, &item) in example.tokens.iter().zip(original.iter()) {
                if token == special_tokens.mask {
                    masked += 1;
                } else if token == item {
                    kept += 1;
                } else {
                    assert!(token >= 1 && token <= num_items);
                    replaced += 1;
                }
            }
        }

        // 5000 positions: 80% masked, 10% random, 10% kept. A random draw
        // equal to the original item counts as kept.
        assert_eq!(masked + kept + replaced, 5000);
        assert!(masked > 3800 && masked < 4200, "masked {}", masked);
        assert!(kept > 400 && kept < 650, "kept {}", kept);
        assert!(replaced > 350 && replaced < 600, "replaced {}", replaced);
    }

    #[test]
    fn unmasked_positions_are_unsupervised() {
        let data = fixture();
        let parameters = MaskingParameters::new(10).mask_prob(0.3).seed(5);
        let special_tokens = SpecialTokens::new(data.num_items());
        let mut dataset = TrainDataset::new(&data, &parameters, special_tokens, &[(1, 25)]).unwrap();
        let original: Vec<ItemId> = (16..26).collect();

        for _ in 0..100 {
            let example = dataset.get(0).unwrap();

            for (&token, &label, &item) in izip!(&example.tokens, &example.labels, &original) {
                if label == 0 {
                    assert_eq!(token, item);
                } else {
                    assert_eq!(label, item);
                }
            }
        }
    }

    #[test]
    fn training_offset_past_the_sequence_is_an_error() {
        let data = fixture();
        let parameters = MaskingParameters::new(4);
        let tokens = SpecialTokens::new(data.num_items());
        let mut dataset = TrainDataset::new(&data, &parameters, tokens, &[(0, 100), (0, 5)]).unwrap();

        match dataset.get(0) {
            Err(DataError::PositionOutOfRange {
                user_id,
                position,
                len,
            }) => {
                assert_eq!(user_id, 0);
                assert_eq!(position, 100);
                assert_eq!(len, 5);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(dataset.get(1).is_ok());
    }

    #[test]
    fn training_requires_items() {
        let data = Interactions::from_sequences(&[vec![0, 0], vec![]]).to_compressed();
        let parameters = MaskingParameters::new(4).mask_prob(1.0);
        let tokens = SpecialTokens::new(data.num_items());

        match TrainDataset::new(&data, &parameters, tokens, &[(0, 2)]) {
            Err(DataError::NoItems) => {}
            Err(other) => panic!("unexpected {:?}", other),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[test]
    fn training_example_truncates_and_pads() {
        let data = fixture();
        let parameters = MaskingParameters::new(4).mask_prob(0.0);
        let tokens = SpecialTokens::new(data.num_items());

        let mut dataset = TrainDataset::new(&data, &parameters, tokens, &[(0, 4), (0, 2)]).unwrap();

        let long = dataset.get(0).unwrap();
        assert_eq!(long.tokens, vec![3, 5, 7, 9]);
        assert_eq!(long.labels, vec![0, 0, 0, 0]);
        assert_eq!(long.decoder_tokens, vec![0, 3, 5, 7]);

        let short = dataset.get(1).unwrap();
        assert_eq!(short.tokens, vec![0, 0, 3, 5]);
        assert_eq!(short.decoder_tokens, vec![0, 0, 0, 3]);
    }

    #[test]
    fn empty_sequences_are_zero_filled() {
        let data = fixture();
        let parameters = MaskingParameters::new(4).mask_prob(1.0);
        let tokens = SpecialTokens::new(data.num_items());
        let mut dataset = TrainDataset::new(&data, &parameters, tokens, &[(2, 0), (0, 0)]).unwrap();

        for index in 0..2 {
            let example = dataset.get(index).unwrap();
            assert_eq!(example.tokens, vec![0; 4]);
            assert_eq!(example.labels, vec![0; 4]);
            assert_eq!(example.decoder_tokens, vec![0; 4]);
        }
    }

    #[test]
    fn full_masking_supervises_every_position() {
        let data = fixture();
        let parameters = MaskingParameters::new(6).mask_prob(1.0);
        let tokens = SpecialTokens::new(data.num_items());
        let mut dataset = TrainDataset::new(&data, &parameters, tokens, &[(0, 5)]).unwrap();

        let example = dataset.get(0).unwrap();

        assert_eq!(example.labels, vec![0, 3, 5, 7, 9, 11]);
    }

    #[test]
    fn masking_is_reproducible_from_saved_state() {
        let data = fixture();
        let parameters = MaskingParameters::new(10).mask_prob(0.4).train_window(2);
        let tokens = SpecialTokens::new(data.num_items());
        let targets = [(0, 4), (1, 28)];
        let mut dataset = TrainDataset::new(&data, &parameters, tokens, &targets).unwrap();

        dataset.get(0).unwrap();
        let state = dataset.get_rng_state();

        let first: Vec<_> = (0..dataset.len()).map(|idx| dataset.get(idx).unwrap()).collect();

        dataset.set_rng_state(state);
        let second: Vec<_> = (0..dataset.len()).map(|idx| dataset.get(idx).unwrap()).collect();

        assert_eq!(first, second);
    }

    #[test]
    fn same_seed_same_examples() {
        let data = fixture();
        let parameters = MaskingParameters::new(10).mask_prob(0.4).seed(7);
        let tokens = SpecialTokens::new(data.num_items());
        let targets = [(1, 28)];

        let mut first = TrainDataset::new(&data, &parameters, tokens, &targets).unwrap();
        let mut second = TrainDataset::new(&data, &parameters, tokens, &targets)
            .unwrap()
            .with_rng(MaskingRng::from_seed(7));

        for _ in 0..10 {
            assert_eq!(first.get(0).unwrap(), second.get(0).unwrap());
        }
    }

    #[test]
    fn training_index_errors() {
        let data = fixture();
        let parameters = MaskingParameters::new(4);
        let tokens = SpecialTokens::new(data.num_items());
        let mut dataset = TrainDataset::new(&data, &parameters, tokens, &[(9, 2)]).unwrap();

        assert!(dataset.get(1).is_err());
        assert!(dataset.get(0).is_err());
    }

    #[test]
    fn evaluation_example() {
        let data = fixture();
        let parameters = MaskingParameters::new(4);
        let tokens = SpecialTokens::new(data.num_items());
        let mut negatives = HashMap::new();
        negatives.insert(0, vec![2, 4]);
        negatives.insert(3, vec![1, 2, 3]);
        let positions = [(0, 4), (3, 0)];

        let dataset = EvalDataset::new(&data, &parameters, tokens, &negatives, &positions);
        assert_eq!(dataset.len(), 2);

        let example = dataset.get(0).unwrap();
        assert_eq!(example.candidates, vec![11, 2, 4]);
        assert_eq!(example.labels, vec![1, 0, 0]);
        assert_eq!(example.tokens, vec![5, 7, 9, tokens.mask]);
        assert_eq!(example.decoder_tokens, vec![0, 5, 7, 9]);

        let short = dataset.get(1).unwrap();
        assert_eq!(short.candidates, vec![8, 1, 2, 3]);
        assert_eq!(short.labels, vec![1, 0, 0, 0]);
        assert_eq!(short.tokens, vec![0, 0, 0, tokens.mask]);
    }

    #[test]
    fn evaluation_errors() {
        let data = fixture();
        let parameters = MaskingParameters::new(4);
        let tokens = SpecialTokens::new(data.num_items());
        let mut negatives = HashMap::new();
        negatives.insert(0, vec![2]);
        let positions = [(0, 5), (1, 3), (7, 0)];

        let dataset = EvalDataset::new(&data, &parameters, tokens, &negatives, &positions);

        match dataset.get(0) {
            Err(DataError::PositionOutOfRange { len, .. }) => assert_eq!(len, 5),
            other => panic!("unexpected {:?}", other),
        }
        match dataset.get(1) {
            Err(DataError::MissingNegatives { user_id }) => assert_eq!(user_id, 1),
            other => panic!("unexpected {:?}", other),
        }
        match dataset.get(2) {
            Err(DataError::UnknownUser { user_id }) => assert_eq!(user_id, 7),
            other => panic!("unexpected {:?}", other),
        }
        assert!(dataset.get(3).is_err());
    }
}
