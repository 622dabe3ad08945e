//! Interaction data and per-user sequences.
//!
//! Raw `(user, item, timestamp)` triplets are collected into [`Interactions`]
//! and compressed into per-user chronological item sequences
//! ([`CompressedInteractions`]), which every dataset in this crate reads from.
use std::cmp::Ordering;
use std::path::Path;

use csv;
use failure;

use super::{ItemId, Timestamp, UserId};

/// Data error types.
#[derive(Debug, Fail)]
pub enum DataError {
    /// The user has no sequence.
    #[fail(display = "Unknown user: {}.", user_id)]
    UnknownUser {
        /// The missing user.
        user_id: UserId,
    },
    /// The requested position lies outside the user's sequence.
    #[fail(
        display = "Position {} out of range for user {} with {} interactions.",
        position,
        user_id,
        len
    )]
    PositionOutOfRange {
        /// The user.
        user_id: UserId,
        /// The requested position.
        position: usize,
        /// Length of the user's sequence.
        len: usize,
    },
    /// No evaluation negatives were supplied for the user.
    #[fail(display = "No negative samples for user {}.", user_id)]
    MissingNegatives {
        /// The user.
        user_id: UserId,
    },
    /// Sampling requires at least one item.
    #[fail(display = "Cannot sample from an empty item set.")]
    NoItems,
    /// Example index past the end of a dataset.
    #[fail(display = "Example {} out of range for dataset of length {}.", index, len)]
    IndexOutOfRange {
        /// The requested index.
        index: usize,
        /// Dataset length.
        len: usize,
    },
}

/// A single user-item interaction.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct Interaction {
    user_id: UserId,
    item_id: ItemId,
    timestamp: Timestamp,
}

impl Interaction {
    /// Build a new interaction.
    pub fn new(user_id: UserId, item_id: ItemId, timestamp: Timestamp) -> Self {
        Interaction {
            user_id,
            item_id,
            timestamp,
        }
    }
}

impl Interaction {
    fn user_id(&self) -> UserId {
        self.user_id
    }
    fn item_id(&self) -> ItemId {
        self.item_id
    }
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// An unordered collection of interactions.
pub struct Interactions {
    num_users: usize,
    num_items: usize,
    interactions: Vec<Interaction>,
}

impl Interactions {
    /// Build an empty collection for the given number of users and items.
    pub fn new(num_users: usize, num_items: usize) -> Self {
        Interactions {
            num_users: num_users,
            num_items: num_items,
            interactions: Vec::new(),
        }
    }

    /// Build interactions from per-user item sequences.
    ///
    /// The user id is the index of the sequence and the timestamp the
    /// position of the item within it.
    pub fn from_sequences(sequences: &[Vec<ItemId>]) -> Self {
        let interactions: Vec<_> = sequences
            .iter()
            .enumerate()
            .flat_map(|(user_id, items)| {
                items
                    .iter()
                    .enumerate()
                    .map(move |(timestamp, &item_id)| Interaction::new(user_id, item_id, timestamp))
            })
            .collect();
        let num_items = interactions.iter().map(|x| x.item_id()).max().unwrap_or(0);

        Interactions {
            num_users: sequences.len(),
            num_items: num_items,
            interactions: interactions,
        }
    }

    /// Read interactions from a CSV file with `user_id,item_id,timestamp` columns.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self, failure::Error> {
        let mut reader = csv::Reader::from_path(path)?;
        let interactions: Vec<Interaction> = reader.deserialize().collect::<Result<Vec<_>, _>>()?;

        debug!("Read {} interactions", interactions.len());

        Ok(Interactions::from(interactions))
    }

    /// Add an interaction.
    pub fn push(&mut self, interaction: Interaction) {
        self.num_users = self.num_users.max(interaction.user_id() + 1);
        self.num_items = self.num_items.max(interaction.item_id());
        self.interactions.push(interaction);
    }

    /// Return the underlying interactions.
    pub fn data(&self) -> &[Interaction] {
        &self.interactions
    }

    /// Number of interactions.
    pub fn len(&self) -> usize {
        self.interactions.len()
    }

    /// Whether there are no interactions.
    pub fn is_empty(&self) -> bool {
        self.interactions.is_empty()
    }

    /// Compress into per-user chronological sequences.
    pub fn to_compressed(&self) -> CompressedInteractions {
        CompressedInteractions::from(self)
    }

    /// Number of users.
    pub fn num_users(&self) -> usize {
        self.num_users
    }

    /// Number of items: the largest item id, as ids start at 1.
    pub fn num_items(&self) -> usize {
        self.num_items
    }
}

impl From<Vec<Interaction>> for Interactions {
    fn from(data: Vec<Interaction>) -> Interactions {
        let num_users = data.iter().map(|x| x.user_id() + 1).max().unwrap_or(0);
        let num_items = data.iter().map(|x| x.item_id()).max().unwrap_or(0);

        Interactions {
            num_users: num_users,
            num_items: num_items,
            interactions: data,
        }
    }
}

fn cmp_timestamp(x: &Interaction, y: &Interaction) -> Ordering {
    let uid_comparison = x.user_id().cmp(&y.user_id());

    if uid_comparison == Ordering::Equal {
        x.timestamp().cmp(&y.timestamp())
    } else {
        uid_comparison
    }
}

/// Interactions stored as one chronological item sequence per user.
#[derive(Clone, Debug)]
pub struct CompressedInteractions {
    num_users: usize,
    num_items: usize,
    user_pointers: Vec<usize>,
    item_ids: Vec<ItemId>,
}

impl<'a> From<&'a Interactions> for CompressedInteractions {
    fn from(interactions: &Interactions) -> CompressedInteractions {
        let mut data = interactions.data().to_owned();

        // Stable, so equal timestamps keep insertion order.
        data.sort_by(cmp_timestamp);

        let mut user_pointers = vec![0; interactions.num_users + 1];
        let mut item_ids = Vec::with_capacity(data.len());

        for datum in &data {
            item_ids.push(datum.item_id());

            user_pointers[datum.user_id() + 1] += 1;
        }

        for idx in 1..user_pointers.len() {
            user_pointers[idx] += user_pointers[idx - 1];
        }

        CompressedInteractions {
            num_users: interactions.num_users,
            num_items: interactions.num_items,
            user_pointers: user_pointers,
            item_ids: item_ids,
        }
    }
}

impl CompressedInteractions {
    /// Iterate over all users, including users with no interactions.
    pub fn iter_users(&self) -> CompressedInteractionsUserIterator {
        CompressedInteractionsUserIterator {
            interactions: &self,
            idx: 0,
        }
    }

    /// Return the sequence of a single user.
    pub fn get_user(&self, user_id: UserId) -> Option<CompressedInteractionsUser> {
        if user_id >= self.num_users {
            return None;
        }

        let start = self.user_pointers[user_id];
        let stop = self.user_pointers[user_id + 1];

        Some(CompressedInteractionsUser {
            user_id: user_id,
            item_ids: &self.item_ids[start..stop],
        })
    }

    /// Number of users.
    pub fn num_users(&self) -> usize {
        self.num_users
    }

    /// Number of items: the largest item id, as ids start at 1.
    pub fn num_items(&self) -> usize {
        self.num_items
    }
}

/// Iterator over the users of a `CompressedInteractions`.
pub struct CompressedInteractionsUserIterator<'a> {
    interactions: &'a CompressedInteractions,
    idx: usize,
}

/// Read-only view of one user's chronological sequence.
#[derive(Debug)]
pub struct CompressedInteractionsUser<'a> {
    /// The user.
    pub user_id: UserId,
    /// Items, oldest first.
    pub item_ids: &'a [ItemId],
}

impl<'a> CompressedInteractionsUser<'a> {
    /// Length of the sequence.
    pub fn len(&self) -> usize {
        self.item_ids.len()
    }

    /// Whether the user has no interactions.
    pub fn is_empty(&self) -> bool {
        self.item_ids.is_empty()
    }
}

impl<'a> Iterator for CompressedInteractionsUserIterator<'a> {
    type Item = CompressedInteractionsUser<'a>;
    fn next(&mut self) -> Option<Self::Item> {
        let value = if self.idx >= self.interactions.num_users {
            None
        } else {
            let start = self.interactions.user_pointers[self.idx];
            let stop = self.interactions.user_pointers[self.idx + 1];

            Some(CompressedInteractionsUser {
                user_id: self.idx,
                item_ids: &self.interactions.item_ids[start..stop],
            })
        };

        self.idx += 1;

        value
    }
}

/// Leave-one-out targets.
///
/// For a user with `n` interactions the last item is held out for testing
/// and the one before it for validation. Training examples use the
/// exclusive offset `n - 2`, so neither held-out item is ever trained on.
/// Users with fewer than three interactions are skipped.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaveOneOut {
    train: Vec<(UserId, usize)>,
    validation: Vec<(UserId, usize)>,
    test: Vec<(UserId, usize)>,
}

impl LeaveOneOut {
    /// `(user, exclusive offset)` pairs for training.
    pub fn train(&self) -> &[(UserId, usize)] {
        &self.train
    }

    /// `(user, position)` pairs for validation.
    pub fn validation(&self) -> &[(UserId, usize)] {
        &self.validation
    }

    /// `(user, position)` pairs for testing.
    pub fn test(&self) -> &[(UserId, usize)] {
        &self.test
    }
}

impl<'a> From<&'a CompressedInteractions> for LeaveOneOut {
    fn from(interactions: &CompressedInteractions) -> Self {
        let mut train = Vec::new();
        let mut validation = Vec::new();
        let mut test = Vec::new();

        for user in interactions.iter_users().filter(|user| user.len() >= 3) {
            let n = user.len();

            train.push((user.user_id, n - 2));
            validation.push((user.user_id, n - 2));
            test.push((user.user_id, n - 1));
        }

        debug!(
            "Leave-one-out split over {} of {} users",
            train.len(),
            interactions.num_users()
        );

        LeaveOneOut {
            train,
            validation,
            test,
        }
    }
}
