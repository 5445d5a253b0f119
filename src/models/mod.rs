use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::algorithms::initializer;

/// A single observed (user, item, target) triple.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub user_id: usize,
    pub item_id: usize,
    pub target: f32,
}

impl Interaction {
    pub fn new(user_id: usize, item_id: usize, target: f32) -> Self {
        Self {
            user_id,
            item_id,
            target,
        }
    }
}

/// Model inputs: parallel arrays of user and item ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub user_ids: Vec<usize>,
    pub item_ids: Vec<usize>,
}

impl Batch {
    pub fn new(user_ids: Vec<usize>, item_ids: Vec<usize>) -> Self {
        Self { user_ids, item_ids }
    }

    /// Splits interactions into model inputs and the matching targets.
    pub fn from_interactions(interactions: &[Interaction]) -> (Self, Vec<f32>) {
        let mut batch = Self {
            user_ids: Vec::with_capacity(interactions.len()),
            item_ids: Vec::with_capacity(interactions.len()),
        };
        let mut targets = Vec::with_capacity(interactions.len());

        for interaction in interactions {
            batch.user_ids.push(interaction.user_id);
            batch.item_ids.push(interaction.item_id);
            targets.push(interaction.target);
        }

        (batch, targets)
    }

    pub fn len(&self) -> usize {
        self.user_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.user_ids.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionSet {
    pub interactions: Vec<Interaction>,
    pub num_users: usize,
    pub num_items: usize,
}

impl InteractionSet {
    pub fn new(interactions: Vec<Interaction>, num_users: usize, num_items: usize) -> Self {
        Self {
            interactions,
            num_users,
            num_items,
        }
    }

    /// Builds a set whose id ranges are inferred from the largest ids seen.
    pub fn from_interactions(interactions: Vec<Interaction>) -> Self {
        let num_users = interactions.iter().map(|i| i.user_id + 1).max().unwrap_or(0);
        let num_items = interactions.iter().map(|i| i.item_id + 1).max().unwrap_or(0);
        Self::new(interactions, num_users, num_items)
    }

    /// Samples interactions scored by hidden ground-truth factors plus
    /// gaussian noise. Same seed, same data.
    pub fn synthetic(
        num_users: usize,
        num_items: usize,
        features: usize,
        count: usize,
        noise: f32,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let scale = 1.0 / (features.max(1) as f32).sqrt();

        let user_factors: Vec<Vec<f32>> = (0..num_users)
            .map(|_| initializer::normal(&mut rng, features, 0.0, 1.0))
            .collect();
        let item_factors: Vec<Vec<f32>> = (0..num_items)
            .map(|_| initializer::normal(&mut rng, features, 0.0, 1.0))
            .collect();
        let user_bias = initializer::normal(&mut rng, num_users, 0.0, 0.1);
        let item_bias = initializer::normal(&mut rng, num_items, 0.0, 0.1);

        let mut interactions = Vec::with_capacity(count);
        if num_users > 0 && num_items > 0 {
            for _ in 0..count {
                let user_id = rng.gen_range(0..num_users);
                let item_id = rng.gen_range(0..num_items);
                let affinity = crate::utils::dot(&user_factors[user_id], &item_factors[item_id]);
                let target = affinity * scale
                    + user_bias[user_id]
                    + item_bias[item_id]
                    + noise * initializer::standard_normal(&mut rng);
                interactions.push(Interaction::new(user_id, item_id, target));
            }
        }

        Self::new(interactions, num_users, num_items)
    }

    pub fn len(&self) -> usize {
        self.interactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interactions.is_empty()
    }

    /// Shuffles a copy with `seed` and holds out `validation_fraction` of it.
    /// Returns `(train, validation)`; both keep the full id ranges.
    pub fn split(&self, validation_fraction: f32, seed: u64) -> (Self, Self) {
        let mut shuffled = self.interactions.clone();
        shuffled.shuffle(&mut StdRng::seed_from_u64(seed));

        let fraction = validation_fraction.clamp(0.0, 1.0);
        let held_out = ((shuffled.len() as f32) * fraction).round() as usize;
        let train = shuffled.split_off(held_out);

        (
            Self::new(train, self.num_users, self.num_items),
            Self::new(shuffled, self.num_users, self.num_items),
        )
    }

    /// Cuts the set into mini-batches, shuffled when a seed is given.
    pub fn batches(&self, batch_size: usize, shuffle_seed: Option<u64>) -> Vec<(Batch, Vec<f32>)> {
        let batch_size = batch_size.max(1);
        let mut order: Vec<Interaction> = self.interactions.clone();
        if let Some(seed) = shuffle_seed {
            order.shuffle(&mut StdRng::seed_from_u64(seed));
        }

        order
            .chunks(batch_size)
            .map(Batch::from_interactions)
            .collect()
    }

    /// Items each user has interacted with, indexed by user id.
    pub fn items_by_user(&self) -> Vec<Vec<usize>> {
        let mut seen = vec![Vec::new(); self.num_users];
        for interaction in &self.interactions {
            if let Some(items) = seen.get_mut(interaction.user_id) {
                items.push(interaction.item_id);
            }
        }
        seen
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochStats {
    pub epoch: usize,
    pub train_loss: f32,
    pub validation_loss: Option<f32>,
    pub steps: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub epochs: Vec<EpochStats>,
    pub best_epoch: Option<usize>,
    pub stopped_early: bool,
}

impl TrainingReport {
    pub fn final_train_loss(&self) -> Option<f32> {
        self.epochs.last().map(|e| e.train_loss)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub loss: f32,
    pub rmse: f64,
    pub mae: f64,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub item_id: usize,
    pub score: f32,
}
