use std::collections::{HashMap, HashSet};

use rayon::prelude::*;
use tracing::debug;

use crate::algorithms::{MatrixFactorisation, Params};
use crate::error::{ModelError, Result};
use crate::models::{InteractionSet, Recommendation};
use crate::services::training::MatrixFactorisationModel;
use crate::utils::metrics::{MetricsCalculator, RankingMetrics};
use crate::utils::validation::{validate_embedding_dimension, validate_finite};
use crate::utils::{cosine_similarity, top_k_indices};

/// Read-only scoring over a trained parameter set.
pub struct RecommendationService<'a> {
    model: &'a MatrixFactorisation,
    params: &'a Params,
}

impl<'a> RecommendationService<'a> {
    pub fn new(model: &'a MatrixFactorisationModel) -> Self {
        Self {
            model: model.model(),
            params: model.params(),
        }
    }

    pub fn from_parts(model: &'a MatrixFactorisation, params: &'a Params) -> Result<Self> {
        params.check_shapes(model.num_users, model.num_items, model.features)?;
        Ok(Self { model, params })
    }

    fn check_user(&self, user_id: usize) -> Result<()> {
        if user_id >= self.model.num_users {
            return Err(ModelError::IndexOutOfRange {
                kind: "user",
                id: user_id,
                len: self.model.num_users,
            });
        }
        Ok(())
    }

    fn check_item(&self, item_id: usize) -> Result<()> {
        if item_id >= self.model.num_items {
            return Err(ModelError::IndexOutOfRange {
                kind: "item",
                id: item_id,
                len: self.model.num_items,
            });
        }
        Ok(())
    }

    fn item_row(&self, item_id: usize) -> Vec<f32> {
        self.params.item.embedding.row(item_id).iter().copied().collect()
    }

    /// Scores every item for an arbitrary user vector and bias, e.g. one
    /// folded in for a user the model was not trained on.
    pub fn score_with_embedding(&self, embedding: &[f32], bias: f32) -> Result<Vec<f32>> {
        validate_embedding_dimension(embedding, self.model.features)?;
        validate_finite(embedding, "user embedding")?;
        validate_finite(&[bias], "user bias")?;

        let item_embedding = &self.params.item.embedding;
        let item_bias = &self.params.item.bias;
        Ok((0..self.model.num_items)
            .into_par_iter()
            .map(|i| {
                let affinity: f32 = item_embedding
                    .row(i)
                    .iter()
                    .zip(embedding)
                    .map(|(q, p)| q * p)
                    .sum();
                affinity + bias + item_bias[(i, 0)]
            })
            .collect())
    }

    pub fn score_items(&self, user_id: usize) -> Result<Vec<f32>> {
        self.check_user(user_id)?;
        let embedding: Vec<f32> = self.params.user.embedding.row(user_id).iter().copied().collect();
        self.score_with_embedding(&embedding, self.params.user.bias[(user_id, 0)])
    }

    /// Top `k` items for a user, best first, skipping `exclude`.
    pub fn recommend(&self, user_id: usize, k: usize, exclude: &[usize]) -> Result<Vec<Recommendation>> {
        let scores = self.score_items(user_id)?;
        let excluded: HashSet<usize> = exclude.iter().copied().collect();

        let candidates: Vec<(usize, f32)> = scores
            .into_iter()
            .enumerate()
            .filter(|(item_id, _)| !excluded.contains(item_id))
            .collect();
        let candidate_scores: Vec<f32> = candidates.iter().map(|(_, s)| *s).collect();

        let recommendations: Vec<Recommendation> = top_k_indices(&candidate_scores, k)
            .into_iter()
            .map(|idx| Recommendation {
                item_id: candidates[idx].0,
                score: candidates[idx].1,
            })
            .collect();

        debug!(user_id, k, excluded = excluded.len(), returned = recommendations.len(), "recommended");
        Ok(recommendations)
    }

    /// Top-`k` ranking quality against held-out interactions, averaged over
    /// users with at least one relevant item.
    ///
    /// An interaction is relevant when its target exceeds `threshold`, with
    /// gain `target - threshold` for NDCG. Items in `seen[user]` are excluded
    /// from that user's ranking. Returns `None` when no user has a relevant
    /// item.
    pub fn evaluate_ranking(
        &self,
        held_out: &InteractionSet,
        seen: &[Vec<usize>],
        k: usize,
        threshold: f32,
    ) -> Result<Option<RankingMetrics>> {
        let mut relevant_by_user: HashMap<usize, HashMap<usize, f64>> = HashMap::new();
        for interaction in held_out.interactions.iter().filter(|i| i.target > threshold) {
            self.check_user(interaction.user_id)?;
            relevant_by_user
                .entry(interaction.user_id)
                .or_default()
                .insert(interaction.item_id, (interaction.target - threshold) as f64);
        }
        if relevant_by_user.is_empty() {
            return Ok(None);
        }

        let calculator = MetricsCalculator::new(k);
        let mut users: Vec<_> = relevant_by_user.into_iter().collect();
        users.sort_unstable_by_key(|(user_id, _)| *user_id);

        let per_user = users
            .par_iter()
            .map(|(user_id, gains)| -> Result<RankingMetrics> {
                let exclude = seen.get(*user_id).map(Vec::as_slice).unwrap_or(&[]);
                let recommended: Vec<usize> = self
                    .recommend(*user_id, k, exclude)?
                    .into_iter()
                    .map(|r| r.item_id)
                    .collect();
                let relevant: Vec<usize> = gains.keys().copied().collect();
                Ok(calculator.calculate_all_metrics(&recommended, &relevant, gains))
            })
            .collect::<Result<Vec<_>>>()?;

        let n = per_user.len() as f64;
        let mean = |f: fn(&RankingMetrics) -> f64| per_user.iter().map(f).sum::<f64>() / n;
        let metrics = RankingMetrics {
            precision_at_k: mean(|m| m.precision_at_k),
            recall_at_k: mean(|m| m.recall_at_k),
            f1_score: mean(|m| m.f1_score),
            ndcg_at_k: mean(|m| m.ndcg_at_k),
            map_at_k: mean(|m| m.map_at_k),
        };
        debug!(users = per_user.len(), k, "ranking evaluated");
        Ok(Some(metrics))
    }

    /// Items closest to `item_id` by cosine similarity of their embeddings.
    pub fn similar_items(&self, item_id: usize, k: usize) -> Result<Vec<Recommendation>> {
        self.check_item(item_id)?;
        let query = self.item_row(item_id);

        let similarities: Vec<f32> = (0..self.model.num_items)
            .into_par_iter()
            .map(|i| {
                if i == item_id {
                    f32::NAN
                } else {
                    cosine_similarity(&query, &self.item_row(i))
                }
            })
            .collect();

        Ok(top_k_indices(&similarities, k)
            .into_iter()
            .filter(|&i| i != item_id)
            .map(|i| Recommendation {
                item_id: i,
                score: similarities[i],
            })
            .collect())
    }
}
