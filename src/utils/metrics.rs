use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

pub fn rmse(targets: &[f32], predictions: &[f32]) -> f64 {
    if targets.is_empty() || targets.len() != predictions.len() {
        return 0.0;
    }
    let sum: f64 = targets
        .iter()
        .zip(predictions)
        .map(|(y, p)| ((p - y) as f64).powi(2))
        .sum();
    (sum / targets.len() as f64).sqrt()
}

pub fn mae(targets: &[f32], predictions: &[f32]) -> f64 {
    if targets.is_empty() || targets.len() != predictions.len() {
        return 0.0;
    }
    let sum: f64 = targets
        .iter()
        .zip(predictions)
        .map(|(y, p)| ((p - y) as f64).abs())
        .sum();
    sum / targets.len() as f64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingMetrics {
    pub precision_at_k: f64,
    pub recall_at_k: f64,
    pub f1_score: f64,
    pub ndcg_at_k: f64,
    pub map_at_k: f64,
}

/// Top-k ranking metrics over item ids.
#[derive(Debug, Clone)]
pub struct MetricsCalculator {
    k: usize,
}

impl MetricsCalculator {
    pub fn new(k: usize) -> Self {
        Self { k }
    }

    pub fn calculate_precision_at_k(&self, recommended: &[usize], relevant: &[usize]) -> f64 {
        if recommended.is_empty() || self.k == 0 {
            return 0.0;
        }

        let relevant_set: HashSet<_> = relevant.iter().collect();
        let relevant_recommended = recommended
            .iter()
            .take(self.k)
            .filter(|item| relevant_set.contains(item))
            .count();

        relevant_recommended as f64 / self.k.min(recommended.len()) as f64
    }

    pub fn calculate_recall_at_k(&self, recommended: &[usize], relevant: &[usize]) -> f64 {
        if relevant.is_empty() {
            return 0.0;
        }

        let relevant_set: HashSet<_> = relevant.iter().collect();
        let relevant_recommended = recommended
            .iter()
            .take(self.k)
            .filter(|item| relevant_set.contains(item))
            .count();

        relevant_recommended as f64 / relevant_set.len() as f64
    }

    pub fn calculate_f1_score(&self, precision: f64, recall: f64) -> f64 {
        if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        }
    }

    pub fn calculate_ndcg_at_k(
        &self,
        recommended: &[usize],
        relevant_scores: &HashMap<usize, f64>,
    ) -> f64 {
        let dcg = self.calculate_dcg(recommended, relevant_scores);
        let idcg = self.calculate_ideal_dcg(relevant_scores);

        if idcg == 0.0 {
            0.0
        } else {
            dcg / idcg
        }
    }

    // rank r (0-based) is discounted by log2(r + 2)
    fn calculate_dcg(&self, recommended: &[usize], relevant_scores: &HashMap<usize, f64>) -> f64 {
        recommended
            .iter()
            .take(self.k)
            .enumerate()
            .map(|(rank, item_id)| {
                let relevance = relevant_scores.get(item_id).copied().unwrap_or(0.0);
                relevance / ((rank + 2) as f64).log2()
            })
            .sum()
    }

    fn calculate_ideal_dcg(&self, relevant_scores: &HashMap<usize, f64>) -> f64 {
        let mut scores: Vec<f64> = relevant_scores.values().copied().collect();
        scores.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

        scores
            .iter()
            .take(self.k)
            .enumerate()
            .map(|(rank, &score)| score / ((rank + 2) as f64).log2())
            .sum()
    }

    pub fn calculate_map(&self, all_recommended: &[Vec<usize>], all_relevant: &[Vec<usize>]) -> f64 {
        if all_recommended.len() != all_relevant.len() || all_recommended.is_empty() {
            return 0.0;
        }

        let total_ap: f64 = all_recommended
            .iter()
            .zip(all_relevant.iter())
            .map(|(recommended, relevant)| self.calculate_average_precision(recommended, relevant))
            .sum();

        total_ap / all_recommended.len() as f64
    }

    fn calculate_average_precision(&self, recommended: &[usize], relevant: &[usize]) -> f64 {
        if relevant.is_empty() {
            return 0.0;
        }

        let relevant_set: HashSet<_> = relevant.iter().collect();
        let mut relevant_found = 0;
        let mut precision_sum = 0.0;

        for (i, item) in recommended.iter().take(self.k).enumerate() {
            if relevant_set.contains(item) {
                relevant_found += 1;
                precision_sum += relevant_found as f64 / (i + 1) as f64;
            }
        }

        precision_sum / relevant_set.len().min(self.k) as f64
    }

    pub fn calculate_all_metrics(
        &self,
        recommended: &[usize],
        relevant: &[usize],
        relevant_scores: &HashMap<usize, f64>,
    ) -> RankingMetrics {
        let precision = self.calculate_precision_at_k(recommended, relevant);
        let recall = self.calculate_recall_at_k(recommended, relevant);

        RankingMetrics {
            precision_at_k: precision,
            recall_at_k: recall,
            f1_score: self.calculate_f1_score(precision, recall),
            ndcg_at_k: self.calculate_ndcg_at_k(recommended, relevant_scores),
            map_at_k: self.calculate_average_precision(recommended, relevant),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rmse_and_mae() {
        let targets = [1.0, 2.0, 3.0];
        let predictions = [1.0, 3.0, 1.0];
        assert!((rmse(&targets, &predictions) - (5.0f64 / 3.0).sqrt()).abs() < 1e-9);
        assert!((mae(&targets, &predictions) - 1.0).abs() < 1e-9);
        assert_eq!(rmse(&[], &[]), 0.0);
    }

    #[test]
    fn test_precision_recall() {
        let calculator = MetricsCalculator::new(3);
        let recommended = vec![4, 7, 1, 9];
        let relevant = vec![7, 9];
        assert!((calculator.calculate_precision_at_k(&recommended, &relevant) - 1.0 / 3.0).abs() < 1e-9);
        assert!((calculator.calculate_recall_at_k(&recommended, &relevant) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_ndcg_perfect_ranking_is_one() {
        let calculator = MetricsCalculator::new(3);
        let scores: HashMap<usize, f64> = [(2, 3.0), (5, 2.0), (8, 1.0)].into_iter().collect();
        let ndcg = calculator.calculate_ndcg_at_k(&[2, 5, 8], &scores);
        assert!((ndcg - 1.0).abs() < 1e-9);

        let worse = calculator.calculate_ndcg_at_k(&[8, 5, 2], &scores);
        assert!(worse < 1.0 && worse > 0.0);
    }

    #[test]
    fn test_all_metrics() {
        let calculator = MetricsCalculator::new(2);
        let scores: HashMap<usize, f64> = [(1, 1.0), (2, 1.0)].into_iter().collect();
        let metrics = calculator.calculate_all_metrics(&[1, 3], &[1, 2], &scores);
        assert!((metrics.precision_at_k - 0.5).abs() < 1e-9);
        assert!((metrics.recall_at_k - 0.5).abs() < 1e-9);
        assert!((metrics.f1_score - 0.5).abs() < 1e-9);
        assert!(metrics.ndcg_at_k > 0.0 && metrics.ndcg_at_k < 1.0);
        assert!((metrics.map_at_k - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_map() {
        let calculator = MetricsCalculator::new(2);
        let map = calculator.calculate_map(&[vec![1, 2], vec![3, 4]], &[vec![1], vec![4]]);
        // AP = 1.0 and 0.5
        assert!((map - 0.75).abs() < 1e-9);
    }
}
