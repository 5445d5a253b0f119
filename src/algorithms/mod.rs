pub mod initializer;
pub mod loss;
pub mod optimizer;
pub mod params;

use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::models::Batch;
use initializer::InitializationMethod;
pub use params::{EmbedParams, Params};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitConfig {
    pub embedding: InitializationMethod,
    pub bias: InitializationMethod,
}

/// Matrix factorisation scorer:
/// `score(u, i) = <p_u, q_i> + b_u + b_i`.
///
/// The struct only holds the dimensions; parameters live in a separate
/// [`Params`] tree so the same definition can be applied to any set of
/// weights (current state, a gradient-perturbed copy, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixFactorisation {
    pub num_users: usize,
    pub num_items: usize,
    pub features: usize,
}

impl MatrixFactorisation {
    pub fn new(num_users: usize, num_items: usize, features: usize) -> Result<Self> {
        if num_users == 0 || num_items == 0 || features == 0 {
            return Err(ModelError::InvalidConfig(format!(
                "num_users, num_items and features must be non-zero (got {num_users}, {num_items}, {features})"
            )));
        }
        Ok(Self {
            num_users,
            num_items,
            features,
        })
    }

    /// Draws fresh parameters. Tables are filled in a fixed order from one
    /// seeded stream, so equal seeds give equal parameters.
    pub fn init(&self, seed: u64, init: &InitConfig) -> Params {
        let mut rng = StdRng::seed_from_u64(seed);
        let user = EmbedParams {
            embedding: init
                .embedding
                .initialize_matrix(&mut rng, self.num_users, self.features),
            bias: init.bias.initialize_matrix(&mut rng, self.num_users, 1),
        };
        let item = EmbedParams {
            embedding: init
                .embedding
                .initialize_matrix(&mut rng, self.num_items, self.features),
            bias: init.bias.initialize_matrix(&mut rng, self.num_items, 1),
        };
        Params { user, item }
    }

    fn check_inputs(&self, params: &Params, batch: &Batch) -> Result<()> {
        if batch.user_ids.len() != batch.item_ids.len() {
            return Err(ModelError::ShapeMismatch {
                what: "item_ids",
                expected: batch.user_ids.len(),
                actual: batch.item_ids.len(),
            });
        }
        params.check_shapes(self.num_users, self.num_items, self.features)?;

        if let Some(&id) = batch.user_ids.iter().find(|&&u| u >= self.num_users) {
            return Err(ModelError::IndexOutOfRange {
                kind: "user",
                id,
                len: self.num_users,
            });
        }
        if let Some(&id) = batch.item_ids.iter().find(|&&i| i >= self.num_items) {
            return Err(ModelError::IndexOutOfRange {
                kind: "item",
                id,
                len: self.num_items,
            });
        }
        Ok(())
    }

    fn score(&self, params: &Params, user: usize, item: usize) -> f32 {
        params.user.embedding.row(user).dot(&params.item.embedding.row(item))
            + params.user.bias[(user, 0)]
            + params.item.bias[(item, 0)]
    }

    pub fn apply(&self, params: &Params, batch: &Batch) -> Result<DVector<f32>> {
        self.check_inputs(params, batch)?;

        Ok(DVector::from_iterator(
            batch.len(),
            batch
                .user_ids
                .iter()
                .zip(&batch.item_ids)
                .map(|(&u, &i)| self.score(params, u, i)),
        ))
    }

    /// Pulls `d_predictions` back through [`apply`](Self::apply).
    ///
    /// Gradient tables are dense; rows whose ids do not appear in the batch
    /// stay zero and repeated ids accumulate.
    pub fn backward(
        &self,
        params: &Params,
        batch: &Batch,
        d_predictions: &[f32],
    ) -> Result<Params> {
        self.check_inputs(params, batch)?;
        if d_predictions.len() != batch.len() {
            return Err(ModelError::ShapeMismatch {
                what: "d_predictions",
                expected: batch.len(),
                actual: d_predictions.len(),
            });
        }

        let mut grads = params.zeros_like();
        for ((&u, &i), &g) in batch.user_ids.iter().zip(&batch.item_ids).zip(d_predictions) {
            if g == 0.0 {
                continue;
            }
            for f in 0..self.features {
                grads.user.embedding[(u, f)] += g * params.item.embedding[(i, f)];
                grads.item.embedding[(i, f)] += g * params.user.embedding[(u, f)];
            }
            grads.user.bias[(u, 0)] += g;
            grads.item.bias[(i, 0)] += g;
        }

        Ok(grads)
    }

    /// L2 penalty on the embedding rows a batch touches, with its gradient
    /// accumulated into `grads`. Returns the penalty value.
    pub fn l2_penalty(
        &self,
        params: &Params,
        batch: &Batch,
        lambda: f32,
        grads: &mut Params,
    ) -> f32 {
        if lambda == 0.0 || batch.is_empty() {
            return 0.0;
        }

        let scale = lambda / batch.len() as f32;
        let mut penalty = 0.0f32;
        for (&u, &i) in batch.user_ids.iter().zip(&batch.item_ids) {
            let user_row = params.user.embedding.row(u);
            let item_row = params.item.embedding.row(i);
            penalty += user_row.norm_squared() + item_row.norm_squared();

            for f in 0..self.features {
                grads.user.embedding[(u, f)] += 2.0 * scale * user_row[f];
                grads.item.embedding[(i, f)] += 2.0 * scale * item_row[f];
            }
        }
        scale * penalty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;

    fn fixed_params() -> (MatrixFactorisation, Params) {
        let model = MatrixFactorisation::new(2, 2, 2).unwrap();
        let params = Params {
            user: EmbedParams {
                embedding: DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 2.0, 0.0]),
                bias: DMatrix::from_row_slice(2, 1, &[0.1, -0.2]),
            },
            item: EmbedParams {
                embedding: DMatrix::from_row_slice(2, 2, &[0.5, 2.0, 3.0, 3.0]),
                bias: DMatrix::from_row_slice(2, 1, &[0.0, 1.0]),
            },
        };
        (model, params)
    }

    #[test]
    fn test_apply_dot_plus_biases() {
        let (model, params) = fixed_params();
        let batch = Batch::new(vec![0, 1, 1], vec![0, 1, 0]);
        let out = model.apply(&params, &batch).unwrap();
        // 2.5 + 0.1 + 0.0, 6.0 - 0.2 + 1.0, 1.0 - 0.2 + 0.0
        let expected = [2.6, 6.8, 0.8];
        assert_eq!(out.len(), 3);
        for (got, want) in out.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "{got} != {want}");
        }
    }

    #[test]
    fn test_apply_rejects_bad_inputs() {
        let (model, params) = fixed_params();

        let err = model
            .apply(&params, &Batch::new(vec![0, 1], vec![0]))
            .unwrap_err();
        assert!(matches!(err, ModelError::ShapeMismatch { .. }));

        let err = model
            .apply(&params, &Batch::new(vec![2], vec![0]))
            .unwrap_err();
        assert_eq!(
            err,
            ModelError::IndexOutOfRange {
                kind: "user",
                id: 2,
                len: 2
            }
        );

        let wrong = MatrixFactorisation::new(3, 2, 2).unwrap();
        assert!(matches!(
            wrong.apply(&params, &Batch::new(vec![0], vec![0])),
            Err(ModelError::ParameterShape { .. })
        ));
    }

    #[test]
    fn test_empty_batch_gives_empty_output() {
        let (model, params) = fixed_params();
        let out = model.apply(&params, &Batch::default()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        assert!(MatrixFactorisation::new(0, 3, 4).is_err());
        assert!(MatrixFactorisation::new(3, 3, 0).is_err());
    }

    #[test]
    fn test_backward_accumulates_repeated_ids() {
        let (model, params) = fixed_params();
        let batch = Batch::new(vec![0, 0], vec![1, 1]);
        let grads = model.backward(&params, &batch, &[1.0, 0.5]).unwrap();

        // user 0 gets 1.5 * q_1, item 1 gets 1.5 * p_0
        assert_eq!(grads.user.embedding.row(0).iter().copied().collect::<Vec<_>>(), vec![4.5, 4.5]);
        assert_eq!(grads.item.embedding.row(1).iter().copied().collect::<Vec<_>>(), vec![1.5, 1.5]);
        assert_eq!(grads.user.bias[(0, 0)], 1.5);
        assert_eq!(grads.item.bias[(1, 0)], 1.5);
        // untouched rows stay zero
        assert_eq!(grads.user.embedding.row(1).sum(), 0.0);
        assert_eq!(grads.item.bias[(0, 0)], 0.0);
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let model = MatrixFactorisation::new(4, 3, 3).unwrap();
        let params = model.init(5, &InitConfig::default());
        let batch = Batch::new(vec![0, 3, 1, 3], vec![2, 0, 2, 1]);
        let weights = [0.3f32, -1.0, 0.7, 2.0];
        let grads = model.backward(&params, &batch, &weights).unwrap();

        let objective = |p: &Params| -> f32 {
            let out = model.apply(p, &batch).unwrap();
            out.iter().zip(weights).map(|(o, w)| o * w).sum()
        };

        let eps = 1e-2;
        for (path, leaf) in params.leaves() {
            let grad = grads.leaf(path).unwrap();
            for r in 0..leaf.nrows() {
                for c in 0..leaf.ncols() {
                    let mut plus = params.clone();
                    let mut minus = params.clone();
                    plus.leaves_mut().into_iter().find(|(p, _)| *p == path).unwrap().1[(r, c)] += eps;
                    minus.leaves_mut().into_iter().find(|(p, _)| *p == path).unwrap().1[(r, c)] -= eps;
                    let numeric = (objective(&plus) - objective(&minus)) / (2.0 * eps);
                    assert!(
                        (numeric - grad[(r, c)]).abs() < 1e-2,
                        "{path}[{r},{c}]: analytic {} numeric {numeric}",
                        grad[(r, c)]
                    );
                }
            }
        }
    }

    #[test]
    fn test_init_is_seeded() {
        let model = MatrixFactorisation::new(5, 7, 3).unwrap();
        let a = model.init(1, &InitConfig::default());
        let b = model.init(1, &InitConfig::default());
        let c = model.init(2, &InitConfig::default());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.check_shapes(5, 7, 3).is_ok());
    }

    #[test]
    fn test_l2_penalty_gradient() {
        let (model, params) = fixed_params();
        let batch = Batch::new(vec![1], vec![0]);
        let mut grads = params.zeros_like();
        let penalty = model.l2_penalty(&params, &batch, 0.5, &mut grads);
        // 0.5 * (|p_1|^2 + |q_0|^2) = 0.5 * (4 + 4.25)
        assert!((penalty - 4.125).abs() < 1e-6);
        assert_eq!(grads.user.embedding[(1, 0)], 2.0);
        assert_eq!(grads.item.embedding[(0, 1)], 2.0);
        assert_eq!(grads.user.bias.sum(), 0.0);
    }
}
