use std::fmt;
use std::time::Instant;

use chrono::Utc;
use rayon::prelude::*;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::algorithms::loss::Loss;
use crate::algorithms::optimizer::{Adam, Optimizer};
use crate::algorithms::{MatrixFactorisation, Params};
use crate::config::{Config, TrainingConfig};
use crate::error::{ModelError, Result};
use crate::models::{Batch, EpochStats, EvaluationReport, InteractionSet, TrainingReport};
use crate::utils::metrics;
use crate::utils::validation::{validate_batch_size, validate_interaction, validate_targets};

const EVAL_CHUNK: usize = 4096;

/// Parameters plus the optimizer that owns their update state.
pub struct TrainState {
    pub step: u64,
    pub params: Params,
    optimizer: Box<dyn Optimizer>,
}

impl TrainState {
    pub fn create(params: Params, optimizer: Box<dyn Optimizer>) -> Self {
        Self {
            step: 0,
            params,
            optimizer,
        }
    }

    pub fn apply_gradients(&mut self, grads: &Params) {
        self.optimizer.apply(&mut self.params, grads);
        self.step += 1;
    }

    pub fn optimizer_name(&self) -> &'static str {
        self.optimizer.name()
    }
}

impl fmt::Debug for TrainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrainState")
            .field("step", &self.step)
            .field("optimizer", &self.optimizer.name())
            .field("num_parameters", &self.params.num_parameters())
            .finish()
    }
}

/// Rescales `grads` in place so their global norm is at most `max_norm`.
pub fn clip_by_global_norm(grads: &mut Params, max_norm: f32) -> f32 {
    let norm = grads.global_norm();
    if norm > max_norm && norm > 0.0 {
        grads.scale_mut(max_norm / norm);
    }
    norm
}

/// The factorisation model bound to its training state and loss.
pub struct MatrixFactorisationModel {
    model: MatrixFactorisation,
    pub state: TrainState,
    loss_fn: Box<dyn Loss>,
    regularization: f32,
    clip_norm: Option<f32>,
}

impl MatrixFactorisationModel {
    pub fn new(
        model: MatrixFactorisation,
        params: Params,
        loss_fn: Box<dyn Loss>,
        optimizer: Box<dyn Optimizer>,
    ) -> Result<Self> {
        params.check_shapes(model.num_users, model.num_items, model.features)?;
        Ok(Self {
            model,
            state: TrainState::create(params, optimizer),
            loss_fn,
            regularization: 0.0,
            clip_norm: None,
        })
    }

    /// Adam with learning rate 1e-2.
    pub fn with_default_optimizer(
        model: MatrixFactorisation,
        params: Params,
        loss_fn: Box<dyn Loss>,
    ) -> Result<Self> {
        Self::new(model, params, loss_fn, Box::new(Adam::with_learning_rate(1e-2)))
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let model = MatrixFactorisation::new(
            config.model.num_users,
            config.model.num_items,
            config.model.features,
        )?;
        let params = model.init(config.training.seed, &config.model.init);

        Ok(Self::new(
            model,
            params,
            config.training.loss.build(),
            config.training.optimizer.build(),
        )?
        .with_regularization(config.training.regularization)
        .with_clip_norm(config.training.clip_norm))
    }

    pub fn with_regularization(mut self, regularization: f32) -> Self {
        self.regularization = regularization;
        self
    }

    pub fn with_clip_norm(mut self, clip_norm: Option<f32>) -> Self {
        self.clip_norm = clip_norm;
        self
    }

    pub fn model(&self) -> &MatrixFactorisation {
        &self.model
    }

    pub fn params(&self) -> &Params {
        &self.state.params
    }

    pub fn loss_name(&self) -> &'static str {
        self.loss_fn.name()
    }

    pub fn predict(&self, inputs: &Batch) -> Result<Vec<f32>> {
        Ok(self
            .model
            .apply(&self.state.params, inputs)?
            .iter()
            .copied()
            .collect())
    }

    /// Loss of the current parameters, without gradients.
    pub fn compute_loss(&self, inputs: &Batch, targets: &[f32]) -> Result<f32> {
        validate_targets(inputs, targets)?;
        let predictions = self.predict(inputs)?;
        self.loss_fn.value(targets, &predictions)
    }

    /// Training objective and its gradient with respect to every parameter
    /// leaf. The objective includes the L2 penalty when one is configured.
    pub fn value_and_grad(&self, inputs: &Batch, targets: &[f32]) -> Result<(f32, Params)> {
        validate_targets(inputs, targets)?;
        let params = &self.state.params;

        let predictions = self.model.apply(params, inputs)?;
        let (loss, d_predictions) = self
            .loss_fn
            .value_and_grad(targets, predictions.as_slice())?;

        let mut grads = self.model.backward(params, inputs, &d_predictions)?;
        let penalty = self
            .model
            .l2_penalty(params, inputs, self.regularization, &mut grads);

        Ok((loss + penalty, grads))
    }

    /// One optimizer update on a batch. Returns the pre-update loss.
    pub fn train_step(&mut self, inputs: &Batch, targets: &[f32]) -> Result<f32> {
        let (loss, mut grads) = self.value_and_grad(inputs, targets)?;
        if !loss.is_finite() {
            return Err(ModelError::NonFinite("loss"));
        }

        if let Some(max_norm) = self.clip_norm {
            let norm = clip_by_global_norm(&mut grads, max_norm);
            if norm > max_norm {
                debug!(norm, max_norm, "clipped gradients");
            }
        }

        self.state.apply_gradients(&grads);
        Ok(loss)
    }
}

impl fmt::Debug for MatrixFactorisationModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatrixFactorisationModel")
            .field("model", &self.model)
            .field("state", &self.state)
            .field("loss", &self.loss_fn.name())
            .field("regularization", &self.regularization)
            .field("clip_norm", &self.clip_norm)
            .finish()
    }
}

pub struct Trainer {
    config: TrainingConfig,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn fit(
        &self,
        model: &mut MatrixFactorisationModel,
        train: &InteractionSet,
        validation: Option<&InteractionSet>,
    ) -> Result<TrainingReport> {
        if train.is_empty() {
            return Err(ModelError::EmptyBatch);
        }
        validate_batch_size(self.config.batch_size, usize::MAX)?;
        let validation = validation.filter(|v| !v.is_empty());
        let (num_users, num_items) = (model.model().num_users, model.model().num_items);
        for interaction in train
            .interactions
            .iter()
            .chain(validation.iter().flat_map(|v| v.interactions.iter()))
        {
            validate_interaction(interaction, num_users, num_items)?;
        }

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            %run_id,
            examples = train.len(),
            validation_examples = validation.map(|v| v.len()).unwrap_or(0),
            epochs = self.config.epochs,
            batch_size = self.config.batch_size,
            optimizer = model.state.optimizer_name(),
            loss = model.loss_name(),
            "starting training"
        );

        let mut epochs = Vec::with_capacity(self.config.epochs);
        let mut best: Option<(usize, f32)> = None;
        let mut best_params: Option<Params> = None;
        let mut epochs_without_improvement = 0;
        let mut stopped_early = false;

        for epoch in 0..self.config.epochs {
            let epoch_start = Instant::now();
            let seed = self
                .config
                .shuffle
                .then(|| self.config.seed.wrapping_add(epoch as u64));

            let batches = train.batches(self.config.batch_size, seed);
            let mut weighted_loss = 0.0f64;
            for (batch, targets) in &batches {
                let loss = model.train_step(batch, targets)?;
                weighted_loss += loss as f64 * batch.len() as f64;
            }
            let train_loss = (weighted_loss / train.len() as f64) as f32;
            debug!(epoch, batches = batches.len(), step = model.state.step, "epoch done");

            let validation_loss = match validation {
                Some(data) => Some(self.evaluate(model, data)?.loss),
                None => None,
            };

            let stats = EpochStats {
                epoch,
                train_loss,
                validation_loss,
                steps: model.state.step,
                duration_ms: epoch_start.elapsed().as_millis() as u64,
            };
            info!(
                epoch = stats.epoch,
                train_loss = stats.train_loss,
                validation_loss = ?stats.validation_loss,
                duration_ms = stats.duration_ms,
                "epoch complete"
            );
            epochs.push(stats);

            // validation loss when available, training loss otherwise
            let monitored = validation_loss.unwrap_or(train_loss);
            if best.map_or(true, |(_, b)| monitored < b) {
                best = Some((epoch, monitored));
                epochs_without_improvement = 0;
                if self.config.early_stopping_patience.is_some() {
                    best_params = Some(model.state.params.clone());
                }
                continue;
            }

            epochs_without_improvement += 1;
            if let Some(patience) = self.config.early_stopping_patience {
                if epochs_without_improvement >= patience {
                    warn!(epoch, patience, "no improvement, stopping early");
                    stopped_early = true;
                    break;
                }
            }
        }

        if stopped_early {
            if let Some(params) = best_params {
                model.state.params = params;
            }
        }

        let report = TrainingReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            epochs,
            best_epoch: best.map(|(epoch, _)| epoch),
            stopped_early,
        };
        info!(
            %run_id,
            best_epoch = ?report.best_epoch,
            final_train_loss = ?report.final_train_loss(),
            "training finished"
        );
        Ok(report)
    }

    /// Loss, RMSE and MAE of the model's current parameters on `data`.
    pub fn evaluate(
        &self,
        model: &MatrixFactorisationModel,
        data: &InteractionSet,
    ) -> Result<EvaluationReport> {
        if data.is_empty() {
            return Err(ModelError::EmptyBatch);
        }

        let chunks: Vec<(Vec<f32>, Vec<f32>)> = data
            .interactions
            .par_chunks(EVAL_CHUNK)
            .map(|chunk| {
                let (batch, targets) = Batch::from_interactions(chunk);
                model.predict(&batch).map(|predictions| (targets, predictions))
            })
            .collect::<Result<_>>()?;

        let (targets, predictions): (Vec<f32>, Vec<f32>) = chunks
            .into_iter()
            .flat_map(|(t, p)| t.into_iter().zip(p))
            .unzip();

        Ok(EvaluationReport {
            loss: model.loss_fn.value(&targets, &predictions)?,
            rmse: metrics::rmse(&targets, &predictions),
            mae: metrics::mae(&targets, &predictions),
            count: targets.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::loss::MeanSquaredError;
    use crate::algorithms::optimizer::SGD;
    use crate::algorithms::InitConfig;
    use crate::models::Interaction;

    fn small_model() -> MatrixFactorisationModel {
        let model = MatrixFactorisation::new(4, 3, 2).unwrap();
        let params = model.init(0, &InitConfig::default());
        MatrixFactorisationModel::with_default_optimizer(model, params, Box::new(MeanSquaredError))
            .unwrap()
    }

    #[test]
    fn test_compute_loss_matches_value_and_grad() {
        let model = small_model();
        let batch = Batch::new(vec![0, 1, 3], vec![2, 0, 1]);
        let targets = [1.0, -1.0, 0.5];
        let loss = model.compute_loss(&batch, &targets).unwrap();
        let (value, grads) = model.value_and_grad(&batch, &targets).unwrap();
        assert!((loss - value).abs() < 1e-6);
        assert!(grads.check_shapes(4, 3, 2).is_ok());
        // user 2 is not in the batch
        assert_eq!(grads.user.embedding.row(2).sum(), 0.0);
        assert_eq!(grads.user.bias[(2, 0)], 0.0);
    }

    #[test]
    fn test_targets_must_match_batch() {
        let model = small_model();
        let batch = Batch::new(vec![0, 1], vec![2, 0]);
        assert!(matches!(
            model.compute_loss(&batch, &[1.0]),
            Err(ModelError::ShapeMismatch { .. })
        ));
        assert_eq!(
            model.value_and_grad(&Batch::default(), &[]).unwrap_err(),
            ModelError::EmptyBatch
        );
    }

    #[test]
    fn test_train_step_reduces_loss() {
        let mut model = small_model();
        let batch = Batch::new(vec![0, 1, 2, 3], vec![0, 1, 2, 0]);
        let targets = [1.0, 2.0, -1.0, 0.5];
        let before = model.compute_loss(&batch, &targets).unwrap();
        for _ in 0..300 {
            model.train_step(&batch, &targets).unwrap();
        }
        let after = model.compute_loss(&batch, &targets).unwrap();
        assert_eq!(model.state.step, 300);
        assert!(after < before * 0.1, "loss {before} -> {after}");
    }

    #[test]
    fn test_sgd_step_follows_negative_gradient() {
        let mf = MatrixFactorisation::new(2, 2, 2).unwrap();
        let params = mf.init(3, &InitConfig::default());
        let mut model = MatrixFactorisationModel::new(
            mf,
            params.clone(),
            Box::new(MeanSquaredError),
            Box::new(SGD::new(0.1)),
        )
        .unwrap();

        let batch = Batch::new(vec![1], vec![0]);
        let (_, grads) = model.value_and_grad(&batch, &[2.0]).unwrap();
        model.train_step(&batch, &[2.0]).unwrap();

        let expected = params.user.bias[(1, 0)] - 0.1 * grads.user.bias[(1, 0)];
        assert!((model.params().user.bias[(1, 0)] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_regularization_adds_penalty() {
        let plain = small_model();
        let regularized = small_model().with_regularization(0.1);
        let batch = Batch::new(vec![0], vec![0]);
        let (a, _) = plain.value_and_grad(&batch, &[1.0]).unwrap();
        let (b, _) = regularized.value_and_grad(&batch, &[1.0]).unwrap();
        assert!(b > a);
        // evaluation loss stays the data loss
        assert_eq!(
            plain.compute_loss(&batch, &[1.0]).unwrap(),
            regularized.compute_loss(&batch, &[1.0]).unwrap()
        );
    }

    #[test]
    fn test_clip_by_global_norm() {
        let mut grads = Params::zeros(1, 1, 1);
        grads.user.embedding[(0, 0)] = 3.0;
        grads.item.embedding[(0, 0)] = 4.0;
        let norm = clip_by_global_norm(&mut grads, 1.0);
        assert!((norm - 5.0).abs() < 1e-6);
        assert!((grads.global_norm() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_new_rejects_mismatched_params() {
        let mf = MatrixFactorisation::new(2, 2, 2).unwrap();
        let params = Params::zeros(3, 2, 2);
        assert!(MatrixFactorisationModel::with_default_optimizer(
            mf,
            params,
            Box::new(MeanSquaredError)
        )
        .is_err());
    }

    #[test]
    fn test_fit_and_evaluate() {
        let data = InteractionSet::synthetic(20, 15, 3, 600, 0.05, 1);
        let (train, validation) = data.split(0.2, 2);

        let mut config = Config::default();
        config.model.num_users = 20;
        config.model.num_items = 15;
        config.model.features = 3;
        config.training.epochs = 5;
        config.training.batch_size = 32;
        let mut model = MatrixFactorisationModel::from_config(&config).unwrap();

        let trainer = Trainer::new(config.training.clone());
        let before = trainer.evaluate(&model, &train).unwrap();
        let report = trainer.fit(&mut model, &train, Some(&validation)).unwrap();
        let after = trainer.evaluate(&model, &train).unwrap();

        assert_eq!(report.epochs.len(), 5);
        assert!(report.epochs.iter().all(|e| e.validation_loss.is_some()));
        assert!(report.best_epoch.is_some());
        assert_eq!(after.count, train.len());
        assert!(after.loss < before.loss, "{} -> {}", before.loss, after.loss);
    }

    #[test]
    fn test_early_stopping_restores_best_params() {
        let train = InteractionSet::new(
            vec![Interaction::new(0, 0, 10.0), Interaction::new(1, 1, -10.0)],
            2,
            2,
        );
        // every step towards the training targets moves away from these
        let validation = InteractionSet::new(
            vec![Interaction::new(0, 0, -10.0), Interaction::new(1, 1, 10.0)],
            2,
            2,
        );

        let mut config = Config::default();
        config.model.num_users = 2;
        config.model.num_items = 2;
        config.model.features = 2;
        config.training.epochs = 200;
        config.training.batch_size = 2;
        config.training.early_stopping_patience = Some(2);
        let mut model = MatrixFactorisationModel::from_config(&config).unwrap();

        let trainer = Trainer::new(config.training.clone());
        let report = trainer.fit(&mut model, &train, Some(&validation)).unwrap();

        assert!(report.stopped_early);
        assert_eq!(report.epochs.len(), 3);
        let best_epoch = report.best_epoch.unwrap();
        assert_eq!(best_epoch, 0);
        let best_loss = report.epochs[best_epoch].validation_loss.unwrap();
        let restored = trainer.evaluate(&model, &validation).unwrap().loss;
        assert!((restored - best_loss).abs() < 1e-4);
    }

    #[test]
    fn test_train_step_applies_clipped_gradients() {
        let mf = MatrixFactorisation::new(2, 2, 2).unwrap();
        let params = mf.init(3, &InitConfig::default());
        let mut model = MatrixFactorisationModel::new(
            mf,
            params.clone(),
            Box::new(MeanSquaredError),
            Box::new(SGD::new(1.0)),
        )
        .unwrap()
        .with_clip_norm(Some(0.1));

        let batch = Batch::new(vec![0, 1], vec![1, 0]);
        let targets = [10.0, -10.0];
        let (_, grads) = model.value_and_grad(&batch, &targets).unwrap();
        assert!(grads.global_norm() > 1.0);

        model.train_step(&batch, &targets).unwrap();
        let mut delta = params;
        for ((_, d), (_, p)) in delta.leaves_mut().into_iter().zip(model.params().leaves()) {
            *d -= p;
        }
        // lr 1.0, so the update is the clipped gradient itself
        assert!((delta.global_norm() - 0.1).abs() < 1e-4, "{}", delta.global_norm());
    }

    #[test]
    fn test_patience_only_counts_epochs_without_improvement() {
        let data = InteractionSet::synthetic(20, 15, 3, 600, 0.05, 1);

        let mut config = Config::default();
        config.model.num_users = 20;
        config.model.num_items = 15;
        config.model.features = 3;
        config.training.epochs = 4;
        config.training.batch_size = 32;
        config.training.early_stopping_patience = Some(1);
        let mut model = MatrixFactorisationModel::from_config(&config).unwrap();

        let trainer = Trainer::new(config.training.clone());
        let report = trainer.fit(&mut model, &data, None).unwrap();

        assert!(!report.stopped_early);
        assert_eq!(report.epochs.len(), 4);
        assert_eq!(report.best_epoch, Some(3));
    }

    #[test]
    fn test_early_stopping_on_training_loss_without_validation() {
        let data = InteractionSet::synthetic(4, 3, 2, 40, 0.0, 5);
        let mf = MatrixFactorisation::new(4, 3, 2).unwrap();
        let params = mf.init(0, &InitConfig::default());
        // a zero learning rate keeps the training loss flat
        let mut model = MatrixFactorisationModel::new(
            mf,
            params.clone(),
            Box::new(MeanSquaredError),
            Box::new(SGD::new(0.0)),
        )
        .unwrap();

        let config = TrainingConfig {
            epochs: 50,
            batch_size: 8,
            shuffle: false,
            early_stopping_patience: Some(2),
            ..TrainingConfig::default()
        };
        let report = Trainer::new(config).fit(&mut model, &data, None).unwrap();

        assert!(report.stopped_early);
        assert_eq!(report.epochs.len(), 3);
        assert_eq!(report.best_epoch, Some(0));
        assert!(report.epochs.iter().all(|e| e.validation_loss.is_none()));
        assert_eq!(model.params(), &params);
    }

    #[test]
    fn test_fit_rejects_ids_outside_the_model() {
        let mut model = small_model();
        let trainer = Trainer::new(TrainingConfig::default());
        let data = InteractionSet::from_interactions(vec![Interaction::new(4, 0, 1.0)]);
        assert_eq!(
            trainer.fit(&mut model, &data, None).unwrap_err(),
            ModelError::IndexOutOfRange {
                kind: "user",
                id: 4,
                len: 4
            }
        );
        assert_eq!(model.state.step, 0);
    }

    #[test]
    fn test_fit_rejects_empty_training_set() {
        let mut model = small_model();
        let trainer = Trainer::new(TrainingConfig::default());
        let empty = InteractionSet::new(Vec::new(), 4, 3);
        assert_eq!(
            trainer.fit(&mut model, &empty, None).unwrap_err(),
            ModelError::EmptyBatch
        );
    }
}
