use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::algorithms::params::Params;

/// First-order optimizer over a [`Params`] tree. Per-leaf state is keyed by
/// the leaf path.
pub trait Optimizer: Send + Sync {
    fn name(&self) -> &'static str;

    fn update_with_key(&mut self, key: &str, params: &mut DMatrix<f32>, gradients: &DMatrix<f32>);

    /// Advances any step-dependent state. Called once per `apply`, before the
    /// leaves are updated.
    fn begin_step(&mut self) {}

    fn reset(&mut self);

    fn apply(&mut self, params: &mut Params, gradients: &Params) {
        self.begin_step();
        for ((key, leaf), (_, grad)) in params.leaves_mut().into_iter().zip(gradients.leaves()) {
            self.update_with_key(key, leaf, grad);
        }
    }
}

fn state_for<'a>(
    state: &'a mut HashMap<String, DMatrix<f32>>,
    key: &str,
    like: &DMatrix<f32>,
) -> &'a mut DMatrix<f32> {
    state
        .entry(key.to_string())
        .or_insert_with(|| DMatrix::zeros(like.nrows(), like.ncols()))
}

#[derive(Debug, Clone)]
pub struct SGD {
    learning_rate: f64,
    momentum: f64,
    velocity: HashMap<String, DMatrix<f32>>,
}

impl SGD {
    pub fn new(learning_rate: f64) -> Self {
        Self::with_momentum(learning_rate, 0.0)
    }

    pub fn with_momentum(learning_rate: f64, momentum: f64) -> Self {
        Self {
            learning_rate,
            momentum,
            velocity: HashMap::new(),
        }
    }
}

impl Optimizer for SGD {
    fn name(&self) -> &'static str {
        "sgd"
    }

    fn update_with_key(&mut self, key: &str, params: &mut DMatrix<f32>, gradients: &DMatrix<f32>) {
        if self.momentum == 0.0 {
            *params -= gradients * self.learning_rate as f32;
            return;
        }

        let velocity = state_for(&mut self.velocity, key, params);
        *velocity = velocity.scale(self.momentum as f32) + gradients;
        *params -= velocity.scale(self.learning_rate as f32);
    }

    fn reset(&mut self) {
        self.velocity.clear();
    }
}

#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    t: usize,
    m: HashMap<String, DMatrix<f32>>,
    v: HashMap<String, DMatrix<f32>>,
}

impl Adam {
    pub fn new(learning_rate: f64, beta1: f64, beta2: f64, epsilon: f64) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            t: 0,
            m: HashMap::new(),
            v: HashMap::new(),
        }
    }

    pub fn with_learning_rate(learning_rate: f64) -> Self {
        Self::new(learning_rate, 0.9, 0.999, 1e-8)
    }

    pub fn step_count(&self) -> usize {
        self.t
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &'static str {
        "adam"
    }

    fn begin_step(&mut self) {
        self.t += 1;
    }

    fn update_with_key(&mut self, key: &str, params: &mut DMatrix<f32>, gradients: &DMatrix<f32>) {
        // a bare update_with_key outside apply() still counts as a step
        let t = self.t.max(1) as i32;
        let (beta1, beta2) = (self.beta1 as f32, self.beta2 as f32);

        let m = state_for(&mut self.m, key, params);
        *m = m.scale(beta1) + gradients.scale(1.0 - beta1);
        let m_hat = m.scale(1.0 / (1.0 - beta1.powi(t)));

        let v = state_for(&mut self.v, key, params);
        *v = v.scale(beta2) + gradients.component_mul(gradients).scale(1.0 - beta2);
        let v_hat = v.scale(1.0 / (1.0 - beta2.powi(t)));

        let denominator = v_hat.map(|x| x.sqrt() + self.epsilon as f32);
        let update = m_hat.component_div(&denominator).scale(self.learning_rate as f32);

        *params -= update;
    }

    fn reset(&mut self) {
        self.t = 0;
        self.m.clear();
        self.v.clear();
    }
}

#[derive(Debug, Clone)]
pub struct AdaGrad {
    learning_rate: f64,
    epsilon: f64,
    sum_squared_gradients: HashMap<String, DMatrix<f32>>,
}

impl AdaGrad {
    pub fn new(learning_rate: f64, epsilon: f64) -> Self {
        Self {
            learning_rate,
            epsilon,
            sum_squared_gradients: HashMap::new(),
        }
    }
}

impl Optimizer for AdaGrad {
    fn name(&self) -> &'static str {
        "adagrad"
    }

    fn update_with_key(&mut self, key: &str, params: &mut DMatrix<f32>, gradients: &DMatrix<f32>) {
        let sum_sq_grad = state_for(&mut self.sum_squared_gradients, key, params);
        *sum_sq_grad += gradients.component_mul(gradients);

        let lr = self.learning_rate as f32;
        let eps = self.epsilon as f32;
        let adaptive_lr = sum_sq_grad.map(|x| lr / (x + eps).sqrt());

        *params -= gradients.component_mul(&adaptive_lr);
    }

    fn reset(&mut self) {
        self.sum_squared_gradients.clear();
    }
}

#[derive(Debug, Clone)]
pub struct RMSprop {
    learning_rate: f64,
    decay_rate: f64,
    epsilon: f64,
    cache: HashMap<String, DMatrix<f32>>,
}

impl RMSprop {
    pub fn new(learning_rate: f64, decay_rate: f64, epsilon: f64) -> Self {
        Self {
            learning_rate,
            decay_rate,
            epsilon,
            cache: HashMap::new(),
        }
    }
}

impl Optimizer for RMSprop {
    fn name(&self) -> &'static str {
        "rmsprop"
    }

    fn update_with_key(&mut self, key: &str, params: &mut DMatrix<f32>, gradients: &DMatrix<f32>) {
        let decay = self.decay_rate as f32;
        let cache = state_for(&mut self.cache, key, params);
        *cache = cache.scale(decay) + gradients.component_mul(gradients).scale(1.0 - decay);

        let eps = self.epsilon as f32;
        let denominator = cache.map(|x| x.sqrt() + eps);
        let update = gradients.component_div(&denominator).scale(self.learning_rate as f32);

        *params -= update;
    }

    fn reset(&mut self) {
        self.cache.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Sgd,
    Adam,
    #[serde(rename = "adagrad")]
    AdaGrad,
    #[serde(rename = "rmsprop")]
    RmsProp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub momentum: f64,
    pub decay_rate: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::Adam,
            learning_rate: 1e-2,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            momentum: 0.0,
            decay_rate: 0.9,
        }
    }
}

impl OptimizerConfig {
    /// Adam's bias correction divides by `1 - beta^t`, so betas must stay
    /// below 1. Moving-average rates share the same `[0, 1)` range.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.learning_rate > 0.0) {
            return Err(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            ));
        }
        if !(self.epsilon > 0.0) {
            return Err(format!("epsilon must be positive, got {}", self.epsilon));
        }
        for (name, value) in [
            ("beta1", self.beta1),
            ("beta2", self.beta2),
            ("momentum", self.momentum),
            ("decay_rate", self.decay_rate),
        ] {
            if !(0.0..1.0).contains(&value) {
                return Err(format!("{name} must be in [0, 1), got {value}"));
            }
        }
        Ok(())
    }

    pub fn build(&self) -> Box<dyn Optimizer> {
        match self.kind {
            OptimizerKind::Sgd => Box::new(SGD::with_momentum(self.learning_rate, self.momentum)),
            OptimizerKind::Adam => Box::new(Adam::new(
                self.learning_rate,
                self.beta1,
                self.beta2,
                self.epsilon,
            )),
            OptimizerKind::AdaGrad => Box::new(AdaGrad::new(self.learning_rate, self.epsilon)),
            OptimizerKind::RmsProp => Box::new(RMSprop::new(
                self.learning_rate,
                self.decay_rate,
                self.epsilon,
            )),
        }
    }
}
