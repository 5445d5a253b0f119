use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::utils::sigmoid;

/// A mean-reduced loss over `(targets, predictions)`.
///
/// `value_and_grad` returns the loss together with its derivative with
/// respect to every prediction, which is what the model's backward pass
/// consumes.
pub trait Loss: Send + Sync {
    fn name(&self) -> &'static str;

    fn value_and_grad(&self, targets: &[f32], predictions: &[f32]) -> Result<(f32, Vec<f32>)>;

    fn value(&self, targets: &[f32], predictions: &[f32]) -> Result<f32> {
        self.value_and_grad(targets, predictions).map(|(value, _)| value)
    }
}

fn check_lengths(targets: &[f32], predictions: &[f32]) -> Result<()> {
    if targets.len() != predictions.len() {
        return Err(ModelError::ShapeMismatch {
            what: "targets",
            expected: predictions.len(),
            actual: targets.len(),
        });
    }
    if targets.is_empty() {
        return Err(ModelError::EmptyBatch);
    }
    Ok(())
}

/// Applies a per-element `(loss, dloss/dpred)` function and averages.
fn reduce_mean<F>(targets: &[f32], predictions: &[f32], elementwise: F) -> Result<(f32, Vec<f32>)>
where
    F: Fn(f32, f32) -> (f32, f32),
{
    check_lengths(targets, predictions)?;
    let n = targets.len() as f32;

    let mut total = 0.0f64;
    let mut grads = Vec::with_capacity(targets.len());
    for (&y, &p) in targets.iter().zip(predictions) {
        let (loss, grad) = elementwise(y, p);
        total += loss as f64;
        grads.push(grad / n);
    }

    Ok(((total / n as f64) as f32, grads))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MeanSquaredError;

impl Loss for MeanSquaredError {
    fn name(&self) -> &'static str {
        "mse"
    }

    fn value_and_grad(&self, targets: &[f32], predictions: &[f32]) -> Result<(f32, Vec<f32>)> {
        reduce_mean(targets, predictions, |y, p| {
            let diff = p - y;
            (diff * diff, 2.0 * diff)
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MeanAbsoluteError;

impl Loss for MeanAbsoluteError {
    fn name(&self) -> &'static str {
        "mae"
    }

    fn value_and_grad(&self, targets: &[f32], predictions: &[f32]) -> Result<(f32, Vec<f32>)> {
        reduce_mean(targets, predictions, |y, p| {
            let diff = p - y;
            let grad = if diff > 0.0 {
                1.0
            } else if diff < 0.0 {
                -1.0
            } else {
                0.0
            };
            (diff.abs(), grad)
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Huber {
    pub delta: f32,
}

impl Huber {
    pub fn new(delta: f32) -> Self {
        Self { delta }
    }
}

impl Loss for Huber {
    fn name(&self) -> &'static str {
        "huber"
    }

    fn value_and_grad(&self, targets: &[f32], predictions: &[f32]) -> Result<(f32, Vec<f32>)> {
        let delta = self.delta;
        reduce_mean(targets, predictions, |y, p| {
            let diff = p - y;
            if diff.abs() <= delta {
                (0.5 * diff * diff, diff)
            } else {
                (delta * (diff.abs() - 0.5 * delta), delta * diff.signum())
            }
        })
    }
}

/// Binary cross-entropy on logits, for targets in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SigmoidBinaryCrossEntropy;

impl Loss for SigmoidBinaryCrossEntropy {
    fn name(&self) -> &'static str {
        "sigmoid_bce"
    }

    fn value_and_grad(&self, targets: &[f32], predictions: &[f32]) -> Result<(f32, Vec<f32>)> {
        reduce_mean(targets, predictions, |y, x| {
            // max(x, 0) - x*y + log(1 + exp(-|x|)) stays finite for large |x|
            let loss = x.max(0.0) - x * y + (-x.abs()).exp().ln_1p();
            (loss, sigmoid(x) - y)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LossKind {
    MeanSquaredError,
    MeanAbsoluteError,
    Huber { delta: f32 },
    SigmoidBinaryCrossEntropy,
}

impl Default for LossKind {
    fn default() -> Self {
        LossKind::MeanSquaredError
    }
}

impl LossKind {
    pub fn build(&self) -> Box<dyn Loss> {
        match *self {
            LossKind::MeanSquaredError => Box::new(MeanSquaredError),
            LossKind::MeanAbsoluteError => Box::new(MeanAbsoluteError),
            LossKind::Huber { delta } => Box::new(Huber::new(delta)),
            LossKind::SigmoidBinaryCrossEntropy => Box::new(SigmoidBinaryCrossEntropy),
        }
    }
}
