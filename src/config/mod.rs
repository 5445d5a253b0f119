use serde::{Deserialize, Serialize};

use crate::algorithms::loss::LossKind;
use crate::algorithms::optimizer::OptimizerConfig;
use crate::algorithms::InitConfig;
use crate::error::ModelError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub data: DataConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub num_users: usize,
    pub num_items: usize,
    pub features: usize,
    pub init: InitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub seed: u64,
    pub shuffle: bool,
    pub loss: LossKind,
    pub optimizer: OptimizerConfig,
    /// L2 weight on the embedding rows each batch touches.
    pub regularization: f32,
    /// Clip gradients to this global norm before the optimizer sees them.
    pub clip_norm: Option<f32>,
    /// Stop after this many epochs without a validation improvement.
    pub early_stopping_patience: Option<usize>,
    pub num_threads: usize,
}

/// Synthetic dataset used by the trainer binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub interactions: usize,
    pub noise: f32,
    pub validation_fraction: f32,
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_users: 1000,
            num_items: 500,
            features: 32,
            init: InitConfig::default(),
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 256,
            seed: 0,
            shuffle: true,
            loss: LossKind::MeanSquaredError,
            optimizer: OptimizerConfig::default(),
            regularization: 0.0,
            clip_norm: None,
            early_stopping_patience: None,
            num_threads: num_cpus::get(),
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            interactions: 50_000,
            noise: 0.1,
            validation_fraction: 0.1,
            seed: 42,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("MFREC").separator("__"))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        let invalid = |msg: String| Err(ModelError::InvalidConfig(msg));

        if self.model.num_users == 0 || self.model.num_items == 0 || self.model.features == 0 {
            return invalid("model dimensions must be non-zero".to_string());
        }
        if let Err(msg) = self.model.init.embedding.validate() {
            return invalid(msg);
        }
        if let Err(msg) = self.model.init.bias.validate() {
            return invalid(msg);
        }

        let training = &self.training;
        crate::utils::validation::validate_batch_size(training.batch_size, 1 << 20)?;
        if let Err(msg) = training.optimizer.validate() {
            return invalid(msg);
        }
        if training.early_stopping_patience == Some(0) {
            return invalid("early_stopping_patience must be at least 1".to_string());
        }
        if !(training.regularization >= 0.0) {
            return invalid(format!(
                "regularization must be >= 0, got {}",
                training.regularization
            ));
        }
        if let Some(clip) = training.clip_norm {
            if !(clip > 0.0) {
                return invalid(format!("clip_norm must be positive, got {clip}"));
            }
        }
        if let LossKind::Huber { delta } = training.loss {
            if !(delta > 0.0) {
                return invalid(format!("huber delta must be positive, got {delta}"));
            }
        }
        if !(0.0..1.0).contains(&self.data.validation_fraction) {
            return invalid(format!(
                "validation_fraction must be in [0, 1), got {}",
                self.data.validation_fraction
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::optimizer::OptimizerKind;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.training.optimizer.kind, OptimizerKind::Adam);
        assert_eq!(config.training.optimizer.learning_rate, 1e-2);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.training.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.training.clip_norm = Some(0.0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.model.features = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.training.early_stopping_patience = Some(0);
        assert!(config.validate().is_err());
        config.training.early_stopping_patience = Some(1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unstable_optimizer_settings() {
        let mut config = Config::default();
        config.training.optimizer.beta1 = 1.0;
        assert!(matches!(config.validate(), Err(ModelError::InvalidConfig(_))));

        let mut config = Config::default();
        config.training.optimizer.beta2 = 1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.training.optimizer.epsilon = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.training.optimizer.momentum = 1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.training.optimizer.decay_rate = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_overrides_defaults() {
        let dir = std::env::temp_dir().join(format!("mfrec-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("test.toml");
        std::fs::write(
            &path,
            r#"
[model]
num_users = 12
features = 4

[training]
epochs = 3
loss = { kind = "huber", delta = 0.5 }

[training.optimizer]
kind = "sgd"
learning_rate = 0.1
"#,
        )
        .unwrap();

        let config = Config::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.model.num_users, 12);
        assert_eq!(config.model.num_items, 500);
        assert_eq!(config.training.epochs, 3);
        assert_eq!(config.training.loss, LossKind::Huber { delta: 0.5 });
        assert_eq!(config.training.optimizer.kind, OptimizerKind::Sgd);
        assert_eq!(config.training.batch_size, 256);

        std::fs::remove_dir_all(&dir).ok();
    }
}
