pub mod algorithms;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use algorithms::{InitConfig, MatrixFactorisation, Params};
pub use config::Config;
pub use error::{ModelError, Result};
pub use models::*;
pub use services::recommendation::RecommendationService;
pub use services::training::{MatrixFactorisationModel, TrainState, Trainer};

/// Installs the global `tracing` subscriber, filtered by `RUST_LOG`.
/// Later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
