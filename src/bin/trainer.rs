use anyhow::Result;
use clap::Parser;
use mfrec::{init_tracing, Config, InteractionSet, MatrixFactorisationModel, RecommendationService, Trainer};
use tracing::info;

const RANKING_K: usize = 10;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Overrides `data.interactions`
    #[arg(long)]
    interactions: Option<usize>,

    /// Overrides `training.epochs`
    #[arg(long)]
    epochs: Option<usize>,

    /// User to print recommendations for after training
    #[arg(long, default_value_t = 0)]
    show_user: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();

    std::env::set_var("RUST_LOG", &args.log_level);
    init_tracing();

    info!("Starting mfrec trainer");

    let mut config = if std::path::Path::new(&args.config).exists() {
        Config::from_file(&args.config)?
    } else {
        info!("Config file not found, using default configuration");
        Config::default()
    };
    if let Some(interactions) = args.interactions {
        config.data.interactions = interactions;
    }
    if let Some(epochs) = args.epochs {
        config.training.epochs = epochs;
    }
    config.validate()?;
    if args.show_user >= config.model.num_users {
        anyhow::bail!(
            "--show-user {} is out of range for {} users",
            args.show_user,
            config.model.num_users
        );
    }

    rayon::ThreadPoolBuilder::new()
        .num_threads(config.training.num_threads)
        .build_global()?;

    info!("Model configuration: {:?}", config.model);
    info!("Training configuration: {:?}", config.training);

    let data = InteractionSet::synthetic(
        config.model.num_users,
        config.model.num_items,
        config.model.features,
        config.data.interactions,
        config.data.noise,
        config.data.seed,
    );
    let (train, validation) = data.split(config.data.validation_fraction, config.data.seed);
    info!(
        train = train.len(),
        validation = validation.len(),
        "Generated synthetic interactions"
    );

    let mut model = MatrixFactorisationModel::from_config(&config)?;
    let trainer = Trainer::new(config.training.clone());
    let report = trainer.fit(&mut model, &train, Some(&validation))?;

    if !validation.is_empty() {
        let evaluation = trainer.evaluate(&model, &validation)?;
        info!(
            loss = evaluation.loss,
            rmse = evaluation.rmse,
            mae = evaluation.mae,
            "Validation metrics"
        );
    }

    let service = RecommendationService::new(&model);
    let seen = train.items_by_user();
    let ranking = service.evaluate_ranking(&validation, &seen, RANKING_K, 0.0)?;
    if let Some(metrics) = &ranking {
        info!(
            k = RANKING_K,
            precision = metrics.precision_at_k,
            recall = metrics.recall_at_k,
            ndcg = metrics.ndcg_at_k,
            map = metrics.map_at_k,
            "Validation ranking metrics"
        );
    }

    let exclude = seen.get(args.show_user).cloned().unwrap_or_default();
    let recommendations = service.recommend(args.show_user, RANKING_K, &exclude)?;
    info!("Top items for user {}: {:?}", args.show_user, recommendations);

    let output = serde_json::json!({
        "training": report,
        "ranking": ranking,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
