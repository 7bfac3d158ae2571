use std::path::PathBuf;

use clap::Parser;
use training::{apply_overrides, OverrideArg, Trainer, TrainingConfig, TrainingError};

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Recurrent decoder training CLI", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to training config file (TOML or JSON)"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, help = "Evaluate the freshly initialized model and exit")]
    evaluate_only: bool,
}

fn init_tracing() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,decoder=warn,attention=warn"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::load(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }

    let mut trainer = Trainer::new(config)?;

    if args.evaluate_only {
        let summary = trainer.evaluate(trainer.config().runtime.evaluation.max_batches)?;
        println!(
            "eval train_loss={:.4} runtime_loss={:.4} exact={:.2}% sentences={}",
            summary.train_loss,
            summary.runtime_loss,
            summary.exact_match * 100.0,
            summary.sentences
        );
        return Ok(());
    }

    trainer.train()?;
    println!(
        "finished: {} optimizer steps over {} epochs",
        trainer.optimizer_steps(),
        trainer.epochs_completed()
    );
    Ok(())
}
