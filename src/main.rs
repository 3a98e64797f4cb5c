//! haystack-rs CLI: context-neuron analyses for Pythia models

use anyhow::Result;
use clap::{Parser, Subcommand};
use haystack_rs::corpus::{batch_prompts, load_json_data, save_token_batches};
use haystack_rs::{
    and_conditions, baseline, downstream, feature_formation, sae, AndConditionsConfig, BaselineConfig,
    DownstreamConfig, FeatureFormationConfig, HaystackModel, MetricMode, SaeTrainingConfig,
};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "haystack-rs")]
#[command(about = "Context neuron analyses for small language models")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long, global = true)]
    cpu: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Probe, ablate and score every checkpoint of a Pythia model
    FeatureFormation {
        #[arg(short, long, default_value = "EleutherAI/pythia-70m")]
        model: String,
        #[arg(short, long, default_value = "feature_formation")]
        output_dir: PathBuf,
        #[arg(short, long, default_value = "data")]
        data_dir: PathBuf,
        /// Only visit the first N checkpoints
        #[arg(long)]
        max_checkpoints: Option<usize>,
    },
    /// Tokenise a JSON corpus into BOS-prefixed rows for autoencoder training
    BatchPrompts {
        #[arg(short, long, default_value = "EleutherAI/pythia-70m")]
        model: String,
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, default_value_t = 127)]
        seq_len: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Train a sparse autoencoder from a JSON config
    TrainSae {
        /// Training config (missing fields take their defaults)
        #[arg(short, long)]
        config: PathBuf,
    },
    /// AND-condition analysis of the German context neuron
    AndConditions {
        #[arg(short, long, default_value = "EleutherAI/pythia-70m")]
        model: String,
        #[arg(short, long, default_value = "data")]
        data_dir: PathBuf,
        #[arg(short, long, default_value = "data/and_neurons")]
        output_dir: PathBuf,
        #[arg(long, default_value_t = 1000)]
        num_prompts: usize,
    },
    /// Peak-snapping analysis of a bimodal context neuron
    Downstream {
        #[arg(short, long, default_value = "EleutherAI/pythia-160m")]
        model: String,
        #[arg(short, long, default_value = "data/german_europarl.json")]
        data_path: PathBuf,
        #[arg(short, long, default_value = "data/downstream")]
        output_dir: PathBuf,
        #[arg(long, value_enum, default_value_t = MetricMode::Peaks)]
        mode: MetricMode,
        #[arg(long, default_value_t = 100)]
        num_prompts: usize,
    },
    /// Single-neuron next-is-space and is-German probes
    ProbeBaseline {
        #[arg(short, long, default_value = "EleutherAI/pythia-160m")]
        model: String,
        #[arg(short, long, default_value = "data")]
        data_dir: PathBuf,
        #[arg(short, long, default_value = "data/pythia_160m")]
        output_dir: PathBuf,
        #[arg(long, default_value_t = 10_000)]
        train_size: usize,
        #[arg(long, default_value_t = 10_000)]
        test_size: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let force_cpu = Some(cli.cpu);
    match cli.command {
        Command::FeatureFormation {
            model,
            output_dir,
            data_dir,
            max_checkpoints,
        } => {
            let config = FeatureFormationConfig {
                model,
                output_dir,
                data_dir,
                max_checkpoints,
                force_cpu: cli.cpu,
                ..Default::default()
            };
            let progress = feature_formation::run(config)?;
            println!(
                "Finished {} layers: {} probe rows, {} ablation rows",
                progress.completed.len(),
                progress.probe.len(),
                progress.layer_ablation.len()
            );
        }
        Command::BatchPrompts {
            model,
            input,
            output,
            seq_len,
            seed,
        } => {
            let model = HaystackModel::from_pretrained_with_device(&model, force_cpu)?;
            let prompts = load_json_data(&input)?;
            let tokens = batch_prompts(&model, &prompts, seq_len, seed)?;
            save_token_batches(&tokens, &output)?;
            info!("Saved {:?} tokens to {}", tokens.dims(), output.display());
        }
        Command::TrainSae { config } => {
            let cfg = SaeTrainingConfig::from_file(&config)?;
            let summary = sae::run_training(cfg, force_cpu)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::AndConditions {
            model,
            data_dir,
            output_dir,
            num_prompts,
        } => {
            let cfg = AndConditionsConfig {
                model,
                data_dir,
                output_dir,
                num_prompts,
                ..Default::default()
            };
            let model = HaystackModel::from_pretrained_with_device(&cfg.model, force_cpu)?;
            let results = and_conditions::run(&model, &cfg)?;
            for r in &results {
                println!(
                    "{:>14}  loss Two Features {:+.3}  logits Two Features {:+.3}",
                    r.option, r.loss.scores.two_features, r.logits.scores.two_features
                );
            }
        }
        Command::Downstream {
            model,
            data_path,
            output_dir,
            mode,
            num_prompts,
        } => {
            let cfg = DownstreamConfig {
                model,
                data_path,
                output_dir,
                mode,
                num_prompts,
                ..Default::default()
            };
            let model = HaystackModel::from_pretrained_with_device(&cfg.model, force_cpu)?;
            let records = downstream::run(&model, &cfg)?;
            println!("Scored {} downstream neurons", records.len());
        }
        Command::ProbeBaseline {
            model,
            data_dir,
            output_dir,
            train_size,
            test_size,
        } => {
            let cfg = BaselineConfig {
                model,
                data_dir,
                output_dir,
                train_size,
                test_size,
                ..Default::default()
            };
            let model = HaystackModel::from_pretrained_with_device(&cfg.model, force_cpu)?;
            let (space, german) = baseline::run(&model, &cfg)?;
            println!(
                "Probed {} neurons for next_is_space and {} for is_german",
                space.len(),
                german.len()
            );
        }
    }

    Ok(())
}
