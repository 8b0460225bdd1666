use std::path::PathBuf;

use anyhow::Context;
use candle_core::Device;
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use tandem_core::distributed::{DistributedConfig, RemainderPolicy};
use tandem_core::engine::{AttnFfnMode, KvDataType};
use tandem_core::layers::{MlpProjection, NormKind, QuantKind};
use tandem_core::loader::{export_weights, model_tensors, SyntheticWeights, WeightDataType};

use tandem_launcher::config::{LauncherConfig, DEFAULT_MAX_NEW_TOKENS};
use tandem_launcher::distributed_launcher::{is_worker_process, spawn_workers, wait_for_workers};
use tandem_launcher::logging;
use tandem_launcher::runner::{self, RunSettings};

#[derive(Parser)]
#[command(name = "tandem", about = "Tensor and pipeline parallel decoder")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
#[allow(clippy::large_enum_variant)] // CLI struct parsed once at startup
enum Command {
    /// Greedily extend one or more prompts
    Generate {
        /// Directory with config.json and weight files
        #[arg(long)]
        model_dir: Option<PathBuf>,

        /// Use deterministic synthetic weights with this seed
        #[arg(long)]
        synthetic_seed: Option<u64>,

        /// Prompt as comma-separated token ids; repeat for a batch
        #[arg(long = "prompt", required = true)]
        prompts: Vec<String>,

        /// Shared prefix primed once and reused by every prompt
        #[arg(long)]
        prefix: Option<String>,

        #[arg(long)]
        max_new_tokens: Option<usize>,

        /// Total number of ranks
        #[arg(long)]
        world_size: Option<usize>,

        /// Number of pipeline stages
        #[arg(long, env = "TANDEM_PIPELINE_STAGES")]
        pipeline_stages: Option<usize>,

        /// Run the ranks as threads of this process instead of spawning workers
        #[arg(long)]
        threads: bool,

        /// Attention/FFN schedule: sequential or parallel
        #[arg(long, value_parser = parse_setting::<AttnFfnMode>)]
        attn_ffn: Option<AttnFfnMode>,

        /// rms_norm or layer_norm
        #[arg(long, value_parser = parse_setting::<NormKind>)]
        norm: Option<NormKind>,

        /// none or int8
        #[arg(long, value_parser = parse_setting::<QuantKind>)]
        quant: Option<QuantKind>,

        #[arg(long, value_parser = parse_setting::<MlpProjection>)]
        mlp_projection: Option<MlpProjection>,

        /// f16, bf16 or f32
        #[arg(long, value_parser = parse_setting::<KvDataType>)]
        kv_dtype: Option<KvDataType>,

        /// Element type of the weight files
        #[arg(long, value_parser = parse_setting::<WeightDataType>)]
        weight_dtype: Option<WeightDataType>,

        /// Where leftover layers go: spread, last_stage or floor
        #[arg(long, value_parser = parse_setting::<RemainderPolicy>)]
        remainder: Option<RemainderPolicy>,

        #[arg(long)]
        master_addr: Option<String>,

        #[arg(long)]
        master_port: Option<u16>,

        /// Log level when RUST_LOG is unset
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Write synthetic weights for a model config into a directory
    ExportSynthetic {
        /// Path to a config.json
        #[arg(long)]
        config: PathBuf,

        /// Output directory
        #[arg(long)]
        out: PathBuf,

        #[arg(long, default_value_t = 0)]
        seed: u64,

        #[arg(long, default_value = "f32", value_parser = parse_setting::<WeightDataType>)]
        dtype: WeightDataType,

        /// Also write bias tensors
        #[arg(long)]
        biases: bool,
    },
    /// Manage the persistent launcher config
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective config file
    Show,
    /// Write a config file with the default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Parse a snake_case setting through its serde representation.
fn parse_setting<T: DeserializeOwned>(value: &str) -> Result<T, String> {
    toml::Value::String(value.to_string())
        .try_into()
        .map_err(|e: toml::de::Error| format!("invalid value {value:?}: {e}"))
}

fn main() -> anyhow::Result<()> {
    let file_config = LauncherConfig::load();
    let cli = Cli::parse();

    match cli.command {
        Command::Generate {
            model_dir,
            synthetic_seed,
            prompts,
            prefix,
            max_new_tokens,
            world_size,
            pipeline_stages,
            threads,
            attn_ffn,
            norm,
            quant,
            mlp_projection,
            kv_dtype,
            weight_dtype,
            remainder,
            master_addr,
            master_port,
            log_level,
        } => {
            let cli_config = LauncherConfig {
                model_dir,
                world_size,
                pipeline_stages,
                master_addr,
                master_port,
                attn_ffn,
                norm,
                quant,
                mlp_projection,
                kv_dtype,
                weight_dtype,
                remainder,
                max_new_tokens,
                log_level,
            };
            let mut config = file_config;
            config.merge(&cli_config);
            logging::init(config.log_level.as_deref())?;

            let settings = RunSettings {
                model_dir: config
                    .model_dir
                    .clone()
                    .context("--model-dir is required (or model_dir in the config file)")?,
                synthetic_seed,
                pipeline_stages: config.pipeline_stages.unwrap_or(1),
                strategy: config.strategy(),
                prompts: prompts
                    .iter()
                    .map(|p| runner::parse_token_list(p))
                    .collect::<anyhow::Result<_>>()?,
                prefix: prefix.as_deref().map(runner::parse_token_list).transpose()?,
                max_new_tokens: config.max_new_tokens.unwrap_or(DEFAULT_MAX_NEW_TOKENS),
            };
            generate(&settings, &config, threads)
        }
        Command::ExportSynthetic {
            config,
            out,
            seed,
            dtype,
            biases,
        } => {
            logging::init(None)?;
            export_synthetic(&config, &out, seed, dtype, biases)
        }
        Command::Config { action } => match action {
            ConfigAction::Show => {
                match LauncherConfig::default_path() {
                    Some(path) if path.exists() => eprintln!("Config file: {}", path.display()),
                    Some(path) => eprintln!("No config file at {}", path.display()),
                    None => eprintln!("No config directory available"),
                }
                print!("{}", toml::to_string_pretty(&file_config)?);
                Ok(())
            }
            ConfigAction::Init { force } => {
                let path = LauncherConfig::default_path()
                    .context("no config directory available")?;
                anyhow::ensure!(
                    force || !path.exists(),
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
                let defaults = LauncherConfig {
                    world_size: Some(1),
                    pipeline_stages: Some(1),
                    master_addr: Some(tandem_launcher::config::DEFAULT_MASTER_ADDR.to_string()),
                    master_port: Some(tandem_launcher::config::DEFAULT_MASTER_PORT),
                    max_new_tokens: Some(DEFAULT_MAX_NEW_TOKENS),
                    ..Default::default()
                };
                let path = defaults.save()?;
                eprintln!("Wrote {}", path.display());
                Ok(())
            }
        },
    }
}

fn generate(settings: &RunSettings, config: &LauncherConfig, threads: bool) -> anyhow::Result<()> {
    let world_size = config.world_size.unwrap_or(1);

    let tokens = if threads || world_size == 1 {
        runner::run_threads(settings, world_size)?
    } else if is_worker_process() {
        let dist = DistributedConfig::from_env();
        runner::run_process(settings, &dist)?;
        return Ok(());
    } else {
        let master_addr = config.master_addr();
        let master_port = config.master_port();
        let workers = spawn_workers(world_size, &master_addr, master_port)?;
        let dist = DistributedConfig {
            rank: 0,
            world_size,
            local_rank: 0,
            master_addr,
            master_port,
        };
        let result = runner::run_process(settings, &dist);
        wait_for_workers(workers)?;
        result?
    };

    for sequence in tokens {
        let line: Vec<String> = sequence.iter().map(u32::to_string).collect();
        println!("{}", line.join(","));
    }
    Ok(())
}

fn export_synthetic(
    config_path: &std::path::Path,
    out: &std::path::Path,
    seed: u64,
    dtype: WeightDataType,
    biases: bool,
) -> anyhow::Result<()> {
    let raw = tandem_core::config::ModelConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let model = raw.clone().finalize()?;
    let gated = model.activation()?.is_gated();
    let source = SyntheticWeights::new(seed, Device::Cpu).with_biases(biases);
    let written = export_weights(&source, &model_tensors(&model, gated), out, dtype)?;
    std::fs::write(out.join("config.json"), serde_json::to_string_pretty(&raw)?)
        .with_context(|| format!("writing {}", out.join("config.json").display()))?;
    eprintln!("Wrote {written} tensors to {}", out.display());
    Ok(())
}
