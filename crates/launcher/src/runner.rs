//! Per-rank generation runner.
//!
//! Builds the execution context, weight source and communicators for one
//! rank and drives greedy generation. The same code runs as threads over a
//! `LocalFabric` or as separate processes over a `TcpTransport`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use candle_core::Device;
use tandem_core::config::ModelConfig;
use tandem_core::distributed::{
    DistributedConfig, GroupCommunicator, LocalFabric, ParallelCoordinates, StageLink,
    TcpTransport, Transport,
};
use tandem_core::engine::{generate_greedy, Decoder, ExecutionContext, ExecutionStrategy, GreedyRequest};
use tandem_core::loader::{DirWeightSource, SyntheticWeights, WeightSource};

/// Everything a rank needs to run, identical on every rank.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub model_dir: PathBuf,
    /// Use deterministic synthetic weights instead of weight files.
    pub synthetic_seed: Option<u64>,
    pub pipeline_stages: usize,
    pub strategy: ExecutionStrategy,
    /// Equal-length prompts.
    pub prompts: Vec<Vec<u32>>,
    /// Shared prefix every prompt starts with.
    pub prefix: Option<Vec<u32>>,
    pub max_new_tokens: usize,
}

impl RunSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.prompts.is_empty(), "at least one prompt is required");
        let len = self.prompts[0].len();
        anyhow::ensure!(len > 0, "prompts must not be empty");
        anyhow::ensure!(
            self.prompts.iter().all(|p| p.len() == len),
            "all prompts must have the same length"
        );
        if let Some(prefix) = &self.prefix {
            anyhow::ensure!(prefix.len() < len, "prefix must be shorter than the prompts");
            anyhow::ensure!(
                self.prompts.iter().all(|p| p.starts_with(prefix)),
                "every prompt must start with the shared prefix"
            );
        }
        Ok(())
    }
}

/// Parse a comma-separated token list such as `"1, 15, 7"`.
pub fn parse_token_list(text: &str) -> anyhow::Result<Vec<u32>> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .with_context(|| format!("invalid token id {s:?}"))
        })
        .collect()
}

/// Read `config.json` from the model directory.
pub fn load_model_config(model_dir: &Path) -> anyhow::Result<ModelConfig> {
    let path = model_dir.join("config.json");
    ModelConfig::from_file(&path).with_context(|| format!("loading {}", path.display()))
}

fn weight_source(settings: &RunSettings) -> Box<dyn WeightSource> {
    match settings.synthetic_seed {
        Some(seed) => Box::new(SyntheticWeights::new(seed, Device::Cpu)),
        None => Box::new(DirWeightSource::new(
            settings.model_dir.clone(),
            settings.strategy.weight_dtype,
            Device::Cpu,
        )),
    }
}

/// Build this rank's decoder and run greedy generation to completion.
pub fn run_rank(
    settings: &RunSettings,
    config: &ModelConfig,
    transport: Arc<dyn Transport>,
) -> anyhow::Result<Vec<Vec<u32>>> {
    let rank = transport.rank();
    let coords = ParallelCoordinates::from_world(transport.world_size(), rank, settings.pipeline_stages)?;
    let mut strategy = settings.strategy;
    strategy.layer.activation = config.activation()?;

    let ctx = ExecutionContext::new(config.clone(), coords, strategy, Device::Cpu)?;
    let tp = Arc::new(GroupCommunicator::new(transport.clone(), coords));
    let link = Arc::new(StageLink::new(transport.clone()));
    let source = weight_source(settings);
    let mut decoder = Decoder::new(ctx, source.as_ref(), tp, link)
        .with_context(|| format!("building decoder on rank {rank}"))?;

    if let Some(prefix) = &settings.prefix {
        decoder.set_prefix(prefix)?;
    }
    let request = GreedyRequest {
        prompts: settings.prompts.concat(),
        batch: settings.prompts.len(),
        max_new_tokens: settings.max_new_tokens,
        eos_token_id: Some(config.eos_token_id),
    };
    let tokens = generate_greedy(&mut decoder, transport.as_ref(), &request)?;
    tracing::info!(rank, sequences = tokens.len(), "generation finished");
    Ok(tokens)
}

/// Run every rank as a thread of this process.
pub fn run_threads(settings: &RunSettings, world_size: usize) -> anyhow::Result<Vec<Vec<u32>>> {
    settings.validate()?;
    let config = load_model_config(&settings.model_dir)?;
    let endpoints = LocalFabric::create(world_size);
    let results: Vec<anyhow::Result<Vec<Vec<u32>>>> = std::thread::scope(|scope| {
        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|endpoint| {
                let config = &config;
                scope.spawn(move || run_rank(settings, config, Arc::new(endpoint)))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("rank thread panicked")))
            })
            .collect()
    });
    let mut results = results.into_iter();
    let first = results
        .next()
        .ok_or_else(|| anyhow::anyhow!("world size must be > 0"))??;
    for other in results {
        other?;
    }
    Ok(first)
}

/// Run this process's rank over a TCP mesh.
pub fn run_process(settings: &RunSettings, dist: &DistributedConfig) -> anyhow::Result<Vec<Vec<u32>>> {
    settings.validate()?;
    dist.validate()?;
    let config = load_model_config(&settings.model_dir)?;
    let transport = TcpTransport::connect(dist)
        .with_context(|| format!("connecting rank {} to the mesh", dist.rank))?;
    run_rank(settings, &config, Arc::new(transport))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::engine::KvDataType;
    use tandem_core::testing::tiny_config;

    fn settings(dir: &Path, stages: usize) -> RunSettings {
        RunSettings {
            model_dir: dir.to_path_buf(),
            synthetic_seed: Some(5),
            pipeline_stages: stages,
            strategy: ExecutionStrategy::default().with_kv_dtype(KvDataType::F32),
            prompts: vec![vec![3, 4, 5, 6], vec![7, 8, 9, 10]],
            prefix: None,
            max_new_tokens: 3,
        }
    }

    fn model_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            serde_json::to_string(&tiny_config()).unwrap(),
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_parse_token_list() {
        assert_eq!(parse_token_list("1, 2,3").unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_token_list("").unwrap(), Vec::<u32>::new());
        assert!(parse_token_list("1,x").is_err());
    }

    #[test]
    fn test_validate_rejects_ragged_prompts() {
        let dir = model_dir();
        let mut s = settings(dir.path(), 1);
        s.prompts[1].pop();
        assert!(s.validate().is_err());

        let mut s = settings(dir.path(), 1);
        s.prefix = Some(vec![3, 4]);
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_thread_grid_matches_single_rank() {
        let dir = model_dir();
        let single = run_threads(&settings(dir.path(), 1), 1).unwrap();
        let grid = run_threads(&settings(dir.path(), 2), 4).unwrap();
        assert_eq!(single, grid);
        assert_eq!(single.len(), 2);
    }

    #[test]
    fn test_shared_prefix_run() {
        let dir = model_dir();
        let mut s = settings(dir.path(), 1);
        s.prompts = vec![vec![3, 4, 5, 6], vec![3, 4, 9, 10]];
        let plain = run_threads(&s, 1).unwrap();
        s.prefix = Some(vec![3, 4]);
        let shared = run_threads(&s, 2).unwrap();
        assert_eq!(plain, shared);
    }

    #[test]
    fn test_missing_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_threads(&settings(dir.path(), 1), 1).unwrap_err();
        assert!(format!("{err:#}").contains("config.json"));
    }
}
