use std::sync::Arc;

use candle_core::Device;

use super::{tiny_config, NullLink, RecordingChannel};
use crate::config::ModelConfig;
use crate::distributed::{
    CollectiveChannel, GroupCommunicator, LocalFabric, LocalTransport, ParallelCoordinates,
    StageLink,
};
use crate::engine::{Decoder, ExecutionContext, ExecutionStrategy};
use crate::loader::SyntheticWeights;

/// Seed shared by every helper so grids and single ranks load equal weights.
pub const TEST_SEED: u64 = 7;

/// One rank of a thread grid, handed to the per-rank closure.
pub struct GridRank {
    pub rank: usize,
    pub decoder: Decoder,
    pub transport: Arc<LocalTransport>,
    /// Counts the collectives this rank's decoder issued.
    pub channel: Arc<RecordingChannel>,
}

/// Single-process decoder over [`tiny_config`] with synthetic weights.
pub fn single_rank_decoder(strategy: ExecutionStrategy) -> Decoder {
    let ctx = ExecutionContext::new(tiny_config(), ParallelCoordinates::single(), strategy, Device::Cpu)
        .expect("tiny config is valid");
    let source = SyntheticWeights::new(TEST_SEED, Device::Cpu);
    Decoder::new(ctx, &source, Arc::new(RecordingChannel::default()), Arc::new(NullLink))
        .expect("synthetic weights load")
}

/// Run `f` on every rank of a `world`-process grid split into `stages`
/// pipeline stages, one thread per rank. Results are returned in rank order.
pub fn run_grid<T, F>(
    config: ModelConfig,
    world: usize,
    stages: usize,
    strategy: ExecutionStrategy,
    f: F,
) -> Vec<T>
where
    T: Send,
    F: Fn(GridRank) -> T + Sync,
{
    let endpoints = LocalFabric::create(world);
    std::thread::scope(|scope| {
        let handles: Vec<_> = endpoints
            .into_iter()
            .enumerate()
            .map(|(rank, endpoint)| {
                let f = &f;
                let config = config.clone();
                scope.spawn(move || {
                    let transport = Arc::new(endpoint);
                    let coords = ParallelCoordinates::from_world(world, rank, stages)
                        .expect("grid topology is valid");
                    let ctx = ExecutionContext::new(config, coords, strategy, Device::Cpu)
                        .expect("context for grid rank");
                    let group: Arc<dyn CollectiveChannel> =
                        Arc::new(GroupCommunicator::new(transport.clone(), coords));
                    let channel = Arc::new(RecordingChannel::wrap(group));
                    let link = Arc::new(StageLink::new(transport.clone()));
                    let source = SyntheticWeights::new(TEST_SEED, Device::Cpu);
                    let decoder = Decoder::new(ctx, &source, channel.clone(), link)
                        .expect("decoder for grid rank");
                    f(GridRank {
                        rank,
                        decoder,
                        transport,
                        channel,
                    })
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("grid rank panicked"))
            .collect()
    })
}
