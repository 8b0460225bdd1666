//! Multi-process launcher for TP × PP runs.
//!
//! When `--world-size N` is requested without `--threads`, rank 0 spawns
//! N-1 worker processes (ranks 1..N-1). Each worker is a re-execution of the
//! same binary with the same CLI arguments, distinguished by the standard
//! distributed environment variables.
//!
//! # Environment Variables
//!
//! | Variable      | Set by launcher | Consumed by |
//! |---------------|-----------------|-------------|
//! | `RANK`        | 1..N-1          | `DistributedConfig::from_env()` |
//! | `WORLD_SIZE`  | N               | `DistributedConfig::from_env()` |
//! | `LOCAL_RANK`  | 1..N-1          | `DistributedConfig::from_env()` |
//! | `MASTER_ADDR` | `--master-addr` | TCP mesh bootstrap |
//! | `MASTER_PORT` | `--master-port` | TCP mesh bootstrap |
//!
//! Workers detect their role via `is_worker_process()`.

use std::process::{Child, Command};

/// Return `true` when this process is a spawned worker (`RANK > 0`).
pub fn is_worker_process() -> bool {
    std::env::var("RANK")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .map(|r| r > 0)
        .unwrap_or(false)
}

/// Environment handed to worker `rank`.
pub fn worker_env(
    rank: usize,
    world_size: usize,
    master_addr: &str,
    master_port: u16,
) -> Vec<(&'static str, String)> {
    vec![
        ("RANK", rank.to_string()),
        ("WORLD_SIZE", world_size.to_string()),
        // Single node: LOCAL_RANK == RANK.
        ("LOCAL_RANK", rank.to_string()),
        ("MASTER_ADDR", master_addr.to_string()),
        ("MASTER_PORT", master_port.to_string()),
    ]
}

/// Spawn `world_size - 1` worker processes (ranks 1..world_size).
///
/// Returns handles to the children so the coordinator can wait for them.
pub fn spawn_workers(
    world_size: usize,
    master_addr: &str,
    master_port: u16,
) -> anyhow::Result<Vec<Child>> {
    anyhow::ensure!(world_size > 1, "no workers to spawn for world_size={world_size}");

    let current_exe = std::env::current_exe()
        .map_err(|e| anyhow::anyhow!("failed to determine current executable: {e}"))?;
    let args: Vec<std::ffi::OsString> = std::env::args_os().skip(1).collect();

    let mut workers = Vec::with_capacity(world_size - 1);
    for rank in 1..world_size {
        tracing::info!(rank, world_size, master_port, "spawning worker");
        let child = Command::new(&current_exe)
            .args(&args)
            .envs(worker_env(rank, world_size, master_addr, master_port))
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn worker rank {rank}: {e}"))?;
        workers.push(child);
    }

    tracing::info!(count = world_size - 1, "all workers spawned");
    Ok(workers)
}

/// Wait for every worker and fail if any exited unsuccessfully.
pub fn wait_for_workers(mut workers: Vec<Child>) -> anyhow::Result<()> {
    let mut failed = Vec::new();
    for (i, child) in workers.iter_mut().enumerate() {
        let rank = i + 1;
        match child.wait() {
            Ok(status) if status.success() => {
                tracing::debug!(rank, "worker exited cleanly");
            }
            Ok(status) => {
                tracing::warn!(rank, ?status, "worker exited with non-zero status");
                failed.push(rank);
            }
            Err(e) => {
                tracing::warn!(rank, error = %e, "error waiting for worker");
                failed.push(rank);
            }
        }
    }
    anyhow::ensure!(failed.is_empty(), "workers {failed:?} failed");
    Ok(())
}
