//! # Flowmonkey Worker
//!
//! The long-running tasks that share the store with the engine: the job
//! runner (claim / execute / heartbeat / complete), the stalled-job reaper,
//! the WAL replayer, and the wake sweeper. Each is an independent loop with
//! watch-channel shutdown; none holds state beyond its configuration.

pub mod checkpoint;
pub mod reaper;
pub mod replay;
pub mod runner;
pub mod sweeper;

pub use checkpoint::JobCheckpoint;
pub use reaper::{JobReaper, ReapStats, ReaperConfig};
pub use replay::{ReplayConfig, ReplayStats, WalReplayer};
pub use runner::{JobRunner, PollStats, RunnerConfig};
pub use sweeper::{SweeperConfig, WakeSweeper};
