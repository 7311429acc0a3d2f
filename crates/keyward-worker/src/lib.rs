//! # Keyward Worker
//!
//! Long-running process hosting the Keyward key services.
//!
//! On startup it marks rotations left unfinished by a previous process as
//! failed, then executes queued rotations and periodically prunes share
//! access rate limits until shut down.

pub mod config;
pub mod server;
pub mod state;

pub use config::WorkerConfig;
pub use server::{run_worker, run_worker_with_shutdown, serve};
pub use state::WorkerState;
