// Streaming principal component analysis (PCA)

#![doc = include_str!("../README.md")]

use std::error::Error;

pub mod ccipca;
pub mod config;
pub mod engine;
pub mod gradient;
pub mod linalg_backends;
pub mod monitor;
pub mod normalize;
pub mod output;
pub mod retraction;
pub mod rsvd;
pub mod schedule;
pub mod stream;
pub mod variance_reduction;


/// A thread-safe wrapper for standard dynamic errors,
/// so they implement `Send` and `Sync`.
pub type ThreadSafeStdError = Box<dyn Error + Send + Sync + 'static>;

pub use config::{Algorithm, NormalizationSettings, RandomizedSvdConfig, ScaleMode, StreamingPcaConfig};
pub use engine::{OptimizationContext, StreamingPca};
pub use monitor::{Checkpoint, CheckpointSink, DirectoryCheckpointSink, NoCheckpoints};
pub use output::{PcaOutput, StopReason};
pub use rsvd::ChunkedRandomizedSvd;
pub use schedule::{PolicyState, SchedulingPolicy};
pub use nalgebra_sparse::CsrMatrix;
pub use stream::{csr_from_dense, csr_from_parts, BufferedChunks, ChunkSource, InMemoryRows, RowChunk, RowStream};
