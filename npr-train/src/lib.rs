//! NPR Training Crate
//!
//! Network, losses and training loop of the neural point-rendering
//! reconstruction. Everything is generic over the burn backend; training runs
//! on an autodiff backend, evaluation and export on its inner backend.
//!
//! ## Modules
//!
//! - [`network`]: warping operator, building blocks and the reconstruction network
//! - [`model`]: architecture selection and batch-to-tensor conversion
//! - [`loss`]: image losses and per-epoch bookkeeping
//! - [`scheduler`]: reduce-on-plateau learning rate
//! - [`config`]: the training configuration
//! - [`checkpoint`] / [`export`]: persisted training state and inference artifacts
//! - [`debug`]: debug image output
//! - [`session`]: the training session

pub mod checkpoint;
pub mod config;
pub mod debug;
pub mod error;
pub mod export;
pub mod loss;
pub mod model;
pub mod network;
pub mod scheduler;
pub mod session;

pub use checkpoint::{Checkpoint, CheckpointMeta};
pub use config::TrainingConfig;
pub use error::{Result, TrainError};
pub use export::{ExportSignature, export_network, load_exported};
pub use loss::{LossKind, LossTracker};
pub use model::{Model, ModelKind, NetworkInput, NprNetwork};
pub use network::{Inovis, InovisConfig};
pub use scheduler::{PlateauConfig, ReduceOnPlateau};
pub use session::{EpochReport, TrainingSession, TrainingSummary};
