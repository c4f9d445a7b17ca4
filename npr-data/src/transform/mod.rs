//! Init and onload transforms
//!
//! - [`init`]: versioned transforms baked into the cache once per frame
//! - [`onload`]: per-access crops that produce planar network input
//! - [`resize`]: resampling helpers shared by both

pub mod init;
pub mod onload;
pub mod resize;

pub use init::{TRANSFORM_DESCRIPTOR_VERSION, TransformDescriptor};
pub use onload::{OnloadTransform, OnloadTransforms};
pub use resize::{Interpolation, center_crop, fit_shorter_side, resize};
