//! NPR Data Crate
//!
//! Data pipeline for neural point-rendering training. This crate is
//! tensor-library agnostic: it decodes frames, splits them, builds disk
//! caches and serves planar `f32` samples and batches.
//!
//! - [`decode`]: custom binary blobs and raster images
//! - [`split`]: deterministic train/val/test partitioning
//! - [`feature`]: feature registration, file listing and the dataset layout
//! - [`transform`]: init transforms (baked into caches) and onload transforms
//! - [`cache`]: content-addressed cache files
//! - [`dataset`] / [`batch`]: sample and batch access
//! - [`factory`]: feature collection and dataset production

pub mod batch;
pub mod cache;
pub mod dataset;
pub mod decode;
pub mod error;
pub mod factory;
pub mod feature;
pub mod split;
pub mod transform;
pub mod types;

pub use batch::{Batch, BatchIter, DataLoader, FeatureBatch};
pub use cache::{CacheBuilder, CacheFile};
pub use dataset::{DatasetKind, GROUNDTRUTH_FEATURE, NprDataset, Sample};
pub use decode::{read_blob, read_image, write_blob};
pub use error::{DataError, Result};
pub use factory::{DataloaderFactory, FactoryConfig, PointRenderingFeatures};
pub use feature::{DatasetLayout, FeatureSpec};
pub use split::{SplitConfig, SplitKind, split_filename_list};
pub use transform::{OnloadTransform, OnloadTransforms, TransformDescriptor};
pub use types::{ChwArray, ImageArray};
