//! Network building blocks and the point-rendering network
//!
//! - `blocks`: convolution blocks, pooling and upsampling stages
//! - `warp`: backward warping with texture coordinates or pixel offsets
//! - `extraction`: current-frame and auxiliary-frame feature extraction
//! - `reweighting`: per-frame weight maps for warped auxiliary features
//! - `reconstruction`: multi-scale UNet
//! - `inovis`: the complete network

pub mod blocks;
pub mod extraction;
pub mod inovis;
pub mod reconstruction;
pub mod reweighting;
pub mod warp;

pub use blocks::{ConvBlockKind, InitType, PoolingMode, UpsampleMode};
pub use inovis::{Inovis, InovisConfig, InovisTrace};
pub use reconstruction::FinalActivation;
pub use warp::WarpMode;
