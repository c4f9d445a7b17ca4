//! Per-frame asset decoding (images and raw binary blobs)

mod blob;
mod raster;

pub use blob::{BLOB_HEADER_LEN, BlobHeader, decode_blob, encode_blob, read_blob, write_blob};
pub use raster::read_image;
