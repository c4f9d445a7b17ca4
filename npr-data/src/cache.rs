//! Content-addressed on-disk frame cache
//!
//! A cache file holds one dense `[N, H, W, C]` little-endian `f32` array, one
//! row per frame, after a fixed header:
//!
//! ```text
//! b"NPRC" | u32 version | u64 N | u64 H | u64 W | u64 C | rows...
//! ```
//!
//! The file name is the SHA-256 of the feature names, every frame path, the
//! canonical init-transform descriptors and the array shape, so any change to
//! the inputs selects a different file. Files are written under a `.partial`
//! name and renamed only after every row is on disk; an interrupted build never
//! leaves a file that would be mistaken for a complete cache.

use crate::decode::read_image;
use crate::error::{DataError, Result};
use crate::feature::FeatureFrames;
use crate::types::ImageArray;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CACHE_MAGIC: &[u8; 4] = b"NPRC";
pub const CACHE_VERSION: u32 = 1;
pub const CACHE_HEADER_LEN: u64 = 40;
pub const CACHE_EXTENSION: &str = "npc";

/// Dimensions of a cache array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheShape {
    pub frames: usize,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl CacheShape {
    pub fn row_len(&self) -> usize {
        self.height * self.width * self.channels
    }

    fn row_bytes(&self) -> u64 {
        self.row_len() as u64 * 4
    }

    fn row_offset(&self, index: usize) -> u64 {
        CACHE_HEADER_LEN + index as u64 * self.row_bytes()
    }
}

/// Channel range `lo..hi` of one feature inside a cache row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpan {
    pub feature: String,
    pub lo: usize,
    pub hi: usize,
}

/// Sidecar written next to each cache file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheManifest {
    pub shape: CacheShape,
    pub spans: Vec<ChannelSpan>,
    pub keys: Vec<String>,
}

/// Read handle description of a complete cache file.
///
/// No file descriptor is kept: every row read opens its own handle, so
/// loader threads never share a cursor.
#[derive(Debug, Clone)]
pub struct CacheFile {
    path: PathBuf,
    shape: CacheShape,
}

impl CacheFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| DataError::io(path, e))?;
        let mut reader = BufReader::new(file);
        let shape = read_header(&mut reader, path)?;
        let expected = shape.row_offset(shape.frames);
        let actual = std::fs::metadata(path)
            .map_err(|e| DataError::io(path, e))?
            .len();
        if actual != expected {
            return Err(DataError::CacheFormat {
                path: path.to_path_buf(),
                reason: format!("file is {} bytes, header implies {}", actual, expected),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
            shape,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn shape(&self) -> CacheShape {
        self.shape
    }

    /// Reads row `index` as an `[H, W, C]` array.
    pub fn read_row(&self, index: usize) -> Result<ImageArray> {
        if index >= self.shape.frames {
            return Err(DataError::IndexOutOfRange {
                index,
                len: self.shape.frames,
            });
        }
        let mut file = File::open(&self.path).map_err(|e| DataError::io(&self.path, e))?;
        file.seek(SeekFrom::Start(self.shape.row_offset(index)))
            .map_err(|e| DataError::io(&self.path, e))?;
        let mut bytes = vec![0u8; self.shape.row_bytes() as usize];
        file.read_exact(&mut bytes)
            .map_err(|e| DataError::io(&self.path, e))?;
        let mut row = vec![0f32; self.shape.row_len()];
        LittleEndian::read_f32_into(&bytes, &mut row);
        ImageArray::new(self.shape.height, self.shape.width, self.shape.channels, row)
    }
}

fn read_header<R: Read>(reader: &mut R, path: &Path) -> Result<CacheShape> {
    let bad = |reason: &str| DataError::CacheFormat {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|_| bad("truncated header"))?;
    if &magic != CACHE_MAGIC {
        return Err(bad("bad magic"));
    }
    let version = reader
        .read_u32::<LittleEndian>()
        .map_err(|_| bad("truncated header"))?;
    if version != CACHE_VERSION {
        return Err(bad(&format!("unsupported version {version}")));
    }
    let mut dims = [0usize; 4];
    for dim in dims.iter_mut() {
        *dim = reader
            .read_u64::<LittleEndian>()
            .map_err(|_| bad("truncated header"))? as usize;
    }
    let [frames, height, width, channels] = dims;
    Ok(CacheShape {
        frames,
        height,
        width,
        channels,
    })
}

fn write_header<W: Write>(writer: &mut W, shape: &CacheShape) -> std::io::Result<()> {
    writer.write_all(CACHE_MAGIC)?;
    writer.write_u32::<LittleEndian>(CACHE_VERSION)?;
    for dim in [shape.frames, shape.height, shape.width, shape.channels] {
        writer.write_u64::<LittleEndian>(dim as u64)?;
    }
    Ok(())
}

/// Decodes frame `index` of a feature and applies its init transform.
pub fn load_frame(feature: &FeatureFrames, index: usize) -> Result<ImageArray> {
    let frame = feature
        .frames
        .get(index)
        .ok_or(DataError::IndexOutOfRange {
            index,
            len: feature.frames.len(),
        })?;
    feature.init.apply(read_image(&frame.path, feature.channels)?)
}

/// `[H, W, C]` of a feature after its init transform, from its first frame.
pub fn probe_shape(feature: &FeatureFrames) -> Result<[usize; 3]> {
    Ok(load_frame(feature, 0)?.shape())
}

#[derive(Serialize)]
struct KeyMaterial<'a> {
    features: Vec<&'a str>,
    paths: Vec<Vec<&'a Path>>,
    transforms: Vec<String>,
    shape: CacheShape,
}

/// Hex digest naming the cache file of `features` with `shape`.
pub fn cache_key(features: &[FeatureFrames], shape: &CacheShape) -> Result<String> {
    let material = KeyMaterial {
        features: features.iter().map(|f| f.name.as_str()).collect(),
        paths: features
            .iter()
            .map(|f| f.frames.iter().map(|frame| frame.path.as_path()).collect())
            .collect(),
        transforms: features
            .iter()
            .map(|f| f.init.canonical())
            .collect::<Result<_>>()?,
        shape: *shape,
    };
    let digest = Sha256::digest(serde_json::to_vec(&material)?);
    Ok(hex::encode(digest))
}

/// A cache ready for reading.
#[derive(Debug, Clone)]
pub struct BuiltCache {
    pub file: CacheFile,
    pub manifest: CacheManifest,
    pub key: String,
    /// Whether an existing file was reused instead of built.
    pub reused: bool,
}

/// Builds (or reuses) the cache of a group of features.
#[derive(Debug, Clone)]
pub struct CacheBuilder {
    cache_dir: PathBuf,
    show_progress: bool,
}

impl CacheBuilder {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            show_progress: true,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Resolves shapes, derives the key and builds the file unless it exists.
    ///
    /// All features must share one `H x W` after their init transform.
    #[tracing::instrument(skip_all, fields(cache_dir = %self.cache_dir.display()))]
    pub fn build(&self, features: &[FeatureFrames]) -> Result<BuiltCache> {
        let first = features.first().ok_or(DataError::NoFeatures)?;
        let frames = first.frames.len();

        let mut spans = Vec::with_capacity(features.len());
        let mut spatial: Option<[usize; 2]> = None;
        let mut channels = 0;
        for feature in features {
            let [h, w, c] = probe_shape(feature)?;
            match spatial {
                None => spatial = Some([h, w]),
                Some(expected) if expected != [h, w] => {
                    return Err(DataError::ShapeMismatch {
                        feature: feature.name.clone(),
                        expected,
                        got: [h, w],
                    });
                }
                Some(_) => {}
            }
            spans.push(ChannelSpan {
                feature: feature.name.clone(),
                lo: channels,
                hi: channels + c,
            });
            channels += c;
        }
        let [height, width] = spatial.ok_or(DataError::NoFeatures)?;
        let shape = CacheShape {
            frames,
            height,
            width,
            channels,
        };

        let key = cache_key(features, &shape)?;
        let path = self.cache_dir.join(format!("{key}.{CACHE_EXTENSION}"));
        let manifest = CacheManifest {
            shape,
            spans,
            keys: first.keys().map(str::to_string).collect(),
        };

        if path.exists() {
            info!("Reusing cache {}", path.display());
            let file = CacheFile::open(&path)?;
            if file.shape() != shape {
                return Err(DataError::CacheFormat {
                    path,
                    reason: format!("stored shape {:?} differs from {:?}", file.shape(), shape),
                });
            }
            return Ok(BuiltCache {
                file,
                manifest,
                key,
                reused: true,
            });
        }

        info!(
            "Building cache {:?} -> {} ({} frames of {}x{}x{})",
            features.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            path.display(),
            frames,
            height,
            width,
            channels
        );
        self.write_cache(features, &manifest, &path)?;
        Ok(BuiltCache {
            file: CacheFile::open(&path)?,
            manifest,
            key,
            reused: false,
        })
    }

    fn write_cache(
        &self,
        features: &[FeatureFrames],
        manifest: &CacheManifest,
        path: &Path,
    ) -> Result<()> {
        std::fs::create_dir_all(&self.cache_dir).map_err(|e| DataError::io(&self.cache_dir, e))?;
        let shape = manifest.shape;
        let partial = path.with_extension(format!("{CACHE_EXTENSION}.partial"));
        {
            let mut file = File::create(&partial).map_err(|e| DataError::io(&partial, e))?;
            write_header(&mut file, &shape).map_err(|e| DataError::io(&partial, e))?;
            file.set_len(shape.row_offset(shape.frames))
                .map_err(|e| DataError::io(&partial, e))?;
        }

        let progress = if self.show_progress {
            ProgressBar::new(shape.frames as u64)
        } else {
            ProgressBar::hidden()
        };
        progress.set_style(
            ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len} ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        progress.set_message("caching frames");

        (0..shape.frames).into_par_iter().try_for_each(|index| {
            let row = self.assemble_row(features, manifest, index)?;
            let mut bytes = vec![0u8; row.data().len() * 4];
            LittleEndian::write_f32_into(row.data(), &mut bytes);
            let mut file = OpenOptions::new()
                .write(true)
                .open(&partial)
                .map_err(|e| DataError::io(&partial, e))?;
            file.seek(SeekFrom::Start(shape.row_offset(index)))
                .and_then(|_| file.write_all(&bytes))
                .map_err(|e| DataError::io(&partial, e))?;
            progress.inc(1);
            Ok::<_, DataError>(())
        })?;
        progress.finish_and_clear();

        let sidecar = path.with_extension("json");
        std::fs::write(&sidecar, serde_json::to_vec_pretty(manifest)?)
            .map_err(|e| DataError::io(&sidecar, e))?;
        std::fs::rename(&partial, path).map_err(|e| DataError::io(path, e))?;
        debug!("Cache {} complete", path.display());
        Ok(())
    }

    fn assemble_row(
        &self,
        features: &[FeatureFrames],
        manifest: &CacheManifest,
        index: usize,
    ) -> Result<ImageArray> {
        let shape = manifest.shape;
        let mut parts = Vec::with_capacity(features.len());
        for (feature, span) in features.iter().zip(&manifest.spans) {
            let frame = load_frame(feature, index)?;
            if frame.height() != shape.height || frame.width() != shape.width {
                return Err(DataError::ShapeMismatch {
                    feature: feature.name.clone(),
                    expected: [shape.height, shape.width],
                    got: [frame.height(), frame.width()],
                });
            }
            if frame.channels() != span.hi - span.lo {
                return Err(DataError::ArrayShape(format!(
                    "frame {} of '{}' has {} channels, expected {}",
                    index,
                    feature.name,
                    frame.channels(),
                    span.hi - span.lo
                )));
            }
            parts.push(frame);
        }
        ImageArray::concat_channels(&parts)
    }
}
