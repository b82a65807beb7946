//! `.dgz` dose archives.
//!
//! Layout inside one gzip stream: magic `DOSEGRD1`, little-endian `u32`
//! metadata length, JSON metadata, three little-endian `u64` axis lengths,
//! then the x-major `f64` dose values.

use crate::algorithms::AlgorithmKind;
use crate::common::config::CalculationOptions;
use crate::domain::{DoseError, DoseGrid, Grid3};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

pub const ARCHIVE_MAGIC: &[u8; 8] = b"DOSEGRD1";
pub const ARCHIVE_FORMAT_VERSION: u32 = 1;
const MAX_METADATA_BYTES: u32 = 16 * 1024 * 1024;
/// Largest dose grid a header may declare (2 GiB of `f64`).
pub const MAX_ARCHIVE_VOXELS: usize = 1 << 28;
const READ_CHUNK_VALUES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub format_version: u32,
    pub algorithm: AlgorithmKind,
    pub resolution_mm: Option<f64>,
    pub spacing: [f64; 3],
    pub heterogeneity_correction: bool,
    pub options: CalculationOptions,
    pub shape: [usize; 3],
    pub uncertainty: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DoseArchive {
    pub metadata: ArchiveMetadata,
    pub dose: DoseGrid,
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("dose archive '{}' I/O failed: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("'{}' is not a dose archive (bad magic)", path.display())]
    Magic { path: PathBuf },
    #[error("dose archive '{}' has invalid metadata: {source}", path.display())]
    Metadata {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("dose archive '{}' is inconsistent: {reason}", path.display())]
    Inconsistent { path: PathBuf, reason: String },
}

impl From<ArchiveError> for DoseError {
    fn from(error: ArchiveError) -> Self {
        match &error {
            ArchiveError::Io { .. } => DoseError::io_system("IO.ARCHIVE", error.to_string()),
            _ => DoseError::validation("INPUT.ARCHIVE_FORMAT", error.to_string()),
        }
    }
}

pub fn write_archive(path: impl AsRef<Path>, archive: &DoseArchive) -> Result<(), ArchiveError> {
    let path = path.as_ref();
    let io = |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    };
    if archive.metadata.shape != archive.dose.shape() {
        return Err(ArchiveError::Inconsistent {
            path: path.to_path_buf(),
            reason: format!(
                "metadata shape {:?} differs from dose shape {:?}",
                archive.metadata.shape,
                archive.dose.shape()
            ),
        });
    }
    let metadata = serde_json::to_vec(&archive.metadata).map_err(|source| ArchiveError::Metadata {
        path: path.to_path_buf(),
        source,
    })?;
    let metadata_len = u32::try_from(metadata.len()).map_err(|_| ArchiveError::Inconsistent {
        path: path.to_path_buf(),
        reason: "metadata exceeds 4 GiB".to_string(),
    })?;

    let file = File::create(path).map_err(io)?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    encoder.write_all(ARCHIVE_MAGIC).map_err(io)?;
    encoder.write_u32::<LittleEndian>(metadata_len).map_err(io)?;
    encoder.write_all(&metadata).map_err(io)?;
    for axis in archive.dose.shape() {
        encoder.write_u64::<LittleEndian>(axis as u64).map_err(io)?;
    }
    for value in archive.dose.as_slice() {
        encoder.write_f64::<LittleEndian>(*value).map_err(io)?;
    }
    encoder.finish().map_err(io)?.flush().map_err(io)
}

pub fn read_archive(path: impl AsRef<Path>) -> Result<DoseArchive, ArchiveError> {
    let path = path.as_ref();
    let io = |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    };
    let inconsistent = |reason: String| ArchiveError::Inconsistent {
        path: path.to_path_buf(),
        reason,
    };
    let file = File::open(path).map_err(io)?;
    let mut decoder = GzDecoder::new(BufReader::new(file));

    let mut magic = [0u8; 8];
    decoder.read_exact(&mut magic).map_err(|source| {
        if source.kind() == std::io::ErrorKind::InvalidInput
            || source.kind() == std::io::ErrorKind::UnexpectedEof
        {
            ArchiveError::Magic {
                path: path.to_path_buf(),
            }
        } else {
            io(source)
        }
    })?;
    if &magic != ARCHIVE_MAGIC {
        return Err(ArchiveError::Magic {
            path: path.to_path_buf(),
        });
    }

    let metadata_len = decoder.read_u32::<LittleEndian>().map_err(io)?;
    if metadata_len > MAX_METADATA_BYTES {
        return Err(inconsistent(format!(
            "metadata length {metadata_len} exceeds the {MAX_METADATA_BYTES} byte limit"
        )));
    }
    let mut metadata = vec![0u8; metadata_len as usize];
    decoder.read_exact(&mut metadata).map_err(io)?;
    let metadata: ArchiveMetadata =
        serde_json::from_slice(&metadata).map_err(|source| ArchiveError::Metadata {
            path: path.to_path_buf(),
            source,
        })?;

    let mut shape = [0usize; 3];
    for axis in &mut shape {
        let value = decoder.read_u64::<LittleEndian>().map_err(io)?;
        *axis = usize::try_from(value)
            .map_err(|_| inconsistent(format!("axis length {value} does not fit in memory")))?;
    }
    if shape != metadata.shape {
        return Err(inconsistent(format!(
            "stored shape {shape:?} differs from metadata shape {:?}",
            metadata.shape
        )));
    }
    let count = shape
        .iter()
        .try_fold(1usize, |product, axis| product.checked_mul(*axis))
        .ok_or_else(|| inconsistent(format!("shape {shape:?} overflows")))?;
    if count > MAX_ARCHIVE_VOXELS {
        return Err(inconsistent(format!(
            "shape {shape:?} declares {count} voxels, above the {MAX_ARCHIVE_VOXELS} voxel limit"
        )));
    }

    // Memory grows with the decoded payload, not with the declared count.
    let mut values = Vec::with_capacity(count.min(READ_CHUNK_VALUES));
    let mut chunk = vec![0.0; count.min(READ_CHUNK_VALUES)];
    while values.len() < count {
        let take = (count - values.len()).min(READ_CHUNK_VALUES);
        decoder
            .read_f64_into::<LittleEndian>(&mut chunk[..take])
            .map_err(|source| {
                if source.kind() == std::io::ErrorKind::UnexpectedEof {
                    inconsistent(format!("expected {count} dose values, stream ended early"))
                } else {
                    io(source)
                }
            })?;
        values.extend_from_slice(&chunk[..take]);
    }
    let mut trailing = [0u8; 1];
    if decoder.read(&mut trailing).map_err(io)? != 0 {
        return Err(inconsistent("unexpected bytes after dose values".to_string()));
    }
    let dose = Grid3::from_vec(shape, values)
        .map_err(|error| inconsistent(error.message().to_string()))?;
    Ok(DoseArchive { metadata, dose })
}
