//! Random-projection dimensionality reduction for embeddings.
//!
//! Native encoder vectors (e.g. 512-d CLIP) are projected down to a smaller
//! storage dimension with a fixed random matrix. The matrix is generated
//! once from a fixed seed and persisted; every vector in the system, at
//! ingest and at query time, must go through the same matrix or the query
//! and index vectors end up in unrelated spaces.
//!
//! File format: projection_{native}x{reduced}.bin
//!
//! Header (17 bytes):
//! - version: u8 (1)
//! - native: u16 (little-endian)
//! - reduced: u16 (little-endian)
//! - seed: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Body:
//! - matrix: [f32; native * reduced] (little-endian, row-major)
//! - checksum: u32 (CRC32 of the matrix bytes)
//!
//! Generation procedure (fixed, so regeneration from scratch is
//! reproducible): StdRng seeded with `MATRIX_SEED`, standard-normal samples
//! via the Box-Muller transform, row-major fill.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + native(2) + reduced(2) + seed(8) + checksum(4)
const HEADER_SIZE: usize = 17;

/// Fixed seed for matrix generation.
const MATRIX_SEED: u64 = 42;

/// Norm below which a vector is considered unusable.
const ZERO_NORM_EPS: f32 = 1e-12;

#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Checksum mismatch: projection matrix file may be corrupted")]
    ChecksumMismatch,

    #[error("Cannot project a zero-norm vector")]
    ZeroNormVector,
}

/// A loaded projection matrix plus the shapes it maps between.
///
/// The fingerprint (SHA-256 of the matrix bytes) identifies the matrix
/// version; the vector index records it so that an index built under a
/// different matrix is refused instead of silently searched.
pub struct Projector {
    matrix: Vec<f32>,
    native: usize,
    reduced: usize,
    fingerprint: [u8; 32],
}

impl Projector {
    /// Load the persisted matrix for this shape, or generate and persist a
    /// new one if absent.
    ///
    /// Creation is atomic (temp file + rename) and generation is
    /// deterministic, so concurrent first-use cannot end up with two
    /// different matrices: racing writers produce identical bytes.
    pub fn load_or_create(
        path: &Path,
        native: usize,
        reduced: usize,
    ) -> Result<Self, ProjectionError> {
        if path.exists() {
            return Self::load(path, native, reduced);
        }

        log::info!(
            "no projection matrix at {}, generating {}x{} (seed {})",
            path.display(),
            native,
            reduced,
            MATRIX_SEED
        );

        let matrix = generate_matrix(native, reduced, MATRIX_SEED);
        write_matrix_file(path, &matrix, native, reduced, MATRIX_SEED)?;

        // Re-read what we just wrote so racing creators all end up with the
        // file's bytes, not their own buffer.
        Self::load(path, native, reduced)
    }

    /// Load a persisted matrix, validating shape and checksums.
    pub fn load(path: &Path, native: usize, reduced: usize) -> Result<Self, ProjectionError> {
        let file = std::fs::File::open(path)?;
        let mut reader = std::io::BufReader::new(file);

        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header)?;

        let version = header[0];
        if version > FORMAT_VERSION {
            return Err(ProjectionError::VersionMismatch(version, FORMAT_VERSION));
        }

        let file_native = u16::from_le_bytes([header[1], header[2]]) as usize;
        let file_reduced = u16::from_le_bytes([header[3], header[4]]) as usize;
        let stored_checksum = u32::from_le_bytes([header[13], header[14], header[15], header[16]]);
        if stored_checksum != crc32fast::hash(&header[0..13]) {
            return Err(ProjectionError::ChecksumMismatch);
        }

        if file_native != native {
            return Err(ProjectionError::DimensionMismatch {
                expected: native,
                got: file_native,
            });
        }
        if file_reduced != reduced {
            return Err(ProjectionError::DimensionMismatch {
                expected: reduced,
                got: file_reduced,
            });
        }

        let mut data = vec![0u8; native * reduced * 4];
        reader.read_exact(&mut data)?;

        let mut crc_bytes = [0u8; 4];
        reader.read_exact(&mut crc_bytes)?;
        if u32::from_le_bytes(crc_bytes) != crc32fast::hash(&data) {
            return Err(ProjectionError::ChecksumMismatch);
        }

        let mut matrix = Vec::with_capacity(native * reduced);
        for chunk in data.chunks_exact(4) {
            matrix.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }

        let mut hasher = Sha256::new();
        hasher.update(&data);
        let fingerprint: [u8; 32] = hasher.finalize().into();

        Ok(Self {
            matrix,
            native,
            reduced,
            fingerprint,
        })
    }

    pub fn native_dimensions(&self) -> usize {
        self.native
    }

    pub fn reduced_dimensions(&self) -> usize {
        self.reduced
    }

    /// SHA-256 of the matrix bytes; identifies the matrix version.
    pub fn fingerprint(&self) -> &[u8; 32] {
        &self.fingerprint
    }

    /// Identity mapping at a fixed dimension, for tests that need to
    /// control similarity scores exactly.
    #[cfg(test)]
    pub(crate) fn identity(dimensions: usize) -> Self {
        let mut matrix = vec![0.0f32; dimensions * dimensions];
        for i in 0..dimensions {
            matrix[i * dimensions + i] = 1.0;
        }
        Self {
            matrix,
            native: dimensions,
            reduced: dimensions,
            fingerprint: [0u8; 32],
        }
    }

    /// Project a native vector down to the reduced dimension.
    ///
    /// The input is re-normalized defensively (a no-op for already-unit
    /// vectors), multiplied by the matrix with 1/sqrt(reduced) scaling, and
    /// the result re-normalized: a random linear projection does not
    /// preserve norm.
    pub fn project(&self, vector: &[f32]) -> Result<Vec<f32>, ProjectionError> {
        if vector.len() != self.native {
            return Err(ProjectionError::DimensionMismatch {
                expected: self.native,
                got: vector.len(),
            });
        }

        let mut input = vector.to_vec();
        normalize(&mut input).ok_or(ProjectionError::ZeroNormVector)?;

        let scale = 1.0 / (self.reduced as f32).sqrt();
        let mut out = vec![0.0f32; self.reduced];
        for (i, &x) in input.iter().enumerate() {
            let row = &self.matrix[i * self.reduced..(i + 1) * self.reduced];
            for (j, &m) in row.iter().enumerate() {
                out[j] += x * m;
            }
        }
        for v in out.iter_mut() {
            *v *= scale;
        }

        normalize(&mut out).ok_or(ProjectionError::ZeroNormVector)?;
        Ok(out)
    }
}

/// L2-normalize in place. Returns None if the vector has ~zero norm.
pub fn normalize(v: &mut [f32]) -> Option<()> {
    let norm = l2_norm(v);
    if norm < ZERO_NORM_EPS {
        return None;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    Some(())
}

/// L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Generate a native x reduced standard-normal matrix from a fixed seed.
fn generate_matrix(native: usize, reduced: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let count = native * reduced;
    let mut out = Vec::with_capacity(count);
    while out.len() < count {
        // Box-Muller: two uniforms -> two independent standard normals.
        let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
        let u2: f64 = rng.random::<f64>();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f64::consts::PI * u2;
        out.push((r * theta.cos()) as f32);
        if out.len() < count {
            out.push((r * theta.sin()) as f32);
        }
    }
    out
}

/// Serialization lock: keeps two threads in this process from interleaving
/// temp-file writes for the same target path.
static WRITE_LOCK: Mutex<()> = Mutex::new(());

fn write_matrix_file(
    path: &Path,
    matrix: &[f32],
    native: usize,
    reduced: usize,
    seed: u64,
) -> Result<(), ProjectionError> {
    let _guard = WRITE_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    // Another creator may have won the race while we were generating.
    if path.exists() {
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = temp_sibling(path);
    let result = (|| -> Result<(), ProjectionError> {
        let file = std::fs::File::create(&tmp)?;
        let mut writer = std::io::BufWriter::new(file);

        let mut header = [0u8; HEADER_SIZE];
        header[0] = FORMAT_VERSION;
        header[1..3].copy_from_slice(&(native as u16).to_le_bytes());
        header[3..5].copy_from_slice(&(reduced as u16).to_le_bytes());
        header[5..13].copy_from_slice(&seed.to_le_bytes());
        let checksum = crc32fast::hash(&header[0..13]);
        header[13..17].copy_from_slice(&checksum.to_le_bytes());
        writer.write_all(&header)?;

        let mut data = Vec::with_capacity(matrix.len() * 4);
        for &v in matrix {
            data.extend_from_slice(&v.to_le_bytes());
        }
        writer.write_all(&data)?;
        writer.write_all(&crc32fast::hash(&data).to_le_bytes())?;

        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        file.sync_all()?;
        Ok(())
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }

    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    path.with_extension(format!("tmp.{}", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix_path(dir: &Path) -> PathBuf {
        dir.join("projection_8x4.bin")
    }

    #[test]
    fn test_create_then_load_same_projection() {
        let dir = tempfile::tempdir().unwrap();
        let path = matrix_path(dir.path());

        let p1 = Projector::load_or_create(&path, 8, 4).unwrap();
        let p2 = Projector::load_or_create(&path, 8, 4).unwrap();

        assert_eq!(p1.fingerprint(), p2.fingerprint());

        let v = vec![0.5, -0.25, 0.1, 0.0, 1.0, 2.0, -1.0, 0.75];
        let a = p1.project(&v).unwrap();
        let b = p2.project(&v).unwrap();
        // Bit-identical: same matrix bytes, same arithmetic.
        assert_eq!(a, b);
    }

    #[test]
    fn test_projection_is_unit_norm() {
        let dir = tempfile::tempdir().unwrap();
        let p = Projector::load_or_create(&matrix_path(dir.path()), 8, 4).unwrap();

        for scale in [0.001f32, 1.0, 1000.0] {
            let v: Vec<f32> = (0..8).map(|i| (i as f32 - 3.0) * scale).collect();
            let out = p.project(&v).unwrap();
            assert_eq!(out.len(), 4);
            assert!((l2_norm(&out) - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_project_normalized_input_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let p = Projector::load_or_create(&matrix_path(dir.path()), 8, 4).unwrap();

        let mut v: Vec<f32> = (0..8).map(|i| i as f32 + 1.0).collect();
        let raw = p.project(&v).unwrap();
        normalize(&mut v).unwrap();
        let pre_normalized = p.project(&v).unwrap();

        for (a, b) in raw.iter().zip(pre_normalized.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_input_dimension_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let p = Projector::load_or_create(&matrix_path(dir.path()), 8, 4).unwrap();

        let result = p.project(&[1.0, 2.0]);
        assert!(matches!(
            result,
            Err(ProjectionError::DimensionMismatch { expected: 8, got: 2 })
        ));
    }

    #[test]
    fn test_persisted_shape_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = matrix_path(dir.path());
        Projector::load_or_create(&path, 8, 4).unwrap();

        let result = Projector::load(&path, 16, 4);
        assert!(matches!(
            result,
            Err(ProjectionError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_zero_vector_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p = Projector::load_or_create(&matrix_path(dir.path()), 8, 4).unwrap();

        let result = p.project(&[0.0; 8]);
        assert!(matches!(result, Err(ProjectionError::ZeroNormVector)));
    }

    #[test]
    fn test_corrupted_file_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = matrix_path(dir.path());
        Projector::load_or_create(&path, 8, 4).unwrap();

        // Flip a byte in the matrix body.
        let mut bytes = std::fs::read(&path).unwrap();
        let mid = HEADER_SIZE + 10;
        bytes[mid] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let result = Projector::load(&path, 8, 4);
        assert!(matches!(result, Err(ProjectionError::ChecksumMismatch)));
    }

    #[test]
    fn test_generation_is_deterministic() {
        let a = generate_matrix(8, 4, MATRIX_SEED);
        let b = generate_matrix(8, 4, MATRIX_SEED);
        assert_eq!(a, b);

        let c = generate_matrix(8, 4, 7);
        assert_ne!(a, c);
    }
}
