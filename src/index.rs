//! Vector index adapter: the contract the retrieval engine and collection
//! manager need from a similarity-search provider, plus a local
//! file-backed provider used by default.
//!
//! Similarity is cosine over unit-normalized vectors (equivalent to inner
//! product given the normalization invariant). Result order for exact
//! score ties is provider-defined; no secondary tie-break is imposed.
//!
//! Local provider file format: vectors.bin
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - matrix_fingerprint: [u8; 32] (SHA-256 of the projection matrix)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated):
//! - content_id: [u8; 32] (raw SHA-256)
//! - path_len: u16 (little-endian) + path bytes (UTF-8)
//! - embedding: [f32; dimensions] (little-endian)
//!
//! The fingerprint pins the index to the projection matrix that produced
//! its vectors; loading under a different matrix is refused outright
//! rather than serving incoherent results.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::content_id::{bytes_to_hex, hex_to_bytes};
use crate::projection::l2_norm;

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size: version(1) + fingerprint(32) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot store or search with zero-norm vector")]
    ZeroNormVector,

    #[error("Malformed content id: {0}")]
    BadContentId(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Checksum mismatch: index file may be corrupted")]
    ChecksumMismatch,

    #[error(
        "Index was built with a different projection matrix; re-index the collection \
         or restore the original matrix file"
    )]
    MatrixMismatch,

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),
}

/// One stage-1 match, highest-similarity-first in query results.
#[derive(Debug, Clone)]
pub struct IndexMatch {
    pub id: String,
    pub score: f32,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct IndexStats {
    pub count: usize,
    pub dimensions: usize,
    pub name: String,
}

/// Contract over an external similarity-search capability.
pub trait VectorIndex: Send + Sync {
    /// Insert or overwrite the vector for an id. Idempotent: re-upserting
    /// the same id replaces, never duplicates.
    fn upsert(&self, id: &str, embedding: &[f32], path: &str) -> Result<(), IndexError>;

    /// Remove one id. Returns whether it was present.
    fn delete(&self, id: &str) -> Result<bool, IndexError>;

    /// Remove everything. Returns how many entries were removed.
    fn delete_all(&self) -> Result<usize, IndexError>;

    /// Top-k most similar entries, highest cosine first. Tie order between
    /// equal scores is provider-defined.
    fn query_top_k(&self, query: &[f32], k: usize) -> Result<Vec<IndexMatch>, IndexError>;

    /// Resolve a source path back to its indexed id, if any.
    fn find_by_path(&self, path: &str) -> Result<Option<String>, IndexError>;

    /// All indexed ids (for reconciliation against the caption store).
    fn list_ids(&self) -> Result<Vec<String>, IndexError>;

    fn stats(&self) -> Result<IndexStats, IndexError>;

    /// Flush durable state. No-op for providers that persist per call.
    fn persist(&self) -> Result<(), IndexError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Entry {
    embedding: Vec<f32>,
    path: String,
}

/// File-backed local provider: an in-memory map with write-through binary
/// persistence, so every mutation is durable once the call returns.
pub struct LocalIndex {
    name: String,
    file_path: PathBuf,
    dimensions: usize,
    fingerprint: [u8; 32],
    entries: Mutex<HashMap<String, Entry>>,
}

impl LocalIndex {
    /// Open (or create) the index file, validating version, checksum,
    /// dimensions, and projection-matrix fingerprint.
    pub fn open(
        file_path: PathBuf,
        name: &str,
        dimensions: usize,
        fingerprint: [u8; 32],
    ) -> Result<Self, IndexError> {
        let entries = if file_path.exists() {
            Self::load_file(&file_path, dimensions, &fingerprint)?
        } else {
            HashMap::new()
        };

        Ok(Self {
            name: name.to_string(),
            file_path,
            dimensions,
            fingerprint,
            entries: Mutex::new(entries),
        })
    }

    fn load_file(
        path: &Path,
        expected_dimensions: usize,
        expected_fingerprint: &[u8; 32],
    ) -> Result<HashMap<String, Entry>, IndexError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header)?;

        let version = header[0];
        if version > FORMAT_VERSION {
            return Err(IndexError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored_checksum = u32::from_le_bytes([header[43], header[44], header[45], header[46]]);
        if stored_checksum != crc32fast::hash(&header[0..43]) {
            return Err(IndexError::ChecksumMismatch);
        }

        let mut fingerprint = [0u8; 32];
        fingerprint.copy_from_slice(&header[1..33]);
        if &fingerprint != expected_fingerprint {
            return Err(IndexError::MatrixMismatch);
        }

        let dimensions = u16::from_le_bytes([header[33], header[34]]) as usize;
        if dimensions != expected_dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: expected_dimensions,
                got: dimensions,
            });
        }

        let entry_count = u64::from_le_bytes([
            header[35], header[36], header[37], header[38], header[39], header[40], header[41],
            header[42],
        ]);

        let mut entries = HashMap::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            let mut id_bytes = [0u8; 32];
            reader.read_exact(&mut id_bytes)?;
            let id = bytes_to_hex(&id_bytes);

            let mut len_bytes = [0u8; 2];
            reader.read_exact(&mut len_bytes)?;
            let path_len = u16::from_le_bytes(len_bytes) as usize;
            let mut path_bytes = vec![0u8; path_len];
            reader.read_exact(&mut path_bytes)?;
            let entry_path = String::from_utf8(path_bytes)
                .map_err(|e| IndexError::InvalidFormat(format!("non-UTF-8 path: {e}")))?;

            let mut embedding = Vec::with_capacity(dimensions);
            let mut float_bytes = [0u8; 4];
            for _ in 0..dimensions {
                reader.read_exact(&mut float_bytes)?;
                embedding.push(f32::from_le_bytes(float_bytes));
            }

            entries.insert(
                id,
                Entry {
                    embedding,
                    path: entry_path,
                },
            );
        }

        Ok(entries)
    }

    /// Atomic save: temp file -> fsync -> rename.
    fn save(&self, entries: &HashMap<String, Entry>) -> Result<(), IndexError> {
        let tmp = self
            .file_path
            .with_extension(format!("tmp.{}", std::process::id()));

        let result = self.write_to_file(&tmp, entries);
        if let Err(e) = result {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }

        std::fs::rename(&tmp, &self.file_path)?;
        Ok(())
    }

    fn write_to_file(
        &self,
        path: &Path,
        entries: &HashMap<String, Entry>,
    ) -> Result<(), IndexError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let mut header = [0u8; HEADER_SIZE];
        header[0] = FORMAT_VERSION;
        header[1..33].copy_from_slice(&self.fingerprint);
        header[33..35].copy_from_slice(&(self.dimensions as u16).to_le_bytes());
        header[35..43].copy_from_slice(&(entries.len() as u64).to_le_bytes());
        let checksum = crc32fast::hash(&header[0..43]);
        header[43..47].copy_from_slice(&checksum.to_le_bytes());
        writer.write_all(&header)?;

        for (id, entry) in entries {
            let id_bytes =
                hex_to_bytes(id).ok_or_else(|| IndexError::BadContentId(id.clone()))?;
            writer.write_all(&id_bytes)?;

            let path_bytes = entry.path.as_bytes();
            if path_bytes.len() > u16::MAX as usize {
                return Err(IndexError::InvalidFormat(format!(
                    "path too long: {}",
                    entry.path
                )));
            }
            writer.write_all(&(path_bytes.len() as u16).to_le_bytes())?;
            writer.write_all(path_bytes)?;

            for &value in &entry.embedding {
                writer.write_all(&value.to_le_bytes())?;
            }
        }

        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        file.sync_all()?;
        Ok(())
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl VectorIndex for LocalIndex {
    fn upsert(&self, id: &str, embedding: &[f32], path: &str) -> Result<(), IndexError> {
        if embedding.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: embedding.len(),
            });
        }
        if l2_norm(embedding) < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }
        if hex_to_bytes(id).is_none() {
            return Err(IndexError::BadContentId(id.to_string()));
        }

        let mut entries = self.lock_entries();
        entries.insert(
            id.to_string(),
            Entry {
                embedding: embedding.to_vec(),
                path: path.to_string(),
            },
        );
        self.save(&entries)
    }

    fn delete(&self, id: &str) -> Result<bool, IndexError> {
        let mut entries = self.lock_entries();
        let removed = entries.remove(id).is_some();
        if removed {
            self.save(&entries)?;
        }
        Ok(removed)
    }

    fn delete_all(&self) -> Result<usize, IndexError> {
        let mut entries = self.lock_entries();
        let count = entries.len();
        entries.clear();
        self.save(&entries)?;
        Ok(count)
    }

    fn query_top_k(&self, query: &[f32], k: usize) -> Result<Vec<IndexMatch>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }
        let query_norm = l2_norm(query);
        if query_norm < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        let entries = self.lock_entries();
        let mut results: Vec<IndexMatch> = entries
            .iter()
            .map(|(id, entry)| {
                let target_norm = l2_norm(&entry.embedding);
                let score = if target_norm < f32::EPSILON {
                    0.0
                } else {
                    let dot: f32 = query
                        .iter()
                        .zip(entry.embedding.iter())
                        .map(|(a, b)| a * b)
                        .sum();
                    dot / (query_norm * target_norm)
                };
                IndexMatch {
                    id: id.clone(),
                    score,
                    path: entry.path.clone(),
                }
            })
            .collect();

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(k);
        Ok(results)
    }

    fn find_by_path(&self, path: &str) -> Result<Option<String>, IndexError> {
        let entries = self.lock_entries();
        Ok(entries
            .iter()
            .find(|(_, e)| e.path == path)
            .map(|(id, _)| id.clone()))
    }

    fn list_ids(&self) -> Result<Vec<String>, IndexError> {
        Ok(self.lock_entries().keys().cloned().collect())
    }

    fn stats(&self) -> Result<IndexStats, IndexError> {
        Ok(IndexStats {
            count: self.lock_entries().len(),
            dimensions: self.dimensions,
            name: self.name.clone(),
        })
    }

    fn persist(&self) -> Result<(), IndexError> {
        let entries = self.lock_entries();
        self.save(&entries)
    }
}
