//! Content-addressed disk cache fronting the generation service.
//!
//! One JSON file per key, so a crash mid-batch loses at most the in-flight
//! entry. Lookups are read-through; generation results are written through
//! atomically (temp file + rename), so a reader never observes a torn
//! entry. A malformed entry is discarded and regenerated on the next
//! access instead of crashing the caller.
//!
//! Two instances exist in practice: captions keyed by ContentId, and
//! enhanced queries keyed by a hash of the normalized query text. Both
//! share the same `RateGate`.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::content_id::content_id_bytes;
use crate::gateway::{Clock, RateGate, RetryPolicy};
use crate::generate::GenerationError;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Generation failed: {0}")]
    Generation(#[from] GenerationError),
}

/// Where a value came from on this lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Generated,
    CacheHit,
}

/// On-disk shape of a single cache entry.
#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    value: String,
    ts: i64,
}

/// Durable key/value cache with a rate-limited generation path.
pub struct ContentCache {
    dir: PathBuf,
    gate: Arc<RateGate>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    /// Serializes same-key writes from concurrent callers.
    write_lock: Mutex<()>,
}

impl ContentCache {
    pub fn new(
        dir: PathBuf,
        gate: Arc<RateGate>,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CacheError> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            gate,
            retry,
            clock,
            write_lock: Mutex::new(()),
        })
    }

    /// Read a cached value. Never touches the gate. A malformed entry is
    /// removed and treated as a miss.
    pub fn get(&self, key: &str) -> Option<String> {
        let path = self.entry_path(key);
        let bytes = std::fs::read(&path).ok()?;
        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) => Some(entry.value),
            Err(e) => {
                log::warn!(
                    "discarding corrupt cache entry {} ({e}); it will be regenerated",
                    path.display()
                );
                let _ = std::fs::remove_file(&path);
                None
            }
        }
    }

    /// Write a value for a key, atomically.
    pub fn put(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let entry = CacheEntry {
            value: value.to_string(),
            ts: chrono::Utc::now().timestamp(),
        };
        let path = self.entry_path(key);
        let tmp = path.with_extension(format!("tmp.{}", std::process::id()));

        let data = serde_json::to_vec(&entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&tmp, &data)?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Return the cached value for `key`, or invoke `generate` through the
    /// rate gate (with bounded retries) and persist the result.
    ///
    /// A generation failure leaves the cache untouched: no poisoned values,
    /// and entries already cached for other keys are unaffected.
    pub fn get_or_generate<F>(
        &self,
        key: &str,
        mut generate: F,
    ) -> Result<(String, Provenance), CacheError>
    where
        F: FnMut() -> Result<String, GenerationError>,
    {
        if let Some(value) = self.get(key) {
            return Ok((value, Provenance::CacheHit));
        }

        let value = self.retry.run(self.clock.as_ref(), || {
            self.gate.admit();
            generate()
        })?;

        self.put(key, &value)?;
        Ok((value, Provenance::Generated))
    }

    /// Remove the entry for a key. Returns whether one existed.
    pub fn remove(&self, key: &str) -> bool {
        std::fs::remove_file(self.entry_path(key)).is_ok()
    }

    /// Number of entries on disk.
    pub fn len(&self) -> usize {
        self.entry_paths().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete every entry. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        for path in self.entry_paths().collect::<Vec<_>>() {
            if std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn entry_paths(&self) -> impl Iterator<Item = PathBuf> {
        std::fs::read_dir(&self.dir)
            .into_iter()
            .flatten()
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
    }
}

/// Cache key for an enhanced query: hash of the lowercased,
/// whitespace-collapsed text, so trivially different spellings share an
/// entry and the key is filesystem-safe.
pub fn query_cache_key(raw: &str) -> String {
    let normalized = raw
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    content_id_bytes(normalized.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::FakeClock;
    use crate::gateway::RateGateConfig;
    use std::time::Duration;

    fn test_cache(dir: &std::path::Path) -> ContentCache {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new());
        let gate = Arc::new(RateGate::new(RateGateConfig::default(), clock.clone()));
        ContentCache::new(
            dir.to_path_buf(),
            gate,
            RetryPolicy::new(3, Duration::from_millis(1)),
            clock,
        )
        .unwrap()
    }

    #[test]
    fn test_miss_generates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());

        let (value, prov) = cache
            .get_or_generate("k1", || Ok("a sunny beach".to_string()))
            .unwrap();
        assert_eq!(value, "a sunny beach");
        assert_eq!(prov, Provenance::Generated);
        assert_eq!(cache.len(), 1);

        // Survives a fresh handle over the same directory.
        let cache2 = test_cache(dir.path());
        assert_eq!(cache2.get("k1").unwrap(), "a sunny beach");
    }

    #[test]
    fn test_hit_never_invokes_generator() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        cache.put("k1", "cached caption").unwrap();

        let mut calls = 0;
        let (value, prov) = cache
            .get_or_generate("k1", || {
                calls += 1;
                Ok("fresh".to_string())
            })
            .unwrap();

        assert_eq!(value, "cached caption");
        assert_eq!(prov, Provenance::CacheHit);
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_retry_then_success_writes_single_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());

        let mut calls = 0;
        let (value, prov) = cache
            .get_or_generate("k1", || {
                calls += 1;
                if calls < 3 {
                    Err(GenerationError::Retryable("quota".into()))
                } else {
                    Ok("finally".to_string())
                }
            })
            .unwrap();

        assert_eq!(value, "finally");
        assert_eq!(prov, Provenance::Generated);
        assert_eq!(calls, 3);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_exhausted_retries_leave_cache_clean() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        cache.put("other", "kept").unwrap();

        let result = cache.get_or_generate("k1", || {
            Err(GenerationError::Retryable("down".into()))
        });

        assert!(matches!(result, Err(CacheError::Generation(_))));
        assert!(cache.get("k1").is_none());
        // Entries for other keys are untouched.
        assert_eq!(cache.get("other").unwrap(), "kept");
    }

    #[test]
    fn test_corrupt_entry_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        std::fs::write(dir.path().join("k1.json"), b"{ not json").unwrap();

        let (value, prov) = cache
            .get_or_generate("k1", || Ok("regenerated".to_string()))
            .unwrap();
        assert_eq!(value, "regenerated");
        assert_eq!(prov, Provenance::Generated);
    }

    #[test]
    fn test_remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        cache.put("a", "1").unwrap();
        cache.put("b", "2").unwrap();

        assert!(cache.remove("a"));
        assert!(!cache.remove("a"));
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.clear(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_query_cache_key_normalizes() {
        assert_eq!(query_cache_key("Red  Car"), query_cache_key("red car"));
        assert_eq!(query_cache_key("  red car \n"), query_cache_key("red car"));
        assert_ne!(query_cache_key("red car"), query_cache_key("blue car"));
    }

    #[test]
    fn test_generator_calls_pass_the_gate() {
        let dir = tempfile::tempdir().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new());
        let gate = Arc::new(RateGate::new(RateGateConfig::default(), clock.clone()));
        let cache = ContentCache::new(
            dir.path().to_path_buf(),
            gate.clone(),
            RetryPolicy::new(1, Duration::from_millis(1)),
            clock,
        )
        .unwrap();

        cache.get_or_generate("k1", || Ok("v".to_string())).unwrap();
        assert_eq!(gate.total_calls(), 1);

        // Hits bypass the gate entirely.
        cache.get_or_generate("k1", || Ok("v".to_string())).unwrap();
        assert_eq!(gate.total_calls(), 1);
    }
}
