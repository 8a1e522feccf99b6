//! Caption records and the service that produces them.
//!
//! Two layers of persistence exist on purpose. The caption cache
//! (`ContentCache`) is the content-addressed source of truth keyed by
//! ContentId; it survives wipes of the collection. The caption store
//! (captions.json) is the per-collection snapshot the search path reads,
//! written through on every change. The service checks the store first,
//! then the cache, and only then pays for a generation call.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::cache::{CacheError, ContentCache, Provenance};
use crate::generate::{CaptionStats, Generator};

#[derive(Debug, thiserror::Error)]
pub enum CaptionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// How a caption entered the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptionSource {
    /// Freshly generated by the external service.
    Generated,
    /// Recovered from the content-addressed cache.
    CacheHit,
    /// Loaded from an exported snapshot.
    Imported,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptionRecord {
    pub id: String,
    pub path: String,
    pub caption: String,
    pub source: CaptionSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<CaptionStats>,
    pub ts: i64,
}

/// Shape of a caption cache value: the caption plus its generation stats,
/// packed into one JSON string so the cache stays a plain key/value store.
#[derive(Debug, Serialize, Deserialize)]
struct CachedCaption {
    caption: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stats: Option<CaptionStats>,
}

/// Write-through JSON snapshot of every caption in the collection.
pub struct CaptionStore {
    file_path: PathBuf,
    records: Mutex<HashMap<String, CaptionRecord>>,
}

impl CaptionStore {
    /// Load the snapshot, quarantining malformed entries rather than
    /// refusing the whole file.
    pub fn load(file_path: PathBuf) -> Result<Self, CaptionError> {
        let mut records = HashMap::new();

        if file_path.exists() {
            let bytes = std::fs::read(&file_path)?;
            let raw: HashMap<String, serde_json::Value> = serde_json::from_slice(&bytes)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

            let mut quarantined: HashMap<String, serde_json::Value> = HashMap::new();
            for (id, value) in raw {
                match serde_json::from_value::<CaptionRecord>(value.clone()) {
                    Ok(record) => {
                        records.insert(id, record);
                    }
                    Err(e) => {
                        log::warn!("quarantining malformed caption entry {id}: {e}");
                        quarantined.insert(id, value);
                    }
                }
            }

            if !quarantined.is_empty() {
                let quarantine_path = file_path.with_extension("quarantine.json");
                let data = serde_json::to_vec_pretty(&quarantined)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                std::fs::write(&quarantine_path, data)?;
                log::warn!(
                    "moved {} malformed caption entries to {}",
                    quarantined.len(),
                    quarantine_path.display()
                );
            }
        }

        Ok(Self {
            file_path,
            records: Mutex::new(records),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CaptionRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Atomic save: temp file + rename.
    fn save(&self, records: &HashMap<String, CaptionRecord>) -> Result<(), CaptionError> {
        let data = serde_json::to_vec_pretty(records)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = self
            .file_path
            .with_extension(format!("tmp.{}", std::process::id()));
        std::fs::write(&tmp, &data)?;
        if let Err(e) = std::fs::rename(&tmp, &self.file_path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<CaptionRecord> {
        self.lock().get(id).cloned()
    }

    pub fn upsert(&self, record: CaptionRecord) -> Result<(), CaptionError> {
        let mut records = self.lock();
        records.insert(record.id.clone(), record);
        self.save(&records)
    }

    pub fn remove(&self, id: &str) -> Result<bool, CaptionError> {
        let mut records = self.lock();
        let removed = records.remove(id).is_some();
        if removed {
            self.save(&records)?;
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> Result<usize, CaptionError> {
        let mut records = self.lock();
        let count = records.len();
        records.clear();
        self.save(&records)?;
        Ok(count)
    }

    /// Merge records from an exported snapshot, marking them as imported.
    /// Existing records for the same id are overwritten. One save at the end.
    pub fn import(&self, imported: Vec<CaptionRecord>) -> Result<usize, CaptionError> {
        let mut records = self.lock();
        let count = imported.len();
        for mut record in imported {
            record.source = CaptionSource::Imported;
            records.insert(record.id.clone(), record);
        }
        self.save(&records)?;
        Ok(count)
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Snapshot of every record, sorted by id for stable output.
    pub fn records(&self) -> Vec<CaptionRecord> {
        let mut all: Vec<CaptionRecord> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

/// Produces the caption for an image, paying for generation at most once
/// per content id.
pub struct CaptionService {
    store: Arc<CaptionStore>,
    cache: Arc<ContentCache>,
    generator: Arc<dyn Generator>,
    max_edge_px: u32,
    jpeg_quality: u8,
}

impl CaptionService {
    pub fn new(
        store: Arc<CaptionStore>,
        cache: Arc<ContentCache>,
        generator: Arc<dyn Generator>,
        max_edge_px: u32,
        jpeg_quality: u8,
    ) -> Self {
        Self {
            store,
            cache,
            generator,
            max_edge_px,
            jpeg_quality,
        }
    }

    pub fn store(&self) -> &CaptionStore {
        &self.store
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    /// Read-only caption lookup: store first, then the cache. Never
    /// generates; direct-mode results use it to display captions.
    pub fn peek(&self, id: &str) -> Option<String> {
        if let Some(record) = self.store.get(id) {
            return Some(record.caption);
        }
        let value = self.cache.get(id)?;
        let cached: CachedCaption = serde_json::from_str(&value).unwrap_or(CachedCaption {
            caption: value,
            stats: None,
        });
        Some(cached.caption)
    }

    /// Caption for `id`, cheapest source first: store, then cache, then a
    /// rate-limited generation call. The record lands in the store in the
    /// latter two cases, so the next lookup is free.
    pub fn caption_for(&self, id: &str, path: &Path) -> Result<CaptionRecord, CaptionError> {
        if let Some(record) = self.store.get(id) {
            return Ok(record);
        }

        let generator = self.generator.clone();
        let image = path.to_path_buf();
        let max_edge = self.max_edge_px;
        let quality = self.jpeg_quality;

        let (value, provenance) = self.cache.get_or_generate(id, move || {
            let output = generator.generate_caption(&image, max_edge, quality)?;
            let cached = CachedCaption {
                caption: output.caption,
                stats: Some(output.stats),
            };
            serde_json::to_string(&cached).map_err(|e| {
                crate::generate::GenerationError::Terminal(format!(
                    "failed to serialize caption: {e}"
                ))
            })
        })?;

        // Older cache entries may hold the bare caption text.
        let cached: CachedCaption = serde_json::from_str(&value).unwrap_or(CachedCaption {
            caption: value,
            stats: None,
        });

        let record = CaptionRecord {
            id: id.to_string(),
            path: path.to_string_lossy().into_owned(),
            caption: cached.caption,
            source: match provenance {
                Provenance::Generated => CaptionSource::Generated,
                Provenance::CacheHit => CaptionSource::CacheHit,
            },
            stats: cached.stats,
            ts: chrono::Utc::now().timestamp(),
        };
        self.store.upsert(record.clone())?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::FakeClock;
    use crate::gateway::{Clock, RateGate, RateGateConfig, RetryPolicy};
    use crate::generate::{CaptionOutput, GenerationError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingGenerator {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingGenerator {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    impl Generator for CountingGenerator {
        fn generate_caption(
            &self,
            _image: &Path,
            _max_edge_px: u32,
            _jpeg_quality: u8,
        ) -> Result<CaptionOutput, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(GenerationError::Terminal("no key".into()));
            }
            Ok(CaptionOutput {
                caption: "a red bicycle leaning on a wall".to_string(),
                stats: CaptionStats {
                    orig_w: 800,
                    orig_h: 600,
                    new_w: 256,
                    new_h: 192,
                    jpeg_bytes: 1234,
                    input_tokens: Some(10),
                    output_tokens: Some(20),
                },
            })
        }

        fn enhance_query(&self, query: &str) -> Result<String, GenerationError> {
            Ok(query.to_string())
        }
    }

    fn test_service(dir: &Path, generator: Arc<dyn Generator>) -> CaptionService {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new());
        let gate = Arc::new(RateGate::new(RateGateConfig::default(), clock.clone()));
        let cache = Arc::new(
            ContentCache::new(
                dir.join("caption-cache"),
                gate,
                RetryPolicy::new(1, Duration::from_millis(1)),
                clock,
            )
            .unwrap(),
        );
        let store = Arc::new(CaptionStore::load(dir.join("captions.json")).unwrap());
        CaptionService::new(store, cache, generator, 256, 50)
    }

    fn record(id: &str, caption: &str) -> CaptionRecord {
        CaptionRecord {
            id: id.to_string(),
            path: format!("{id}.jpg"),
            caption: caption.to_string(),
            source: CaptionSource::Generated,
            stats: None,
            ts: 0,
        }
    }

    #[test]
    fn test_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("captions.json");
        {
            let store = CaptionStore::load(path.clone()).unwrap();
            store.upsert(record("aa", "a cat")).unwrap();
            store.upsert(record("bb", "a dog")).unwrap();
        }

        let store = CaptionStore::load(path).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("aa").unwrap().caption, "a cat");
    }

    #[test]
    fn test_store_quarantines_malformed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("captions.json");
        std::fs::write(
            &path,
            r#"{
                "good": {"id": "good", "path": "g.jpg", "caption": "a tree", "source": "generated", "ts": 1},
                "bad": {"caption": 42}
            }"#,
        )
        .unwrap();

        let store = CaptionStore::load(path.clone()).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get("good").is_some());
        assert!(path.with_extension("quarantine.json").exists());
    }

    #[test]
    fn test_caption_for_prefers_store() {
        let dir = tempfile::tempdir().unwrap();
        let generator = Arc::new(CountingGenerator::new(false));
        let service = test_service(dir.path(), generator.clone());

        service.store().upsert(record("aa", "stored caption")).unwrap();

        let result = service.caption_for("aa", Path::new("aa.jpg")).unwrap();
        assert_eq!(result.caption, "stored caption");
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_caption_for_generates_once_then_hits_store() {
        let dir = tempfile::tempdir().unwrap();
        let generator = Arc::new(CountingGenerator::new(false));
        let service = test_service(dir.path(), generator.clone());

        let first = service.caption_for("aa", Path::new("aa.jpg")).unwrap();
        assert_eq!(first.caption, "a red bicycle leaning on a wall");
        assert_eq!(first.source, CaptionSource::Generated);
        assert_eq!(first.stats.as_ref().unwrap().jpeg_bytes, 1234);

        let second = service.caption_for("aa", Path::new("aa.jpg")).unwrap();
        assert_eq!(second.caption, first.caption);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_caption_for_recovers_from_cache_after_store_wipe() {
        let dir = tempfile::tempdir().unwrap();
        let generator = Arc::new(CountingGenerator::new(false));
        let service = test_service(dir.path(), generator.clone());

        service.caption_for("aa", Path::new("aa.jpg")).unwrap();
        service.store().clear().unwrap();

        let recovered = service.caption_for("aa", Path::new("aa.jpg")).unwrap();
        assert_eq!(recovered.caption, "a red bicycle leaning on a wall");
        assert_eq!(recovered.source, CaptionSource::CacheHit);
        // The cache answered; the generator was not called again.
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_generation_failure_leaves_store_and_cache_clean() {
        let dir = tempfile::tempdir().unwrap();
        let generator = Arc::new(CountingGenerator::new(true));
        let service = test_service(dir.path(), generator);

        let result = service.caption_for("aa", Path::new("aa.jpg"));
        assert!(result.is_err());
        assert!(service.store().get("aa").is_none());
        assert!(service.cache().get("aa").is_none());
    }

    #[test]
    fn test_plain_text_cache_entry_still_readable() {
        let dir = tempfile::tempdir().unwrap();
        let generator = Arc::new(CountingGenerator::new(true));
        let service = test_service(dir.path(), generator);

        service.cache().put("aa", "an old bare caption").unwrap();

        let record = service.caption_for("aa", Path::new("aa.jpg")).unwrap();
        assert_eq!(record.caption, "an old bare caption");
        assert!(record.stats.is_none());
        assert_eq!(record.source, CaptionSource::CacheHit);
    }
}
