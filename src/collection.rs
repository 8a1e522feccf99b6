//! Collection lifecycle: ingest images, delete them, wipe stores, and
//! reconcile the vector index against the caption store.
//!
//! Ingest order is caption before vector. A caption failure downgrades to
//! a warning and the vector is still added (the entry is searchable in
//! stage 1 and the caption can be backfilled later); a vector failure
//! fails the item.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};

use crate::captions::CaptionService;
use crate::content_id::{content_id_file, looks_like_content_id};
use crate::encoder::Encoder;
use crate::index::VectorIndex;
use crate::projection::Projector;

/// Image extensions accepted by directory ingest, matched case-insensitively.
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp"];

#[derive(Debug, thiserror::Error)]
pub enum CollectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Encoder(#[from] crate::encoder::EncoderError),

    #[error(transparent)]
    Projection(#[from] crate::projection::ProjectionError),

    #[error(transparent)]
    Index(#[from] crate::index::IndexError),

    #[error(transparent)]
    Caption(#[from] crate::captions::CaptionError),

    #[error("Not an indexed image or content id: {0}")]
    UnknownTarget(String),

    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),
}

/// Result of ingesting one image.
#[derive(Debug, Clone)]
pub struct AddOutcome {
    pub id: String,
    pub path: PathBuf,
    /// None when captioning failed or was unavailable; the vector is
    /// indexed either way.
    pub caption: Option<String>,
}

/// Result of a directory ingest.
#[derive(Debug, Default)]
pub struct AddReport {
    pub added: Vec<AddOutcome>,
    /// (path, reason) for each item that could not be ingested.
    pub failed: Vec<(String, String)>,
    /// True when the run stopped early on an interrupt; everything in
    /// `added` is already durable.
    pub interrupted: bool,
}

#[derive(Debug)]
pub struct DeleteReport {
    pub id: String,
    pub vector_removed: bool,
    pub caption_removed: bool,
}

/// What a wipe clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WipeScope {
    /// Vector index only; captions and caches survive.
    Vectors,
    /// Caption store plus the caption and query caches.
    Captions,
    /// Everything.
    All,
}

#[derive(Debug, Default)]
pub struct WipeReport {
    pub vectors_removed: usize,
    pub captions_removed: usize,
    pub cache_entries_removed: usize,
}

/// Drift between the vector index and the caption store.
#[derive(Debug, Default)]
pub struct ConsistencyReport {
    /// Indexed but uncaptioned: searchable in stage 1 only.
    pub vectors_without_captions: Vec<String>,
    /// Captioned but not indexed: unreachable by search.
    pub captions_without_vectors: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.vectors_without_captions.is_empty() && self.captions_without_vectors.is_empty()
    }
}

pub struct CollectionManager {
    encoder: Arc<dyn Encoder>,
    projector: Arc<Projector>,
    index: Arc<dyn VectorIndex>,
    captions: Arc<CaptionService>,
}

impl CollectionManager {
    pub fn new(
        encoder: Arc<dyn Encoder>,
        projector: Arc<Projector>,
        index: Arc<dyn VectorIndex>,
        captions: Arc<CaptionService>,
    ) -> Self {
        Self {
            encoder,
            projector,
            index,
            captions,
        }
    }

    /// Ingest a single image: hash, caption (best effort, skippable),
    /// embed, project, upsert. Re-adding identical content is idempotent.
    pub fn add(&self, path: &Path, with_caption: bool) -> Result<AddOutcome, CollectionError> {
        let id = content_id_file(path)?;

        let caption = if with_caption {
            match self.captions.caption_for(&id, path) {
                Ok(record) => Some(record.caption),
                Err(e) => {
                    log::warn!(
                        "captioning failed for {} ({e}); indexing without a caption",
                        path.display()
                    );
                    None
                }
            }
        } else {
            None
        };

        let native = self.encoder.encode_image(path)?;
        let reduced = self.projector.project(&native)?;
        self.index
            .upsert(&id, &reduced, &path.to_string_lossy())?;

        Ok(AddOutcome {
            id,
            path: path.to_path_buf(),
            caption,
        })
    }

    /// Ingest every image directly inside `dir` (non-recursive), in sorted
    /// filename order. Per-item failures are collected, not fatal; an
    /// interrupt stops between items with everything so far durable.
    pub fn add_dir(
        &self,
        dir: &Path,
        with_caption: bool,
        interrupt: &AtomicBool,
    ) -> Result<AddReport, CollectionError> {
        if !dir.is_dir() {
            return Err(CollectionError::NotADirectory(dir.to_path_buf()));
        }

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.is_file() && has_image_extension(p))
            .collect();
        paths.sort();

        let progress = ProgressBar::new(paths.len() as u64);
        progress.set_style(
            ProgressStyle::with_template(
                "{spinner} [{bar:40}] {pos}/{len} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let mut report = AddReport::default();
        for path in paths {
            if interrupt.load(Ordering::SeqCst) {
                log::warn!("interrupt received, stopping ingest");
                report.interrupted = true;
                break;
            }

            progress.set_message(
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            );

            match self.add(&path, with_caption) {
                Ok(outcome) => report.added.push(outcome),
                Err(e) => {
                    log::error!("failed to add {}: {e}", path.display());
                    report
                        .failed
                        .push((path.to_string_lossy().into_owned(), e.to_string()));
                }
            }
            progress.inc(1);
        }
        progress.finish_and_clear();

        Ok(report)
    }

    /// Delete one entry by path or content id. Removes the vector, the
    /// caption record, and the cached caption so a future re-add
    /// regenerates rather than resurrecting stale data.
    pub fn delete(&self, target: &str) -> Result<DeleteReport, CollectionError> {
        let id = self.resolve_target(target)?;

        let vector_removed = self.index.delete(&id)?;
        let caption_removed = self.captions.store().remove(&id)?;
        self.captions.cache().remove(&id);

        Ok(DeleteReport {
            id,
            vector_removed,
            caption_removed,
        })
    }

    fn resolve_target(&self, target: &str) -> Result<String, CollectionError> {
        // An existing file wins over an id-shaped string.
        let path = Path::new(target);
        if path.is_file() {
            return Ok(content_id_file(path)?);
        }

        if let Some(id) = self.index.find_by_path(target)? {
            return Ok(id);
        }

        if looks_like_content_id(target) {
            return Ok(target.to_lowercase());
        }

        Err(CollectionError::UnknownTarget(target.to_string()))
    }

    /// Clear stores per scope. Wiping captions also clears the query cache
    /// handed in by the caller, since cached rewrites are only as useful as
    /// the captions they were tuned against.
    pub fn wipe(
        &self,
        scope: WipeScope,
        query_cache: Option<&crate::cache::ContentCache>,
    ) -> Result<WipeReport, CollectionError> {
        let mut report = WipeReport::default();

        if matches!(scope, WipeScope::Vectors | WipeScope::All) {
            report.vectors_removed = self.index.delete_all()?;
        }

        if matches!(scope, WipeScope::Captions | WipeScope::All) {
            report.captions_removed = self.captions.store().clear()?;
            report.cache_entries_removed += self.captions.cache().clear();
            if let Some(cache) = query_cache {
                report.cache_entries_removed += cache.clear();
            }
        }

        Ok(report)
    }

    /// Compare the vector index against the caption store.
    pub fn reconcile(&self) -> Result<ConsistencyReport, CollectionError> {
        let indexed: std::collections::HashSet<String> =
            self.index.list_ids()?.into_iter().collect();
        let captioned: std::collections::HashSet<String> =
            self.captions.store().ids().into_iter().collect();

        let mut report = ConsistencyReport::default();
        report.vectors_without_captions = indexed.difference(&captioned).cloned().collect();
        report.captions_without_vectors = captioned.difference(&indexed).cloned().collect();
        report.vectors_without_captions.sort();
        report.captions_without_vectors.sort();
        Ok(report)
    }

    /// Merge caption records from an exported snapshot into the store.
    pub fn import_captions(&self, path: &Path) -> Result<usize, CollectionError> {
        let bytes = std::fs::read(path)?;
        let records: Vec<crate::captions::CaptionRecord> = serde_json::from_slice(&bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(self.captions.store().import(records)?)
    }

    /// Write every caption record to `path` as pretty JSON, sorted by id.
    pub fn export_captions(&self, path: &Path) -> Result<usize, CollectionError> {
        let records = self.captions.store().records();
        let data = serde_json::to_vec_pretty(&records)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, data)?;
        Ok(records.len())
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let lower = e.to_lowercase();
            IMAGE_EXTENSIONS.contains(&lower.as_str())
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ContentCache;
    use crate::captions::CaptionStore;
    use crate::content_id::content_id_bytes;
    use crate::encoder::EncoderError;
    use crate::gateway::testing::FakeClock;
    use crate::gateway::{Clock, RateGate, RateGateConfig, RetryPolicy};
    use crate::generate::{CaptionOutput, CaptionStats, GenerationError, Generator};
    use crate::index::LocalIndex;
    use std::time::Duration;

    const DIM: usize = 4;

    /// Encodes any image to a fixed unit vector derived from file size, so
    /// different files land on different vectors without a real model.
    struct StubEncoder;

    impl Encoder for StubEncoder {
        fn encode_text(&self, _text: &str) -> Result<Vec<f32>, EncoderError> {
            Ok(vec![1.0, 0.0, 0.0, 0.0])
        }

        fn encode_text_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EncoderError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0, 0.0]).collect())
        }

        fn encode_image(&self, path: &Path) -> Result<Vec<f32>, EncoderError> {
            let len = std::fs::metadata(path)
                .map_err(|e| EncoderError::EncodeFailed(e.to_string()))?
                .len();
            let angle = (len % 7) as f32;
            Ok(vec![angle.cos(), angle.sin(), 0.3, 0.0])
        }

        fn dimensions(&self) -> usize {
            DIM
        }
    }

    struct StubGenerator {
        fail: bool,
    }

    impl Generator for StubGenerator {
        fn generate_caption(
            &self,
            image: &Path,
            _max_edge_px: u32,
            _jpeg_quality: u8,
        ) -> Result<CaptionOutput, GenerationError> {
            if self.fail {
                return Err(GenerationError::Terminal("service down".into()));
            }
            Ok(CaptionOutput {
                caption: format!("a photo of {}", image.display()),
                stats: CaptionStats::default(),
            })
        }

        fn enhance_query(&self, query: &str) -> Result<String, GenerationError> {
            Ok(query.to_string())
        }
    }

    struct Fixture {
        manager: CollectionManager,
        query_cache: Arc<ContentCache>,
        dir: tempfile::TempDir,
    }

    fn fixture(caption_fail: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();

        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new());
        let gate = Arc::new(RateGate::new(RateGateConfig::default(), clock.clone()));
        let caption_cache = Arc::new(
            ContentCache::new(
                dir.path().join("caption-cache"),
                gate.clone(),
                RetryPolicy::new(1, Duration::from_millis(1)),
                clock.clone(),
            )
            .unwrap(),
        );
        let query_cache = Arc::new(
            ContentCache::new(
                dir.path().join("query-cache"),
                gate,
                RetryPolicy::new(1, Duration::from_millis(1)),
                clock,
            )
            .unwrap(),
        );

        let store = Arc::new(CaptionStore::load(dir.path().join("captions.json")).unwrap());
        let captions = Arc::new(CaptionService::new(
            store,
            caption_cache,
            Arc::new(StubGenerator { fail: caption_fail }),
            256,
            50,
        ));

        let projector = Arc::new(Projector::identity(DIM));
        let index = Arc::new(
            LocalIndex::open(
                dir.path().join("vectors.bin"),
                "test",
                DIM,
                *projector.fingerprint(),
            )
            .unwrap(),
        );

        Fixture {
            manager: CollectionManager::new(Arc::new(StubEncoder), projector, index, captions),
            query_cache,
            dir,
        }
    }

    fn write_image(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_add_indexes_and_captions() {
        let f = fixture(false);
        let path = write_image(f.dir.path(), "cat.jpg", b"cat bytes");

        let outcome = f.manager.add(&path, true).unwrap();
        assert_eq!(outcome.id, content_id_bytes(b"cat bytes"));
        assert!(outcome.caption.is_some());
        assert!(f.manager.index.find_by_path(&path.to_string_lossy()).unwrap().is_some());
        assert!(f.manager.captions.store().get(&outcome.id).is_some());
    }

    #[test]
    fn test_add_is_idempotent_for_same_content() {
        let f = fixture(false);
        let path = write_image(f.dir.path(), "cat.jpg", b"cat bytes");

        f.manager.add(&path, true).unwrap();
        f.manager.add(&path, true).unwrap();

        assert_eq!(f.manager.index.stats().unwrap().count, 1);
        assert_eq!(f.manager.captions.store().len(), 1);
    }

    #[test]
    fn test_add_without_captions_skips_generation() {
        let f = fixture(false);
        let path = write_image(f.dir.path(), "cat.jpg", b"cat bytes");

        let outcome = f.manager.add(&path, false).unwrap();
        assert!(outcome.caption.is_none());
        assert_eq!(f.manager.index.stats().unwrap().count, 1);
        assert_eq!(f.manager.captions.store().len(), 0);
        assert!(f.manager.captions.cache().is_empty());
    }

    #[test]
    fn test_caption_failure_still_indexes_vector() {
        let f = fixture(true);
        let path = write_image(f.dir.path(), "cat.jpg", b"cat bytes");

        let outcome = f.manager.add(&path, true).unwrap();
        assert!(outcome.caption.is_none());
        assert_eq!(f.manager.index.stats().unwrap().count, 1);
        assert_eq!(f.manager.captions.store().len(), 0);

        let drift = f.manager.reconcile().unwrap();
        assert_eq!(drift.vectors_without_captions, vec![outcome.id]);
    }

    #[test]
    fn test_add_dir_skips_non_images_and_collects_failures() {
        let f = fixture(false);
        let images = f.dir.path().join("images");
        std::fs::create_dir(&images).unwrap();
        write_image(&images, "a.jpg", b"aaa");
        write_image(&images, "b.PNG", b"bbb");
        write_image(&images, "notes.txt", b"not an image");

        let interrupt = AtomicBool::new(false);
        let report = f.manager.add_dir(&images, true, &interrupt).unwrap();

        assert_eq!(report.added.len(), 2);
        assert!(report.failed.is_empty());
        assert!(!report.interrupted);
        assert_eq!(f.manager.index.stats().unwrap().count, 2);
    }

    #[test]
    fn test_add_dir_interrupt_stops_between_items() {
        let f = fixture(false);
        let images = f.dir.path().join("images");
        std::fs::create_dir(&images).unwrap();
        write_image(&images, "a.jpg", b"aaa");

        let interrupt = AtomicBool::new(true);
        let report = f.manager.add_dir(&images, true, &interrupt).unwrap();
        assert!(report.interrupted);
        assert!(report.added.is_empty());
    }

    #[test]
    fn test_delete_by_path_and_by_id() {
        let f = fixture(false);
        let path = write_image(f.dir.path(), "cat.jpg", b"cat bytes");
        let outcome = f.manager.add(&path, true).unwrap();

        let report = f.manager.delete(&path.to_string_lossy()).unwrap();
        assert_eq!(report.id, outcome.id);
        assert!(report.vector_removed);
        assert!(report.caption_removed);

        // Deleting again by id reports nothing removed.
        let report = f.manager.delete(&outcome.id).unwrap();
        assert!(!report.vector_removed);
        assert!(!report.caption_removed);
    }

    #[test]
    fn test_delete_removes_cached_caption() {
        let f = fixture(false);
        let path = write_image(f.dir.path(), "cat.jpg", b"cat bytes");
        let outcome = f.manager.add(&path, true).unwrap();
        assert!(f.manager.captions.cache().get(&outcome.id).is_some());

        f.manager.delete(&outcome.id).unwrap();
        assert!(f.manager.captions.cache().get(&outcome.id).is_none());
    }

    #[test]
    fn test_delete_unknown_target_errors() {
        let f = fixture(false);
        let result = f.manager.delete("no/such/file.jpg");
        assert!(matches!(result, Err(CollectionError::UnknownTarget(_))));
    }

    #[test]
    fn test_deleted_entry_never_returned_by_query() {
        let f = fixture(false);
        let a = write_image(f.dir.path(), "a.jpg", b"aaa");
        let b = write_image(f.dir.path(), "b.jpg", b"bbbb");
        let added = f.manager.add(&a, true).unwrap();
        f.manager.add(&b, true).unwrap();

        f.manager.delete(&added.id).unwrap();

        let results = f
            .manager
            .index
            .query_top_k(&[1.0, 0.0, 0.0, 0.0], 10)
            .unwrap();
        assert!(results.iter().all(|m| m.id != added.id));
    }

    #[test]
    fn test_wipe_vectors_keeps_captions() {
        let f = fixture(false);
        let path = write_image(f.dir.path(), "cat.jpg", b"cat bytes");
        f.manager.add(&path, true).unwrap();

        let report = f.manager.wipe(WipeScope::Vectors, Some(&f.query_cache)).unwrap();
        assert_eq!(report.vectors_removed, 1);
        assert_eq!(report.captions_removed, 0);

        assert_eq!(f.manager.index.stats().unwrap().count, 0);
        assert_eq!(f.manager.captions.store().len(), 1);
        assert!(!f.manager.captions.cache().is_empty());
    }

    #[test]
    fn test_wipe_captions_clears_store_and_caches_but_keeps_vectors() {
        let f = fixture(false);
        let path = write_image(f.dir.path(), "cat.jpg", b"cat bytes");
        f.manager.add(&path, true).unwrap();
        f.query_cache.put("somekey", "cached rewrite").unwrap();

        let report = f.manager.wipe(WipeScope::Captions, Some(&f.query_cache)).unwrap();
        assert_eq!(report.vectors_removed, 0);
        assert_eq!(report.captions_removed, 1);
        assert_eq!(report.cache_entries_removed, 2);

        assert_eq!(f.manager.index.stats().unwrap().count, 1);
        assert_eq!(f.manager.captions.store().len(), 0);
        assert!(f.manager.captions.cache().is_empty());
        assert!(f.query_cache.is_empty());
    }

    #[test]
    fn test_wipe_all() {
        let f = fixture(false);
        let path = write_image(f.dir.path(), "cat.jpg", b"cat bytes");
        f.manager.add(&path, true).unwrap();

        let report = f.manager.wipe(WipeScope::All, Some(&f.query_cache)).unwrap();
        assert_eq!(report.vectors_removed, 1);
        assert_eq!(report.captions_removed, 1);
        assert_eq!(f.manager.index.stats().unwrap().count, 0);
    }

    #[test]
    fn test_export_then_import_roundtrip() {
        let f = fixture(false);
        let path = write_image(f.dir.path(), "cat.jpg", b"cat bytes");
        let outcome = f.manager.add(&path, true).unwrap();

        let export = f.dir.path().join("export.json");
        f.manager.export_captions(&export).unwrap();
        f.manager.captions.store().clear().unwrap();

        let count = f.manager.import_captions(&export).unwrap();
        assert_eq!(count, 1);
        let record = f.manager.captions.store().get(&outcome.id).unwrap();
        assert_eq!(record.source, crate::captions::CaptionSource::Imported);
        assert_eq!(record.caption, outcome.caption.unwrap());
    }

    #[test]
    fn test_export_captions() {
        let f = fixture(false);
        let path = write_image(f.dir.path(), "cat.jpg", b"cat bytes");
        let outcome = f.manager.add(&path, true).unwrap();

        let export = f.dir.path().join("export.json");
        let count = f.manager.export_captions(&export).unwrap();
        assert_eq!(count, 1);

        let records: Vec<crate::captions::CaptionRecord> =
            serde_json::from_slice(&std::fs::read(&export).unwrap()).unwrap();
        assert_eq!(records[0].id, outcome.id);
    }
}
