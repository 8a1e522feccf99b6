//! Evaluation harness: run a grid of search configurations over a fixed
//! query set and dump every cell to CSV for offline comparison.
//!
//! The harness makes no relevance judgments. It records what each
//! configuration returned; scoring the runs against ground truth happens
//! elsewhere.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

use crate::engine::{MissingCaptionPolicy, RetrievalEngine, SearchMode, SearchOptions};

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid query file: {0}")]
    InvalidFormat(String),
}

#[derive(Debug, Clone)]
pub struct EvalQuery {
    pub bucket: String,
    pub id: String,
    pub text: String,
}

/// The configuration axes to sweep. Every combination of mode, enhancement
/// flag, and cutoff runs against every query.
#[derive(Debug, Clone)]
pub struct EvalGrid {
    pub modes: Vec<SearchMode>,
    pub enhance: Vec<bool>,
    pub ks: Vec<usize>,
    pub expand_factor: usize,
    pub missing_caption: MissingCaptionPolicy,
}

#[derive(Debug, Default)]
pub struct EvalReport {
    pub records_written: usize,
    pub interrupted: bool,
}

/// One CSV row: a single (configuration, query) cell.
#[derive(Debug, Serialize)]
struct EvalRecord {
    mode: String,
    alpha: String,
    enhanced: bool,
    bucket: String,
    query_id: String,
    k: usize,
    used_query: String,
    /// Result ids in rank order, semicolon-joined. Empty when the search
    /// returned nothing or failed.
    result_ids: String,
    error: String,
}

/// Load the query set from JSON. Two layouts are accepted: a flat map of
/// query id to text, or buckets of the form
/// `{"bucket": {"queries": {"id": "text"}}}`. Iteration order is sorted,
/// so runs over the same file enumerate identically.
pub fn load_queries(path: &Path) -> Result<Vec<EvalQuery>, EvalError> {
    let bytes = std::fs::read(path)?;
    let raw: BTreeMap<String, serde_json::Value> = serde_json::from_slice(&bytes)
        .map_err(|e| EvalError::InvalidFormat(e.to_string()))?;

    let mut queries = Vec::new();
    for (key, value) in raw {
        match value {
            serde_json::Value::String(text) => queries.push(EvalQuery {
                bucket: "default".to_string(),
                id: key,
                text,
            }),
            serde_json::Value::Object(bucket) => {
                let inner = bucket.get("queries").ok_or_else(|| {
                    EvalError::InvalidFormat(format!("bucket {key} has no \"queries\" object"))
                })?;
                let inner: BTreeMap<String, String> =
                    serde_json::from_value(inner.clone()).map_err(|e| {
                        EvalError::InvalidFormat(format!("bucket {key}: {e}"))
                    })?;
                for (id, text) in inner {
                    queries.push(EvalQuery {
                        bucket: key.clone(),
                        id,
                        text,
                    });
                }
            }
            other => {
                return Err(EvalError::InvalidFormat(format!(
                    "query {key} is neither text nor a bucket: {other}"
                )))
            }
        }
    }
    Ok(queries)
}

/// Run every grid cell, streaming rows to `out_path`. A failed cell is
/// recorded with its error rather than aborting the sweep; an interrupt
/// stops between cells with everything written so far intact.
pub fn run_grid(
    engine: &RetrievalEngine,
    queries: &[EvalQuery],
    grid: &EvalGrid,
    out_path: &Path,
    interrupt: &AtomicBool,
) -> Result<EvalReport, EvalError> {
    let mut writer = csv::Writer::from_path(out_path)?;
    let mut report = EvalReport::default();

    'sweep: for mode in &grid.modes {
        for &enhance in &grid.enhance {
            for &k in &grid.ks {
                for query in queries {
                    if interrupt.load(Ordering::SeqCst) {
                        log::warn!("interrupt received, stopping evaluation");
                        report.interrupted = true;
                        break 'sweep;
                    }

                    let options = SearchOptions {
                        top_k: k,
                        mode: *mode,
                        expand_factor: grid.expand_factor,
                        enhance,
                        missing_caption: grid.missing_caption,
                    };

                    let (used_query, result_ids, error) =
                        match engine.search(&query.text, &options) {
                            Ok(outcome) => {
                                let ids: Vec<String> =
                                    outcome.hits.iter().map(|h| h.id.clone()).collect();
                                (outcome.used_query, ids.join(";"), String::new())
                            }
                            Err(e) => {
                                log::error!(
                                    "evaluation cell failed (query {}, k {k}): {e}",
                                    query.id
                                );
                                (query.text.clone(), String::new(), e.to_string())
                            }
                        };

                    let (mode_name, alpha) = describe_mode(mode);
                    writer.serialize(EvalRecord {
                        mode: mode_name,
                        alpha,
                        enhanced: enhance,
                        bucket: query.bucket.clone(),
                        query_id: query.id.clone(),
                        k,
                        used_query,
                        result_ids,
                        error,
                    })?;
                    report.records_written += 1;
                }
            }
        }
    }

    writer.flush()?;
    Ok(report)
}

fn describe_mode(mode: &SearchMode) -> (String, String) {
    match mode {
        SearchMode::Direct => ("direct".to_string(), String::new()),
        SearchMode::CaptionRerank { alpha } => ("rerank".to_string(), format!("{alpha}")),
    }
}
