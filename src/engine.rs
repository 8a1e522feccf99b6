//! Two-stage retrieval: stage 1 ranks by projected-embedding similarity in
//! the vector index; stage 2 (optional) re-ranks the expanded candidate set
//! by blending stage-1 scores with query/caption similarity computed in the
//! native embedding space.
//!
//! Rerank resolves captions through the caption service (store, then
//! cache, then a rate-limited generation call), so a query backfills
//! captions the ingest pass skipped. A candidate whose caption cannot be
//! produced is scored on stage 1 alone (and flagged) or excluded, per the
//! configured policy.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::{query_cache_key, ContentCache};
use crate::captions::CaptionService;
use crate::encoder::{Encoder, EncoderError};
use crate::generate::Generator;
use crate::index::{IndexError, VectorIndex};
use crate::projection::{ProjectionError, Projector};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Encoder(#[from] EncoderError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("Invalid search options: {0}")]
    InvalidOptions(String),
}

/// How results are scored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SearchMode {
    /// Stage-1 similarity only.
    Direct,
    /// Blend stage-1 similarity with caption similarity:
    /// final = (1 - alpha) * stage1 + alpha * caption_sim.
    CaptionRerank { alpha: f32 },
}

/// What to do with a candidate that has no caption during rerank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MissingCaptionPolicy {
    /// Keep it, scored on stage 1 alone, flagged in the hit.
    Stage1Only,
    /// Drop it from the result set.
    Exclude,
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub top_k: usize,
    pub mode: SearchMode,
    /// Rerank considers top_k * expand_factor stage-1 candidates.
    pub expand_factor: usize,
    /// Rewrite the query through the enhancement service before encoding.
    pub enhance: bool,
    pub missing_caption: MissingCaptionPolicy,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: 10,
            mode: SearchMode::CaptionRerank { alpha: 0.4 },
            expand_factor: 3,
            enhance: false,
            missing_caption: MissingCaptionPolicy::Stage1Only,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub path: String,
    pub stage1_score: f32,
    /// Only set when rerank computed a caption similarity.
    pub caption_sim: Option<f32>,
    pub final_score: f32,
    pub caption: Option<String>,
    /// True when rerank wanted a caption and none could be produced.
    pub caption_missing: bool,
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub hits: Vec<SearchHit>,
    /// The query text that was actually encoded.
    pub used_query: String,
    /// Whether `used_query` came from the enhancement service.
    pub enhanced: bool,
}

/// Query rewriting through the cached enhancement service.
///
/// Enhancement is best-effort: any failure falls back to the raw query with
/// a warning, because a search that works beats a rewrite that does not.
pub struct QueryEnhancer {
    cache: Arc<ContentCache>,
    generator: Arc<dyn Generator>,
}

impl QueryEnhancer {
    pub fn new(cache: Arc<ContentCache>, generator: Arc<dyn Generator>) -> Self {
        Self { cache, generator }
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    /// Returns (query text to encode, whether it was enhanced).
    pub fn enhance(&self, raw: &str) -> (String, bool) {
        let key = query_cache_key(raw);
        let generator = self.generator.clone();
        let raw_owned = raw.to_string();
        match self
            .cache
            .get_or_generate(&key, move || generator.enhance_query(&raw_owned))
        {
            Ok((enhanced, _)) if !enhanced.trim().is_empty() => (enhanced, true),
            Ok(_) => {
                log::warn!("enhancement returned empty text, using raw query");
                (raw.to_string(), false)
            }
            Err(e) => {
                log::warn!("query enhancement failed ({e}), using raw query");
                (raw.to_string(), false)
            }
        }
    }
}

pub struct RetrievalEngine {
    encoder: Arc<dyn Encoder>,
    projector: Arc<Projector>,
    index: Arc<dyn VectorIndex>,
    captions: Arc<CaptionService>,
    enhancer: Option<Arc<QueryEnhancer>>,
}

impl RetrievalEngine {
    pub fn new(
        encoder: Arc<dyn Encoder>,
        projector: Arc<Projector>,
        index: Arc<dyn VectorIndex>,
        captions: Arc<CaptionService>,
        enhancer: Option<Arc<QueryEnhancer>>,
    ) -> Self {
        Self {
            encoder,
            projector,
            index,
            captions,
            enhancer,
        }
    }

    pub fn search(&self, query: &str, options: &SearchOptions) -> Result<SearchOutcome, EngineError> {
        validate_options(options)?;

        let (used_query, enhanced) = match (&self.enhancer, options.enhance) {
            (Some(enhancer), true) => enhancer.enhance(query),
            _ => (query.to_string(), false),
        };

        let native_query = self.encoder.encode_text(&used_query)?;
        let reduced_query = self.projector.project(&native_query)?;

        let hits = match options.mode {
            SearchMode::Direct => self.direct(&reduced_query, options.top_k)?,
            SearchMode::CaptionRerank { alpha } => {
                self.rerank(&native_query, &reduced_query, alpha, options)?
            }
        };

        Ok(SearchOutcome {
            hits,
            used_query,
            enhanced,
        })
    }

    fn direct(&self, reduced_query: &[f32], top_k: usize) -> Result<Vec<SearchHit>, EngineError> {
        let matches = self.index.query_top_k(reduced_query, top_k)?;
        Ok(matches
            .into_iter()
            .map(|m| {
                let caption = self.captions.peek(&m.id);
                SearchHit {
                    id: m.id,
                    path: m.path,
                    stage1_score: m.score,
                    caption_sim: None,
                    final_score: m.score,
                    caption,
                    caption_missing: false,
                }
            })
            .collect())
    }

    fn rerank(
        &self,
        native_query: &[f32],
        reduced_query: &[f32],
        alpha: f32,
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>, EngineError> {
        let candidate_count = options.top_k.saturating_mul(options.expand_factor);
        let matches = self.index.query_top_k(reduced_query, candidate_count)?;
        if matches.is_empty() {
            return Ok(vec![]);
        }

        // Resolve a caption per candidate: store, then cache, then a paid
        // generation call. One batched encode for every candidate that
        // ends up with one.
        let mut captioned: Vec<(usize, String)> = Vec::new();
        let mut captions: Vec<Option<String>> = Vec::with_capacity(matches.len());
        for (i, m) in matches.iter().enumerate() {
            let caption = match self.captions.caption_for(&m.id, Path::new(&m.path)) {
                Ok(record) => Some(record.caption),
                Err(e) => {
                    log::warn!("no caption for {}: {e}", m.path);
                    None
                }
            };
            if let Some(text) = &caption {
                captioned.push((i, text.clone()));
            }
            captions.push(caption);
        }

        let texts: Vec<String> = captioned.iter().map(|(_, t)| t.clone()).collect();
        let embeddings = self.encoder.encode_text_batch(&texts)?;

        let mut similarities: Vec<Option<f32>> = vec![None; matches.len()];
        for ((i, _), embedding) in captioned.iter().zip(embeddings.iter()) {
            similarities[*i] = Some(cosine(native_query, embedding));
        }

        let mut hits: Vec<SearchHit> = Vec::with_capacity(matches.len());
        for ((m, caption), caption_sim) in matches
            .into_iter()
            .zip(captions.into_iter())
            .zip(similarities.into_iter())
        {
            match caption_sim {
                Some(sim) => {
                    let final_score = (1.0 - alpha) * m.score + alpha * sim;
                    hits.push(SearchHit {
                        id: m.id,
                        path: m.path,
                        stage1_score: m.score,
                        caption_sim: Some(sim),
                        final_score,
                        caption,
                        caption_missing: false,
                    });
                }
                None => match options.missing_caption {
                    MissingCaptionPolicy::Stage1Only => hits.push(SearchHit {
                        id: m.id,
                        path: m.path,
                        stage1_score: m.score,
                        caption_sim: None,
                        final_score: m.score,
                        caption: None,
                        caption_missing: true,
                    }),
                    MissingCaptionPolicy::Exclude => {}
                },
            }
        }

        hits.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(options.top_k);
        Ok(hits)
    }
}

fn validate_options(options: &SearchOptions) -> Result<(), EngineError> {
    if options.top_k == 0 {
        return Err(EngineError::InvalidOptions("top_k must be at least 1".into()));
    }
    if options.expand_factor == 0 {
        return Err(EngineError::InvalidOptions(
            "expand_factor must be at least 1".into(),
        ));
    }
    if let SearchMode::CaptionRerank { alpha } = options.mode {
        if !(0.0..=1.0).contains(&alpha) || !alpha.is_finite() {
            return Err(EngineError::InvalidOptions(format!(
                "alpha must be in [0, 1], got {alpha}"
            )));
        }
    }
    Ok(())
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na = crate::projection::l2_norm(a);
    let nb = crate::projection::l2_norm(b);
    if na < f32::EPSILON || nb < f32::EPSILON {
        return 0.0;
    }
    dot / (na * nb)
}
