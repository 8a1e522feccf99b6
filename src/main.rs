mod cache;
mod captions;
mod cli;
mod collection;
mod config;
mod content_id;
mod encoder;
mod engine;
mod evaluate;
mod gateway;
mod generate;
mod index;
mod projection;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cache::ContentCache;
use crate::captions::{CaptionService, CaptionStore};
use crate::cli::{Cli, Command, ModeArg, ScopeArg};
use crate::collection::{CollectionManager, WipeScope};
use crate::config::Config;
use crate::encoder::{Encoder, LazyClipEncoder};
use crate::engine::{QueryEnhancer, RetrievalEngine, SearchMode, SearchOptions};
use crate::gateway::{Clock, RateGate, RateGateConfig, RetryPolicy, SystemClock};
use crate::generate::{GeminiClient, Generator, UnconfiguredGenerator};
use crate::index::{LocalIndex, VectorIndex};
use crate::projection::Projector;

struct App {
    config: Config,
    engine: RetrievalEngine,
    manager: CollectionManager,
    index: Arc<dyn VectorIndex>,
    captions: Arc<CaptionService>,
    query_cache: Arc<ContentCache>,
}

fn build_app(data_dir: &Path, config: Config) -> Result<App> {
    // The model loads on first encode, so commands that never embed
    // (stats, delete, wipe, caption export/import) start instantly.
    let encoder: Arc<dyn Encoder> = Arc::new(LazyClipEncoder::new(
        &config.embedding.model,
        data_dir.to_path_buf(),
        config.embedding.native_dim,
    ));

    let native = config.embedding.native_dim;
    let reduced = config.embedding.reduce_dim;
    let projector = Arc::new(Projector::load_or_create(
        &config::projection_path(data_dir, native, reduced),
        native,
        reduced,
    )?);

    let index: Arc<dyn VectorIndex> = Arc::new(LocalIndex::open(
        config::vectors_path(data_dir),
        &config.index.name,
        reduced,
        *projector.fingerprint(),
    )?);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let gate = Arc::new(RateGate::new(
        RateGateConfig {
            max_calls_per_batch: config.rate_limit.max_calls_per_batch,
            inter_call_delay: Duration::from_millis(config.rate_limit.inter_call_delay_ms),
            batch_cooldown: Duration::from_millis(config.rate_limit.batch_cooldown_ms),
        },
        clock.clone(),
    ));
    let retry = RetryPolicy::new(
        config.retry.max_attempts,
        Duration::from_millis(config.retry.base_delay_ms),
    );

    let caption_cache = Arc::new(ContentCache::new(
        config::caption_cache_dir(data_dir),
        gate.clone(),
        retry.clone(),
        clock.clone(),
    )?);
    let query_cache = Arc::new(ContentCache::new(
        config::query_cache_dir(data_dir),
        gate,
        retry,
        clock,
    )?);

    let generator: Arc<dyn Generator> = match config::api_key() {
        Some(key) => Arc::new(GeminiClient::new(
            &config.generation.api_base,
            &config.generation.model,
            key,
            Duration::from_secs(config.generation.timeout_secs),
        )?),
        None => {
            log::warn!(
                "{} not set; cached captions and rewrites still work, new generation will fail",
                config::API_KEY_ENV
            );
            Arc::new(UnconfiguredGenerator(format!(
                "{} not set; captioning and query enhancement are unavailable",
                config::API_KEY_ENV
            )))
        }
    };

    let store = Arc::new(CaptionStore::load(config::captions_path(data_dir))?);
    let captions = Arc::new(CaptionService::new(
        store,
        caption_cache,
        generator.clone(),
        config.generation.max_edge_px,
        config.generation.jpeg_quality,
    ));

    let enhancer = Arc::new(QueryEnhancer::new(query_cache.clone(), generator));

    let engine = RetrievalEngine::new(
        encoder.clone(),
        projector.clone(),
        index.clone(),
        captions.clone(),
        Some(enhancer),
    );
    let manager = CollectionManager::new(encoder, projector, index.clone(), captions.clone());

    Ok(App {
        config,
        engine,
        manager,
        index,
        captions,
        query_cache,
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let data_dir = config::resolve_data_dir(cli.data_dir.as_deref());
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;
    let config = Config::load(&data_dir)?;

    let interrupt = Arc::new(AtomicBool::new(false));
    {
        let interrupt = interrupt.clone();
        ctrlc::set_handler(move || {
            interrupt.store(true, Ordering::SeqCst);
        })
        .context("failed to install interrupt handler")?;
    }

    let app = build_app(&data_dir, config)?;

    match cli.command {
        Command::Search {
            query,
            top_k,
            mode,
            alpha,
            expand,
            enhance,
            json,
        } => cmd_search(&app, &query, top_k, mode, alpha, expand, enhance, json),
        Command::Add {
            path,
            skip_captions,
        } => cmd_add(&app, &path, !skip_captions, &interrupt),
        Command::Delete { target, yes } => cmd_delete(&app, &target, yes),
        Command::Wipe { scope, yes } => cmd_wipe(&app, scope, yes),
        Command::Stats => cmd_stats(&app),
        Command::ExportCaptions { out } => cmd_export_captions(&app, &out),
        Command::ImportCaptions { file } => {
            let count = app.manager.import_captions(&file)?;
            println!("imported {count} caption records from {}", file.display());
            Ok(())
        }
        Command::Evaluate {
            queries,
            out,
            alphas,
            ks,
            direct,
            enhance,
        } => cmd_evaluate(&app, &queries, &out, &alphas, &ks, direct, enhance, &interrupt),
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_search(
    app: &App,
    query: &str,
    top_k: Option<usize>,
    mode: ModeArg,
    alpha: Option<f32>,
    expand: Option<usize>,
    enhance: bool,
    json: bool,
) -> Result<()> {
    let mode = match mode {
        ModeArg::Direct => SearchMode::Direct,
        ModeArg::Rerank => SearchMode::CaptionRerank {
            alpha: alpha.unwrap_or(app.config.search.alpha),
        },
    };
    let options = SearchOptions {
        top_k: top_k.unwrap_or(app.config.search.top_k),
        mode,
        expand_factor: expand.unwrap_or(app.config.search.expand_factor),
        enhance,
        missing_caption: app.config.search.missing_caption,
    };

    let outcome = app.engine.search(query, &options)?;

    if json {
        let rows: Vec<serde_json::Value> = outcome
            .hits
            .iter()
            .map(|h| {
                serde_json::json!({
                    "id": h.id,
                    "path": h.path,
                    "stage1_score": h.stage1_score,
                    "caption_sim": h.caption_sim,
                    "final_score": h.final_score,
                    "caption": h.caption,
                    "caption_missing": h.caption_missing,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "used_query": outcome.used_query,
                "enhanced": outcome.enhanced,
                "hits": rows,
            }))?
        );
        return Ok(());
    }

    if outcome.enhanced {
        println!("query: {}", outcome.used_query);
    }
    if outcome.hits.is_empty() {
        println!("no results");
        return Ok(());
    }
    for (rank, hit) in outcome.hits.iter().enumerate() {
        let flag = if hit.caption_missing { " [no caption]" } else { "" };
        println!(
            "{:2}. {:.4}  {}{}",
            rank + 1,
            hit.final_score,
            hit.path,
            flag
        );
        if let Some(caption) = &hit.caption {
            println!("      {caption}");
        }
    }
    Ok(())
}

fn cmd_add(app: &App, path: &Path, with_caption: bool, interrupt: &AtomicBool) -> Result<()> {
    if path.is_dir() {
        let report = app.manager.add_dir(path, with_caption, interrupt)?;
        println!("added {} images", report.added.len());
        for (path, reason) in &report.failed {
            println!("failed: {path}: {reason}");
        }
        if report.interrupted {
            println!("interrupted; everything added so far is saved");
        }
    } else {
        let outcome = app.manager.add(path, with_caption)?;
        println!("added {} ({})", outcome.path.display(), outcome.id);
        match outcome.caption {
            Some(caption) => println!("caption: {caption}"),
            None if with_caption => println!("caption: unavailable (indexed without one)"),
            None => {}
        }
    }
    Ok(())
}

fn cmd_delete(app: &App, target: &str, yes: bool) -> Result<()> {
    if !yes && !confirm(&format!("Delete {target} from the collection?"))? {
        println!("aborted");
        return Ok(());
    }

    let report = app.manager.delete(target)?;
    if !report.vector_removed && !report.caption_removed {
        println!("{}: nothing to remove", report.id);
    } else {
        println!(
            "removed {} (vector: {}, caption: {})",
            report.id, report.vector_removed, report.caption_removed
        );
    }
    Ok(())
}

fn cmd_wipe(app: &App, scope: ScopeArg, yes: bool) -> Result<()> {
    let scope = match scope {
        ScopeArg::Vectors => WipeScope::Vectors,
        ScopeArg::Captions => WipeScope::Captions,
        ScopeArg::All => WipeScope::All,
    };
    let what = match scope {
        WipeScope::Vectors => "the vector index",
        WipeScope::Captions => "all captions and caches",
        WipeScope::All => "the entire collection",
    };
    if !yes && !confirm(&format!("Wipe {what}? This cannot be undone."))? {
        println!("aborted");
        return Ok(());
    }

    let report = app.manager.wipe(scope, Some(&app.query_cache))?;
    println!(
        "removed {} vectors, {} captions, {} cache entries",
        report.vectors_removed, report.captions_removed, report.cache_entries_removed
    );
    Ok(())
}

fn cmd_stats(app: &App) -> Result<()> {
    let stats = app.index.stats()?;
    println!("index:     {} ({} entries, {}-d)", stats.name, stats.count, stats.dimensions);
    println!("captions:  {} records", app.captions.store().len());
    println!("cached:    {} captions, {} query rewrites",
        app.captions.cache().len(),
        app.query_cache.len()
    );

    let drift = app.manager.reconcile()?;
    if drift.is_consistent() {
        println!("stores are consistent");
    } else {
        for id in &drift.vectors_without_captions {
            println!("uncaptioned vector: {id}");
        }
        for id in &drift.captions_without_vectors {
            println!("orphaned caption:   {id}");
        }
    }
    Ok(())
}

fn cmd_export_captions(app: &App, out: &Path) -> Result<()> {
    let count = app.manager.export_captions(out)?;
    println!("exported {count} caption records to {}", out.display());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_evaluate(
    app: &App,
    queries: &Path,
    out: &PathBuf,
    alphas: &[f32],
    ks: &[usize],
    direct: bool,
    enhance: bool,
    interrupt: &AtomicBool,
) -> Result<()> {
    let queries = evaluate::load_queries(queries)?;
    anyhow::ensure!(!queries.is_empty(), "query file contains no queries");

    let mut modes: Vec<SearchMode> = alphas
        .iter()
        .map(|&alpha| SearchMode::CaptionRerank { alpha })
        .collect();
    if direct {
        modes.insert(0, SearchMode::Direct);
    }

    let grid = evaluate::EvalGrid {
        modes,
        enhance: if enhance { vec![false, true] } else { vec![false] },
        ks: ks.to_vec(),
        expand_factor: app.config.search.expand_factor,
        missing_caption: app.config.search.missing_caption,
    };

    let report = evaluate::run_grid(&app.engine, &queries, &grid, out, interrupt)?;
    println!("wrote {} records to {}", report.records_written, out.display());
    if report.interrupted {
        println!("interrupted; partial results are complete rows");
    }
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    inquire::Confirm::new(prompt)
        .with_default(false)
        .prompt()
        .context("confirmation prompt failed")
}
