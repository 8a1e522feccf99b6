use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "imgsearch", version, about = "Semantic image search over a local collection")]
pub struct Cli {
    /// Data directory (defaults to $IMGSEARCH_HOME or ~/.imgsearch)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Search the collection with a text query
    Search {
        /// Query text
        query: String,

        /// Number of results to return
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Scoring mode
        #[arg(long, value_enum, default_value_t = ModeArg::Rerank)]
        mode: ModeArg,

        /// Caption weight in rerank mode (0 = stage 1 only, 1 = captions only)
        #[arg(long)]
        alpha: Option<f32>,

        /// Candidate multiplier for rerank (top_k * expand candidates)
        #[arg(long)]
        expand: Option<usize>,

        /// Rewrite the query through the enhancement service first
        #[arg(long)]
        enhance: bool,

        /// Print results as JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Add an image or a directory of images to the collection
    Add {
        /// Image file or directory
        path: PathBuf,

        /// Index vectors only, without generating captions
        #[arg(long)]
        skip_captions: bool,
    },

    /// Remove an image from the collection by path or content id
    Delete {
        /// Image path or 64-character content id
        target: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Clear stored vectors, captions, or both
    Wipe {
        #[arg(value_enum)]
        scope: ScopeArg,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Show collection statistics and store consistency
    Stats,

    /// Export all caption records to a JSON file
    ExportCaptions {
        /// Output file
        out: PathBuf,
    },

    /// Merge caption records from an exported JSON file
    ImportCaptions {
        /// Exported caption file
        file: PathBuf,
    },

    /// Sweep search configurations over a query file, writing results to CSV
    Evaluate {
        /// JSON query file (flat id-to-text map, or buckets with a "queries" object)
        queries: PathBuf,

        /// Output CSV file
        #[arg(long, default_value = "eval-results.csv")]
        out: PathBuf,

        /// Alpha values to sweep in rerank mode
        #[arg(long, value_delimiter = ',', default_value = "0.0,0.4,0.8")]
        alphas: Vec<f32>,

        /// Result cutoffs to sweep
        #[arg(long, value_delimiter = ',', default_value = "5,10")]
        ks: Vec<usize>,

        /// Also sweep direct mode
        #[arg(long)]
        direct: bool,

        /// Sweep both enhanced and raw queries (default: raw only)
        #[arg(long)]
        enhance: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// Stage-1 embedding similarity only
    Direct,
    /// Blend embedding similarity with caption similarity
    Rerank,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScopeArg {
    /// Vector index only
    Vectors,
    /// Caption store and caches only
    Captions,
    /// Everything
    All,
}
