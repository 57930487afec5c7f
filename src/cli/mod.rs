//! Command-line parsing for the model fitting front-end.
//!
//! The goal of this module is to keep **argument parsing** separate from
//! command dispatch (`app`) and from the modeling code.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::io::ResultColumn;

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "neurofit", version, about = "Encoding-model fitting for single-neuron recordings")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fit one model to one cell and save the result.
    ///
    /// `neurofit <cellid> <batch> <modelname>` is shorthand for this command.
    Fit(FitArgs),
    /// Queue fits for every cell/model combination.
    Enqueue(EnqueueArgs),
    /// List saved results for a batch.
    Results(ResultsArgs),
    /// Write a seeded synthetic recording into the data directory.
    Synth(SynthArgs),
}

#[derive(Debug, Parser, Clone)]
pub struct FitArgs {
    pub cellid: String,
    pub batch: u32,
    /// Keyword model name, e.g. `xval10_wc02_fir15_dc_fit00`.
    pub modelname: String,

    /// Skip validation predictions and metrics.
    #[arg(long)]
    pub no_val: bool,

    /// Fitter stopping tolerance.
    #[arg(long, default_value_t = 1e-6)]
    pub tolerance: f64,

    /// Fitter iteration limit (per fold).
    #[arg(long, default_value_t = 2000)]
    pub max_iter: usize,

    /// Seed for the noise floor, control shuffles and initial weights.
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Write a JSON export of the fitted model.
    #[arg(long, value_name = "JSON")]
    pub export: Option<PathBuf>,
}

#[derive(Debug, Parser, Clone)]
pub struct EnqueueArgs {
    #[arg(long)]
    pub batch: u32,

    /// Cell id (repeatable).
    #[arg(long = "cell", required = true, num_args = 1..)]
    pub cells: Vec<String>,

    /// Model name (repeatable).
    #[arg(long = "model", required = true, num_args = 1..)]
    pub models: Vec<String>,

    /// Queue even when a result already exists.
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Parser, Clone)]
pub struct ResultsArgs {
    #[arg(long)]
    pub batch: u32,

    #[arg(long = "cell", num_args = 1..)]
    pub cells: Vec<String>,

    #[arg(long = "model", num_args = 1..)]
    pub models: Vec<String>,

    /// Columns to show (default: cellid modelname r_est r_val n_parms).
    #[arg(long = "column", value_enum, num_args = 1..)]
    pub columns: Vec<ResultColumn>,

    /// Sort by this column (descending unless `--asc`).
    #[arg(long, value_enum)]
    pub sort: Option<ResultColumn>,

    #[arg(long)]
    pub asc: bool,

    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Debug, Parser, Clone)]
pub struct SynthArgs {
    pub cellid: String,
    pub batch: u32,

    #[arg(long, default_value_t = 2)]
    pub channels: usize,

    #[arg(long, default_value_t = 12)]
    pub stimuli: usize,

    #[arg(long, default_value_t = 60)]
    pub time_bins: usize,

    /// Leave the pupil trace out of the recording.
    #[arg(long)]
    pub no_pupil: bool,

    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_flags_parse() {
        let cli = Cli::try_parse_from([
            "neurofit",
            "fit",
            "bbl031f-a1",
            "291",
            "stdval_fir10_fit00",
            "--no-val",
            "--max-iter",
            "50",
        ])
        .unwrap();
        let Command::Fit(args) = cli.command else {
            panic!("expected fit");
        };
        assert_eq!(args.batch, 291);
        assert!(args.no_val);
        assert_eq!(args.max_iter, 50);
        assert_eq!(args.tolerance, 1e-6);
    }

    #[test]
    fn results_columns_use_snake_case_names() {
        let cli = Cli::try_parse_from([
            "neurofit", "results", "--batch", "291", "--column", "cellid", "r_val", "--sort", "r_val", "--asc",
        ])
        .unwrap();
        let Command::Results(args) = cli.command else {
            panic!("expected results");
        };
        assert_eq!(args.columns, vec![ResultColumn::Cellid, ResultColumn::RVal]);
        assert_eq!(args.sort, Some(ResultColumn::RVal));
        assert!(args.asc);
    }

    #[test]
    fn enqueue_requires_cells_and_models() {
        assert!(Cli::try_parse_from(["neurofit", "enqueue", "--batch", "1", "--model", "m"]).is_err());
    }
}
