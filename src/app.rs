//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - parses CLI arguments and the environment
//! - builds the result store and job queue
//! - runs fits, queues jobs and lists results
//! - prints reports

use std::path::PathBuf;

use clap::Parser;
use clap::error::ErrorKind;

use crate::cli::{Cli, Command, EnqueueArgs, FitArgs, ResultsArgs, SynthArgs};
use crate::data::{SyntheticSpec, generate_recording, write_recording};
use crate::domain::FitConfig;
use crate::error::{AppError, FitError};
use crate::io::{JsonJobQueue, JsonResultStore, ResultQuery, ResultStore, enqueue_models};

pub mod pipeline;

/// Exit code for unparseable command lines (`-1` as a process status).
const USAGE_EXIT_CODE: u8 = 255;

/// Settings read from the process environment (and `.env`).
#[derive(Debug, Clone, PartialEq)]
pub struct Environment {
    pub data_dir: PathBuf,
    pub results_path: PathBuf,
    pub queue_path: PathBuf,
    pub queue_id: Option<u64>,
    pub username: String,
    pub labgroup: String,
}

impl Environment {
    pub fn from_env() -> Result<Self, FitError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, FitError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let queue_id = match var("QUEUEID") {
            Some(raw) => Some(
                raw.trim()
                    .parse()
                    .map_err(|_| FitError::Configuration(format!("QUEUEID `{raw}` is not a job id")))?,
            ),
            None => None,
        };
        Ok(Self {
            data_dir: var("NEUROFIT_DATA_DIR").map_or_else(|| PathBuf::from("data"), PathBuf::from),
            results_path: var("NEUROFIT_RESULTS").map_or_else(|| PathBuf::from("results.json"), PathBuf::from),
            queue_path: var("NEUROFIT_QUEUE").map_or_else(|| PathBuf::from("queue.json"), PathBuf::from),
            queue_id,
            username: var("NEUROFIT_USER").unwrap_or_default(),
            labgroup: var("NEUROFIT_LABGROUP").unwrap_or_default(),
        })
    }
}

/// Entry point for the `neurofit` binary.
pub fn run() -> Result<(), AppError> {
    // A missing .env is fine; variables may come from the shell or the queue daemon.
    let _ = dotenvy::dotenv();

    // Queue daemons call `neurofit <cellid> <batch> <modelname>`; clap needs the
    // subcommand name, so rewrite argv before parsing.
    let argv = rewrite_args(std::env::args().collect());
    let cli = match Cli::try_parse_from(argv) {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = err.print();
            return Ok(());
        }
        Err(err) => {
            let _ = err.print();
            return Err(AppError::new(USAGE_EXIT_CODE, "Invalid command line."));
        }
    };
    let env = Environment::from_env()?;

    match cli.command {
        Command::Fit(args) => handle_fit(&args, &env),
        Command::Enqueue(args) => handle_enqueue(&args, &env),
        Command::Results(args) => handle_results(&args, &env),
        Command::Synth(args) => handle_synth(&args, &env),
    }
}

fn handle_fit(args: &FitArgs, env: &Environment) -> Result<(), AppError> {
    let config = fit_config_from_args(args, env);
    let mut ctx = pipeline::FitContext::from_paths(&env.results_path, &env.queue_path, env.queue_id);
    let run = pipeline::run_fit(&mut ctx, &config)?;

    println!("{}", crate::report::format_fit_summary(&run.fit, &config));
    if !run.record.figurefile.is_empty() {
        println!("Export written to {}", run.record.figurefile);
    }
    Ok(())
}

fn handle_enqueue(args: &EnqueueArgs, env: &Environment) -> Result<(), AppError> {
    let store = JsonResultStore::new(&env.results_path);
    let mut queue = JsonJobQueue::new(&env.queue_path);
    let summary = enqueue_models(&store, &mut queue, &args.cells, args.batch, &args.models, args.force)?;
    print!("{}", crate::report::format_enqueue_summary(&summary));
    Ok(())
}

fn handle_results(args: &ResultsArgs, env: &Environment) -> Result<(), AppError> {
    let store = JsonResultStore::new(&env.results_path);
    let rows = store.all_results()?;
    let query = ResultQuery {
        batch: args.batch,
        cells: args.cells.clone(),
        models: args.models.clone(),
        columns: args.columns.clone(),
        sort: args.sort,
        descending: !args.asc,
        limit: args.limit,
    };
    print!("{}", crate::report::format_results_table(&query, &rows));
    Ok(())
}

fn handle_synth(args: &SynthArgs, env: &Environment) -> Result<(), AppError> {
    let spec = SyntheticSpec {
        cellid: args.cellid.clone(),
        channels: args.channels,
        stimuli: args.stimuli,
        time_bins: args.time_bins,
        with_pupil: !args.no_pupil,
        seed: args.seed,
        ..SyntheticSpec::default()
    };
    let recording = generate_recording(&spec)?;
    let path = env
        .data_dir
        .join(args.batch.to_string())
        .join(format!("{}.json", args.cellid));
    write_recording(&path, &recording)?;
    println!("Synthetic recording written to {}", path.display());
    Ok(())
}

pub fn fit_config_from_args(args: &FitArgs, env: &Environment) -> FitConfig {
    FitConfig {
        cellid: args.cellid.clone(),
        batch: args.batch,
        modelname: args.modelname.clone(),
        data_dir: env.data_dir.clone(),
        valmode: !args.no_val,
        tolerance: args.tolerance,
        max_iter: args.max_iter,
        seed: args.seed,
        export: args.export.clone(),
        username: env.username.clone(),
        labgroup: env.labgroup.clone(),
    }
}

/// Rewrite argv so bare positional arguments mean `fit`.
///
/// Rules:
/// - `neurofit <cellid> <batch> <modelname> ...` -> `neurofit fit <cellid> ...`
/// - subcommands, flags and help/version         -> unchanged
fn rewrite_args(mut argv: Vec<String>) -> Vec<String> {
    let Some(arg1) = argv.get(1) else {
        return argv;
    };

    let is_subcommand_or_flag = arg1.starts_with('-')
        || matches!(arg1.as_str(), "fit" | "enqueue" | "results" | "synth" | "help");
    if !is_subcommand_or_flag {
        argv.insert(1, "fit".to_string());
    }
    argv
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn positional_arguments_become_fit() {
        assert_eq!(
            rewrite_args(args(&["neurofit", "bbl031f-a1", "291", "stdval_fir10_fit00"])),
            args(&["neurofit", "fit", "bbl031f-a1", "291", "stdval_fir10_fit00"])
        );
        assert_eq!(
            rewrite_args(args(&["neurofit", "results", "--batch", "291"])),
            args(&["neurofit", "results", "--batch", "291"])
        );
        assert_eq!(rewrite_args(args(&["neurofit", "--help"])), args(&["neurofit", "--help"]));
        assert_eq!(rewrite_args(args(&["neurofit"])), args(&["neurofit"]));
    }

    #[test]
    fn environment_defaults_and_overrides() {
        let env = Environment::from_lookup(|_| None).unwrap();
        assert_eq!(env.data_dir, PathBuf::from("data"));
        assert_eq!(env.results_path, PathBuf::from("results.json"));
        assert_eq!(env.queue_id, None);

        let env = Environment::from_lookup(|key| match key {
            "QUEUEID" => Some("17".to_string()),
            "NEUROFIT_DATA_DIR" => Some("/recordings".to_string()),
            "NEUROFIT_USER" => Some("svd".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(env.queue_id, Some(17));
        assert_eq!(env.data_dir, PathBuf::from("/recordings"));
        assert_eq!(env.username, "svd");
    }

    #[test]
    fn bad_queue_id_is_a_configuration_error() {
        let err = Environment::from_lookup(|key| (key == "QUEUEID").then(|| "abc".to_string())).unwrap_err();
        assert!(matches!(err, FitError::Configuration(_)));
    }

    #[test]
    fn fit_config_takes_flags_and_environment() {
        let cli = Cli::try_parse_from(["neurofit", "fit", "c1", "3", "stdval_dc", "--no-val", "--seed", "9"]).unwrap();
        let Command::Fit(fit_args) = cli.command else {
            panic!("expected fit");
        };
        let env = Environment::from_lookup(|key| (key == "NEUROFIT_LABGROUP").then(|| "lbhb".to_string())).unwrap();
        let config = fit_config_from_args(&fit_args, &env);
        assert!(!config.valmode);
        assert_eq!(config.seed, 9);
        assert_eq!(config.labgroup, "lbhb");
        assert_eq!(config.recording_path(), PathBuf::from("data/3/c1.json"));
    }
}
