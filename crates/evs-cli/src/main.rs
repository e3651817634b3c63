use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use evs_client::CancelSignal;
use evs_core::{BatchId, SubmissionBatch, TaskWindow, ValidationMode, Window};
use evs_runner::{
    batch_exit_code, task_error_exit_code, validation_exit_code, BatchError, BatchFile, BatchOptions, BatchSelection,
    Runner, SubmitOptions, TaskError, EXIT_CONFIG, EXIT_FAILED, EXIT_NOT_FOUND, EXIT_OK,
};
use serde::Serialize;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "evs", version, about = "Validate and submit compliance evidence")]
struct Cli {
    /// Directory holding .evs/ (defaults to the current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = Format::Json)]
    format: Format,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Yaml,
}

#[derive(Subcommand)]
enum Command {
    /// Write .evs/evs.toml and create the data directory
    Init,

    /// Run the validation rules against one task/window
    Validate {
        task: String,
        window: String,
        /// strict, lenient, advisory or skip (default from config)
        #[arg(long)]
        mode: Option<ValidationMode>,
    },

    /// Validate, upload and submit one task/window
    Submit {
        task: String,
        window: String,
        #[arg(long)]
        mode: Option<ValidationMode>,
        /// Submit without validating; recorded in history
        #[arg(long)]
        skip_validation: bool,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Submit several tasks as one batch
    BatchSubmit {
        /// Comma separated task references
        #[arg(long, value_delimiter = ',')]
        tasks: Vec<String>,
        /// Window for --tasks and --all-validated; default window for --file
        #[arg(long)]
        window: Option<String>,
        /// YAML batch file
        #[arg(long)]
        file: Option<PathBuf>,
        /// Every task in `validated` status for --window
        #[arg(long)]
        all_validated: bool,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        mode: Option<ValidationMode>,
        #[arg(long)]
        continue_on_error: Option<bool>,
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Re-run failed and skipped entries of an earlier batch
    BatchRetry {
        batch_id: String,
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Fetch the platform's verdict for a submitted task/window
    Poll { task: String, window: String },

    /// Mark the evidence of a task/window as changed
    Edit { task: String, window: String },

    /// Show the current record, last report and history
    Status { task: String, window: String },

    /// List batches, newest first, or show one
    Batches {
        #[arg(long)]
        id: Option<String>,
    },
}

#[derive(Serialize)]
struct Failure<'a> {
    task_ref: &'a str,
    window: &'a str,
    code: &'a str,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    remediation: Option<String>,
}

fn emit<T: Serialize>(format: Format, value: &T) -> anyhow::Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(value)?),
        Format::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

fn report_task_error(format: Format, err: &TaskError) -> anyhow::Result<i32> {
    if let TaskError::ValidationFailed { report, .. } = err {
        emit(format, report)?;
    }
    let key = err.key();
    let failure = Failure {
        task_ref: key.task_ref.as_str(),
        window: key.window.as_str(),
        code: err.code(),
        error: err.to_string(),
        remediation: err.remediation(),
    };
    eprintln!("{}", serde_json::to_string_pretty(&failure)?);
    Ok(task_error_exit_code(err))
}

fn report_batch_error(err: &BatchError) -> i32 {
    eprintln!("error: {err}");
    match err {
        BatchError::Empty | BatchError::NotFound(_) => EXIT_NOT_FOUND,
        BatchError::Invalid(_) => EXIT_CONFIG,
        BatchError::Store(_) | BatchError::Persistence { .. } => EXIT_FAILED,
    }
}

fn batch_result(format: Format, result: Result<SubmissionBatch, BatchError>) -> anyhow::Result<i32> {
    match result {
        Ok(batch) => {
            emit(format, &batch)?;
            Ok(batch_exit_code(&batch))
        }
        // The ledger is still complete; show it before reporting the write failure.
        Err(BatchError::Persistence { batch, source }) => {
            emit(format, &batch)?;
            eprintln!("error: batch manifest could not be written: {source}");
            Ok(EXIT_FAILED)
        }
        Err(e) => Ok(report_batch_error(&e)),
    }
}

/// Cancelled on Ctrl-C; in-flight tasks finish their current call.
fn interrupt_signal() -> CancelSignal {
    let cancel = CancelSignal::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, no new tasks will start");
            on_signal.cancel();
        }
    });
    cancel
}

fn batch_selection(
    tasks: Vec<String>,
    window: Option<String>,
    file: Option<&Path>,
    all_validated: bool,
) -> Result<(BatchSelection, Option<String>), BatchError> {
    if all_validated {
        let window = window.ok_or_else(|| BatchError::Invalid("--all-validated needs --window".into()))?;
        return Ok((BatchSelection::ValidatedInWindow(Window::new(window)), None));
    }
    if let Some(path) = file {
        let batch_file = BatchFile::load(path).map_err(|e| BatchError::Invalid(e.to_string()))?;
        let keys = batch_file
            .task_windows(window.as_deref())
            .map_err(|e| BatchError::Invalid(e.to_string()))?;
        return Ok((BatchSelection::Tasks(keys), batch_file.name));
    }
    if tasks.is_empty() {
        return Err(BatchError::Invalid("give --tasks, --file or --all-validated".into()));
    }
    let window = window.ok_or_else(|| BatchError::Invalid("--tasks needs --window".into()))?;
    let keys = tasks.iter().map(|t| TaskWindow::new(t.trim(), window.as_str())).collect();
    Ok((BatchSelection::Tasks(keys), None))
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir()?,
    };
    let format = cli.format;

    if let Command::Init = cli.cmd {
        let path = Runner::init(&root)?;
        println!("Initialized evs in {} ({})", root.display(), path.display());
        return Ok(EXIT_OK);
    }

    let r = match Runner::open(&root) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return Ok(EXIT_CONFIG);
        }
    };
    let default_mode = r.cfg.validation.default_mode;

    match cli.cmd {
        Command::Init => Ok(EXIT_OK),
        Command::Validate { task, window, mode } => {
            let key = TaskWindow::new(task, window);
            match r.controller.validate(&key, mode.unwrap_or(default_mode)) {
                Ok(report) => {
                    emit(format, &report)?;
                    Ok(validation_exit_code(&report))
                }
                Err(e) => report_task_error(format, &e),
            }
        }
        Command::Submit {
            task,
            window,
            mode,
            skip_validation,
            notes,
            tags,
        } => {
            let key = TaskWindow::new(task, window);
            let opts = SubmitOptions {
                mode: if skip_validation {
                    ValidationMode::Skip
                } else {
                    mode.unwrap_or(default_mode)
                },
                batch_id: None,
                notes,
                tags,
            };
            match r.controller.submit(&key, opts, &interrupt_signal()).await {
                Ok(s) => {
                    emit(format, &s)?;
                    Ok(EXIT_OK)
                }
                Err(e) => report_task_error(format, &e),
            }
        }
        Command::BatchSubmit {
            tasks,
            window,
            file,
            all_validated,
            name,
            mode,
            continue_on_error,
            concurrency,
            notes,
            tags,
        } => {
            let (selection, file_name) = match batch_selection(tasks, window, file.as_deref(), all_validated) {
                Ok(s) => s,
                Err(e) => return Ok(report_batch_error(&e)),
            };
            let opts = BatchOptions {
                name: name.or(file_name),
                mode: mode.unwrap_or(default_mode),
                continue_on_error: continue_on_error.unwrap_or(r.cfg.batch.continue_on_error),
                concurrency: concurrency.unwrap_or(r.cfg.batch.concurrency),
                notes,
                tags,
            };
            let result = r.batches.submit_batch(&selection, opts, &interrupt_signal()).await;
            batch_result(format, result)
        }
        Command::BatchRetry { batch_id, concurrency } => {
            let concurrency = concurrency.unwrap_or(r.cfg.batch.concurrency);
            let result = r
                .batches
                .retry_failed(&BatchId::new(batch_id), concurrency, &interrupt_signal())
                .await;
            batch_result(format, result)
        }
        Command::Poll { task, window } => {
            let key = TaskWindow::new(task, window);
            match r.controller.poll_status(&key).await {
                Ok(s) => {
                    emit(format, &s)?;
                    Ok(EXIT_OK)
                }
                Err(e) => report_task_error(format, &e),
            }
        }
        Command::Edit { task, window } => {
            let key = TaskWindow::new(task, window);
            match r.controller.record_edit(&key) {
                Ok(s) => {
                    emit(format, &s)?;
                    Ok(EXIT_OK)
                }
                Err(e) => report_task_error(format, &e),
            }
        }
        Command::Status { task, window } => {
            let key = TaskWindow::new(task, window);
            match r.controller.status(&key) {
                Ok(view) => {
                    emit(format, &view)?;
                    Ok(EXIT_OK)
                }
                Err(e) => report_task_error(format, &e),
            }
        }
        Command::Batches { id } => {
            let listed = match id {
                Some(id) => r.batches.load(&BatchId::new(id)).map(|b| vec![b]),
                None => r.batches.list(),
            };
            match listed {
                Ok(batches) => {
                    emit(format, &batches)?;
                    Ok(EXIT_OK)
                }
                Err(e) => Ok(report_batch_error(&e)),
            }
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let code = match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            EXIT_FAILED
        }
    };
    std::process::exit(code);
}
