use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam::channel::{bounded, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::{error, info};

use gbooru_ingest::ingest::scanner;
use gbooru_ingest::strategy::RawTag;
use gbooru_ingest::utils::{config::Config, logging};
use gbooru_ingest::{ImageInput, Orchestrator, Role, SearchType, Store};

const JOB_QUEUE: usize = 1024;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config; written with defaults when missing.
    #[arg(short, long, default_value = "gbooru.toml")]
    config: PathBuf,

    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest one page of results for a search term.
    Query {
        term: String,
        #[arg(short, long, default_value_t = 1)]
        page: u32,
        #[arg(short, long, default_value = "google-image")]
        mode: String,
        #[arg(long)]
        force: bool,
    },
    /// Reverse-image search by local file or image url.
    Image {
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long, value_enum, default_value_t = SearchType::Similar)]
        search_type: SearchType,
        #[arg(long)]
        force: bool,
    },
    /// List registered strategies.
    Strategies {
        #[arg(long, value_enum)]
        role: Option<Role>,
    },
    /// Run the tag preprocessors over `namespace:value` tags.
    Preprocess { tags: Vec<String> },
    /// Ingest many terms, or every image under a directory, on worker threads.
    Batch {
        /// File with one search term per line.
        #[arg(long, conflicts_with = "dir", required_unless_present = "dir")]
        terms: Option<PathBuf>,
        /// Directory scanned for images to reverse-search.
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(short, long, default_value_t = 1)]
        page: u32,
        #[arg(short, long, default_value = "google-image")]
        mode: String,
        #[arg(long, value_enum, default_value_t = SearchType::Similar)]
        search_type: SearchType,
        #[arg(short, long, default_value_t = 4)]
        workers: usize,
        #[arg(long)]
        force: bool,
    },
}

enum Job {
    Term(String),
    Image(PathBuf),
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Term(term) => f.write_str(term),
            Job::Image(path) => write!(f, "{}", path.display()),
        }
    }
}

struct BatchSettings {
    page: u32,
    mode: String,
    search_type: SearchType,
    workers: usize,
    force: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load_or_create(&args.config)?;
    logging::init(&config.log_level, args.verbose);

    let db_path = config.database_path.clone();
    let orchestrator = Orchestrator::new(config)?;
    let mut store = Store::open(&db_path)
        .with_context(|| format!("Failed to open database: {:?}", db_path))?;
    orchestrator.prepare_store(&mut store)?;

    match args.command {
        Command::Query { term, page, mode, force } => {
            let record = orchestrator.resolve_search_query(&mut store, &term, page, &mode, force)?;
            print_json(&record)
        }
        Command::Image { file, url, search_type, force } => {
            let input = ImageInput::from_parts(file, url)?;
            let record = orchestrator.resolve_search_image(&mut store, &input, search_type, 1, force)?;
            print_json(&record)
        }
        Command::Strategies { role } => {
            let roles = match role {
                Some(role) => vec![role],
                None => vec![Role::Mode, Role::Parser, Role::TagPreprocessor],
            };
            let listed: Vec<_> = roles
                .into_iter()
                .flat_map(|role| orchestrator.list_strategies(role))
                .collect();
            print_json(&listed)
        }
        Command::Preprocess { tags } => {
            let raw = tags.iter().map(|tag| parse_tag(tag)).collect();
            let processed: Vec<String> = orchestrator
                .run_tag_preprocessor(raw)
                .into_iter()
                .map(|(namespace, value)| match namespace {
                    Some(namespace) => format!("{namespace}:{value}"),
                    None => value,
                })
                .collect();
            print_json(&processed)
        }
        Command::Batch { terms, dir, page, mode, search_type, workers, force } => {
            drop(store);
            let settings = BatchSettings {
                page,
                mode,
                search_type,
                workers: workers.max(1),
                force,
            };
            run_batch(Arc::new(orchestrator), db_path, terms, dir, settings)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// `namespace:value`, or a bare value when there is no colon.
fn parse_tag(raw: &str) -> RawTag {
    match raw.split_once(':') {
        Some((namespace, value)) => (Some(namespace.to_string()), value.to_string()),
        None => (None, raw.to_string()),
    }
}

fn run_batch(
    orchestrator: Arc<Orchestrator>,
    db_path: PathBuf,
    terms: Option<PathBuf>,
    dir: Option<PathBuf>,
    settings: BatchSettings,
) -> Result<()> {
    let (job_tx, job_rx) = bounded::<Job>(JOB_QUEUE);
    let producer = match (terms, dir) {
        (Some(path), None) => thread::spawn(move || send_terms(path, job_tx)),
        (None, Some(dir)) => thread::spawn(move || send_images(dir, job_tx)),
        _ => return Err(anyhow!("batch needs exactly one of --terms and --dir")),
    };

    let progress = ProgressBar::new_spinner();
    progress.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {pos} done {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    progress.enable_steady_tick(Duration::from_millis(120));

    let failed = Arc::new(AtomicUsize::new(0));
    let settings = Arc::new(settings);
    let mut handles = Vec::with_capacity(settings.workers);
    for i in 0..settings.workers {
        let rx = job_rx.clone();
        let orchestrator = Arc::clone(&orchestrator);
        let settings = Arc::clone(&settings);
        let db_path = db_path.clone();
        let progress = progress.clone();
        let failed = Arc::clone(&failed);

        handles.push(thread::spawn(move || -> Result<()> {
            // One connection per worker; SQLite serialises the writers.
            let mut store = Store::open(&db_path)?;
            info!(worker = i, "worker started");
            for job in rx {
                let outcome = match &job {
                    Job::Term(term) => orchestrator
                        .resolve_search_query(&mut store, term, settings.page, &settings.mode, settings.force)
                        .map(|record| record.match_results.len()),
                    Job::Image(path) => orchestrator
                        .resolve_search_image(
                            &mut store,
                            &ImageInput::File(path.clone()),
                            settings.search_type,
                            1,
                            settings.force,
                        )
                        .map(|record| record.match_results.len()),
                };
                match outcome {
                    Ok(count) => progress.set_message(format!("{job}: {count} results")),
                    Err(err) => {
                        failed.fetch_add(1, Ordering::Relaxed);
                        error!(job = %job, error = %err, "batch job failed");
                    }
                }
                progress.inc(1);
            }
            info!(worker = i, "worker finished");
            Ok(())
        }));
    }
    drop(job_rx);

    let queued = producer
        .join()
        .map_err(|_| anyhow!("job producer panicked"))??;
    for handle in handles {
        handle.join().map_err(|_| anyhow!("batch worker panicked"))??;
    }
    progress.finish_and_clear();

    let failed = failed.load(Ordering::Relaxed);
    info!(queued, failed, "batch completed");
    if failed > 0 {
        return Err(anyhow!("{failed} of {queued} batch jobs failed"));
    }
    Ok(())
}

fn send_terms(path: PathBuf, tx: Sender<Job>) -> Result<usize> {
    let text = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read terms file: {:?}", path))?;
    let mut sent = 0;
    for term in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if tx.send(Job::Term(term.to_string())).is_err() {
            break;
        }
        sent += 1;
    }
    Ok(sent)
}

fn send_images(dir: PathBuf, tx: Sender<Job>) -> Result<usize> {
    let (path_tx, path_rx) = bounded::<PathBuf>(JOB_QUEUE);
    let scanner = thread::spawn(move || scanner::scan_images(&dir, path_tx));
    let mut sent = 0;
    for path in path_rx {
        if tx.send(Job::Image(path)).is_err() {
            break;
        }
        sent += 1;
    }
    scanner.join().map_err(|_| anyhow!("scanner thread panicked"))??;
    Ok(sent)
}
