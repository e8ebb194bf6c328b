//! ferry CLI
//!
//! Resumable bulk copies of large local files. Every run keeps a journal;
//! an interrupted copy continues from its checkpoints with `ferry resume`.

mod config;
mod progress;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;
use ferry_core::{
    JobStatus, ObjectSource, Transfer, TransferJournal, TransferLocation, TransferSummary,
};
use ferry_files::{FileSinkFactory, LocalFileSource};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use config::Config;
use progress::{BatchProgress, format_bytes};

/// How often the journal is saved while a batch runs
const JOURNAL_SAVE_INTERVAL: Duration = Duration::from_secs(2);

/// Progress bar refresh period
const PROGRESS_TICK: Duration = Duration::from_millis(250);

/// Journal file name used by `sync-dir` inside the destination directory
const SYNC_JOURNAL_NAME: &str = ".ferry-journal";

/// ferry - resumable bulk transfers of very large files
#[derive(Parser)]
#[command(name = "ferry")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug output (implies --verbose)
    #[arg(short, long)]
    debug: bool,

    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/ferry/config.toml")]
    config: String,

    /// Hide the progress bar
    #[arg(long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy one file
    Copy {
        /// Source file
        source: PathBuf,

        /// Destination file
        destination: PathBuf,

        /// Journal path (default: <DESTINATION>.ferry-journal)
        #[arg(long)]
        journal: Option<PathBuf>,

        /// Block size in bytes
        #[arg(long)]
        block_size: Option<u64>,

        /// Read the source densely, without sparse range discovery
        #[arg(long)]
        dense: bool,
    },

    /// Copy every file under a directory
    SyncDir {
        /// Source directory
        source: PathBuf,

        /// Destination directory
        destination: PathBuf,

        /// Journal path (default: <DESTINATION>/.ferry-journal)
        #[arg(long)]
        journal: Option<PathBuf>,

        /// Block size in bytes
        #[arg(long)]
        block_size: Option<u64>,

        /// Read sources densely, without sparse range discovery
        #[arg(long)]
        dense: bool,
    },

    /// Continue an interrupted transfer
    Resume {
        /// Journal written by an earlier run
        journal: PathBuf,

        /// Read sources densely, without sparse range discovery
        #[arg(long)]
        dense: bool,
    },

    /// Show the jobs recorded in a journal
    Inspect {
        /// Journal to show
        journal: PathBuf,

        /// Print the raw journal
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration (expand tilde if present)
    let config_path = if let Some(rest) = cli.config.strip_prefix("~/") {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(rest)
    } else {
        PathBuf::from(&cli.config)
    };
    let mut config = if config_path.exists() {
        Config::load(&config_path)?
    } else if config_path == Config::default_path() {
        Config::load_or_default()?
    } else {
        Config::load(&config_path)? // Will fail with proper error
    };

    // Initialize logging
    let log_level = if cli.debug {
        "trace".to_string()
    } else if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    match cli.command {
        Commands::Copy {
            source,
            destination,
            journal,
            block_size,
            dense,
        } => {
            if let Some(block_size) = block_size {
                config.transfer = config.transfer.with_block_size(block_size);
            }
            config.validate()?;
            let journal = journal.unwrap_or_else(|| default_copy_journal(&destination));
            copy_file(source, destination, journal, dense, cli.quiet, &config).await?;
        }
        Commands::SyncDir {
            source,
            destination,
            journal,
            block_size,
            dense,
        } => {
            if let Some(block_size) = block_size {
                config.transfer = config.transfer.with_block_size(block_size);
            }
            config.validate()?;
            let journal = journal.unwrap_or_else(|| destination.join(SYNC_JOURNAL_NAME));
            sync_dir(source, destination, journal, dense, cli.quiet, &config).await?;
        }
        Commands::Resume { journal, dense } => {
            config.validate()?;
            resume(journal, dense, cli.quiet, &config).await?;
        }
        Commands::Inspect { journal, json } => {
            inspect(&journal, json).await?;
        }
    }

    Ok(())
}

fn default_copy_journal(destination: &Path) -> PathBuf {
    let mut path = destination.as_os_str().to_owned();
    path.push(".ferry-journal");
    PathBuf::from(path)
}

fn local_source(dense: bool) -> Arc<dyn ObjectSource> {
    if dense {
        Arc::new(LocalFileSource::dense())
    } else {
        Arc::new(LocalFileSource::new())
    }
}

/// Copy one file
async fn copy_file(
    source: PathBuf,
    destination: PathBuf,
    journal: PathBuf,
    dense: bool,
    quiet: bool,
    config: &Config,
) -> anyhow::Result<()> {
    if journal.exists() {
        anyhow::bail!(
            "Journal {} already exists; continue with `ferry resume {}`",
            journal.display(),
            journal.display()
        );
    }
    let size = std::fs::metadata(&source)
        .with_context(|| format!("Cannot read {}", source.display()))?
        .len();

    println!("Source:      {}", source.display());
    println!("Destination: {}", destination.display());
    println!("Size:        {}", format_bytes(size));
    println!();

    let transfer = Transfer::new(
        config.transfer.clone(),
        local_source(dense),
        Arc::new(FileSinkFactory::new()),
    )?;
    transfer.add_job(
        TransferLocation::local(source),
        TransferLocation::local(destination),
    )?;
    run_batch(&transfer, &journal, size, quiet).await
}

/// Copy every regular file under `source` to the same relative path under
/// `destination`
async fn sync_dir(
    source: PathBuf,
    destination: PathBuf,
    journal: PathBuf,
    dense: bool,
    quiet: bool,
    config: &Config,
) -> anyhow::Result<()> {
    if journal.exists() {
        anyhow::bail!(
            "Journal {} already exists; continue with `ferry resume {}`",
            journal.display(),
            journal.display()
        );
    }
    let root = source.clone();
    let files = tokio::task::spawn_blocking(move || enumerate_files(&root))
        .await?
        .with_context(|| format!("Cannot list {}", source.display()))?;

    let transfer = Transfer::new(
        config.transfer.clone(),
        local_source(dense),
        Arc::new(FileSinkFactory::new()),
    )?;
    let mut total = 0u64;
    for (relative, size) in &files {
        transfer.add_job(
            TransferLocation::local(source.join(relative)),
            TransferLocation::local(destination.join(relative)),
        )?;
        total += size;
    }

    println!("Source:      {}", source.display());
    println!("Destination: {}", destination.display());
    println!("Files:       {} ({})", files.len(), format_bytes(total));
    println!();

    run_batch(&transfer, &journal, total, quiet).await
}

/// Regular files under `root` as (relative path, size), sorted by path.
fn enumerate_files(root: &Path) -> std::io::Result<Vec<(PathBuf, u64)>> {
    let mut files = Vec::new();
    let mut pending = vec![PathBuf::new()];
    while let Some(relative) = pending.pop() {
        for entry in std::fs::read_dir(root.join(&relative))? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = relative.join(entry.file_name());
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                files.push((path, entry.metadata()?.len()));
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Continue a batch from its journal
async fn resume(journal: PathBuf, dense: bool, quiet: bool, config: &Config) -> anyhow::Result<()> {
    let saved = TransferJournal::load(&journal)
        .await
        .with_context(|| format!("Cannot load journal {}", journal.display()))?;
    let total = saved.jobs.iter().filter_map(|job| job.total_length).sum();
    let pending = saved
        .jobs
        .iter()
        .filter(|job| job.status.needs_run())
        .count();
    println!(
        "Resuming {}: {} of {} jobs to run",
        journal.display(),
        pending,
        saved.jobs.len()
    );
    println!();

    let transfer = Transfer::restore(
        saved,
        config.transfer.clone(),
        local_source(dense),
        Arc::new(FileSinkFactory::new()),
    )?;
    run_batch(&transfer, &journal, total, quiet).await
}

/// Run `transfer`, saving the journal periodically and on exit.
///
/// Ctrl-C cancels the batch; the journal written afterwards lets a later
/// `ferry resume` continue. The journal is removed once every job is done.
async fn run_batch(
    transfer: &Transfer,
    journal: &Path,
    total_bytes: u64,
    quiet: bool,
) -> anyhow::Result<()> {
    let started = Instant::now();
    let bar = if quiet {
        BatchProgress::hidden()
    } else {
        BatchProgress::new(total_bytes)
    };
    if let Some(parent) = journal.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    transfer.snapshot().save(journal).await?;

    let run = transfer.run();
    tokio::pin!(run);
    let mut ticker = tokio::time::interval(PROGRESS_TICK);
    let mut last_save = Instant::now();
    let mut interrupted = false;

    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            _ = ticker.tick() => {
                bar.update(&transfer.progress());
                if last_save.elapsed() >= JOURNAL_SAVE_INTERVAL {
                    if let Err(e) = transfer.snapshot().save(journal).await {
                        tracing::warn!("Failed to save journal {}: {}", journal.display(), e);
                    }
                    last_save = Instant::now();
                }
            }
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal?;
                interrupted = true;
                bar.println("Interrupted, stopping transfers...");
                transfer.cancel();
            }
        }
    };

    let snapshot = transfer.snapshot();
    snapshot.save(journal).await?;
    let summary = result?;
    bar.update(&summary.progress);
    bar.finish_with_message(format!(
        "{}/{} files",
        summary.progress.files_done(),
        summary.progress.files_total
    ));

    print_summary(&summary, started.elapsed());
    if summary.is_success() {
        tokio::fs::remove_file(journal).await?;
        return Ok(());
    }
    println!();
    println!("Journal saved to {}", journal.display());
    println!("Continue with: ferry resume {}", journal.display());
    anyhow::bail!(
        "{} of {} files not transferred",
        summary.failures.len() as u64 + summary.not_started,
        summary.progress.files_total
    )
}

fn print_summary(summary: &TransferSummary, elapsed: Duration) {
    let p = &summary.progress;
    println!();
    println!(
        "{} {} transferred in {:.1}s",
        style("Done:").bold(),
        format_bytes(p.bytes_transferred),
        elapsed.as_secs_f64()
    );
    println!("  Finished: {}", style(p.files_transferred).green());
    if p.files_skipped > 0 {
        println!("  Skipped:  {}", style(p.files_skipped).yellow());
    }
    if p.files_failed > 0 {
        println!("  Failed:   {}", style(p.files_failed).red());
        for failure in &summary.failures {
            println!("    {} {}: {}", failure.id.short(), failure.source, failure.error);
        }
    }
    if summary.not_started > 0 {
        println!("  Not started: {}", summary.not_started);
    }
}

/// Print the jobs of a journal
async fn inspect(journal: &Path, json: bool) -> anyhow::Result<()> {
    let saved = TransferJournal::load(journal)
        .await
        .with_context(|| format!("Cannot load journal {}", journal.display()))?;
    if json {
        println!("{}", saved.to_json()?);
        return Ok(());
    }

    println!("Journal: {} (format {})", journal.display(), saved.format_version);
    println!("Jobs:    {}", saved.jobs.len());
    println!();
    for job in &saved.jobs {
        let done = match (job.status, job.total_length) {
            (JobStatus::Finished, Some(total)) => total,
            (_, Some(total)) => job.checkpoint.committed_bytes(total, job.block_size),
            (_, None) => 0,
        };
        let total = job
            .total_length
            .map_or_else(|| "?".to_string(), format_bytes);
        let status = match job.status {
            JobStatus::Finished => style(job.status.to_string()).green(),
            JobStatus::Failed => style(job.status.to_string()).red(),
            JobStatus::Skipped => style(job.status.to_string()).yellow(),
            _ => style(job.status.to_string()),
        };
        println!("{} {:<12} {} -> {}", job.id.short(), status, job.source, job.destination);
        println!(
            "    {} / {}, window {}, next offset {}",
            format_bytes(done),
            total,
            job.checkpoint.transfer_window.len(),
            job.checkpoint.entry_transfer_offset
        );
        if let Some(error) = &job.last_error {
            println!("    last error: {error}");
        }
    }

    let p = &saved.progress;
    println!();
    println!(
        "{} transferred, {} finished, {} failed, {} skipped",
        format_bytes(p.bytes_transferred),
        p.files_transferred,
        p.files_failed,
        p.files_skipped
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_copy() {
        let cli = Cli::try_parse_from([
            "ferry",
            "--verbose",
            "copy",
            "/data/disk.img",
            "/backup/disk.img",
            "--block-size",
            "1048576",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Copy {
                source,
                block_size,
                journal,
                dense,
                ..
            } => {
                assert_eq!(source, PathBuf::from("/data/disk.img"));
                assert_eq!(block_size, Some(1_048_576));
                assert!(journal.is_none());
                assert!(!dense);
            }
            _ => panic!("expected copy"),
        }
    }

    #[test]
    fn test_parse_resume_and_inspect() {
        let cli = Cli::try_parse_from(["ferry", "resume", "/tmp/j"]).unwrap();
        assert!(matches!(cli.command, Commands::Resume { .. }));
        let cli = Cli::try_parse_from(["ferry", "inspect", "/tmp/j", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Inspect { json: true, .. }));
        assert!(Cli::try_parse_from(["ferry", "copy", "/only-one"]).is_err());
    }

    #[test]
    fn test_default_copy_journal() {
        assert_eq!(
            default_copy_journal(Path::new("/backup/disk.img")),
            PathBuf::from("/backup/disk.img.ferry-journal")
        );
    }

    #[test]
    fn test_enumerate_files_recursive() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("top.bin"), [0u8; 10]).unwrap();
        std::fs::write(dir.path().join("a/b/deep.bin"), [0u8; 3]).unwrap();

        let files = enumerate_files(dir.path()).unwrap();
        assert_eq!(
            files,
            vec![
                (PathBuf::from("a/b/deep.bin"), 3),
                (PathBuf::from("top.bin"), 10),
            ]
        );
    }

    #[tokio::test]
    async fn test_copy_file_end_to_end() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src.bin");
        let destination = dir.path().join("out/dst.bin");
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 253) as u8).collect();
        std::fs::write(&source, &data).unwrap();

        let mut config = Config::default();
        config.transfer.block_size = 16 * 1024;
        config.transfer.span_size = 64 * 1024;
        config.transfer.memory_buffer_size = 16 * 1024;
        config.transfer.memory_pool_buffers = 8;
        config.transfer.worker_count = 4;
        let journal = default_copy_journal(&destination);

        copy_file(source, destination.clone(), journal.clone(), true, true, &config)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&destination).unwrap(), data);
        assert!(!journal.exists());
    }
}
