//! Batch conversion
//!
//! Runs the conversion pipeline over many inputs on a bounded set of worker
//! threads. Folders are searched recursively for `.fb2` and `.fb2.zip` files,
//! every input gets its own output path, and a failure only affects the file
//! it happened in.
//!
//! ## Usage
//!
//! ```rust, no_run
//! # fn main() -> Result<(), fb2_epub::error::ConvertError> {
//! use fb2_epub::{batch::BatchConverter, config::ConversionConfig};
//!
//! let batch = BatchConverter::new(ConversionConfig::default())
//!     .output_dir("converted")
//!     .workers(4);
//!
//! let report = batch.run(&["library/"])?;
//! println!("{} converted, {} failed", report.succeeded + report.partial, report.failed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Notes
//!
//! - Cancellation is cooperative: [`CancellationToken::cancel`] stops workers
//!   from starting new files, conversions already running are finished.
//! - Reports are returned in input order, whatever order the files finished in.

use std::{
    collections::HashSet,
    num::NonZeroUsize,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
};

use log::{debug, error, info};
use walkdir::WalkDir;

use crate::{
    config::ConversionConfig,
    error::ConvertError,
    pipeline::Converter,
    report::{ConversionReport, ConversionStatus},
};

/// Shared flag to stop a running batch
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Receives progress events of a batch
///
/// Events of different files may arrive concurrently from several worker
/// threads. All methods default to doing nothing.
pub trait BatchObserver: Send + Sync {
    /// Called once before any file is converted
    fn on_batch_start(&self, total: usize) {
        let _ = total;
    }

    /// Called when a worker picks up a file
    fn on_file_start(&self, index: usize, source: &Path) {
        let _ = (index, source);
    }

    /// Called when a file is done, whatever its outcome
    fn on_file_complete(&self, index: usize, report: &ConversionReport) {
        let _ = (index, report);
    }

    /// Called once after all workers have stopped
    fn on_batch_complete(&self, report: &BatchReport) {
        let _ = report;
    }
}

/// A planned conversion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchJob {
    pub source: PathBuf,
    pub output: PathBuf,
}

/// Outcome of a batch
#[derive(Debug, Default)]
pub struct BatchReport {
    /// One report per input, in input order
    pub reports: Vec<ConversionReport>,

    pub succeeded: usize,
    pub partial: usize,

    /// Failed files, not counting cancelled ones
    pub failed: usize,

    pub cancelled: usize,
}

impl BatchReport {
    fn from_reports(reports: Vec<ConversionReport>) -> Self {
        let mut report = BatchReport::default();

        for file in &reports {
            match file.status {
                ConversionStatus::Success => report.succeeded += 1,
                ConversionStatus::Partial => report.partial += 1,
                ConversionStatus::Failure
                    if matches!(file.error, Some(ConvertError::Cancelled)) =>
                {
                    report.cancelled += 1
                }
                ConversionStatus::Failure => report.failed += 1,
            }
        }

        report.reports = reports;
        report
    }

    pub fn total(&self) -> usize {
        self.reports.len()
    }

    /// Whether every file produced an output
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }
}

/// Converts many books in parallel
pub struct BatchConverter {
    converter: Converter,
    output_dir: Option<PathBuf>,
    workers: Option<usize>,
    token: CancellationToken,
    observer: Option<Arc<dyn BatchObserver>>,
}

impl BatchConverter {
    pub fn new(config: ConversionConfig) -> Self {
        Self {
            converter: Converter::new(config),
            output_dir: None,
            workers: None,
            token: CancellationToken::new(),
            observer: None,
        }
    }

    /// Write all outputs into one folder instead of next to their inputs
    pub fn output_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.output_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Limit the number of worker threads, defaults to the available parallelism
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers.max(1));
        self
    }

    /// Use an existing cancellation token
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn BatchObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Returns a handle to cancel this batch
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Collect, plan and convert the inputs
    ///
    /// ## Parameters
    /// - `inputs`: Files and folders; folders are searched recursively
    ///
    /// ## Return
    /// - `Ok(BatchReport)`: The per-file reports, failed files included
    /// - `Err(ConvertError)`: A folder could not be traversed
    pub fn run<P: AsRef<Path>>(&self, inputs: &[P]) -> Result<BatchReport, ConvertError> {
        let sources = collect_inputs(inputs)?;
        let jobs = self.plan(sources);

        Ok(self.convert(&jobs))
    }

    /// Assign every source a distinct output path
    ///
    /// The output is named after the source with an `.epub` extension. Names
    /// already taken by an earlier job get a numeric suffix.
    pub fn plan(&self, sources: Vec<PathBuf>) -> Vec<BatchJob> {
        let mut taken = HashSet::new();

        sources
            .into_iter()
            .map(|source| {
                let stem = book_stem(&source);
                let dir = match &self.output_dir {
                    Some(dir) => dir.clone(),
                    None => source.parent().map(Path::to_path_buf).unwrap_or_default(),
                };

                let mut output = dir.join(format!("{}.epub", stem));
                let mut counter = 1;
                while !taken.insert(output.to_string_lossy().to_lowercase()) {
                    counter += 1;
                    output = dir.join(format!("{}-{}.epub", stem, counter));
                }

                BatchJob { source, output }
            })
            .collect()
    }

    /// Convert planned jobs on the worker threads
    pub fn convert(&self, jobs: &[BatchJob]) -> BatchReport {
        let workers = self
            .workers
            .unwrap_or_else(|| thread::available_parallelism().map_or(1, NonZeroUsize::get))
            .min(jobs.len())
            .max(1);
        info!("converting {} files with {} workers", jobs.len(), workers);

        if let Some(observer) = &self.observer {
            observer.on_batch_start(jobs.len());
        }

        let next = AtomicUsize::new(0);
        let mut slots: Vec<Option<ConversionReport>> = jobs.iter().map(|_| None).collect();

        thread::scope(|scope| {
            let handles = (0..workers)
                .map(|_| scope.spawn(|| self.work(jobs, &next)))
                .collect::<Vec<_>>();

            for handle in handles {
                match handle.join() {
                    Ok(done) => {
                        for (index, report) in done {
                            slots[index] = Some(report);
                        }
                    }
                    Err(payload) => panic::resume_unwind(payload),
                }
            }
        });

        let reports = slots
            .into_iter()
            .zip(jobs)
            .map(|(slot, job)| {
                slot.unwrap_or_else(|| {
                    ConversionReport::failed(&job.source, ConvertError::Cancelled, vec![])
                })
            })
            .collect();

        let report = BatchReport::from_reports(reports);
        info!(
            "batch finished: {} succeeded, {} partial, {} failed, {} cancelled",
            report.succeeded, report.partial, report.failed, report.cancelled
        );

        if let Some(observer) = &self.observer {
            observer.on_batch_complete(&report);
        }

        report
    }

    /// Worker loop, pulls job indices until all jobs are taken or the batch is cancelled
    fn work(&self, jobs: &[BatchJob], next: &AtomicUsize) -> Vec<(usize, ConversionReport)> {
        let mut done = Vec::new();

        while !self.token.is_cancelled() {
            let index = next.fetch_add(1, Ordering::Relaxed);
            let Some(job) = jobs.get(index) else {
                break;
            };

            debug!("converting {}", job.source.display());
            if let Some(observer) = &self.observer {
                observer.on_file_start(index, &job.source);
            }

            let report = isolate(&job.source, || {
                self.converter.convert_file(&job.source, &job.output)
            });

            if let Some(observer) = &self.observer {
                observer.on_file_complete(index, &report);
            }
            done.push((index, report));
        }

        done
    }
}

/// Run a single conversion, turning a panic into a failed report
fn isolate<F>(source: &Path, convert: F) -> ConversionReport
where
    F: FnOnce() -> ConversionReport,
{
    panic::catch_unwind(AssertUnwindSafe(convert)).unwrap_or_else(|payload| {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|reason| reason.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());

        error!("conversion of {} panicked: {}", source.display(), reason);
        ConversionReport::failed(source, ConvertError::Panicked { reason }, vec![])
    })
}

/// Expand folders into the FB2 files they contain
///
/// Files are taken as given, folders are traversed recursively in file name
/// order.
pub fn collect_inputs<P: AsRef<Path>>(inputs: &[P]) -> Result<Vec<PathBuf>, ConvertError> {
    let mut sources = Vec::new();

    for input in inputs {
        let input = input.as_ref();
        if !input.is_dir() {
            sources.push(input.to_path_buf());
            continue;
        }

        for entry in WalkDir::new(input).sort_by_file_name() {
            let entry = entry?;
            if entry.file_type().is_file() && is_fb2_path(entry.path()) {
                sources.push(entry.into_path());
            }
        }
    }

    Ok(sources)
}

/// Whether the path names an `.fb2` or `.fb2.zip` file
pub fn is_fb2_path(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    name.ends_with(".fb2") || name.ends_with(".fb2.zip")
}

/// File name without the `.fb2` or `.fb2.zip` extension
fn book_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let lower = name.to_lowercase();

    let stem = [".fb2.zip", ".fb2", ".zip"]
        .iter()
        .find(|extension| lower.ends_with(*extension))
        .map(|extension| &name[..name.len() - extension.len()])
        .unwrap_or(name.as_str());

    if stem.is_empty() {
        "book".to_string()
    } else {
        stem.to_string()
    }
}
