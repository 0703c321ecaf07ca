//! Terminal progress display
//!
//! One bar per started file plus an overall counter, drawn with `indicatif`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::progress::ProgressObserver;
use crate::registry::FileId;

const FILE_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({per_sec}) {msg}";
const FILE_SPINNER_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] {pos} lines ({per_sec}) {msg}";
const TOTAL_TEMPLATE: &str = "{prefix:.bold} [{elapsed_precise}] [{bar:40.green}] {pos}/{len} ({eta}) {msg}";
const TOTAL_SPINNER_TEMPLATE: &str = "{prefix:.bold} [{elapsed_precise}] {pos} lines ({per_sec}) {msg}";

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

/// Renders progress bars on stderr.
pub struct ConsoleObserver {
    multi: MultiProgress,
    total: ProgressBar,
    bars: Mutex<HashMap<FileId, ProgressBar>>,
    expected_lines_per_file: Option<u64>,
    files: usize,
    finished: AtomicU64,
}

impl ConsoleObserver {
    /// `expected_lines_per_file` sizes the per-file bars; without it they are
    /// open-ended counters.
    pub fn new(files: usize, expected_lines_per_file: Option<u64>) -> Self {
        Self::with_draw_target(ProgressDrawTarget::stderr(), files, expected_lines_per_file)
    }

    pub fn with_draw_target(
        target: ProgressDrawTarget,
        files: usize,
        expected_lines_per_file: Option<u64>,
    ) -> Self {
        let multi = MultiProgress::with_draw_target(target);

        let total = match expected_lines_per_file {
            Some(per_file) => {
                let bar = multi.add(ProgressBar::new(per_file.saturating_mul(files as u64)));
                bar.set_style(style(TOTAL_TEMPLATE));
                bar
            }
            None => {
                let bar = multi.add(ProgressBar::new_spinner());
                bar.set_style(style(TOTAL_SPINNER_TEMPLATE));
                bar
            }
        };
        total.set_prefix("total");
        total.set_message(format!("0/{} files", files));

        Self {
            multi,
            total,
            bars: Mutex::new(HashMap::new()),
            expected_lines_per_file,
            files,
            finished: AtomicU64::new(0),
        }
    }

    fn bars(&self) -> MutexGuard<'_, HashMap<FileId, ProgressBar>> {
        self.bars.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lines counted so far across all files.
    pub fn total_lines(&self) -> u64 {
        self.total.position()
    }

    /// Stop drawing and leave the final state on screen.
    pub fn finish(&self) {
        self.total.finish();
    }

    fn file_done(&self) {
        let done = self.finished.fetch_add(1, Ordering::Relaxed) + 1;
        self.total.set_message(format!("{}/{} files", done, self.files));
    }
}

impl ProgressObserver for ConsoleObserver {
    fn file_started(&self, file: &FileId) {
        let bar = match self.expected_lines_per_file {
            Some(expected) => {
                let bar = ProgressBar::new(expected);
                bar.set_style(style(FILE_TEMPLATE));
                bar
            }
            None => {
                let bar = ProgressBar::new_spinner();
                bar.set_style(style(FILE_SPINNER_TEMPLATE));
                bar
            }
        };
        let bar = self.multi.add(bar);
        bar.set_message(format!("Processing file {}", file.file_name()));
        self.bars().insert(file.clone(), bar);
    }

    fn lines_processed(&self, file: &FileId, lines: u64) {
        if let Some(bar) = self.bars().get(file) {
            bar.inc(lines);
        }
        self.total.inc(lines);
    }

    fn file_finished(&self, file: &FileId) {
        if let Some(bar) = self.bars().remove(file) {
            bar.finish_with_message(format!("Done processing file {}", file.file_name()));
        }
        self.file_done();
    }

    fn file_interrupted(&self, file: &FileId) {
        if let Some(bar) = self.bars().remove(file) {
            bar.abandon_with_message(format!(
                "Processing of file {} was interrupted",
                file.file_name()
            ));
        }
    }
}
