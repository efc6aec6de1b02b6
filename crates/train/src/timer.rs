//! Wall-clock progress annotations and the plain-text progress transcript.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

pub const TRANSCRIPT_FILE: &str = "progress.txt";

/// Tracks elapsed time and remembers the most recent annotation, which is
/// attached to a divergence error when a loss goes NaN.
pub struct ProgressTimer {
    start: Instant,
    last: Instant,
    annotation: String,
    transcript: Option<BufWriter<File>>,
}

impl Default for ProgressTimer {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last: now,
            annotation: String::new(),
            transcript: None,
        }
    }
}

impl ProgressTimer {
    /// Timer that also appends every reported line to `log_dir/progress.txt`.
    pub fn with_transcript(log_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(log_dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join(TRANSCRIPT_FILE))?;
        Ok(Self {
            transcript: Some(BufWriter::new(file)),
            ..Self::default()
        })
    }

    /// Record `[step] total, +delta, msg` as the current annotation.
    pub fn annotate(&mut self, step: usize, msg: &str) -> &str {
        let now = Instant::now();
        let total = now.duration_since(self.start).as_secs_f64();
        let delta = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.annotation = format!("[{step:>7}] time: {total:>9.2}s, +{delta:.3}s, {msg}");
        &self.annotation
    }

    /// Annotate, log, and append to the transcript.
    pub fn report(&mut self, step: usize, msg: &str) -> anyhow::Result<()> {
        self.annotate(step, msg);
        tracing::info!("{}", self.annotation);
        if let Some(out) = self.transcript.as_mut() {
            writeln!(out, "{}", self.annotation)?;
            out.flush()?;
        }
        Ok(())
    }

    pub fn last_annotation(&self) -> &str {
        &self.annotation
    }
}
