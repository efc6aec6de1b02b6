//! Structured per-step summaries.
//!
//! A summary that fails to write never aborts training; the driver counts
//! the failure and retries on the next generator step.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;

use mmd_core::LossDiagnostics;

use crate::optim::HyperState;

pub const SUMMARY_FILE: &str = "summary.jsonl";

/// One emitted summary.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryRecord {
    pub step: usize,
    pub global_d_step: usize,
    pub g_loss: f32,
    pub d_loss: f32,
    pub lr: f64,
    pub gp: f64,
    pub sc: f64,
    pub mmd2: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gradient_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l2_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unscaled_g_loss: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub norm2_jacobian: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub norm_discriminator: Option<f32>,
}

impl SummaryRecord {
    pub fn new(
        step: usize,
        global_d_step: usize,
        (g_loss, d_loss): (f32, f32),
        hyper: &HyperState,
        d: &LossDiagnostics,
    ) -> Self {
        Self {
            step,
            global_d_step,
            g_loss,
            d_loss,
            lr: hyper.lr,
            gp: hyper.gp,
            sc: hyper.sc,
            mmd2: d.mmd2,
            gradient_penalty: d.gradient_penalty,
            l2_penalty: d.l2_penalty,
            unscaled_g_loss: d.unscaled_g_loss,
            norm2_jacobian: d.norm2_jacobian,
            norm_discriminator: d.norm_discriminator,
        }
    }
}

/// Destination of summaries.
pub trait SummarySink: Send {
    fn write(&mut self, record: &SummaryRecord) -> anyhow::Result<()>;
}

/// Appends one JSON object per line to `log_dir/summary.jsonl`.
pub struct JsonlSummaryWriter {
    out: BufWriter<File>,
}

impl JsonlSummaryWriter {
    pub fn create(log_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(log_dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join(SUMMARY_FILE))?;
        Ok(Self {
            out: BufWriter::new(file),
        })
    }
}

impl SummarySink for JsonlSummaryWriter {
    fn write(&mut self, record: &SummaryRecord) -> anyhow::Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

/// Discards everything.
pub struct NullSink;

impl SummarySink for NullSink {
    fn write(&mut self, _record: &SummaryRecord) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HYPER: HyperState = HyperState {
        lr: 1e-4,
        gp: 0.0,
        sc: 1.0,
    };

    fn record(step: usize, diagnostics: &LossDiagnostics) -> SummaryRecord {
        SummaryRecord::new(step, step * 5, (0.25, -0.25), &HYPER, diagnostics)
    }

    #[test]
    fn jsonl_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = JsonlSummaryWriter::create(dir.path()).unwrap();
        let diag = LossDiagnostics {
            mmd2: 0.25,
            l2_penalty: Some(0.01),
            ..Default::default()
        };
        writer.write(&record(0, &diag)).unwrap();
        writer.write(&record(50, &LossDiagnostics::default())).unwrap();
        let text = std::fs::read_to_string(dir.path().join(SUMMARY_FILE)).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["step"], 0);
        assert_eq!(lines[0]["mmd2"], 0.25);
        assert_eq!(lines[1]["global_d_step"], 250);
        assert!(lines[0].get("l2_penalty").is_some());
        assert!(lines[1].get("l2_penalty").is_none());
    }
}
