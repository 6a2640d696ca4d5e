//! Scalar loss sinks.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::losses::IterationLosses;
use crate::Result;

/// Receives the losses of each logged iteration.
pub trait MetricsSink {
    fn record(&mut self, losses: &IterationLosses) -> Result<()>;
}

/// Appends one JSON object per scalar: `{"step": 10, "tag": "D/loss", "value": 0.5}`.
///
/// `step` is the one-based iteration number, matching the log line.
pub struct JsonlMetrics {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl JsonlMetrics {
    /// Open `path` for appending, creating parent directories as needed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for JsonlMetrics {
    fn record(&mut self, losses: &IterationLosses) -> Result<()> {
        let step = losses.iteration + 1;
        for (tag, value) in losses.entries() {
            let line = serde_json::to_string(&serde_json::json!({
                "step": step,
                "tag": tag,
                "value": value,
            }))?;
            writeln!(self.writer, "{line}")?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_one_line_per_scalar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/metrics.jsonl");
        let mut sink = JsonlMetrics::new(&path).unwrap();

        let mut losses = IterationLosses::new(9);
        losses.push("D/loss", 0.5);
        losses.push("G/loss_id", 0.25);
        sink.record(&losses).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["step"], 10);
        assert_eq!(lines[0]["tag"], "D/loss");
        assert_eq!(lines[1]["value"].as_f64().unwrap(), 0.25);
    }

    #[test]
    fn test_appends_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let mut losses = IterationLosses::new(0);
        losses.push("D/loss", 1.0);
        JsonlMetrics::new(&path).unwrap().record(&losses).unwrap();
        JsonlMetrics::new(&path).unwrap().record(&losses).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
    }
}
