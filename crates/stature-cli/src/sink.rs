use serde::Serialize;
use stature_core::pipeline::{EstimateSink, PipelineOutput, PipelineRequest, SinkError};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Flattened per-person row, one JSON object per line.
#[derive(Serialize)]
struct Row<'a> {
    filename: &'a str,
    person: usize,
    pixel_per_cm: f64,
    height_cm: f64,
    cm_sum: f64,
    diff: f64,
    corrected_cm: Option<f64>,
    distances: [f64; 7],
}

/// Appends every estimate to a JSON Lines file, creating it if needed.
pub struct JsonLinesSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl EstimateSink for JsonLinesSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn record(
        &self,
        request: &PipelineRequest,
        output: &PipelineOutput,
    ) -> Result<Option<PathBuf>, SinkError> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| SinkError("writer lock poisoned".into()))?;

        let report = &output.report;
        for row_index in 0..report.len() {
            let person = report.persons[row_index];
            let row = Row {
                filename: &request.filename,
                person,
                pixel_per_cm: output.scale.pixel_per_cm,
                height_cm: report.heights[row_index],
                cm_sum: report.cm_sum[row_index],
                diff: report.diffs[row_index],
                corrected_cm: output.corrected.as_ref().and_then(|c| c.get(row_index).copied()),
                distances: report.distances[row_index],
            };
            serde_json::to_writer(&mut *writer, &row).map_err(|e| SinkError(e.to_string()))?;
            writer.write_all(b"\n").map_err(|e| SinkError(e.to_string()))?;
        }
        writer.flush().map_err(|e| SinkError(e.to_string()))?;

        tracing::debug!(path = %self.path.display(), rows = report.len(), "estimates appended");
        Ok(None)
    }
}
