use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::cache::write_atomic;
use crate::error::PipelineError;
use crate::pipeline::{BatchReport, BatchSummary, ProgressEvent, ProgressSink};

pub const RECORDS_FILE: &str = "records.json";
pub const PROBLEMS_FILE: &str = "problems.json";
pub const SNIPPETS_FILE: &str = "snippets.jsonl";
pub const COST_REPORT_FILE: &str = "cost_report.json";

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_summary(summary: &BatchSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Logs progress through `tracing` instead of stdout.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn event(&self, event: ProgressEvent) {
        let elapsed = event
            .elapsed
            .map(|elapsed| format!(" ({:.1}s)", elapsed.as_secs_f64()))
            .unwrap_or_default();
        match event.accession {
            Some(accession) => tracing::info!("{accession}: {}{elapsed}", event.message),
            None => tracing::info!("{}{elapsed}", event.message),
        }
    }
}

fn to_json<T: Serialize + ?Sized>(what: &str, value: &T) -> Result<Vec<u8>, PipelineError> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|err| PipelineError::Parse {
        what: what.to_string(),
        message: err.to_string(),
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Writes the four batch artifacts into `out_dir`, each replaced atomically.
pub fn write_outputs(
    out_dir: &Utf8Path,
    report: &BatchReport,
) -> Result<Vec<Utf8PathBuf>, PipelineError> {
    std::fs::create_dir_all(out_dir.as_std_path())
        .map_err(|err| PipelineError::Filesystem(format!("{out_dir}: {err}")))?;

    let mut snippets = Vec::new();
    for snippet in &report.snippets {
        serde_json::to_writer(&mut snippets, snippet).map_err(|err| PipelineError::Parse {
            what: SNIPPETS_FILE.to_string(),
            message: err.to_string(),
        })?;
        snippets.push(b'\n');
    }

    let artifacts = [
        (RECORDS_FILE, to_json(RECORDS_FILE, &report.records)?),
        (PROBLEMS_FILE, to_json(PROBLEMS_FILE, &report.problems)?),
        (SNIPPETS_FILE, snippets),
        (COST_REPORT_FILE, to_json(COST_REPORT_FILE, &report.costs)?),
    ];
    let mut written = Vec::new();
    for (name, bytes) in artifacts {
        let path = out_dir.join(name);
        write_atomic(&path, &bytes)?;
        tracing::info!("wrote {path}");
        written.push(path);
    }
    Ok(written)
}
