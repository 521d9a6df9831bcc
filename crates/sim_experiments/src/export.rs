//! Export of experiment reports to JSON and CSV.

use std::fs::File;
use std::path::Path;

use crate::error::ExperimentError;
use crate::runner::ExperimentReport;

const SUMMARY_COLUMNS: [&str; 9] = [
    "status",
    "final_time",
    "plans_executed",
    "plans_replayed",
    "events_published",
    "dispatch_faults",
    "outputs_released",
    "elapsed_ms",
    "fault",
];

/// Writes the whole report, continuity logs included, as pretty JSON.
///
/// # Errors
///
/// Returns [`ExperimentError::EmptyExport`] when no scenario ran, or the
/// underlying I/O or serialization error.
pub fn export_to_json(report: &ExperimentReport, path: impl AsRef<Path>) -> Result<(), ExperimentError> {
    ensure_not_empty(report)?;
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}

/// Writes one row per executed scenario: index, seed, the dimension meta
/// values under their headers, then the run summary.
///
/// # Errors
///
/// Returns [`ExperimentError::EmptyExport`] when no scenario ran, or the
/// underlying I/O or CSV error.
pub fn export_to_csv(report: &ExperimentReport, path: impl AsRef<Path>) -> Result<(), ExperimentError> {
    ensure_not_empty(report)?;
    let mut wtr = csv::Writer::from_writer(File::create(path)?);

    let header: Vec<&str> = ["scenario", "seed"]
        .into_iter()
        .chain(report.meta_headers.iter().map(String::as_str))
        .chain(SUMMARY_COLUMNS)
        .collect();
    wtr.write_record(&header)?;

    for record in &report.records {
        let run = &record.report;
        let mut row = vec![record.index.to_string(), record.seed.to_string()];
        row.extend(record.meta.iter().cloned());
        row.extend([
            run.status.label().to_string(),
            run.final_time.to_string(),
            run.plans_executed.to_string(),
            run.plans_replayed.to_string(),
            run.metrics.events_published.to_string(),
            run.metrics.dispatch_faults.to_string(),
            run.metrics.outputs_released.to_string(),
            run.elapsed.as_millis().to_string(),
            run.status
                .fault()
                .map(|fault| fault.message.clone())
                .unwrap_or_default(),
        ]);
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

fn ensure_not_empty(report: &ExperimentReport) -> Result<(), ExperimentError> {
    if report.records.is_empty() {
        return Err(ExperimentError::EmptyExport);
    }
    Ok(())
}
