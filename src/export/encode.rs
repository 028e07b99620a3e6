//! Record encoders.

use crate::batch::GeneratedRecord;
use crate::error::WorkerError;
use crate::job::ExportFormat;

/// CSV header: fixed leading columns, step ids in first-seen order, then the
/// seed as JSON.
pub fn csv_columns(records: &[GeneratedRecord]) -> Vec<String> {
    let mut steps: Vec<String> = Vec::new();
    for record in records {
        for output in &record.outputs {
            if !steps.contains(&output.step_id) {
                steps.push(output.step_id.clone());
            }
        }
    }
    let mut columns = vec!["record_id".to_string(), "seed_index".to_string()];
    columns.extend(steps);
    columns.push("seed".to_string());
    columns
}

pub fn encode_records(
    format: ExportFormat,
    records: &[&GeneratedRecord],
    columns: &[String],
) -> Result<Vec<u8>, WorkerError> {
    match format {
        ExportFormat::Jsonl => encode_jsonl(records),
        ExportFormat::Json => serde_json::to_vec_pretty(records)
            .map_err(|e| WorkerError::ExportFailed(format!("JSON encoding failed: {}", e))),
        ExportFormat::Csv => encode_csv(records, columns),
    }
}

fn encode_jsonl(records: &[&GeneratedRecord]) -> Result<Vec<u8>, WorkerError> {
    let mut out = Vec::new();
    for record in records {
        serde_json::to_writer(&mut out, record)
            .map_err(|e| WorkerError::ExportFailed(format!("JSONL encoding failed: {}", e)))?;
        out.push(b'\n');
    }
    Ok(out)
}

fn encode_csv(records: &[&GeneratedRecord], columns: &[String]) -> Result<Vec<u8>, WorkerError> {
    let csv_err = |e: csv::Error| WorkerError::ExportFailed(format!("CSV encoding failed: {}", e));
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(columns).map_err(csv_err)?;

    // columns between the two fixed leading ones and the trailing seed
    let step_columns = columns.get(2..columns.len().saturating_sub(1)).unwrap_or(&[]);
    for record in records {
        let mut row: Vec<String> = Vec::with_capacity(columns.len());
        row.push(record.record_id.clone());
        row.push(record.seed_index.to_string());
        for step_id in step_columns {
            row.push(record.output(step_id).unwrap_or_default().to_string());
        }
        row.push(record.seed.to_string());
        writer.write_record(&row).map_err(csv_err)?;
    }

    writer
        .into_inner()
        .map_err(|e| WorkerError::ExportFailed(format!("CSV flush failed: {}", e)))
}
