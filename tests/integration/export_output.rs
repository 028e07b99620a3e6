//! Export artifacts after completion.

use super::support::Fixture;
use genworker::export::{ExportManifest, ExportPipeline, MANIFEST_NAME};
use genworker::job::{ExportFormat, OutputSelection, Partitioning, TemplateRef};
use genworker::worker::{JobOutcome, RunReport};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

fn read_artifacts(fx: &Fixture, job_id: &str, manifest: &ExportManifest) -> BTreeMap<String, Vec<u8>> {
    manifest
        .artifacts
        .iter()
        .map(|artifact| {
            let path = fx.backends.batches.export_path(job_id, &artifact.name).unwrap();
            (artifact.name.clone(), std::fs::read(path).unwrap())
        })
        .collect()
}

async fn run_to_completion(fx: &Fixture) -> ExportManifest {
    let worker = fx.worker("w1");
    match worker.run_once(CancellationToken::new()).await.unwrap() {
        RunReport::Finished {
            outcome: JobOutcome::Completed { export, .. },
            ..
        } => export,
        other => panic!("expected completion, got {:?}", other),
    }
}

#[tokio::test]
async fn reexport_produces_identical_artifacts() {
    let fx = Fixture::with_interval(4);
    let mut request = fx.request("j", 100.0, 9);
    request.output = OutputSelection {
        formats: vec![ExportFormat::Jsonl, ExportFormat::Json, ExportFormat::Csv],
        partitioning: Partitioning::None,
    };
    fx.submit_request(request);

    let first = run_to_completion(&fx).await;
    let before = read_artifacts(&fx, "j", &first);

    let pipeline = ExportPipeline::new(fx.backends.batches.clone());
    let second = pipeline.export(&fx.job("j")).unwrap();
    let after = read_artifacts(&fx, "j", &second);

    assert_eq!(first, second);
    assert_eq!(before, after);
    assert_eq!(
        before.keys().cloned().collect::<Vec<_>>(),
        vec!["records.csv", "records.json", "records.jsonl"]
    );

    let csv = String::from_utf8(before["records.csv"].clone()).unwrap();
    assert_eq!(csv.lines().next().unwrap(), "record_id,seed_index,text,seed");
    assert_eq!(csv.lines().count(), 10);

    let manifest_path = fx.backends.batches.export_path("j", MANIFEST_NAME).unwrap();
    let manifest: ExportManifest =
        serde_json::from_slice(&std::fs::read(manifest_path).unwrap()).unwrap();
    assert_eq!(manifest, second);
}

#[tokio::test]
async fn record_partitioning_splits_jsonl_and_csv() {
    let fx = Fixture::new();
    let mut request = fx.request("p", 100.0, 10);
    request.output = OutputSelection {
        formats: vec![ExportFormat::Jsonl, ExportFormat::Csv],
        partitioning: Partitioning::Records { per_file: 4 },
    };
    fx.submit_request(request);

    let manifest = run_to_completion(&fx).await;
    let names: Vec<&str> = manifest.artifacts.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "records-part-00000.jsonl",
            "records-part-00001.jsonl",
            "records-part-00002.jsonl",
            "records-part-00000.csv",
            "records-part-00001.csv",
            "records-part-00002.csv",
        ]
    );
    let counts: Vec<usize> = manifest.artifacts.iter().map(|a| a.records).collect();
    assert_eq!(counts, vec![4, 4, 2, 4, 4, 2]);
}

#[tokio::test]
async fn field_partitioning_groups_by_label_and_degrades_for_csv() {
    let fx = Fixture::new();
    let mut request = fx.request("f", 100.0, 6);
    request.template = TemplateRef {
        id: "labelled".to_string(),
        version: "1".to_string(),
    };
    request.output = OutputSelection {
        formats: vec![ExportFormat::Jsonl, ExportFormat::Csv],
        partitioning: Partitioning::Field {
            step_id: "tone".to_string(),
        },
    };
    fx.submit_request(request);
    fx.inference
        .reply_containing("Tone of: out:Write about rust", "URGENT");
    fx.inference.reply_containing("Tone of:", "calm");

    let manifest = run_to_completion(&fx).await;
    assert_eq!(manifest.total_records, 6);

    let jsonl: Vec<_> = manifest
        .artifacts
        .iter()
        .filter(|a| a.format == ExportFormat::Jsonl)
        .collect();
    assert_eq!(jsonl.len(), 2);
    assert!(jsonl[0].name.starts_with("records-tone-calm-"));
    assert_eq!(jsonl[0].records, 4);
    assert!(jsonl[1].name.starts_with("records-tone-urgent-"));
    assert_eq!(jsonl[1].records, 2);

    let csv: Vec<_> = manifest
        .artifacts
        .iter()
        .filter(|a| a.format == ExportFormat::Csv)
        .collect();
    assert_eq!(csv.len(), 1);
    assert_eq!(csv[0].name, "records.csv");

    // Labels are stored in their canonical spelling.
    let path = fx.backends.batches.export_path("f", &jsonl[1].name).unwrap();
    let first = std::fs::read_to_string(path).unwrap();
    let record: serde_json::Value = serde_json::from_str(first.lines().next().unwrap()).unwrap();
    assert!(record.to_string().contains("\"urgent\""));
}
