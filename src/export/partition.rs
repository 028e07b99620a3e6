//! Artifact partitioning.

use crate::batch::GeneratedRecord;
use crate::job::{ExportFormat, Partitioning};
use std::collections::BTreeMap;

pub(super) const BASE_NAME: &str = "records";
const MAX_SLUG_CHARS: usize = 48;

/// Records destined for one artifact. `name` has no extension.
#[derive(Debug)]
pub struct Partition<'a> {
    pub name: String,
    pub records: Vec<&'a GeneratedRecord>,
}

/// The partitioning a format can honor for the requested strategy.
///
/// JSONL supports every strategy, CSV supports record chunks, JSON is always
/// a single document. `Records { per_file: 0 }` is never honored.
pub fn effective_partitioning(format: ExportFormat, requested: &Partitioning) -> Partitioning {
    let supported = match (format, requested) {
        (_, Partitioning::None) => true,
        (_, Partitioning::Records { per_file: 0 }) => false,
        (ExportFormat::Jsonl, _) => true,
        (ExportFormat::Csv, Partitioning::Records { .. }) => true,
        _ => false,
    };
    if supported {
        requested.clone()
    } else {
        Partitioning::None
    }
}

pub fn partition_records<'a>(
    records: &'a [GeneratedRecord],
    partitioning: &Partitioning,
) -> Vec<Partition<'a>> {
    match partitioning {
        Partitioning::None => vec![Partition {
            name: BASE_NAME.to_string(),
            records: records.iter().collect(),
        }],
        Partitioning::Records { per_file } => {
            let per_file = (*per_file).max(1);
            if records.is_empty() {
                return vec![Partition {
                    name: format!("{}-part-{:05}", BASE_NAME, 0),
                    records: Vec::new(),
                }];
            }
            records
                .chunks(per_file)
                .enumerate()
                .map(|(i, chunk)| Partition {
                    name: format!("{}-part-{:05}", BASE_NAME, i),
                    records: chunk.iter().collect(),
                })
                .collect()
        }
        Partitioning::Field { step_id } => {
            let mut groups: BTreeMap<Option<&str>, Vec<&GeneratedRecord>> = BTreeMap::new();
            for record in records {
                groups.entry(record.output(step_id)).or_default().push(record);
            }
            groups
                .into_iter()
                .map(|(value, records)| Partition {
                    name: field_partition_name(step_id, value),
                    records,
                })
                .collect()
        }
    }
}

/// `records-{step}-{slug}-{hash}`: readable, and unique per distinct value.
fn field_partition_name(step_id: &str, value: Option<&str>) -> String {
    match value {
        None => format!("{}-{}-missing", BASE_NAME, slug(step_id)),
        Some(value) => {
            let digest = blake3::hash(value.as_bytes());
            let short = hex::encode(&digest.as_bytes()[..4]);
            let value_slug = slug(value);
            let value_slug = if value_slug.is_empty() {
                "empty".to_string()
            } else {
                value_slug
            };
            format!("{}-{}-{}-{}", BASE_NAME, slug(step_id), value_slug, short)
        }
    }
}

fn slug(text: &str) -> String {
    let mut out = String::new();
    for c in text.trim().chars() {
        if out.chars().count() >= MAX_SLUG_CHARS {
            break;
        }
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}
