//! Default compute function: a column profile of a delimited text dataset.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::models::artifact::RawArtifact;
use crate::models::job::JobDescriptor;
use crate::models::report::ComputeOutput;
use crate::services::compute::{AnalysisCompute, ComputeError};
use crate::services::storage::BlobStore;

/// Columns with less than this share of filled cells are reported as sparse.
const SPARSE_THRESHOLD: f64 = 0.5;

#[derive(Debug, Deserialize)]
struct ProfileParams {
    #[serde(default = "default_delimiter")]
    delimiter: char,
}

fn default_delimiter() -> char {
    ','
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ColumnProfile {
    pub name: String,
    pub filled: usize,
    pub fill_ratio: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numeric: Option<NumericSummary>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NumericSummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DatasetProfile {
    pub row_count: usize,
    pub column_count: usize,
    pub blank_lines_dropped: usize,
    /// 1-based data row numbers whose field count differs from the header.
    pub ragged_rows: Vec<usize>,
    pub columns: Vec<ColumnProfile>,
}

/// Profiles the dataset referenced by `input_ref` and emits `report.json`
/// and `cleaned.csv`.
pub struct DatasetProfiler {
    blobs: Arc<dyn BlobStore>,
}

impl DatasetProfiler {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }
}

#[async_trait]
impl AnalysisCompute for DatasetProfiler {
    async fn run(&self, job: &JobDescriptor) -> Result<ComputeOutput, ComputeError> {
        let params: ProfileParams = if job.params.is_null() {
            ProfileParams {
                delimiter: default_delimiter(),
            }
        } else {
            serde_json::from_value(job.params.clone())
                .map_err(|e| ComputeError::InvalidParams(e.to_string()))?
        };

        let key = resolve_input_key(&job.input_ref);
        tracing::debug!(job_id = %job.job_id, key = %key, "Downloading input dataset");
        let bytes = self.blobs.download(&key).await?;

        // Parsing is CPU-bound; keep it off the async workers.
        let delimiter = params.delimiter;
        let (profile, cleaned) =
            tokio::task::spawn_blocking(move || profile_dataset(&bytes, delimiter))
                .await
                .map_err(|e| ComputeError::Failed(format!("profiling task failed: {e}")))??;

        tracing::info!(
            job_id = %job.job_id,
            rows = profile.row_count,
            columns = profile.column_count,
            "Dataset profiled"
        );

        let findings = findings_for(&profile);
        let route = if findings.is_empty() { "ready" } else { "review" };
        let report_json = serde_json::to_vec_pretty(&profile)
            .map_err(|e| ComputeError::Failed(e.to_string()))?;

        Ok(ComputeOutput {
            payload: json!({
                "summary": {
                    "rows": profile.row_count,
                    "columns": profile.column_count,
                    "blank_lines_dropped": profile.blank_lines_dropped,
                },
                "findings": findings,
                "routing": { "next_step": route },
                "columns": profile.columns,
            }),
            artifacts: vec![
                RawArtifact::new("report.json", report_json),
                RawArtifact::new("cleaned.csv", cleaned),
            ],
        })
    }
}

/// Blob key for an input reference: `s3://bucket/key`, `r2://bucket/key` or
/// a bare key.
pub fn resolve_input_key(input_ref: &str) -> String {
    match input_ref.split_once("://") {
        Some((_, rest)) => rest
            .split_once('/')
            .map(|(_, key)| key.to_string())
            .unwrap_or_default(),
        None => input_ref.trim_start_matches('/').to_string(),
    }
}

/// Split one record. A double-quoted field may contain the delimiter and
/// `""` escapes, and its content is kept as written; unquoted fields are
/// trimmed. Quoted fields cannot span lines.
fn split_fields(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut chars = line.chars().peekable();
    loop {
        while chars.next_if(|c| *c != delimiter && c.is_whitespace()).is_some() {}

        let mut field = String::new();
        if chars.next_if_eq(&'"').is_some() {
            while let Some(c) = chars.next() {
                match c {
                    '"' if chars.next_if_eq(&'"').is_some() => field.push('"'),
                    '"' => break,
                    _ => field.push(c),
                }
            }
        }

        let mut rest = String::new();
        let mut more = false;
        for c in chars.by_ref() {
            if c == delimiter {
                more = true;
                break;
            }
            rest.push(c);
        }
        field.push_str(rest.trim());
        fields.push(field);

        if !more {
            return fields;
        }
    }
}

/// Quote a field for the cleaned output when reading it back unquoted
/// would change it.
fn quote_field(field: &str, delimiter: char) -> Cow<'_, str> {
    let needs_quotes = field.contains(delimiter)
        || field.contains(['"', '\n', '\r'])
        || field.trim() != field;
    if needs_quotes {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

fn join_fields(fields: &[String], delimiter: char) -> String {
    fields
        .iter()
        .map(|f| quote_field(f, delimiter))
        .collect::<Vec<_>>()
        .join(&delimiter.to_string())
}

/// Profile delimited text and produce the cleaned copy.
pub fn profile_dataset(
    bytes: &[u8],
    delimiter: char,
) -> Result<(DatasetProfile, Vec<u8>), ComputeError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| ComputeError::InvalidData(format!("input is not UTF-8: {e}")))?;

    let mut blank_lines_dropped = 0;
    let mut lines = text.lines().filter(|line| {
        let blank = line.trim().is_empty();
        if blank {
            blank_lines_dropped += 1;
        }
        !blank
    });

    let header = lines
        .next()
        .map(|line| split_fields(line, delimiter))
        .ok_or_else(|| ComputeError::InvalidData("dataset has no header row".to_string()))?;

    let mut filled = vec![0usize; header.len()];
    let mut numeric: Vec<Option<NumericSummary>> = vec![None; header.len()];
    let mut sums = vec![0f64; header.len()];
    let mut ragged_rows = Vec::new();
    let mut cleaned = join_fields(&header, delimiter);
    cleaned.push('\n');

    let mut row_count = 0;
    for line in lines {
        row_count += 1;
        let fields = split_fields(line, delimiter);
        if fields.len() != header.len() {
            ragged_rows.push(row_count);
        }
        for (i, value) in fields.iter().enumerate().take(header.len()) {
            if value.is_empty() {
                continue;
            }
            filled[i] += 1;
            if let Ok(n) = value.parse::<f64>() {
                if !n.is_finite() {
                    continue;
                }
                sums[i] += n;
                let summary = numeric[i].get_or_insert(NumericSummary {
                    count: 0,
                    min: n,
                    max: n,
                    mean: 0.0,
                });
                summary.count += 1;
                summary.min = summary.min.min(n);
                summary.max = summary.max.max(n);
            }
        }
        cleaned.push_str(&join_fields(&fields, delimiter));
        cleaned.push('\n');
    }

    let columns = header
        .iter()
        .enumerate()
        .map(|(i, name)| {
            // Only call a column numeric when every filled cell parsed.
            let numeric = numeric[i].take().filter(|s| s.count == filled[i]).map(|mut s| {
                s.mean = sums[i] / s.count as f64;
                s
            });
            ColumnProfile {
                name: name.clone(),
                filled: filled[i],
                fill_ratio: if row_count == 0 {
                    0.0
                } else {
                    filled[i] as f64 / row_count as f64
                },
                numeric,
            }
        })
        .collect();

    Ok((
        DatasetProfile {
            row_count,
            column_count: header.len(),
            blank_lines_dropped,
            ragged_rows,
            columns,
        },
        cleaned.into_bytes(),
    ))
}

fn findings_for(profile: &DatasetProfile) -> Vec<serde_json::Value> {
    let mut findings = Vec::new();
    if profile.row_count == 0 {
        findings.push(json!({"kind": "empty_dataset"}));
    }
    if !profile.ragged_rows.is_empty() {
        findings.push(json!({
            "kind": "ragged_rows",
            "rows": profile.ragged_rows,
        }));
    }
    for column in &profile.columns {
        if profile.row_count > 0 && column.fill_ratio < SPARSE_THRESHOLD {
            findings.push(json!({
                "kind": "sparse_column",
                "column": column.name,
                "fill_ratio": column.fill_ratio,
            }));
        }
    }
    findings
}
