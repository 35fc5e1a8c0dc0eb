use super::PipelineContext;
use crate::schema::{DeclaredSchema, RECORD_SEQ, SchemaViolation};
use crate::storage::ObjectStorage;
use crate::utils::paths::GlobPattern;
use arrow::json::reader::ReaderBuilder;
use arrow::record_batch::RecordBatch;
use common::Result;
use datafusion::prelude::DataFrame;
use object_store::path::Path;
use serde_json::Value;
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A set of newline-delimited JSON files selected by a glob under a storage
/// root.
pub struct RecordSource {
    storage: Arc<dyn ObjectStorage>,
    pattern: GlobPattern,
}

impl RecordSource {
    pub fn new(storage: Arc<dyn ObjectStorage>, pattern: &str) -> Result<Self> {
        Ok(Self {
            storage,
            pattern: GlobPattern::new(pattern)?,
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Matching keys in lexicographic order.
    pub async fn list_files(&self) -> Result<Vec<Path>> {
        let candidates = self
            .storage
            .list_objects(&self.pattern.list_prefix())
            .await?;

        Ok(candidates
            .into_iter()
            .filter(|key| self.pattern.matches(key))
            .collect())
    }
}

#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub files: usize,
    pub accepted: usize,
    pub violations: Vec<SchemaViolation>,
}

impl IngestReport {
    pub fn rejected(&self) -> usize {
        self.violations.len()
    }
}

pub struct RecordReader {
    batch_size: usize,
}

impl RecordReader {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Reads every file of `source` into one frame shaped like
    /// `schema.sequenced_schema()`.
    pub async fn load(
        &self,
        context: &PipelineContext,
        source: &RecordSource,
        schema: &DeclaredSchema,
    ) -> Result<(DataFrame, IngestReport)> {
        let files = source.list_files().await?;
        info!(
            source = schema.name(),
            root = source.storage.root(),
            pattern = source.pattern(),
            files = files.len(),
            "Reading source files"
        );

        let mut contents = Vec::with_capacity(files.len());
        for key in &files {
            let bytes = source.storage.get_object(key).await?;
            contents.push((key.to_string(), bytes));
        }

        let (batches, report) = self.decode(
            schema,
            contents
                .iter()
                .map(|(name, bytes)| (name.as_str(), bytes.as_ref())),
        )?;

        info!(
            source = schema.name(),
            accepted = report.accepted,
            rejected = report.rejected(),
            "Decoded source records"
        );

        let df = context.frame_from_batches(schema.sequenced_schema(), batches)?;
        Ok((df, report))
    }

    /// Validates each line of each file against `schema`, drops the ones
    /// that fail, numbers the rest and decodes them into Arrow batches.
    pub fn decode<'a>(
        &self,
        schema: &DeclaredSchema,
        files: impl IntoIterator<Item = (&'a str, &'a [u8])>,
    ) -> Result<(Vec<RecordBatch>, IngestReport)> {
        let mut report = IngestReport::default();
        let mut accepted_lines: Vec<String> = Vec::new();

        for (source_name, bytes) in files {
            report.files += 1;

            for (line_idx, line) in bytes.split(|b| *b == b'\n').enumerate() {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }

                let outcome = serde_json::from_slice::<Value>(line)
                    .map_err(|e| (None, format!("invalid JSON: {}", e)))
                    .and_then(|value| {
                        schema
                            .coerce(value)
                            .map_err(|rejection| (rejection.field, rejection.reason))
                    });

                match outcome {
                    Ok(mut record) => {
                        record.insert(
                            RECORD_SEQ.to_string(),
                            Value::from(accepted_lines.len() as i64),
                        );
                        accepted_lines.push(serde_json::to_string(&record)?);
                    }
                    Err((field, reason)) => {
                        let violation = SchemaViolation {
                            source: source_name.to_string(),
                            line: line_idx + 1,
                            field,
                            reason,
                        };
                        warn!(source = schema.name(), %violation, "Dropping record");
                        report.violations.push(violation);
                    }
                }
            }
        }

        report.accepted = accepted_lines.len();
        if accepted_lines.is_empty() {
            debug!(source = schema.name(), "No records accepted");
            return Ok((vec![], report));
        }

        let data = accepted_lines.join("\n");
        let reader = ReaderBuilder::new(schema.sequenced_schema())
            .with_batch_size(self.batch_size)
            .build(Cursor::new(data.as_bytes()))?;

        let mut batches = Vec::new();
        for batch in reader {
            let batch = batch?;
            if batch.num_rows() > 0 {
                batches.push(batch);
            }
        }

        Ok((batches, report))
    }
}
