pub mod dimensions;
pub mod facts;
pub mod ingest;
pub mod tables;
pub mod timestamp;
pub mod udf;
pub mod writer;

pub use dimensions::DimensionExtractor;
pub use facts::FactResolver;
pub use ingest::{IngestReport, RecordReader, RecordSource};
pub use tables::TableType;
pub use timestamp::TimestampDeriver;
pub use udf::register_udfs;
pub use writer::{PartitionedWriter, TableWriteSummary};

use crate::schema::{RecordSchemaKind, get_record_schema};
use crate::storage::ObjectStorage;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use common::Result;
use datafusion::datasource::MemTable;
use datafusion::execution::context::{SessionConfig, SessionContext};
use datafusion::prelude::DataFrame;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Session state shared by every stage of a run.
pub struct PipelineContext {
    ctx: SessionContext,
    batch_size: usize,
}

impl PipelineContext {
    pub fn new(batch_size: usize) -> Result<Self> {
        let batch_size = batch_size.max(1);
        let ctx = SessionContext::new_with_config(SessionConfig::new().with_batch_size(batch_size));
        register_udfs(&ctx)?;

        Ok(Self { ctx, batch_size })
    }

    pub fn session(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Wraps in-memory batches as a frame. Works for zero batches.
    pub fn frame_from_batches(
        &self,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    ) -> Result<DataFrame> {
        let table = MemTable::try_new(schema, vec![batches])?;
        Ok(self.ctx.read_table(Arc::new(table))?)
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub catalog_accepted: usize,
    pub catalog_rejected: usize,
    pub events_accepted: usize,
    pub events_rejected: usize,
    pub malformed_timestamps: usize,
    pub unresolved_plays: usize,
    pub tables: Vec<TableWriteSummary>,
}

/// Runs ingestion, transformation and output for both sources.
pub struct PipelineProcessor {
    context: PipelineContext,
    reader: RecordReader,
    writer: PartitionedWriter,
}

impl PipelineProcessor {
    pub fn new(context: PipelineContext, output: Arc<dyn ObjectStorage>) -> Self {
        let reader = RecordReader::new(context.batch_size());
        Self {
            context,
            reader,
            writer: PartitionedWriter::new(output),
        }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    /// Rebuilds all five tables. Tables are written in [`TableType::ALL`]
    /// order and the run stops at the first failure; tables published
    /// before it stay valid.
    pub async fn run(
        &self,
        catalog_source: &RecordSource,
        event_source: &RecordSource,
    ) -> Result<RunReport> {
        info!(run_id = self.writer.run_id(), "Starting pipeline run");

        let (catalog, catalog_report) = self
            .reader
            .load(
                &self.context,
                catalog_source,
                get_record_schema(RecordSchemaKind::Catalog),
            )
            .await?;
        let (events, event_report) = self
            .reader
            .load(
                &self.context,
                event_source,
                get_record_schema(RecordSchemaKind::Events),
            )
            .await?;

        let derived = TimestampDeriver::derive(events.clone())?;
        let songplays = FactResolver::songplays(catalog.clone(), derived.clone())?;

        let mut report = RunReport {
            run_id: self.writer.run_id().to_string(),
            catalog_accepted: catalog_report.accepted,
            catalog_rejected: catalog_report.rejected(),
            events_accepted: event_report.accepted,
            events_rejected: event_report.rejected(),
            malformed_timestamps: TimestampDeriver::count_malformed(&derived).await?,
            unresolved_plays: FactResolver::count_unresolved(&songplays).await?,
            tables: Vec::with_capacity(TableType::ALL.len()),
        };

        for table in TableType::ALL {
            let df = match table {
                TableType::Songs => DimensionExtractor::songs(catalog.clone())?,
                TableType::Artists => DimensionExtractor::artists(catalog.clone())?,
                TableType::Users => DimensionExtractor::users(events.clone())?,
                TableType::Time => DimensionExtractor::time(derived.clone())?,
                TableType::SongPlays => songplays.clone(),
            };
            report.tables.push(self.writer.write_table(table, df).await?);
        }

        info!(
            run_id = %report.run_id,
            malformed_timestamps = report.malformed_timestamps,
            unresolved_plays = report.unresolved_plays,
            "Pipeline run complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::schema::DeclaredSchema;
    use crate::storage::ObjectStoreStorage;
    use async_trait::async_trait;
    use bytes::Bytes;
    use common::Error;
    use object_store::path::Path;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicBool, Ordering};

    type Fault = Box<dyn Fn(&Path) -> bool + Send + Sync>;

    /// In-memory storage that, once armed, fails puts to matching keys or
    /// renames onto matching keys.
    pub struct FaultyStorage {
        inner: ObjectStoreStorage,
        armed: AtomicBool,
        fail_put: Fault,
        fail_rename_to: Fault,
    }

    impl FaultyStorage {
        pub fn failing_puts(fault: impl Fn(&Path) -> bool + Send + Sync + 'static) -> Self {
            Self {
                inner: ObjectStoreStorage::in_memory(),
                armed: AtomicBool::new(false),
                fail_put: Box::new(fault),
                fail_rename_to: Box::new(|_| false),
            }
        }

        pub fn failing_renames(fault: impl Fn(&Path) -> bool + Send + Sync + 'static) -> Self {
            Self {
                inner: ObjectStoreStorage::in_memory(),
                armed: AtomicBool::new(false),
                fail_put: Box::new(|_| false),
                fail_rename_to: Box::new(fault),
            }
        }

        pub fn arm(&self) {
            self.armed.store(true, Ordering::SeqCst);
        }

        fn trips(&self, fault: &Fault, key: &Path) -> bool {
            self.armed.load(Ordering::SeqCst) && fault(key)
        }
    }

    #[async_trait]
    impl ObjectStorage for FaultyStorage {
        async fn put_object(&self, key: &Path, data: Vec<u8>) -> Result<()> {
            if self.trips(&self.fail_put, key) {
                return Err(Error::Storage(format!("injected put failure for {}", key)));
            }
            self.inner.put_object(key, data).await
        }
        async fn get_object(&self, key: &Path) -> Result<Bytes> {
            self.inner.get_object(key).await
        }
        async fn list_objects(&self, prefix: &Path) -> Result<Vec<Path>> {
            self.inner.list_objects(prefix).await
        }
        async fn delete_object(&self, key: &Path) -> Result<()> {
            self.inner.delete_object(key).await
        }
        async fn rename_object(&self, from: &Path, to: &Path) -> Result<()> {
            if self.trips(&self.fail_rename_to, to) {
                return Err(Error::Storage(format!("injected rename failure for {}", to)));
            }
            self.inner.rename_object(from, to).await
        }
        async fn check_file_exists(&self, key: &Path) -> Result<bool> {
            self.inner.check_file_exists(key).await
        }
        fn root(&self) -> &str {
            self.inner.root()
        }
    }

    pub fn test_context() -> PipelineContext {
        PipelineContext::new(1024).unwrap()
    }

    fn frame_from_lines(
        context: &PipelineContext,
        schema: &DeclaredSchema,
        lines: &[String],
    ) -> DataFrame {
        let content = lines.join("\n");
        let (batches, report) = RecordReader::new(context.batch_size())
            .decode(schema, [("test.json", content.as_bytes())])
            .unwrap();
        assert!(report.violations.is_empty(), "{:?}", report.violations);
        context
            .frame_from_batches(schema.sequenced_schema(), batches)
            .unwrap()
    }

    pub fn catalog_frame(context: &PipelineContext, lines: &[String]) -> DataFrame {
        frame_from_lines(context, get_record_schema(RecordSchemaKind::Catalog), lines)
    }

    pub fn events_frame(context: &PipelineContext, lines: &[String]) -> DataFrame {
        frame_from_lines(context, get_record_schema(RecordSchemaKind::Events), lines)
    }

    pub fn song_line(
        song_id: &str,
        artist_id: &str,
        artist_name: &str,
        title: &str,
        duration: f64,
        year: i32,
    ) -> String {
        json!({
            "num_songs": 1,
            "artist_id": artist_id,
            "artist_latitude": null,
            "artist_longitude": null,
            "artist_location": "",
            "artist_name": artist_name,
            "song_id": song_id,
            "title": title,
            "duration": duration,
            "year": year
        })
        .to_string()
    }

    pub fn event_value(
        page: &str,
        user_id: &str,
        artist: &str,
        song: &str,
        length: f64,
        ts: i64,
    ) -> Value {
        json!({
            "artist": artist,
            "auth": "Logged In",
            "firstName": format!("First{}", user_id),
            "gender": "F",
            "itemInSession": 0,
            "lastName": format!("Last{}", user_id),
            "length": length,
            "level": "free",
            "location": "Lansing-East Lansing, MI",
            "method": "PUT",
            "page": page,
            "registration": 1540856006796.0,
            "sessionId": 139,
            "song": song,
            "status": 200,
            "ts": ts,
            "userAgent": "Mozilla/5.0",
            "userId": user_id
        })
    }

    pub fn event_line(
        page: &str,
        user_id: &str,
        artist: &str,
        song: &str,
        length: f64,
        ts: i64,
    ) -> String {
        event_value(page, user_id, artist, song, length, ts).to_string()
    }

    pub async fn read_parquet(storage: &dyn ObjectStorage, key: &str) -> Vec<RecordBatch> {
        let bytes: Bytes = storage.get_object(&Path::from(key)).await.unwrap();
        ParquetRecordBatchReaderBuilder::try_new(bytes)
            .unwrap()
            .build()
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }
}
