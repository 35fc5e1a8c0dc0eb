use super::tables::TableType;
use crate::storage::ObjectStorage;
use crate::utils::paths::{PathBuilder, previous_prefix, rebase, staging_prefix};
use arrow::array::{Array, UInt32Array};
use arrow::compute::{concat_batches, take_record_batch};
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use common::{Error, Result};
use datafusion::prelude::*;
use object_store::path::Path;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Partition column values of one output directory, in partition order.
type PartitionKey = Vec<(String, Option<String>)>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableWriteSummary {
    pub table: String,
    pub rows: usize,
    pub files: Vec<String>,
}

/// Content of `{table}/_SUCCESS`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SuccessMarker {
    pub table_name: String,
    pub row_count: usize,
    pub partition_columns: Vec<String>,
    pub files: Vec<String>,
}

/// Moves made while publishing one table.
#[derive(Default)]
struct PublishLog {
    /// `(original, parked)` pairs of files the table held before.
    parked: Vec<(Path, Path)>,
    published: Vec<Path>,
}

/// Writes tables as hive-partitioned parquet under a storage root, replacing
/// whatever a previous run left there.
///
/// Files are staged under `_temporary/{run_id}/{table}/` first. A table's
/// published directory is only touched once every one of its files has been
/// staged. Publishing parks the old files under
/// `_temporary/{run_id}/_previous/{table}/` and moves them back if any later
/// step fails, so a failed write leaves the previous output in place.
pub struct PartitionedWriter {
    storage: Arc<dyn ObjectStorage>,
    run_id: String,
}

impl PartitionedWriter {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self {
            storage,
            run_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Writes one of the pipeline tables with its columns, row order and
    /// partitioning.
    pub async fn write_table(&self, table: TableType, df: DataFrame) -> Result<TableWriteSummary> {
        let ordered = df
            .select_columns(table.columns())?
            .sort(vec![col(table.order_column()).sort(true, true)])?;

        self.write(table.as_str(), ordered, table.partition_columns())
            .await
    }

    /// Writes `df` in its current row order to `{root}/{table}/`,
    /// partitioned by `partition_by` (possibly empty).
    pub async fn write(
        &self,
        table: &str,
        df: DataFrame,
        partition_by: &[&str],
    ) -> Result<TableWriteSummary> {
        let schema = df.schema().inner().clone();
        let batches = df.collect().await?;
        let batch = concat_batches(&schema, &batches)?;
        let rows = batch.num_rows();

        let mut files = Vec::new();
        for (partition, data) in split_partitions(&batch, partition_by)? {
            let path = PathBuilder::new(table)
                .with_partitions(&partition)
                .build_file_path();
            debug!(table, path = %path, rows = data.num_rows(), "Encoding parquet file");
            files.push((path, encode_parquet(table, partition_by, &data)?));
        }

        let summary = self.publish(table, partition_by, rows, files).await?;
        info!(
            table,
            rows = summary.rows,
            files = summary.files.len(),
            root = self.storage.root(),
            "Table written"
        );
        Ok(summary)
    }

    async fn publish(
        &self,
        table: &str,
        partition_by: &[&str],
        rows: usize,
        files: Vec<(Path, Vec<u8>)>,
    ) -> Result<TableWriteSummary> {
        let table_root = PathBuilder::new(table).build_table_path();
        let staging = staging_prefix(&self.run_id, table);

        let mut staged = Vec::with_capacity(files.len());
        for (target, bytes) in files {
            let staged_path = rebase(&target, &table_root, &staging).ok_or_else(|| {
                Error::write_failure(table, format!("{} is outside the table directory", target))
            })?;

            if let Err(e) = self.storage.put_object(&staged_path, bytes).await {
                self.discard_staging(&staging).await;
                return Err(Error::write_failure(table, e));
            }
            staged.push((staged_path, target));
        }

        let files: Vec<String> = staged.iter().map(|(_, target)| target.to_string()).collect();
        let content = serde_json::to_vec_pretty(&SuccessMarker {
            table_name: table.to_string(),
            row_count: rows,
            partition_columns: partition_by.iter().map(|c| c.to_string()).collect(),
            files: files.clone(),
        })?;

        let mut log = PublishLog::default();
        if let Err(e) = self.swap_in(table, &staged, content, &mut log).await {
            self.roll_back(table, &log).await;
            self.discard_staging(&staging).await;
            return Err(Error::write_failure(table, e));
        }

        for (_, parked) in &log.parked {
            if let Err(e) = self.storage.delete_object(parked).await {
                warn!(table, path = %parked, error = %e, "Failed to remove replaced file");
            }
        }

        Ok(TableWriteSummary {
            table: table.to_string(),
            rows,
            files,
        })
    }

    /// Parks every file the table currently holds, moves the staged files
    /// into place and writes the marker. Each completed move is recorded in
    /// `log` so a failure can be undone.
    async fn swap_in(
        &self,
        table: &str,
        staged: &[(Path, Path)],
        marker_content: Vec<u8>,
        log: &mut PublishLog,
    ) -> Result<()> {
        let table_root = PathBuilder::new(table).build_table_path();
        let marker = PathBuilder::new(table).build_marker_path();
        let parking = previous_prefix(&self.run_id, table);

        let mut previous = self.storage.list_objects(&table_root).await?;
        // marker goes first: readers must not see a complete table while files move
        previous.sort_by_key(|path| *path != marker);

        for path in previous {
            let parked = rebase(&path, &table_root, &parking)
                .ok_or_else(|| Error::Storage(format!("{} is outside {}", path, table_root)))?;
            self.storage.rename_object(&path, &parked).await?;
            log.parked.push((path, parked));
        }

        for (staged_path, target) in staged {
            self.storage.rename_object(staged_path, target).await?;
            log.published.push(target.clone());
        }

        self.storage.put_object(&marker, marker_content).await
    }

    /// Removes newly published files and moves parked files back.
    async fn roll_back(&self, table: &str, log: &PublishLog) {
        for target in log.published.iter().rev() {
            if let Err(e) = self.storage.delete_object(target).await {
                warn!(table, path = %target, error = %e, "Failed to remove partially published file");
            }
        }

        for (original, parked) in log.parked.iter().rev() {
            if let Err(e) = self.storage.rename_object(parked, original).await {
                error!(
                    table,
                    path = %original,
                    parked = %parked,
                    error = %e,
                    "Failed to restore previous file"
                );
            }
        }
    }

    async fn discard_staging(&self, staging: &Path) {
        let staged = match self.storage.list_objects(staging).await {
            Ok(staged) => staged,
            Err(e) => {
                warn!(path = %staging, error = %e, "Failed to list staged files");
                return;
            }
        };

        for path in staged {
            if let Err(e) = self.storage.delete_object(&path).await {
                warn!(path = %path, error = %e, "Failed to remove staged file");
            }
        }
    }
}

/// Splits `batch` by the values of `partition_by`, dropping those columns
/// from the data. Groups come back sorted by key; a null value sorts first.
fn split_partitions(
    batch: &RecordBatch,
    partition_by: &[&str],
) -> Result<Vec<(PartitionKey, RecordBatch)>> {
    if partition_by.is_empty() {
        return Ok(vec![(Vec::new(), batch.clone())]);
    }

    let schema = batch.schema();
    let key_indices = partition_by
        .iter()
        .map(|name| schema.index_of(name))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let data_indices: Vec<usize> = (0..schema.fields().len())
        .filter(|idx| !key_indices.contains(idx))
        .collect();

    let mut groups: BTreeMap<Vec<Option<String>>, Vec<u32>> = BTreeMap::new();
    for row in 0..batch.num_rows() {
        let mut key = Vec::with_capacity(key_indices.len());
        for &idx in &key_indices {
            let column = batch.column(idx);
            key.push(if column.is_null(row) {
                None
            } else {
                Some(array_value_to_string(column.as_ref(), row)?)
            });
        }
        groups.entry(key).or_default().push(take_index(row)?);
    }

    groups
        .into_iter()
        .map(|(values, rows)| {
            let taken = take_record_batch(batch, &UInt32Array::from(rows))?;
            let partition = partition_by
                .iter()
                .map(|name| name.to_string())
                .zip(values)
                .collect();
            Ok((partition, taken.project(&data_indices)?))
        })
        .collect()
}

/// `take` indices are `u32`.
fn take_index(row: usize) -> Result<u32> {
    u32::try_from(row)
        .map_err(|_| Error::Other(format!("Row {} exceeds the partition index range", row)))
}

fn encode_parquet(table: &str, partition_by: &[&str], batch: &RecordBatch) -> Result<Vec<u8>> {
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_key_value_metadata(Some(vec![
            KeyValue::new("table_name".to_string(), table.to_string()),
            KeyValue::new("partition_columns".to_string(), partition_by.join(",")),
        ]))
        .build();

    let mut buffer: Vec<u8> = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::test_support::{FaultyStorage, read_parquet, test_context};
    use crate::storage::{ObjectStoreStorage, StorageManager};
    use crate::utils::arrow::batches_to_json;
    use common::config::StorageSettings;
    use crate::utils::paths::STAGING_DIR;
    use arrow::array::{Int32Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use serde_json::json;

    fn songs_batch(rows: &[(&str, Option<&str>, Option<i32>)]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("song_id", DataType::Utf8, true),
            Field::new("title", DataType::Utf8, true),
            Field::new("artist_id", DataType::Utf8, true),
            Field::new("year", DataType::Int32, true),
            Field::new("duration", DataType::Float64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(
                    rows.iter().map(|r| Some(r.0)).collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(
                    rows.iter().map(|r| Some(format!("Title {}", r.0))).collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(rows.iter().map(|r| r.1).collect::<Vec<_>>())),
                Arc::new(Int32Array::from(rows.iter().map(|r| r.2).collect::<Vec<_>>())),
                Arc::new(arrow::array::Float64Array::from(vec![Some(1.5); rows.len()])),
            ],
        )
        .unwrap()
    }

    fn frame(batch: RecordBatch) -> DataFrame {
        test_context()
            .frame_from_batches(batch.schema(), vec![batch])
            .unwrap()
    }

    #[test]
    fn test_split_partitions_groups_and_drops_columns() {
        let batch = songs_batch(&[
            ("SO1", Some("AR2"), Some(2001)),
            ("SO2", Some("AR1"), Some(2001)),
            ("SO3", Some("AR2"), Some(2001)),
            ("SO4", None, None),
        ]);

        let parts = split_partitions(&batch, &["year", "artist_id"]).unwrap();
        let keys: Vec<PartitionKey> = parts.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(
            keys,
            vec![
                vec![("year".to_string(), None), ("artist_id".to_string(), None)],
                vec![
                    ("year".to_string(), Some("2001".to_string())),
                    ("artist_id".to_string(), Some("AR1".to_string()))
                ],
                vec![
                    ("year".to_string(), Some("2001".to_string())),
                    ("artist_id".to_string(), Some("AR2".to_string()))
                ],
            ]
        );

        let ar2 = &parts[2].1;
        assert_eq!(ar2.num_rows(), 2);
        let schema = ar2.schema();
        let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, vec!["song_id", "title", "duration"]);
    }

    #[test]
    fn test_take_index_rejects_rows_beyond_u32() {
        assert_eq!(take_index(7).unwrap(), 7);
        assert_eq!(take_index(u32::MAX as usize).unwrap(), u32::MAX);
        assert!(matches!(take_index(u32::MAX as usize + 1), Err(Error::Other(_))));
    }

    #[tokio::test]
    async fn test_write_partitioned_table_with_marker() {
        let storage = Arc::new(ObjectStoreStorage::in_memory());
        let writer = PartitionedWriter::new(storage.clone());

        let summary = writer
            .write_table(
                TableType::Songs,
                frame(songs_batch(&[
                    ("SO2", Some("AR1"), Some(1999)),
                    ("SO1", Some("AR1"), Some(1999)),
                    ("SO3", None, Some(0)),
                ])),
            )
            .await
            .unwrap();

        assert_eq!(summary.rows, 3);
        assert_eq!(
            summary.files,
            vec![
                "songs/year=0/artist_id=__HIVE_DEFAULT_PARTITION__/part-00000.parquet",
                "songs/year=1999/artist_id=AR1/part-00000.parquet",
            ]
        );

        let rows = batches_to_json(
            &read_parquet(&*storage, "songs/year=1999/artist_id=AR1/part-00000.parquet").await,
        )
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["song_id"], json!("SO1"));
        assert!(rows[0].get("year").is_none());

        let marker: SuccessMarker = serde_json::from_slice(
            &storage.get_object(&Path::from("songs/_SUCCESS")).await.unwrap(),
        )
        .unwrap();
        assert_eq!(marker.table_name, "songs");
        assert_eq!(marker.row_count, 3);
        assert_eq!(marker.partition_columns, vec!["year", "artist_id"]);
        assert_eq!(marker.files, summary.files);

        let staging = storage.list_objects(&Path::from(STAGING_DIR)).await.unwrap();
        assert!(staging.is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_removes_stale_partitions() {
        let storage = Arc::new(ObjectStoreStorage::in_memory());

        PartitionedWriter::new(storage.clone())
            .write_table(
                TableType::Songs,
                frame(songs_batch(&[
                    ("SO1", Some("AR1"), Some(1999)),
                    ("SO2", Some("AR9"), Some(2005)),
                ])),
            )
            .await
            .unwrap();
        PartitionedWriter::new(storage.clone())
            .write_table(
                TableType::Songs,
                frame(songs_batch(&[("SO1", Some("AR1"), Some(1999))])),
            )
            .await
            .unwrap();

        let listed: Vec<String> = storage
            .list_objects(&Path::from("songs"))
            .await
            .unwrap()
            .iter()
            .map(|p| p.to_string())
            .collect();
        assert_eq!(
            listed,
            vec![
                "songs/_SUCCESS",
                "songs/year=1999/artist_id=AR1/part-00000.parquet",
            ]
        );
    }

    #[tokio::test]
    async fn test_local_overwrite_drops_stale_partition_directories() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(StorageSettings::default())
            .storage_for(dir.path().to_str().unwrap())
            .unwrap();

        PartitionedWriter::new(storage.clone())
            .write_table(
                TableType::Songs,
                frame(songs_batch(&[
                    ("SO1", Some("AR1"), Some(1999)),
                    ("SO2", Some("AR9"), Some(2005)),
                ])),
            )
            .await
            .unwrap();
        PartitionedWriter::new(storage)
            .write_table(
                TableType::Songs,
                frame(songs_batch(&[("SO1", Some("AR1"), Some(1999))])),
            )
            .await
            .unwrap();

        assert!(dir.path().join("songs/year=1999/artist_id=AR1").is_dir());
        assert!(!dir.path().join("songs/year=2005").exists());
        assert!(!dir.path().join(STAGING_DIR).exists());
    }

    /// Everything stored under `prefix`, with contents.
    async fn snapshot(storage: &dyn ObjectStorage, prefix: &str) -> Vec<(Path, Vec<u8>)> {
        let mut files = Vec::new();
        for key in storage.list_objects(&Path::from(prefix)).await.unwrap() {
            let bytes = storage.get_object(&key).await.unwrap();
            files.push((key, bytes.to_vec()));
        }
        files
    }

    async fn assert_replacement_rolled_back(storage: Arc<FaultyStorage>) {
        PartitionedWriter::new(storage.clone())
            .write_table(
                TableType::Songs,
                frame(songs_batch(&[
                    ("SO1", Some("AR1"), Some(1999)),
                    ("SO3", Some("AR3"), Some(2005)),
                ])),
            )
            .await
            .unwrap();
        let before = snapshot(&*storage, "songs").await;

        storage.arm();
        let err = PartitionedWriter::new(storage.clone())
            .write_table(
                TableType::Songs,
                frame(songs_batch(&[
                    ("SO1", Some("AR1"), Some(1999)),
                    ("SO2", Some("AR1"), Some(1999)),
                    ("SO5", Some("AR2"), Some(1999)),
                ])),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::WriteFailure { ref table, .. } if table == "songs"));
        assert_eq!(snapshot(&*storage, "songs").await, before);
        assert!(
            storage
                .list_objects(&Path::from(STAGING_DIR))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_failed_staging_keeps_previous_output() {
        let storage = Arc::new(FaultyStorage::failing_puts(|key| {
            key.as_ref().contains("artist_id=AR2")
        }));
        assert_replacement_rolled_back(storage).await;
    }

    #[tokio::test]
    async fn test_failed_move_restores_previous_output() {
        // the new AR1 file is already in place when the AR2 move fails
        let storage = Arc::new(FaultyStorage::failing_renames(|to| {
            to.as_ref() == "songs/year=1999/artist_id=AR2/part-00000.parquet"
        }));
        assert_replacement_rolled_back(storage).await;
    }

    #[tokio::test]
    async fn test_failed_marker_write_restores_previous_output() {
        let storage = Arc::new(FaultyStorage::failing_puts(|key| {
            key.as_ref() == "songs/_SUCCESS"
        }));
        assert_replacement_rolled_back(storage).await;
    }

    #[tokio::test]
    async fn test_empty_unpartitioned_table_still_has_a_file() {
        let storage = Arc::new(ObjectStoreStorage::in_memory());
        let schema = Arc::new(Schema::new(vec![
            Field::new("user_id", DataType::Utf8, true),
            Field::new("first_name", DataType::Utf8, true),
            Field::new("last_name", DataType::Utf8, true),
            Field::new("gender", DataType::Utf8, true),
            Field::new("level", DataType::Utf8, true),
        ]));
        let empty = test_context()
            .frame_from_batches(schema, vec![])
            .unwrap();

        let summary = PartitionedWriter::new(storage.clone())
            .write_table(TableType::Users, empty)
            .await
            .unwrap();

        assert_eq!(summary.rows, 0);
        assert_eq!(summary.files, vec!["users/part-00000.parquet"]);
        let batches = read_parquet(&*storage, "users/part-00000.parquet").await;
        assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 0);
    }
}
