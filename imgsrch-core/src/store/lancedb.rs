use std::sync::{atomic::{AtomicI32, Ordering}, Arc};

use arrow_array::{RecordBatch, RecordBatchIterator};
use arrow_schema::{DataType, Schema, SchemaRef};
use lancedb::{arrow::SendableRecordBatchStream, connect, database::CreateTableMode,
    query::{ExecutableQuery, QueryBase, Select}, table::OptimizeAction, Table};
use log::info;
use tokio::sync::Mutex;

// Number of write operations to run before running optimize.
const OPERATIONS_PER_OPTIMIZE: i32 = 20;

#[derive(thiserror::Error, Debug)]
pub enum LanceDBError {
    #[error("Error while performing merge insert operation")]
    MergeInsert { #[source] source: lancedb::error::Error },
    #[error("Error while performing delete operation")]
    Delete { #[source] source: lancedb::error::Error },
    #[error("Error while querying table")]
    Query { #[source] source: lancedb::error::Error },
    #[error("Error while optimizing table")]
    Optimize { original_operation: &'static str, #[source] source: lancedb::error::Error },
    #[error("Invalid parameters provided to constructor: {parameter}, {issue}")]
    InvalidParameter { parameter: &'static str, issue: String },
    #[error("Issue creating connection to data directory")]
    Connection (#[source] lancedb::error::Error),
    #[error("Error performing holistic table operations")]
    TableOperation { operation: &'static str, #[source] source: lancedb::error::Error },
}

/// A single LanceDB table with serialized writes.
///
/// LanceDB commits every write as a new table version; two writers racing on the same table can conflict, so
/// every mutating operation takes `write_lock` first. Reads are not serialized and always see the latest
/// committed version.
pub struct LanceTable {
    table: Table,
    table_name: String,
    schema: SchemaRef,
    write_lock: Mutex<()>,
    ops_to_optimize: AtomicI32,
}

// development function to clear all the data from a given directory with LanceDB data inside
pub async fn drop(data_dir: &str, table_name: &str) -> Result<(), LanceDBError> {
    let db = connect(data_dir)
        .execute().await
        .map_err(LanceDBError::Connection)?;
    db.drop_table(table_name, &[]).await
        .map_err(|e| LanceDBError::TableOperation { operation: "Dropping table", source: e })?;
    Ok(())
}

impl LanceTable {
    /// Opens the table in `data_dir`, creating it empty with `schema` if it does not exist yet. An existing
    /// table must have every column of `schema` with the same data type.
    pub async fn open(data_dir: &str, table_name: &str, schema: Schema) -> Result<LanceTable, LanceDBError> {
        let schema = Arc::new(schema);

        let db = connect(data_dir)
            .execute().await
            .map_err(LanceDBError::Connection)?;
        let table = db.create_empty_table(table_name, schema.clone())
            .mode(CreateTableMode::ExistOk(Box::new(|r| r)))
            .execute().await
            .map_err(|e| LanceDBError::TableOperation { operation: "Creating or opening table", source: e })?;

        let existing = table.schema().await
            .map_err(|e| LanceDBError::TableOperation { operation: "Reading table schema", source: e })?;
        check_compatible(&schema, &existing)?;

        info!("Opened table {} in {}", table_name, data_dir);

        Ok(LanceTable {
            table,
            table_name: table_name.to_owned(),
            schema,
            write_lock: Mutex::new(()),
            ops_to_optimize: AtomicI32::new(OPERATIONS_PER_OPTIMIZE),
        })
    }

    pub fn name(&self) -> &str {
        &self.table_name
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    /// Insert-or-replace every row of `batch`, matching existing rows on `key_column`.
    pub async fn merge_insert(&self, key_column: &str, batch: RecordBatch) -> Result<(), LanceDBError> {
        let reader = RecordBatchIterator::new(vec![Ok(batch)], self.schema.clone());

        let _guard = self.write_lock.lock().await;
        let mut merge = self.table.merge_insert(&[key_column]);
        merge.when_matched_update_all(None).when_not_matched_insert_all();

        merge.execute(Box::new(reader)).await
            .map_err(|e| LanceDBError::MergeInsert { source: e })?;

        self.maybe_optimize("merge_insert").await
    }

    pub async fn delete_where(&self, condition: &str) -> Result<(), LanceDBError> {
        let _guard = self.write_lock.lock().await;
        self.table.delete(condition).await
            .map_err(|e| LanceDBError::Delete { source: e })?;

        self.maybe_optimize("delete").await
    }

    /// Streams `columns` of every row matching `filter` (or every row), in table scan order.
    pub async fn scan(&self, columns: &[&str], filter: Option<&str>) -> Result<SendableRecordBatchStream, LanceDBError> {
        let mut query = self.table.query().select(Select::columns(columns));
        if let Some(condition) = filter {
            query = query.only_if(condition);
        }

        query.execute().await
            .map_err(|e| LanceDBError::Query { source: e })
    }

    pub async fn count(&self) -> Result<usize, LanceDBError> {
        self.table.count_rows(None).await
            .map_err(|e| LanceDBError::Query { source: e })
    }

    /// Path of the directory LanceDB keeps this table's data and versions in.
    pub fn directory(&self, data_dir: &str) -> String {
        format!("{}/{}.lance", data_dir.trim_end_matches('/'), self.table_name)
    }

    /// Runs a full optimize every OPERATIONS_PER_OPTIMIZE writes, compacting the small fragments every
    /// single-row write leaves behind. Callers must hold the write lock.
    async fn maybe_optimize(&self, original_operation: &'static str) -> Result<(), LanceDBError> {
        let prev_count = self.ops_to_optimize.fetch_sub(1, Ordering::Relaxed);

        if prev_count <= 1 {
            self.ops_to_optimize.store(OPERATIONS_PER_OPTIMIZE, Ordering::Relaxed);

            info!("Optimizing table: {}", self.table_name);
            self.table.optimize(OptimizeAction::All).await
                .map_err(|e| LanceDBError::Optimize { original_operation, source: e })?;
        }
        Ok(())
    }
}

fn check_compatible(expected: &Schema, existing: &Schema) -> Result<(), LanceDBError> {
    for field in expected.fields() {
        let found = existing.field_with_name(field.name())
            .map_err(|_| LanceDBError::InvalidParameter {
                parameter: "table schema",
                issue: format!("existing table has no column named {}", field.name()),
            })?;
        if !same_type(field.data_type(), found.data_type()) {
            return Err(LanceDBError::InvalidParameter {
                parameter: "table schema",
                issue: format!("column {} has type {:?}, expected {:?}", field.name(), found.data_type(),
                    field.data_type()),
            });
        }
    }
    Ok(())
}

// LanceDB quietly flips list item nullability, so only compare list sizes and item types.
fn same_type(expected: &DataType, found: &DataType) -> bool {
    match (expected, found) {
        (DataType::FixedSizeList(a, n), DataType::FixedSizeList(b, m)) =>
            n == m && a.data_type() == b.data_type(),
        _ => expected == found,
    }
}
