use std::sync::Arc;

use arrow::array::{AsArray, FixedSizeListArray, FixedSizeListBuilder, Float32Builder, StringArray, StringBuilder,
    TimestampMillisecondArray, TimestampMillisecondBuilder};
use arrow::datatypes::{Float32Type, TimestampMillisecondType};
use arrow_array::{ArrayRef, RecordBatch};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use camino::Utf8PathBuf;
use chrono::{DateTime, TimeZone, Utc};

use crate::store::{EmbeddingRecord, StoreError};

// ===========================
// Column Names
// ===========================
pub const FILE_PATH_COLUMN: &str = "file_path";
pub const EMBEDDING_COLUMN: &str = "embedding";
pub const FINGERPRINT_COLUMN: &str = "content_fingerprint";
pub const LAST_MODIFIED_COLUMN: &str = "last_modified";
pub const CREATED_AT_COLUMN: &str = "created_at";

pub const ALL_COLUMNS: [&str; 5] =
    [FILE_PATH_COLUMN, EMBEDDING_COLUMN, FINGERPRINT_COLUMN, LAST_MODIFIED_COLUMN, CREATED_AT_COLUMN];

const TIMEZONE: &str = "UTC";

// ===========================
// Schema Definition
// ===========================
fn timestamp_type() -> DataType {
    DataType::Timestamp(TimeUnit::Millisecond, Some(TIMEZONE.into()))
}

fn embedding_type(dimension: i32) -> DataType {
    DataType::FixedSizeList(Arc::new(Field::new_list_field(DataType::Float32, true)), dimension)
}

pub fn schema(dimension: i32) -> Schema {
    Schema::new(vec![
        Field::new(FILE_PATH_COLUMN, DataType::Utf8, false),
        Field::new(EMBEDDING_COLUMN, embedding_type(dimension), false),
        Field::new(FINGERPRINT_COLUMN, DataType::Utf8, false),
        Field::new(LAST_MODIFIED_COLUMN, timestamp_type(), false),
        Field::new(CREATED_AT_COLUMN, timestamp_type(), false),
    ])
}

// ===========================
// Row Builder
// ===========================
pub struct RecordRowBuilder {
    file_path: StringBuilder,
    embedding: FixedSizeListBuilder<Float32Builder>,
    fingerprint: StringBuilder,
    last_modified: TimestampMillisecondBuilder,
    created_at: TimestampMillisecondBuilder,
}

impl RecordRowBuilder {
    pub fn new(dimension: i32) -> Self {
        Self {
            file_path: StringBuilder::new(),
            embedding: FixedSizeListBuilder::new(Float32Builder::new(), dimension),
            fingerprint: StringBuilder::new(),
            last_modified: TimestampMillisecondBuilder::new().with_timezone(TIMEZONE),
            created_at: TimestampMillisecondBuilder::new().with_timezone(TIMEZONE),
        }
    }

    /// Caller guarantees `record.embedding` has the builder's dimension.
    pub fn append(&mut self, record: &EmbeddingRecord) {
        self.file_path.append_value(record.file_path.as_str());
        self.embedding.values().append_slice(&record.embedding);
        self.embedding.append(true);
        self.fingerprint.append_value(&record.content_fingerprint);
        self.last_modified.append_value(record.last_modified.timestamp_millis());
        self.created_at.append_value(record.created_at.timestamp_millis());
    }

    pub fn finish(mut self, schema: Arc<Schema>) -> Result<RecordBatch, StoreError> {
        let columns: Vec<ArrayRef> = vec![
            Arc::new(self.file_path.finish()),
            Arc::new(self.embedding.finish()),
            Arc::new(self.fingerprint.finish()),
            Arc::new(self.last_modified.finish()),
            Arc::new(self.created_at.finish()),
        ];
        RecordBatch::try_new(schema, columns)
            .map_err(|e| StoreError::Encode { source: e.into() })
    }
}

// ===========================
// Decoding
// ===========================
fn column<'a>(batch: &'a RecordBatch, name: &'static str) -> Result<&'a ArrayRef, StoreError> {
    batch.column_by_name(name)
        .ok_or(StoreError::Decode { column: name, issue: "column missing from result".to_owned() })
}

pub fn string_column<'a>(batch: &'a RecordBatch, name: &'static str) -> Result<&'a StringArray, StoreError> {
    column(batch, name)?
        .as_string_opt::<i32>()
        .ok_or(StoreError::Decode { column: name, issue: "not a string column".to_owned() })
}

pub fn timestamp_column<'a>(batch: &'a RecordBatch, name: &'static str)
    -> Result<&'a TimestampMillisecondArray, StoreError> {
    column(batch, name)?
        .as_primitive_opt::<TimestampMillisecondType>()
        .ok_or(StoreError::Decode { column: name, issue: "not a millisecond timestamp column".to_owned() })
}

pub fn embedding_column(batch: &RecordBatch) -> Result<&FixedSizeListArray, StoreError> {
    column(batch, EMBEDDING_COLUMN)?
        .as_fixed_size_list_opt()
        .ok_or(StoreError::Decode { column: EMBEDDING_COLUMN, issue: "not a fixed size list column".to_owned() })
}

pub fn embedding_at(list: &FixedSizeListArray, row: usize) -> Result<Vec<f32>, StoreError> {
    let values = list.value(row);
    let floats = values.as_primitive_opt::<Float32Type>()
        .ok_or(StoreError::Decode { column: EMBEDDING_COLUMN, issue: "list items are not f32".to_owned() })?;
    Ok(floats.values().to_vec())
}

pub fn timestamp_at(array: &TimestampMillisecondArray, row: usize, name: &'static str)
    -> Result<DateTime<Utc>, StoreError> {
    let millis = array.value(row);
    Utc.timestamp_millis_opt(millis).single()
        .ok_or(StoreError::Decode { column: name, issue: format!("timestamp {millis} out of range") })
}

/// Decodes every row of a batch holding all columns.
pub fn batch_to_records(batch: &RecordBatch) -> Result<Vec<EmbeddingRecord>, StoreError> {
    let paths = string_column(batch, FILE_PATH_COLUMN)?;
    let embeddings = embedding_column(batch)?;
    let fingerprints = string_column(batch, FINGERPRINT_COLUMN)?;
    let modified = timestamp_column(batch, LAST_MODIFIED_COLUMN)?;
    let created = timestamp_column(batch, CREATED_AT_COLUMN)?;

    (0..batch.num_rows())
        .map(|row| Ok(EmbeddingRecord {
            file_path: Utf8PathBuf::from(paths.value(row)),
            embedding: embedding_at(embeddings, row)?,
            content_fingerprint: fingerprints.value(row).to_owned(),
            last_modified: timestamp_at(modified, row, LAST_MODIFIED_COLUMN)?,
            created_at: timestamp_at(created, row, CREATED_AT_COLUMN)?,
        }))
        .collect()
}

/// Decodes `(file_path, embedding)` pairs from a batch holding at least those two columns.
pub fn batch_to_pairs(batch: &RecordBatch) -> Result<Vec<(Utf8PathBuf, Vec<f32>)>, StoreError> {
    let paths = string_column(batch, FILE_PATH_COLUMN)?;
    let embeddings = embedding_column(batch)?;

    (0..batch.num_rows())
        .map(|row| Ok((Utf8PathBuf::from(paths.value(row)), embedding_at(embeddings, row)?)))
        .collect()
}

/// SQL string literal for a filter expression.
pub fn quoted(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
