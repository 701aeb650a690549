//! SQLite-backed embedding store.
//!
//! One table holds the records: an integer id, the text columns, a vector
//! column and, optionally, a cached neighbor list. Vectors are stored as
//! packed little-endian float32 (`4 * D` bytes). The established dimension
//! `D` is kept in `embedstore_meta` per table.

use crate::config::{TableConfig, validate_identifier};
use crate::error::{EmbedStoreError, Result};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, info};
use zerocopy::byteorder::{F32, LittleEndian};
use zerocopy::{FromBytes, IntoBytes};

/// Metadata key for the established dimension.
const DIMENSION_KEY: &str = "dimension";

/// How long a statement waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A stored record: id plus its text fields in declared column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    /// Stable record id.
    pub id: i64,
    /// Text fields; `NULL` columns read as empty strings.
    pub texts: Vec<String>,
}

impl Record {
    /// Embedding input: non-empty fields, trimmed, joined by single spaces.
    #[must_use]
    pub fn embedding_input(&self) -> String {
        self.texts
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Row counts for a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStatus {
    /// Table name.
    pub table: String,
    /// All records.
    pub total: usize,
    /// Records with a vector.
    pub embedded: usize,
    /// Records without a vector.
    pub pending: usize,
    /// Established dimension, if any vector was written.
    pub dimension: Option<usize>,
}

/// Encode a vector in the canonical layout.
#[must_use]
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let packed: Vec<F32<LittleEndian>> = vector.iter().map(|&x| F32::new(x)).collect();
    packed.as_bytes().to_vec()
}

/// Decode a canonical blob.
pub fn decode_vector(id: i64, blob: &[u8]) -> Result<Vec<f32>> {
    let packed = <[F32<LittleEndian>]>::ref_from_bytes(blob)
        .map_err(|_| EmbedStoreError::CorruptVector { id, len: blob.len() })?;
    Ok(packed.iter().map(|x| x.get()).collect())
}

/// Quote a validated identifier.
fn quote(ident: &str) -> String {
    format!("\"{ident}\"")
}

/// Escape `LIKE` wildcards with a backslash.
fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Embedding store bound to one table.
///
/// The connection is owned here and closed when the store is dropped.
#[derive(Debug)]
pub struct Store {
    /// Database connection.
    conn: Connection,
    /// Table layout.
    table: TableConfig,
}

impl Store {
    /// Open (or create) the database at `path` and ensure the schema.
    pub fn open(path: &Path, table: TableConfig) -> Result<Self> {
        table.validate()?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| {
            EmbedStoreError::StoreUnavailable(format!("{}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), table = %table.name, "opened store");
        Self::with_connection(conn, table)
    }

    /// Open a private in-memory store.
    pub fn open_in_memory(table: TableConfig) -> Result<Self> {
        table.validate()?;
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, table)
    }

    /// Finish setting up a connection.
    fn with_connection(conn: Connection, table: TableConfig) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        rusqlite::vtab::array::load_module(&conn)?;
        let store = Self { conn, table };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Table layout.
    #[must_use]
    pub const fn table(&self) -> &TableConfig {
        &self.table
    }

    /// Create the table and metadata table if needed and add missing
    /// vector/neighbor columns to an existing table.
    pub fn ensure_schema(&self) -> Result<()> {
        let t = &self.table;
        let mut columns = vec![format!("{} INTEGER PRIMARY KEY", quote(&t.id_column))];
        columns.extend(t.text_columns.iter().map(|c| format!("{} TEXT", quote(c))));
        columns.push(format!("{} BLOB", quote(&t.vector_column)));
        if let Some(n) = &t.neighbors_column {
            columns.push(format!("{} TEXT", quote(n)));
        }

        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({});
             CREATE TABLE IF NOT EXISTS embedstore_meta (
                 table_name TEXT NOT NULL,
                 key TEXT NOT NULL,
                 value TEXT NOT NULL,
                 PRIMARY KEY (table_name, key)
             );",
            quote(&t.name),
            columns.join(", ")
        ))?;

        let existing = self.columns()?;
        if !existing.contains(&t.id_column) {
            return Err(EmbedStoreError::Config(format!(
                "table {} has no column {}",
                t.name, t.id_column
            )));
        }
        for col in &t.text_columns {
            if !existing.contains(col) {
                return Err(EmbedStoreError::Config(format!(
                    "table {} has no text column {col}",
                    t.name
                )));
            }
        }

        if !existing.contains(&t.vector_column) {
            info!(table = %t.name, column = %t.vector_column, "adding vector column");
            self.conn.execute(
                &format!(
                    "ALTER TABLE {} ADD COLUMN {} BLOB",
                    quote(&t.name),
                    quote(&t.vector_column)
                ),
                [],
            )?;
        }
        if let Some(n) = &t.neighbors_column
            && !existing.contains(n)
        {
            info!(table = %t.name, column = %n, "adding neighbors column");
            self.conn.execute(
                &format!("ALTER TABLE {} ADD COLUMN {} TEXT", quote(&t.name), quote(n)),
                [],
            )?;
        }
        Ok(())
    }

    /// Column names of the record table.
    fn columns(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM pragma_table_info(?1)")?;
        let names = stmt
            .query_map([&self.table.name], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// `SELECT` list for id plus text columns.
    fn record_columns(&self) -> String {
        std::iter::once(&self.table.id_column)
            .chain(&self.table.text_columns)
            .map(|c| quote(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Map a row selected with [`Self::record_columns`].
    fn map_record(&self, row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
        let id = row.get(0)?;
        let mut texts = Vec::with_capacity(self.table.text_columns.len());
        for i in 0..self.table.text_columns.len() {
            let text: Option<String> = row.get(i + 1)?;
            texts.push(text.unwrap_or_default());
        }
        Ok(Record { id, texts })
    }

    /// Insert a record. Used to seed tables that are not populated elsewhere.
    pub fn insert_record(&self, id: i64, texts: &[&str]) -> Result<()> {
        if texts.len() != self.table.text_columns.len() {
            return Err(EmbedStoreError::Config(format!(
                "expected {} text fields, got {}",
                self.table.text_columns.len(),
                texts.len()
            )));
        }
        let placeholders = (1..=texts.len() + 1)
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            quote(&self.table.name),
            self.record_columns()
        );
        let values = std::iter::once(Value::Integer(id))
            .chain(texts.iter().map(|t| Value::Text((*t).to_string())));
        self.conn.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    /// Up to `limit` records without a vector, ascending by id.
    pub fn get_pending(&self, limit: usize) -> Result<Vec<Record>> {
        self.get_pending_after(None, limit)
    }

    /// Up to `limit` records without a vector whose id is greater than
    /// `after`, ascending by id.
    pub fn get_pending_after(&self, after: Option<i64>, limit: usize) -> Result<Vec<Record>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} IS NULL AND {} > ?1 ORDER BY {} LIMIT ?2",
            self.record_columns(),
            quote(&self.table.name),
            quote(&self.table.vector_column),
            quote(&self.table.id_column),
            quote(&self.table.id_column),
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(params![after.unwrap_or(i64::MIN), limit], |row| {
                self.map_record(row)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Pages of pending records, `page_size` at a time.
    ///
    /// Each page is fetched when the iterator is advanced and resumes after
    /// the last id seen, so records embedded between pages are not revisited
    /// and records that stay pending are not fetched twice.
    #[must_use]
    pub const fn pending_pages(&self, page_size: usize) -> PendingPages<'_> {
        PendingPages {
            store: self,
            page_size,
            cursor: None,
            done: false,
        }
    }

    /// Number of records without a vector.
    pub fn count_pending(&self) -> Result<usize> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} IS NULL",
            quote(&self.table.name),
            quote(&self.table.vector_column)
        );
        let n: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or_default())
    }

    /// Ids of every record without a vector, ascending.
    pub fn pending_ids(&self) -> Result<Vec<i64>> {
        let sql = format!(
            "SELECT {id} FROM {t} WHERE {vec} IS NULL ORDER BY {id}",
            id = quote(&self.table.id_column),
            vec = quote(&self.table.vector_column),
            t = quote(&self.table.name),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    /// Established dimension, if any.
    ///
    /// This is the dimension recorded in `embedstore_meta`, or, for tables
    /// whose vectors were written by another tool, the length of the
    /// lowest-id stored vector.
    pub fn dimension(&self) -> Result<Option<usize>> {
        match self.recorded_dimension()? {
            Some(d) => Ok(Some(d)),
            None => self.stored_dimension(),
        }
    }

    /// Dimension recorded in the metadata table.
    fn recorded_dimension(&self) -> Result<Option<usize>> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM embedstore_meta WHERE table_name = ?1 AND key = ?2",
                params![self.table.name, DIMENSION_KEY],
                |row| row.get(0),
            )
            .optional()?;
        value
            .map(|v| {
                v.parse::<usize>().map_err(|_| {
                    EmbedStoreError::Config(format!("invalid stored dimension: {v}"))
                })
            })
            .transpose()
    }

    /// Length of the lowest-id vector already in the table.
    fn stored_dimension(&self) -> Result<Option<usize>> {
        let sql = format!(
            "SELECT {id}, length({vec}) FROM {t} WHERE {vec} IS NOT NULL ORDER BY {id} LIMIT 1",
            id = quote(&self.table.id_column),
            vec = quote(&self.table.vector_column),
            t = quote(&self.table.name),
        );
        let row: Option<(i64, i64)> = self
            .conn
            .query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;
        let Some((id, bytes)) = row else {
            return Ok(None);
        };
        let len = usize::try_from(bytes).unwrap_or_default();
        if len == 0 || len % 4 != 0 {
            return Err(EmbedStoreError::CorruptVector { id, len });
        }
        Ok(Some(len / 4))
    }

    /// Set vectors by id, overwriting existing values.
    ///
    /// Every vector is checked against the established dimension (or the
    /// first vector's length when none is established) before anything is
    /// written, and all updates run in one transaction: either every id in
    /// `vectors` is written or none is. An id with no record fails with
    /// [`EmbedStoreError::NotFound`].
    pub fn write_vectors(&self, vectors: &BTreeMap<i64, Vec<f32>>) -> Result<usize> {
        let Some(first) = vectors.values().next() else {
            return Ok(0);
        };

        let tx = self.conn.unchecked_transaction()?;
        let recorded = self.recorded_dimension()?;
        let established = match recorded {
            Some(d) => Some(d),
            None => self.stored_dimension()?,
        };
        let dim = established.unwrap_or(first.len());

        for (&id, vector) in vectors {
            if vector.is_empty() {
                return Err(EmbedStoreError::EmptyVector(id));
            }
            if vector.len() != dim {
                return Err(EmbedStoreError::DimensionMismatch {
                    id: Some(id),
                    expected: dim,
                    actual: vector.len(),
                });
            }
        }

        let sql = format!(
            "UPDATE {} SET {} = ?1 WHERE {} = ?2",
            quote(&self.table.name),
            quote(&self.table.vector_column),
            quote(&self.table.id_column)
        );
        {
            let mut stmt = tx.prepare(&sql)?;
            for (&id, vector) in vectors {
                if stmt.execute(params![encode_vector(vector), id])? == 0 {
                    return Err(EmbedStoreError::NotFound(id));
                }
            }
        }

        if recorded.is_none() {
            tx.execute(
                "INSERT OR REPLACE INTO embedstore_meta (table_name, key, value) VALUES (?1, ?2, ?3)",
                params![self.table.name, DIMENSION_KEY, dim.to_string()],
            )?;
            info!(table = %self.table.name, dims = dim, "established dimension");
        }

        tx.commit()?;
        debug!(count = vectors.len(), "wrote vectors");
        Ok(vectors.len())
    }

    /// Every embedded record's vector, ascending by id.
    pub fn fetch_all(&self) -> Result<Vec<(i64, Vec<f32>)>> {
        let sql = format!(
            "SELECT {id}, {vec} FROM {t} WHERE {vec} IS NOT NULL ORDER BY {id}",
            id = quote(&self.table.id_column),
            vec = quote(&self.table.vector_column),
            t = quote(&self.table.name),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, blob)| Ok((id, decode_vector(id, &blob)?)))
            .collect()
    }

    /// The stored vector for `id`, if the record exists and is embedded.
    pub fn vector(&self, id: i64) -> Result<Option<Vec<f32>>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            quote(&self.table.vector_column),
            quote(&self.table.name),
            quote(&self.table.id_column)
        );
        let blob: Option<Option<Vec<u8>>> = self
            .conn
            .query_row(&sql, [id], |row| row.get(0))
            .optional()?;
        blob.flatten().map(|b| decode_vector(id, &b)).transpose()
    }

    /// Records for `ids`, bound as a single array parameter.
    ///
    /// Row order is whatever SQLite produces; callers that need the input
    /// order must re-sort.
    pub fn fetch_by_ids(&self, ids: &[i64]) -> Result<Vec<Record>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM {} WHERE {} IN rarray(?1)",
            self.record_columns(),
            quote(&self.table.name),
            quote(&self.table.id_column)
        );
        let values: Rc<Vec<Value>> = Rc::new(ids.iter().copied().map(Value::from).collect());
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map([values], |row| self.map_record(row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Records whose text columns contain `term`, ascending by id.
    pub fn search_text(&self, term: &str, limit: usize) -> Result<Vec<Record>> {
        let conditions = self
            .table
            .text_columns
            .iter()
            .map(|c| format!("{} LIKE ?1 ESCAPE '\\'", quote(c)))
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!(
            "SELECT {} FROM {} WHERE {conditions} ORDER BY {} LIMIT ?2",
            self.record_columns(),
            quote(&self.table.name),
            quote(&self.table.id_column)
        );
        let pattern = format!("%{}%", escape_like(term));
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(params![pattern, limit], |row| self.map_record(row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Row counts and dimension.
    pub fn status(&self) -> Result<StoreStatus> {
        let sql = format!(
            "SELECT COUNT(*), COUNT({}) FROM {}",
            quote(&self.table.vector_column),
            quote(&self.table.name)
        );
        let (total, embedded): (i64, i64) =
            self.conn.query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let total = usize::try_from(total).unwrap_or_default();
        let embedded = usize::try_from(embedded).unwrap_or_default();
        Ok(StoreStatus {
            table: self.table.name.clone(),
            total,
            embedded,
            pending: total - embedded,
            dimension: self.dimension()?,
        })
    }

    /// Drop every vector (and cached neighbor list) and forget the
    /// dimension, so the next run re-embeds everything.
    pub fn clear_vectors(&self) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut sets = vec![format!("{} = NULL", quote(&self.table.vector_column))];
        if let Some(n) = &self.table.neighbors_column {
            sets.push(format!("{} = NULL", quote(n)));
        }
        let cleared = tx.execute(
            &format!(
                "UPDATE {} SET {} WHERE {} IS NOT NULL",
                quote(&self.table.name),
                sets.join(", "),
                quote(&self.table.vector_column)
            ),
            [],
        )?;
        tx.execute(
            "DELETE FROM embedstore_meta WHERE table_name = ?1 AND key = ?2",
            params![self.table.name, DIMENSION_KEY],
        )?;
        tx.commit()?;
        info!(table = %self.table.name, cleared, "cleared vectors");
        Ok(cleared)
    }

    /// Configured neighbor column, or a config error.
    fn neighbors_column(&self) -> Result<&str> {
        self.table.neighbors_column.as_deref().ok_or_else(|| {
            EmbedStoreError::Config("table.neighbors_column is not configured".into())
        })
    }

    /// Cache the neighbor list of one record.
    pub fn write_neighbors(&self, id: i64, neighbors: &[i64]) -> Result<()> {
        let lists = BTreeMap::from([(id, neighbors.to_vec())]);
        self.write_neighbor_lists(&lists).map(|_| ())
    }

    /// Cache several neighbor lists in one transaction.
    pub fn write_neighbor_lists(&self, lists: &BTreeMap<i64, Vec<i64>>) -> Result<usize> {
        let column = self.neighbors_column()?;
        let sql = format!(
            "UPDATE {} SET {} = ?1 WHERE {} = ?2",
            quote(&self.table.name),
            quote(column),
            quote(&self.table.id_column)
        );
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(&sql)?;
            for (&id, neighbors) in lists {
                if stmt.execute(params![serde_json::to_string(neighbors)?, id])? == 0 {
                    return Err(EmbedStoreError::NotFound(id));
                }
            }
        }
        tx.commit()?;
        Ok(lists.len())
    }

    /// Cached neighbor list of a record, if one was stored.
    pub fn neighbors(&self, id: i64) -> Result<Option<Vec<i64>>> {
        let column = self.neighbors_column()?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            quote(column),
            quote(&self.table.name),
            quote(&self.table.id_column)
        );
        let raw: Option<Option<String>> = self
            .conn
            .query_row(&sql, [id], |row| row.get(0))
            .optional()?;
        match raw {
            None => Err(EmbedStoreError::NotFound(id)),
            Some(None) => Ok(None),
            Some(Some(text)) => Ok(Some(serde_json::from_str(&text)?)),
        }
    }

    /// Convert a column of JSON float lists into the canonical vector column.
    ///
    /// The whole conversion goes through [`Self::write_vectors`], so it is
    /// all-or-nothing and subject to the same dimension check.
    pub fn migrate_json_vectors(&self, json_column: &str) -> Result<usize> {
        validate_identifier(json_column)?;
        let sql = format!(
            "SELECT {id}, {json} FROM {t} WHERE {json} IS NOT NULL ORDER BY {id}",
            id = quote(&self.table.id_column),
            json = quote(json_column),
            t = quote(&self.table.name),
        );
        let rows = {
            let mut stmt = self.conn.prepare(&sql)?;
            stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut vectors = BTreeMap::new();
        for (id, text) in rows {
            let vector: Vec<f32> = serde_json::from_str(&text)?;
            vectors.insert(id, vector);
        }
        let converted = self.write_vectors(&vectors)?;
        info!(column = json_column, converted, "migrated JSON vectors");
        Ok(converted)
    }
}

/// Iterator over pages of pending records. See [`Store::pending_pages`].
#[derive(Debug)]
pub struct PendingPages<'a> {
    /// Store being paged.
    store: &'a Store,
    /// Records per page.
    page_size: usize,
    /// Last id returned.
    cursor: Option<i64>,
    /// Set after an empty page or an error.
    done: bool,
}

impl Iterator for PendingPages<'_> {
    type Item = Result<Vec<Record>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.page_size == 0 {
            return None;
        }
        match self.store.get_pending_after(self.cursor, self.page_size) {
            Ok(page) if page.is_empty() => {
                self.done = true;
                None
            }
            Ok(page) => {
                self.cursor = page.last().map(|r| r.id);
                if page.len() < self.page_size {
                    self.done = true;
                }
                Some(Ok(page))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableConfig {
        TableConfig {
            name: "tirukkural".into(),
            id_column: "kno".into(),
            text_columns: vec!["efirstline".into(), "esecondline".into()],
            vector_column: "embeddings".into(),
            neighbors_column: Some("related".into()),
        }
    }

    fn store_with(n: i64) -> Store {
        let store = Store::open_in_memory(table()).unwrap();
        for id in 1..=n {
            store
                .insert_record(id, &[format!("first {id}").as_str(), format!("second {id}").as_str()])
                .unwrap();
        }
        store
    }

    #[test]
    fn test_vector_encoding_is_little_endian() {
        let blob = encode_vector(&[1.0, -2.5]);
        assert_eq!(blob.len(), 8);
        assert_eq!(&blob[..4], &1.0f32.to_le_bytes());
        assert_eq!(&blob[4..], &(-2.5f32).to_le_bytes());
        assert_eq!(decode_vector(1, &blob).unwrap(), vec![1.0, -2.5]);
    }

    #[test]
    fn test_decode_rejects_ragged_blob() {
        assert!(matches!(
            decode_vector(9, &[0, 0, 128, 63, 0]),
            Err(EmbedStoreError::CorruptVector { id: 9, len: 5 })
        ));
    }

    #[test]
    fn test_embedding_input_joins_non_empty_fields() {
        let record = Record {
            id: 1,
            texts: vec![" Agara ".into(), String::new(), "mudhala".into()],
        };
        assert_eq!(record.embedding_input(), "Agara mudhala");
    }

    #[test]
    fn test_write_then_fetch() {
        let store = store_with(3);
        let vectors = BTreeMap::from([(1, vec![1.0, 0.0]), (3, vec![0.5, 0.5])]);
        assert_eq!(store.write_vectors(&vectors).unwrap(), 2);

        let all = store.fetch_all().unwrap();
        assert_eq!(all, vec![(1, vec![1.0, 0.0]), (3, vec![0.5, 0.5])]);
        assert_eq!(store.dimension().unwrap(), Some(2));
        assert_eq!(store.vector(3).unwrap(), Some(vec![0.5, 0.5]));
        assert_eq!(store.vector(2).unwrap(), None);
        assert_eq!(store.vector(42).unwrap(), None);
    }

    #[test]
    fn test_write_is_idempotent_overwrite() {
        let store = store_with(1);
        let vectors = BTreeMap::from([(1, vec![0.25, 0.75])]);
        store.write_vectors(&vectors).unwrap();
        store.write_vectors(&vectors).unwrap();
        assert_eq!(store.fetch_all().unwrap(), vec![(1, vec![0.25, 0.75])]);

        store
            .write_vectors(&BTreeMap::from([(1, vec![0.5, 0.5])]))
            .unwrap();
        assert_eq!(store.vector(1).unwrap(), Some(vec![0.5, 0.5]));
    }

    #[test]
    fn test_dimension_mismatch_leaves_store_untouched() {
        let store = store_with(3);
        store
            .write_vectors(&BTreeMap::from([(1, vec![1.0, 0.0])]))
            .unwrap();

        let bad = BTreeMap::from([(2, vec![0.0, 1.0]), (3, vec![1.0, 2.0, 3.0])]);
        let err = store.write_vectors(&bad).unwrap_err();
        assert!(matches!(
            err,
            EmbedStoreError::DimensionMismatch {
                id: Some(3),
                expected: 2,
                actual: 3
            }
        ));
        assert_eq!(store.vector(2).unwrap(), None);
        assert_eq!(store.vector(3).unwrap(), None);
        assert_eq!(store.fetch_all().unwrap().len(), 1);
    }

    #[test]
    fn test_first_write_must_be_uniform() {
        let store = store_with(2);
        let bad = BTreeMap::from([(1, vec![1.0]), (2, vec![1.0, 2.0])]);
        assert!(matches!(
            store.write_vectors(&bad),
            Err(EmbedStoreError::DimensionMismatch { .. })
        ));
        assert_eq!(store.dimension().unwrap(), None);
    }

    #[test]
    fn test_write_unknown_id_rolls_back() {
        let store = store_with(1);
        let vectors = BTreeMap::from([(1, vec![1.0]), (99, vec![2.0])]);
        assert!(matches!(
            store.write_vectors(&vectors),
            Err(EmbedStoreError::NotFound(99))
        ));
        assert_eq!(store.vector(1).unwrap(), None);
        assert_eq!(store.dimension().unwrap(), None);
    }

    #[test]
    fn test_empty_vector_rejected() {
        let store = store_with(1);
        assert!(matches!(
            store.write_vectors(&BTreeMap::from([(1, vec![])])),
            Err(EmbedStoreError::EmptyVector(1))
        ));
    }

    #[test]
    fn test_pending_ascending_and_limited() {
        let store = store_with(5);
        store
            .write_vectors(&BTreeMap::from([(2, vec![1.0])]))
            .unwrap();

        let ids: Vec<i64> = store.get_pending(3).unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3, 4]);
        assert_eq!(store.count_pending().unwrap(), 4);

        let after: Vec<i64> = store
            .get_pending_after(Some(3), 10)
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(after, vec![4, 5]);
    }

    #[test]
    fn test_pending_pages() {
        let store = store_with(7);
        let pages: Vec<Vec<i64>> = store
            .pending_pages(3)
            .map(|p| p.unwrap().iter().map(|r| r.id).collect())
            .collect();
        assert_eq!(pages, vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]);
    }

    #[test]
    fn test_fetch_by_ids() {
        let store = store_with(5);
        let mut records = store.fetch_by_ids(&[4, 2, 42]).unwrap();
        records.sort_by_key(|r| r.id);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, 2);
        assert_eq!(records[1].texts, vec!["first 4", "second 4"]);
        assert!(store.fetch_by_ids(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_search_text_escapes_wildcards() {
        let store = Store::open_in_memory(table()).unwrap();
        store.insert_record(1, &["love is 100%", ""]).unwrap();
        store.insert_record(2, &["lovely", "days"]).unwrap();
        store.insert_record(3, &["nothing", "here"]).unwrap();

        let ids: Vec<i64> = store
            .search_text("love", 10)
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![1, 2]);

        let ids: Vec<i64> = store
            .search_text("100%", 10)
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![1]);
        assert!(store.search_text("_", 10).unwrap().is_empty());
    }

    #[test]
    fn test_status_and_clear() {
        let store = store_with(3);
        store
            .write_vectors(&BTreeMap::from([(1, vec![1.0]), (2, vec![2.0])]))
            .unwrap();
        store.write_neighbors(1, &[2]).unwrap();

        let status = store.status().unwrap();
        assert_eq!(status.total, 3);
        assert_eq!(status.embedded, 2);
        assert_eq!(status.pending, 1);
        assert_eq!(status.dimension, Some(1));

        assert_eq!(store.clear_vectors().unwrap(), 2);
        assert_eq!(store.status().unwrap().embedded, 0);
        assert_eq!(store.dimension().unwrap(), None);
        assert_eq!(store.neighbors(1).unwrap(), None);
    }

    #[test]
    fn test_neighbor_cache() {
        let store = store_with(3);
        assert_eq!(store.neighbors(1).unwrap(), None);
        store.write_neighbors(1, &[3, 2]).unwrap();
        assert_eq!(store.neighbors(1).unwrap(), Some(vec![3, 2]));
        assert!(matches!(
            store.neighbors(9),
            Err(EmbedStoreError::NotFound(9))
        ));
        assert!(matches!(
            store.write_neighbors(9, &[1]),
            Err(EmbedStoreError::NotFound(9))
        ));
    }

    #[test]
    fn test_neighbor_cache_requires_column() {
        let mut t = table();
        t.neighbors_column = None;
        let store = Store::open_in_memory(t).unwrap();
        assert!(matches!(
            store.neighbors(1),
            Err(EmbedStoreError::Config(_))
        ));
    }

    #[test]
    fn test_adds_missing_vector_column() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE tirukkural (kno INTEGER PRIMARY KEY, efirstline TEXT, esecondline TEXT);
             INSERT INTO tirukkural VALUES (1, 'a', 'b');",
        )
        .unwrap();
        let store = Store::with_connection(conn, table()).unwrap();
        assert_eq!(store.count_pending().unwrap(), 1);
        store
            .write_vectors(&BTreeMap::from([(1, vec![1.0, 2.0])]))
            .unwrap();
        assert_eq!(store.vector(1).unwrap(), Some(vec![1.0, 2.0]));
    }

    #[test]
    fn test_missing_text_column_is_config_error() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE tirukkural (kno INTEGER PRIMARY KEY, efirstline TEXT);")
            .unwrap();
        assert!(matches!(
            Store::with_connection(conn, table()),
            Err(EmbedStoreError::Config(_))
        ));
    }

    #[test]
    fn test_migrate_json_vectors() {
        let store = store_with(3);
        store
            .conn
            .execute_batch(
                "ALTER TABLE tirukkural ADD COLUMN embeddings_array TEXT;
                 UPDATE tirukkural SET embeddings_array = '[1.0, 0.0]' WHERE kno = 1;
                 UPDATE tirukkural SET embeddings_array = '[0.5, 0.25]' WHERE kno = 3;",
            )
            .unwrap();

        assert_eq!(store.migrate_json_vectors("embeddings_array").unwrap(), 2);
        assert_eq!(store.vector(1).unwrap(), Some(vec![1.0, 0.0]));
        assert_eq!(store.vector(3).unwrap(), Some(vec![0.5, 0.25]));
        assert_eq!(store.vector(2).unwrap(), None);
        assert!(matches!(
            store.migrate_json_vectors("bad column"),
            Err(EmbedStoreError::InvalidIdentifier(_))
        ));
    }

    /// Write a blob directly, bypassing `write_vectors`, as another tool would.
    fn write_raw(store: &Store, id: i64, vector: &[f32]) {
        store
            .conn
            .execute(
                "UPDATE tirukkural SET embeddings = ?1 WHERE kno = ?2",
                params![encode_vector(vector), id],
            )
            .unwrap();
    }

    #[test]
    fn test_dimension_taken_from_existing_vectors() {
        let store = store_with(3);
        write_raw(&store, 1, &[1.0, 0.0, 5.0]);
        assert_eq!(store.dimension().unwrap(), Some(3));

        assert!(matches!(
            store.write_vectors(&BTreeMap::from([(2, vec![1.0, 0.0])])),
            Err(EmbedStoreError::DimensionMismatch {
                id: Some(2),
                expected: 3,
                actual: 2
            })
        ));
        assert_eq!(store.vector(2).unwrap(), None);

        store
            .write_vectors(&BTreeMap::from([(2, vec![0.0, 1.0, 0.0])]))
            .unwrap();
        assert_eq!(store.recorded_dimension().unwrap(), Some(3));
    }

    #[test]
    fn test_ragged_existing_blob_is_corrupt() {
        let store = store_with(2);
        store
            .conn
            .execute(
                "UPDATE tirukkural SET embeddings = x'0000803F00' WHERE kno = 1",
                [],
            )
            .unwrap();
        assert!(matches!(
            store.dimension(),
            Err(EmbedStoreError::CorruptVector { id: 1, len: 5 })
        ));
    }

    #[test]
    fn test_pending_ids() {
        let store = store_with(4);
        store
            .write_vectors(&BTreeMap::from([(2, vec![1.0])]))
            .unwrap();
        assert_eq!(store.pending_ids().unwrap(), vec![1, 3, 4]);
    }
}
