use super::collection::{Changes, CollectionData};
use super::eval::run_pipeline;
use super::{
    DeleteResult, DocumentStore, FindOneAndUpdateOptions, InsertManyResult, InsertOneResult,
    UpdateResult,
};
use crate::error::{DocmapError, Result};
use crate::pipeline::Stage;
use crate::schema::IndexDescriptor;
use crate::Map;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Store persisted in a SQLite database: one JSON row per document.
pub struct SqliteStore {
    conn: Mutex<Option<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        initialize_tables(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
        self.conn
            .lock()
            .map_err(|_| DocmapError::StoreFailure("store lock poisoned".into()))
    }

    /// Load `collection`, run `op` on it and persist what changed, in one
    /// transaction.
    fn with_collection<T>(
        &self,
        collection: &str,
        op: impl FnOnce(&mut CollectionData, &mut Changes) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.lock()?;
        let conn = guard.as_mut().ok_or_else(closed)?;
        let tx = conn.transaction()?;
        let mut data = load_collection(&tx, collection)?;
        let mut changes = Changes::default();
        let value = op(&mut data, &mut changes)?;
        persist_changes(&tx, collection, &data, &changes)?;
        tx.commit()?;
        Ok(value)
    }

    /// Document counts per collection, sorted by name.
    pub fn collection_counts(&self) -> Result<Vec<(String, u64)>> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or_else(closed)?;
        let mut stmt = conn.prepare(
            "SELECT collection, COUNT(*) FROM documents GROUP BY collection ORDER BY collection",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut counts = Vec::new();
        for row in rows {
            let (collection, count) = row?;
            counts.push((collection, count.max(0) as u64));
        }
        Ok(counts)
    }
}

fn closed() -> DocmapError {
    DocmapError::StoreFailure("store is closed".into())
}

fn initialize_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS documents (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            data_json TEXT NOT NULL,
            PRIMARY KEY (collection, id)
        );

        CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);

        CREATE TABLE IF NOT EXISTS indexes (
            collection TEXT NOT NULL,
            name TEXT NOT NULL,
            spec_json TEXT NOT NULL,
            PRIMARY KEY (collection, name)
        );
        ",
    )?;
    Ok(())
}

fn load_collection(conn: &Connection, collection: &str) -> Result<CollectionData> {
    let mut stmt =
        conn.prepare("SELECT data_json FROM documents WHERE collection = ?1 ORDER BY rowid")?;
    let rows = stmt.query_map(params![collection], |row| row.get::<_, String>(0))?;
    let mut documents = Vec::new();
    for row in rows {
        documents.push(serde_json::from_str::<Map>(&row?)?);
    }

    let mut stmt = conn.prepare("SELECT spec_json FROM indexes WHERE collection = ?1 ORDER BY rowid")?;
    let rows = stmt.query_map(params![collection], |row| row.get::<_, String>(0))?;
    let mut indexes = Vec::new();
    for row in rows {
        indexes.push(serde_json::from_str::<IndexDescriptor>(&row?)?);
    }
    Ok(CollectionData::new(documents, indexes))
}

fn persist_changes(
    conn: &Connection,
    collection: &str,
    data: &CollectionData,
    changes: &Changes,
) -> Result<()> {
    for id in &changes.removed {
        conn.execute(
            "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, id],
        )?;
    }
    for id in &changes.written {
        let doc = data.get(id).ok_or_else(|| {
            DocmapError::StoreFailure(format!("written document '{id}' vanished"))
        })?;
        let data_json = serde_json::to_string(doc)?;
        // Keeps the rowid, and with it the insertion order
        conn.execute(
            "INSERT INTO documents (collection, id, data_json) VALUES (?1, ?2, ?3)
             ON CONFLICT(collection, id) DO UPDATE SET data_json = excluded.data_json",
            params![collection, id, data_json],
        )?;
    }
    Ok(())
}

impl DocumentStore for SqliteStore {
    fn is_ready(&self) -> bool {
        self.lock().map(|guard| guard.is_some()).unwrap_or(false)
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.lock()?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| DocmapError::Sqlite(e))?;
            log::debug!("sqlite store closed");
        }
        Ok(())
    }

    fn ensure_indexes(&self, collection: &str, indexes: &[IndexDescriptor]) -> Result<()> {
        let mut guard = self.lock()?;
        let conn = guard.as_mut().ok_or_else(closed)?;
        let tx = conn.transaction()?;
        let mut data = load_collection(&tx, collection)?;
        data.ensure_indexes(indexes)?;
        for index in indexes {
            tx.execute(
                "INSERT OR REPLACE INTO indexes (collection, name, spec_json) VALUES (?1, ?2, ?3)",
                params![collection, index.name, serde_json::to_string(index)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn aggregate(&self, collection: &str, stages: &[Stage]) -> Result<Vec<Map>> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or_else(closed)?;
        let docs = load_collection(conn, collection)?.documents;
        let mut foreign = |name: &str| -> Result<Vec<Map>> { Ok(load_collection(conn, name)?.documents) };
        run_pipeline(docs, stages, &mut foreign)
    }

    fn insert_one(&self, collection: &str, doc: Map) -> Result<InsertOneResult> {
        self.with_collection(collection, |data, changes| data.insert_one(doc, changes))
    }

    fn insert_many(&self, collection: &str, docs: Vec<Map>) -> Result<InsertManyResult> {
        self.with_collection(collection, |data, changes| data.insert_many(docs, changes))
    }

    fn update_one(&self, collection: &str, filter: &Map, update: &Map, upsert: bool) -> Result<UpdateResult> {
        self.with_collection(collection, |data, changes| {
            data.update(filter, update, upsert, false, changes)
        })
    }

    fn update_many(&self, collection: &str, filter: &Map, update: &Map, upsert: bool) -> Result<UpdateResult> {
        self.with_collection(collection, |data, changes| {
            data.update(filter, update, upsert, true, changes)
        })
    }

    fn delete_one(&self, collection: &str, filter: &Map) -> Result<DeleteResult> {
        self.with_collection(collection, |data, changes| data.delete(filter, false, changes))
    }

    fn delete_many(&self, collection: &str, filter: &Map) -> Result<DeleteResult> {
        self.with_collection(collection, |data, changes| data.delete(filter, true, changes))
    }

    fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Map,
        update: &Map,
        options: FindOneAndUpdateOptions,
    ) -> Result<Option<Map>> {
        self.with_collection(collection, |data, changes| {
            data.find_one_and_update(filter, update, options, changes)
        })
    }

    fn find_one_and_delete(&self, collection: &str, filter: &Map) -> Result<Option<Map>> {
        self.with_collection(collection, |data, changes| data.find_one_and_delete(filter, changes))
    }
}
