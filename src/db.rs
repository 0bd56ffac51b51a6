use crate::error::PersistenceError;
use crate::services::master_data::MasterDataStore;
use crate::types::MasterData;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::Mutex;

const SCHEMA_VERSION: i64 = 1;

pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn new(db_path: PathBuf) -> Result<Self, PersistenceError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| match e.kind() {
                std::io::ErrorKind::PermissionDenied => PersistenceError::PermissionDenied(e.to_string()),
                _ => PersistenceError::Connectivity(e.to_string()),
            })?;
        }
        let conn = Connection::open(&db_path)?;
        Self::migrate(&conn)?;
        log::info!("[db] Opened {}", db_path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn migrate(conn: &Connection) -> Result<(), PersistenceError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            INSERT INTO schema_version (version) SELECT 1 WHERE NOT EXISTS (SELECT 1 FROM schema_version LIMIT 1);
            CREATE TABLE IF NOT EXISTS master_data (
                user_id TEXT PRIMARY KEY,
                data_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )?;
        let version: i64 = conn.query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(PersistenceError::Other(format!(
                "database schema version {} is newer than this build ({})",
                version, SCHEMA_VERSION
            )));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, PersistenceError> {
        self.conn
            .lock()
            .map_err(|e| PersistenceError::Other(e.to_string()))
    }

    pub fn get_master_data(&self, user_id: &str) -> Result<Option<MasterData>, PersistenceError> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT data_json FROM master_data WHERE user_id = ?",
                params![user_id],
                |r| r.get(0),
            )
            .optional()?;
        match raw {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| PersistenceError::Other(format!("Corrupt master data for {}: {}", user_id, e))),
            None => Ok(None),
        }
    }

    pub fn save_master_data(&self, user_id: &str, data: &MasterData) -> Result<(), PersistenceError> {
        let data_json = serde_json::to_string(data).map_err(|e| PersistenceError::Other(e.to_string()))?;
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO master_data (user_id, data_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
               data_json = excluded.data_json,
               updated_at = excluded.updated_at",
            params![user_id, data_json, now],
        )?;
        Ok(())
    }
}

impl MasterDataStore for Db {
    fn get(&self, user_id: &str) -> Result<Option<MasterData>, PersistenceError> {
        self.get_master_data(user_id)
    }

    fn put(&self, user_id: &str, data: &MasterData) -> Result<(), PersistenceError> {
        self.save_master_data(user_id, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(pairs: &[(&str, &str)]) -> MasterData {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn unknown_user_has_no_master_data() {
        let db = Db::open_in_memory().unwrap();
        assert_eq!(db.get_master_data("nobody").unwrap(), None);
    }

    #[test]
    fn save_replaces_the_whole_mapping_per_user() {
        let db = Db::open_in_memory().unwrap();
        db.save_master_data("u1", &data(&[("A", "1"), ("B", "2")])).unwrap();
        db.save_master_data("u1", &data(&[("B", "3")])).unwrap();
        db.save_master_data("u2", &data(&[("A", "x")])).unwrap();

        assert_eq!(db.get("u1").unwrap(), Some(data(&[("B", "3")])));
        assert_eq!(db.get("u2").unwrap(), Some(data(&[("A", "x")])));
    }

    #[test]
    fn keys_are_case_sensitive() {
        let db = Db::open_in_memory().unwrap();
        db.put("u1", &data(&[("GST", "1"), ("gst", "2")])).unwrap();
        assert_eq!(db.get("u1").unwrap().unwrap().len(), 2);
    }

    #[test]
    fn reopening_a_file_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("formfill.db");
        Db::new(path.clone())
            .unwrap()
            .save_master_data("u1", &data(&[("Company Name", "Acme")]))
            .unwrap();
        let db = Db::new(path).unwrap();
        assert_eq!(db.get("u1").unwrap(), Some(data(&[("Company Name", "Acme")])));
    }
}
