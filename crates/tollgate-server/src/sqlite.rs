use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tollgate_kernel::{KvStore, StoreError};

/// Single-table key/value store backing every guard when `store.type=sqlite`.
pub struct SqliteKv {
    conn: Mutex<Connection>,
}

impl SqliteKv {
    pub fn open(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| e.to_string())?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn unavailable(err: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

impl KvStore for SqliteKv {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.conn
            .lock()
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(unavailable)
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO kv(key, value, updated_at) VALUES (?1, ?2, ?3)",
                params![key, value, chrono::Utc::now().to_rfc3339()],
            )
            .map_err(unavailable)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.conn
            .lock()
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map_err(unavailable)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_db() -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        std::env::temp_dir()
            .join(format!("tollgate-kv-{nanos}.db"))
            .to_string_lossy()
            .to_string()
    }

    #[test]
    fn put_get_delete_survive_reopen() {
        let path = temp_db();
        {
            let kv = SqliteKv::open(&path).unwrap();
            assert_eq!(kv.get("kill_switch").unwrap(), None);
            kv.put("kill_switch", "{\"engaged\":true}").unwrap();
            kv.put("kill_switch", "{\"engaged\":false}").unwrap();
            kv.put("rate_limit.mode", "\"disabled\"").unwrap();
            kv.delete("rate_limit.mode").unwrap();
        }
        let kv = SqliteKv::open(&path).unwrap();
        assert_eq!(
            kv.get("kill_switch").unwrap().as_deref(),
            Some("{\"engaged\":false}")
        );
        assert_eq!(kv.get("rate_limit.mode").unwrap(), None);
    }
}
