use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};

use crate::buffers::{Buffer, Macro};
use crate::errors::TyperError;
use crate::logging::append_run_log;
use crate::rehydrate::parse_macro;
use crate::runtime::FileSystem;

const READ_POOL_SIZE: usize = 2;

type StoreResult<T> = Result<T, TyperError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroSummary {
    pub name: String,
    pub description: String,
    pub buffer_count: usize,
}

impl MacroSummary {
    fn of(recorded: &Macro) -> Self {
        Self {
            name: recorded.name.clone(),
            description: recorded.description.clone(),
            buffer_count: recorded.buffers.len(),
        }
    }
}

/// Persistent macro storage. Calls block; async callers go through
/// `spawn_blocking`.
pub trait MacroStorage: Send + Sync {
    /// Stores `recorded`, replacing any macro of the same name.
    fn save(&self, recorded: Macro) -> StoreResult<Macro>;
    fn list(&self) -> StoreResult<Vec<MacroSummary>>;
    fn load(&self, name: &str) -> StoreResult<Option<Macro>>;
    /// `false` when no macro had that name.
    fn delete(&self, name: &str) -> StoreResult<bool>;

    fn export(&self, name: &str, path: &Path, fs: &dyn FileSystem) -> StoreResult<()> {
        let recorded = self
            .load(name)?
            .ok_or_else(|| TyperError::NoActiveRecording(name.to_string()))?;
        let text = serde_json::to_string_pretty(&recorded)
            .map_err(|e| TyperError::Storage(e.to_string()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs.create_dir_all(parent)?;
        }
        fs.write_string(path, &text)?;
        append_run_log(
            "info",
            "macro_store.exported",
            json!({ "name": name, "path": path.display().to_string() }),
        );
        Ok(())
    }

    /// Reads a macro file in either the current or the legacy format.
    fn import(&self, path: &Path, fs: &dyn FileSystem) -> StoreResult<Macro> {
        let text = fs.read_to_string(path)?;
        let recorded = parse_macro(&text)?;
        recorded.validate()?;
        let saved = self.save(recorded)?;
        append_run_log(
            "info",
            "macro_store.imported",
            json!({ "name": saved.name, "path": path.display().to_string() }),
        );
        Ok(saved)
    }
}

// ── SQLite store ──────────────────────────────────────────────────────────────

#[derive(Debug)]
enum WriteCmd {
    Save {
        recorded: Macro,
        now: i64,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    Delete {
        name: String,
        reply: oneshot::Sender<StoreResult<bool>>,
    },
}

pub struct MacroStore {
    write_tx: Option<mpsc::Sender<WriteCmd>>,
    read_pool: ReadPool,
    writer_join: Option<thread::JoinHandle<()>>,
    db_path: PathBuf,
}

impl Drop for MacroStore {
    fn drop(&mut self) {
        // The writer loop ends once its queue closes; join to flush it.
        drop(self.write_tx.take());
        if let Some(handle) = self.writer_join.take() {
            let _ = handle.join();
        }
    }
}

impl MacroStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        append_run_log(
            "info",
            "macro_store.open",
            json!({ "path": path.display().to_string() }),
        );
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| TyperError::Storage(e.to_string()))?;
        }

        let existed_before_open = path.exists();
        if existed_before_open {
            let meta = std::fs::metadata(&path).map_err(|e| TyperError::Storage(e.to_string()))?;
            if meta.len() == 0 {
                return Err(TyperError::Storage(format!(
                    "macro database is 0 bytes (corrupt): {}",
                    path.display()
                )));
            }
        }

        let mut write_conn = Connection::open(&path).map_err(db_err)?;
        configure_write_connection(&write_conn)?;

        if existed_before_open {
            let integrity: String = write_conn
                .pragma_query_value(None, "quick_check", |row| row.get(0))
                .map_err(db_err)?;
            if integrity != "ok" {
                return Err(TyperError::Storage(format!(
                    "macro database failed integrity check: {integrity}"
                )));
            }
        }

        run_migrations(&mut write_conn)?;

        let (write_tx, mut write_rx) = mpsc::channel(32);
        let writer_join = thread::spawn(move || {
            while let Some(cmd) = write_rx.blocking_recv() {
                match cmd {
                    WriteCmd::Save {
                        recorded,
                        now,
                        reply,
                    } => {
                        let _ = reply.send(upsert_macro(&write_conn, &recorded, now));
                    }
                    WriteCmd::Delete { name, reply } => {
                        let _ = reply.send(delete_macro(&write_conn, &name));
                    }
                }
            }
        });

        let read_pool = ReadPool::open(&path, READ_POOL_SIZE)?;
        Ok(Self {
            write_tx: Some(write_tx),
            read_pool,
            writer_join: Some(writer_join),
            db_path: path,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn sender(&self) -> StoreResult<&mpsc::Sender<WriteCmd>> {
        self.write_tx
            .as_ref()
            .ok_or_else(|| TyperError::Storage("store is closed".to_string()))
    }

    fn request<T>(&self, cmd: WriteCmd, reply_rx: oneshot::Receiver<StoreResult<T>>) -> StoreResult<T> {
        self.sender()?
            .blocking_send(cmd)
            .map_err(|e| TyperError::Storage(e.to_string()))?;
        reply_rx
            .blocking_recv()
            .map_err(|e| TyperError::Storage(e.to_string()))?
    }
}

impl MacroStorage for MacroStore {
    fn save(&self, recorded: Macro) -> StoreResult<Macro> {
        recorded.validate()?;
        let (reply, reply_rx) = oneshot::channel();
        self.request(
            WriteCmd::Save {
                recorded: recorded.clone(),
                now: system_time_unix(),
                reply,
            },
            reply_rx,
        )?;
        append_run_log(
            "info",
            "macro_store.saved",
            json!({ "name": recorded.name, "buffers": recorded.buffers.len() }),
        );
        Ok(recorded)
    }

    fn list(&self) -> StoreResult<Vec<MacroSummary>> {
        self.read_pool.with_conn(|conn| {
            let mut statement = conn
                .prepare("SELECT name, description, buffer_count FROM macros ORDER BY name ASC")
                .map_err(db_err)?;
            let rows = statement
                .query_map([], |row| {
                    let count: i64 = row.get(2)?;
                    Ok(MacroSummary {
                        name: row.get(0)?,
                        description: row.get(1)?,
                        buffer_count: count as usize,
                    })
                })
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(rows)
        })
    }

    fn load(&self, name: &str) -> StoreResult<Option<Macro>> {
        let row = self.read_pool.with_conn(|conn| {
            conn.query_row(
                "SELECT name, description, buffers_json, checksum FROM macros WHERE name = ?1",
                [name],
                row_to_stored,
            )
            .optional()
            .map_err(db_err)
        })?;
        row.map(StoredMacro::into_macro).transpose()
    }

    fn delete(&self, name: &str) -> StoreResult<bool> {
        let (reply, reply_rx) = oneshot::channel();
        let deleted = self.request(
            WriteCmd::Delete {
                name: name.to_string(),
                reply,
            },
            reply_rx,
        )?;
        append_run_log(
            "info",
            "macro_store.deleted",
            json!({ "name": name, "deleted": deleted }),
        );
        Ok(deleted)
    }
}

struct StoredMacro {
    name: String,
    description: String,
    buffers_json: String,
    checksum: String,
}

impl StoredMacro {
    /// Decodes the row only when its digest still matches.
    fn into_macro(self) -> StoreResult<Macro> {
        let actual = checksum(&self.buffers_json);
        if actual != self.checksum {
            append_run_log(
                "error",
                "macro_store.checksum_mismatch",
                json!({ "name": self.name, "stored": self.checksum, "actual": actual }),
            );
            return Err(TyperError::Storage(format!(
                "macro {:?} failed its checksum",
                self.name
            )));
        }
        let buffers: Vec<Buffer> = serde_json::from_str(&self.buffers_json)
            .map_err(|e| TyperError::Storage(format!("macro {:?}: {e}", self.name)))?;
        Ok(Macro {
            name: self.name,
            description: self.description,
            buffers,
        })
    }
}

#[derive(Clone)]
struct ReadPool {
    conns: Arc<Vec<Mutex<Connection>>>,
    next: Arc<AtomicUsize>,
}

impl ReadPool {
    fn open(path: &Path, size: usize) -> StoreResult<Self> {
        let mut conns = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                .map_err(db_err)?;
            conn.busy_timeout(std::time::Duration::from_secs(3))
                .map_err(db_err)?;
            conns.push(Mutex::new(conn));
        }
        Ok(Self {
            conns: Arc::new(conns),
            next: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        let guard = self.conns[idx]
            .lock()
            .map_err(|_| TyperError::Storage("read connection lock poisoned".to_string()))?;
        f(&guard)
    }
}

fn configure_write_connection(conn: &Connection) -> StoreResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(db_err)?;
    conn.pragma_update(None, "synchronous", "FULL")
        .map_err(db_err)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(db_err)?;
    Ok(())
}

fn run_migrations(conn: &mut Connection) -> StoreResult<()> {
    let migrations = [(1_i64, include_str!("../migrations/0001_macros.sql"))];

    conn.execute_batch("BEGIN IMMEDIATE; CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL); COMMIT;")
        .map_err(db_err)?;

    for (version, sql) in migrations {
        let exists = conn
            .query_row(
                "SELECT 1 FROM schema_migrations WHERE version = ?1 LIMIT 1",
                [version],
                |_| Ok(()),
            )
            .optional()
            .map_err(db_err)?
            .is_some();
        if exists {
            continue;
        }

        let tx = conn.transaction().map_err(db_err)?;
        tx.execute_batch(sql).map_err(db_err)?;
        tx.execute(
            "INSERT INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, system_time_unix()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        append_run_log(
            "info",
            "macro_store.migration.applied",
            json!({ "version": version }),
        );
    }
    Ok(())
}

fn upsert_macro(conn: &Connection, recorded: &Macro, now: i64) -> StoreResult<()> {
    let buffers_json =
        serde_json::to_string(&recorded.buffers).map_err(|e| TyperError::Storage(e.to_string()))?;
    conn.execute(
        "INSERT INTO macros (name, description, buffers_json, checksum, buffer_count, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
         ON CONFLICT(name) DO UPDATE SET
            description = excluded.description,
            buffers_json = excluded.buffers_json,
            checksum = excluded.checksum,
            buffer_count = excluded.buffer_count,
            updated_at = excluded.updated_at",
        params![
            recorded.name,
            recorded.description,
            buffers_json,
            checksum(&buffers_json),
            recorded.buffers.len() as i64,
            now
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn delete_macro(conn: &Connection, name: &str) -> StoreResult<bool> {
    let changed = conn
        .execute("DELETE FROM macros WHERE name = ?1", [name])
        .map_err(db_err)?;
    Ok(changed > 0)
}

fn row_to_stored(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMacro> {
    let checksum: String = row.get(3)?;
    if checksum.len() != 64 {
        return Err(rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "invalid checksum",
            )),
        ));
    }
    Ok(StoredMacro {
        name: row.get(0)?,
        description: row.get(1)?,
        buffers_json: row.get(2)?,
        checksum,
    })
}

fn checksum(buffers_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(buffers_json.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn db_err(error: rusqlite::Error) -> TyperError {
    TyperError::Storage(error.to_string())
}

fn system_time_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ── In-memory store ───────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    macros: Arc<Mutex<BTreeMap<String, Macro>>>,
    fail_next: Arc<Mutex<Option<TyperError>>>,
}

impl MemoryStorage {
    pub fn set_fail_next(&self, error: TyperError) {
        *self.fail_next.lock().expect("fail lock") = Some(error);
    }

    fn maybe_fail(&self) -> StoreResult<()> {
        match self.fail_next.lock().expect("fail lock").take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl MacroStorage for MemoryStorage {
    fn save(&self, recorded: Macro) -> StoreResult<Macro> {
        self.maybe_fail()?;
        recorded.validate()?;
        self.macros
            .lock()
            .expect("macros lock")
            .insert(recorded.name.clone(), recorded.clone());
        Ok(recorded)
    }

    fn list(&self) -> StoreResult<Vec<MacroSummary>> {
        self.maybe_fail()?;
        Ok(self
            .macros
            .lock()
            .expect("macros lock")
            .values()
            .map(MacroSummary::of)
            .collect())
    }

    fn load(&self, name: &str) -> StoreResult<Option<Macro>> {
        self.maybe_fail()?;
        Ok(self.macros.lock().expect("macros lock").get(name).cloned())
    }

    fn delete(&self, name: &str) -> StoreResult<bool> {
        self.maybe_fail()?;
        Ok(self.macros.lock().expect("macros lock").remove(name).is_some())
    }
}
