//! SQLite persistence for animals, cages, readings, sessions and the
//! command audit trail.
//!
//! One connection, migrations applied at open. Timestamps are stored as
//! RFC 3339 UTC text so they round-trip through chrono; SQL-side defaults
//! use STRFTIME with the same shape.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use labvoice_common::config::DatabaseConfig;
use labvoice_common::types::{
    Animal, Cage, CommandLogEntry, ContextUpdate, Reading, Session, SessionContext,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

/// RFC 3339 with milliseconds, as SQLite produces it.
const SQL_NOW: &str = "STRFTIME('%Y-%m-%dT%H:%M:%fZ','now')";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("animal {0} not found")]
    AnimalNotFound(i64),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct LabDb {
    conn: Connection,
}

impl LabDb {
    /// Open (creating directories as needed), apply pragmas and migrate.
    pub fn open(path: &Path, config: &DatabaseConfig) -> Result<Self, StorageError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        let db = Self::prepare(conn, config)?;
        info!(path = %path.display(), "database opened");
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::prepare(Connection::open_in_memory()?, &DatabaseConfig::default())
    }

    fn prepare(conn: Connection, config: &DatabaseConfig) -> Result<Self, StorageError> {
        conn.pragma_update(None, "foreign_keys", config.foreign_keys)?;
        // journal_mode returns the resulting mode as a row; in-memory
        // databases stay on "memory" and that is fine.
        let _: String = conn.query_row(
            &format!("PRAGMA journal_mode = {}", config.journal_mode),
            [],
            |row| row.get(0),
        )?;
        conn.pragma_update(None, "synchronous", &config.synchronous)?;

        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS animals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                number INTEGER UNIQUE NOT NULL,
                current_cage INTEGER,
                current_weight REAL,
                group_id TEXT,
                created_at TEXT NOT NULL DEFAULT ({now}),
                updated_at TEXT NOT NULL DEFAULT ({now})
            );

            CREATE TABLE IF NOT EXISTS cages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                number INTEGER UNIQUE NOT NULL,
                group_name TEXT,
                capacity INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL DEFAULT ({now})
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                start_time TEXT NOT NULL DEFAULT ({now}),
                end_time TEXT,
                is_active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                animal_id INTEGER NOT NULL,
                weight REAL NOT NULL,
                cage_id INTEGER NOT NULL,
                timestamp TEXT NOT NULL DEFAULT ({now}),
                notes TEXT,
                session_id INTEGER NOT NULL,
                FOREIGN KEY (animal_id) REFERENCES animals(id),
                FOREIGN KEY (cage_id) REFERENCES cages(id),
                FOREIGN KEY (session_id) REFERENCES sessions(id)
            );

            CREATE TABLE IF NOT EXISTS session_context (
                session_id INTEGER PRIMARY KEY,
                last_rat INTEGER,
                last_cage INTEGER,
                last_weight REAL,
                updated_at TEXT NOT NULL DEFAULT ({now}),
                FOREIGN KEY (session_id) REFERENCES sessions(id)
            );

            CREATE TABLE IF NOT EXISTS command_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL,
                raw_text TEXT NOT NULL,
                parsed_command TEXT,
                confidence REAL,
                executed INTEGER NOT NULL DEFAULT 0,
                timestamp TEXT NOT NULL DEFAULT ({now}),
                FOREIGN KEY (session_id) REFERENCES sessions(id)
            );

            CREATE INDEX IF NOT EXISTS idx_animals_number ON animals(number);
            CREATE INDEX IF NOT EXISTS idx_cages_number ON cages(number);
            CREATE INDEX IF NOT EXISTS idx_readings_animal_id ON readings(animal_id);
            CREATE INDEX IF NOT EXISTS idx_readings_timestamp ON readings(timestamp);
            CREATE INDEX IF NOT EXISTS idx_command_history_session ON command_history(session_id);

            CREATE TRIGGER IF NOT EXISTS update_animals_timestamp
            AFTER UPDATE ON animals
            BEGIN
                UPDATE animals SET updated_at = {now} WHERE id = NEW.id;
            END;
            "#,
            now = SQL_NOW,
        ))?;
        Ok(())
    }

    // Animals and cages.

    pub fn get_or_create_animal(&self, number: i64) -> Result<Animal, StorageError> {
        ensure_animal(&self.conn, number)?;
        self.get_animal(number)?
            .ok_or(StorageError::AnimalNotFound(number))
    }

    pub fn get_animal(&self, number: i64) -> Result<Option<Animal>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, number, current_cage, current_weight, group_id, created_at, updated_at
                 FROM animals WHERE number = ?1",
                params![number],
                animal_from_row,
            )
            .optional()?)
    }

    pub fn get_cage(&self, number: i64) -> Result<Option<Cage>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, number, group_name, capacity, created_at FROM cages WHERE number = ?1",
                params![number],
                cage_from_row,
            )
            .optional()?)
    }

    pub fn get_or_create_cage(&self, number: i64) -> Result<Cage, StorageError> {
        ensure_cage(&self.conn, number)?;
        self.conn
            .query_row(
                "SELECT id, number, group_name, capacity, created_at FROM cages WHERE number = ?1",
                params![number],
                cage_from_row,
            )
            .map_err(Into::into)
    }

    /// Record one weighing as a single transaction: the animal and cage
    /// rows are created if missing, the reading inserted, the animal's
    /// current cage and weight updated, and the session context advanced.
    /// Any failure rolls the whole command back.
    pub fn record_reading(
        &mut self,
        animal_number: i64,
        cage_number: i64,
        weight: f64,
        session_id: i64,
    ) -> Result<Reading, StorageError> {
        let tx = self.conn.transaction()?;

        let animal_id = ensure_animal(&tx, animal_number)?;
        let cage_id = ensure_cage(&tx, cage_number)?;

        tx.execute(
            "INSERT INTO readings (animal_id, weight, cage_id, session_id) VALUES (?1, ?2, ?3, ?4)",
            params![animal_id, weight, cage_id, session_id],
        )?;
        let reading_id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE animals SET current_cage = ?1, current_weight = ?2 WHERE id = ?3",
            params![cage_number, weight, animal_id],
        )?;

        upsert_context(
            &tx,
            session_id,
            &ContextUpdate {
                last_rat: Some(animal_number),
                last_cage: Some(cage_number),
                last_weight: Some(weight),
            },
        )?;

        let reading = tx.query_row(
            "SELECT id, animal_id, weight, cage_id, timestamp, notes, session_id
             FROM readings WHERE id = ?1",
            params![reading_id],
            reading_from_row,
        )?;

        tx.commit()?;
        Ok(reading)
    }

    /// Correct an animal's current weight in one transaction: the animal
    /// row, an audit reading when a current cage is known, and the
    /// context's last weight all change together or not at all.
    pub fn update_animal_weight(
        &mut self,
        animal_number: i64,
        weight: f64,
        session_id: i64,
    ) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;

        let row: Option<(i64, Option<i64>)> = tx
            .query_row(
                "SELECT id, current_cage FROM animals WHERE number = ?1",
                params![animal_number],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let (animal_id, current_cage) = row.ok_or(StorageError::AnimalNotFound(animal_number))?;

        tx.execute(
            "UPDATE animals SET current_weight = ?1 WHERE id = ?2",
            params![weight, animal_id],
        )?;

        if let Some(cage_number) = current_cage {
            let cage_id: Option<i64> = tx
                .query_row(
                    "SELECT id FROM cages WHERE number = ?1",
                    params![cage_number],
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(cage_id) = cage_id {
                tx.execute(
                    "INSERT INTO readings (animal_id, weight, cage_id, session_id, notes)
                     VALUES (?1, ?2, ?3, ?4, 'Weight updated')",
                    params![animal_id, weight, cage_id, session_id],
                )?;
            }
        }

        upsert_context(
            &tx,
            session_id,
            &ContextUpdate {
                last_weight: Some(weight),
                ..ContextUpdate::default()
            },
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Relocate an animal in one transaction: the destination cage is
    /// created if missing, the animal's current cage updated and the
    /// context advanced together. An unknown animal rolls everything back.
    pub fn move_animal(
        &mut self,
        animal_number: i64,
        cage_number: i64,
        session_id: i64,
    ) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;

        ensure_cage(&tx, cage_number)?;
        let changed = tx.execute(
            "UPDATE animals SET current_cage = ?1 WHERE number = ?2",
            params![cage_number, animal_number],
        )?;
        if changed == 0 {
            return Err(StorageError::AnimalNotFound(animal_number));
        }

        upsert_context(
            &tx,
            session_id,
            &ContextUpdate {
                last_rat: Some(animal_number),
                last_cage: Some(cage_number),
                ..ContextUpdate::default()
            },
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Animals whose current weight is within `tolerance` of the target,
    /// nearest first.
    pub fn animals_around_weight(
        &self,
        target: f64,
        tolerance: f64,
    ) -> Result<Vec<Animal>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, number, current_cage, current_weight, group_id, created_at, updated_at
             FROM animals
             WHERE current_weight BETWEEN ?1 AND ?2
             ORDER BY ABS(current_weight - ?3) ASC",
        )?;
        let animals = stmt
            .query_map(
                params![target - tolerance, target + tolerance, target],
                animal_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(animals)
    }

    // Sessions.

    /// Start a new session, closing any active one first.
    pub fn start_session(&self) -> Result<Session, StorageError> {
        self.conn.execute(
            &format!(
                "UPDATE sessions SET is_active = 0, end_time = {SQL_NOW} WHERE is_active = 1"
            ),
            [],
        )?;
        self.conn.execute("INSERT INTO sessions DEFAULT VALUES", [])?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, start_time, end_time, is_active FROM sessions WHERE id = ?1",
                params![id],
                session_from_row,
            )
            .map_err(Into::into)
    }

    pub fn current_session(&self) -> Result<Option<Session>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, start_time, end_time, is_active FROM sessions WHERE is_active = 1 LIMIT 1",
                [],
                session_from_row,
            )
            .optional()?)
    }

    /// Partial context upsert; `None` fields keep their stored value.
    pub fn update_session_context(
        &self,
        session_id: i64,
        update: &ContextUpdate,
    ) -> Result<(), StorageError> {
        upsert_context(&self.conn, session_id, update)?;
        Ok(())
    }

    pub fn session_context(
        &self,
        session_id: i64,
    ) -> Result<Option<SessionContext>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT session_id, last_rat, last_cage, last_weight, updated_at
                 FROM session_context WHERE session_id = ?1",
                params![session_id],
                context_from_row,
            )
            .optional()?)
    }

    pub fn clear_session_context(&self, session_id: i64) -> Result<(), StorageError> {
        self.conn.execute(
            "DELETE FROM session_context WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(())
    }

    // Audit trail.

    pub fn log_command(
        &self,
        session_id: i64,
        raw_text: &str,
        parsed_command: &str,
        confidence: f64,
        executed: bool,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO command_history (session_id, raw_text, parsed_command, confidence, executed)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, raw_text, parsed_command, confidence, executed],
        )?;
        Ok(())
    }

    pub fn command_history(
        &self,
        session_id: i64,
        limit: usize,
    ) -> Result<Vec<CommandLogEntry>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT raw_text, parsed_command, confidence, executed, timestamp
             FROM command_history WHERE session_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![session_id, limit as i64], |row| {
                Ok(CommandLogEntry {
                    raw_text: row.get(0)?,
                    parsed_command: row.get(1)?,
                    confidence: row.get(2)?,
                    executed: row.get(3)?,
                    timestamp: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Most recent reading for one animal, if any.
    pub fn last_reading(&self, animal_number: i64) -> Result<Option<Reading>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT r.id, r.animal_id, r.weight, r.cage_id, r.timestamp, r.notes, r.session_id
                 FROM readings r JOIN animals a ON a.id = r.animal_id
                 WHERE a.number = ?1
                 ORDER BY r.id DESC LIMIT 1",
                params![animal_number],
                reading_from_row,
            )
            .optional()?)
    }

    /// Reading counts per session, newest session first. Status display.
    pub fn session_reading_counts(&self, limit: usize) -> Result<HashMap<i64, i64>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, COUNT(*) FROM readings
             GROUP BY session_id ORDER BY session_id DESC LIMIT ?1",
        )?;
        let counts = stmt
            .query_map(params![limit as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(counts)
    }
}

/// Id of the animal row with this number, inserting it if missing. Runs
/// against whatever connection (or open transaction) it is handed.
fn ensure_animal(conn: &Connection, number: i64) -> rusqlite::Result<i64> {
    if let Some(id) = conn
        .query_row(
            "SELECT id FROM animals WHERE number = ?1",
            params![number],
            |r| r.get(0),
        )
        .optional()?
    {
        return Ok(id);
    }
    conn.execute("INSERT INTO animals (number) VALUES (?1)", params![number])?;
    Ok(conn.last_insert_rowid())
}

fn ensure_cage(conn: &Connection, number: i64) -> rusqlite::Result<i64> {
    if let Some(id) = conn
        .query_row(
            "SELECT id FROM cages WHERE number = ?1",
            params![number],
            |r| r.get(0),
        )
        .optional()?
    {
        return Ok(id);
    }
    conn.execute("INSERT INTO cages (number) VALUES (?1)", params![number])?;
    Ok(conn.last_insert_rowid())
}

fn upsert_context(
    conn: &Connection,
    session_id: i64,
    update: &ContextUpdate,
) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO session_context (session_id, last_rat, last_cage, last_weight, updated_at)
             VALUES (?1, ?2, ?3, ?4, {SQL_NOW})
             ON CONFLICT(session_id) DO UPDATE SET
                 last_rat = COALESCE(excluded.last_rat, last_rat),
                 last_cage = COALESCE(excluded.last_cage, last_cage),
                 last_weight = COALESCE(excluded.last_weight, last_weight),
                 updated_at = {SQL_NOW}"
        ),
        params![
            session_id,
            update.last_rat,
            update.last_cage,
            update.last_weight
        ],
    )?;
    Ok(())
}

fn animal_from_row(row: &Row<'_>) -> rusqlite::Result<Animal> {
    Ok(Animal {
        id: row.get(0)?,
        number: row.get(1)?,
        current_cage: row.get(2)?,
        current_weight: row.get(3)?,
        group_id: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn cage_from_row(row: &Row<'_>) -> rusqlite::Result<Cage> {
    Ok(Cage {
        id: row.get(0)?,
        number: row.get(1)?,
        group_name: row.get(2)?,
        capacity: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn reading_from_row(row: &Row<'_>) -> rusqlite::Result<Reading> {
    Ok(Reading {
        id: row.get(0)?,
        animal_id: row.get(1)?,
        weight: row.get(2)?,
        cage_id: row.get(3)?,
        timestamp: row.get(4)?,
        notes: row.get(5)?,
        session_id: row.get(6)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        start_time: row.get(1)?,
        end_time: row.get(2)?,
        is_active: row.get(3)?,
    })
}

fn context_from_row(row: &Row<'_>) -> rusqlite::Result<SessionContext> {
    Ok(SessionContext {
        session_id: row.get(0)?,
        last_rat: row.get(1)?,
        last_cage: row.get(2)?,
        last_weight: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

/// Resolved default database location under the user's data directory.
pub fn default_db_path() -> std::path::PathBuf {
    let base = std::env::var_os("XDG_DATA_HOME")
        .map(std::path::PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME").map(|h| std::path::PathBuf::from(h).join(".local/share"))
        })
        .unwrap_or_else(|| std::path::PathBuf::from("."));
    base.join("labvoice").join("labvoice.db")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn db() -> LabDb {
        LabDb::open_in_memory().unwrap()
    }

    #[test]
    fn animals_and_cages_are_created_on_demand() {
        let d = db();
        let a = d.get_or_create_animal(5).unwrap();
        assert_eq!(a.number, 5);
        assert!(a.current_weight.is_none());

        // Idempotent.
        let again = d.get_or_create_animal(5).unwrap();
        assert_eq!(again.id, a.id);

        let c = d.get_or_create_cage(3).unwrap();
        assert_eq!(c.number, 3);
        assert_eq!(c.capacity, 1);
    }

    #[test]
    fn record_reading_updates_current_state() {
        let mut d = db();
        let session = d.start_session().unwrap();

        // Animal and cage rows come into existence with the reading.
        let reading = d.record_reading(5, 3, 280.0, session.id).unwrap();
        assert_eq!(reading.weight, 280.0);
        assert_eq!(reading.session_id, session.id);

        let animal = d.get_animal(5).unwrap().unwrap();
        assert_eq!(animal.current_cage, Some(3));
        assert_eq!(animal.current_weight, Some(280.0));
        assert!(d.get_cage(3).unwrap().is_some());

        let ctx = d.session_context(session.id).unwrap().unwrap();
        assert_eq!(ctx.last_rat, Some(5));
        assert_eq!(ctx.last_cage, Some(3));
        assert_eq!(ctx.last_weight, Some(280.0));
    }

    #[test]
    fn failed_record_rolls_back_created_rows() {
        let mut d = db();
        // Session 999 does not exist, so the readings foreign key rejects
        // the insert. The animal and cage rows created earlier in the same
        // transaction must not survive.
        assert!(d.record_reading(5, 3, 280.0, 999).is_err());
        assert!(d.get_animal(5).unwrap().is_none());
        assert!(d.get_cage(3).unwrap().is_none());
    }

    #[test]
    fn weight_update_adds_audit_reading_when_caged() {
        let mut d = db();
        let session = d.start_session().unwrap();
        d.get_or_create_animal(5).unwrap();
        d.get_or_create_cage(3).unwrap();
        d.record_reading(5, 3, 280.0, session.id).unwrap();

        d.update_animal_weight(5, 300.0, session.id).unwrap();
        let animal = d.get_animal(5).unwrap().unwrap();
        assert_eq!(animal.current_weight, Some(300.0));

        let last = d.last_reading(5).unwrap().unwrap();
        assert_eq!(last.weight, 300.0);
        assert_eq!(last.notes.as_deref(), Some("Weight updated"));

        let ctx = d.session_context(session.id).unwrap().unwrap();
        assert_eq!(ctx.last_weight, Some(300.0));
    }

    #[test]
    fn weight_update_without_cage_skips_reading() {
        let mut d = db();
        let session = d.start_session().unwrap();
        d.get_or_create_animal(7).unwrap();
        d.update_animal_weight(7, 250.0, session.id).unwrap();
        assert!(d.last_reading(7).unwrap().is_none());
        assert_eq!(d.get_animal(7).unwrap().unwrap().current_weight, Some(250.0));
    }

    #[test]
    fn move_updates_cage_and_rejects_unknown_animal() {
        let mut d = db();
        let session = d.start_session().unwrap();
        d.get_or_create_animal(7).unwrap();
        d.move_animal(7, 12, session.id).unwrap();
        assert_eq!(d.get_animal(7).unwrap().unwrap().current_cage, Some(12));

        let ctx = d.session_context(session.id).unwrap().unwrap();
        assert_eq!(ctx.last_rat, Some(7));
        assert_eq!(ctx.last_cage, Some(12));

        assert!(matches!(
            d.move_animal(99, 12, session.id).unwrap_err(),
            StorageError::AnimalNotFound(99)
        ));
    }

    #[test]
    fn failed_move_rolls_back_created_cage() {
        let mut d = db();
        let session = d.start_session().unwrap();
        assert!(matches!(
            d.move_animal(99, 12, session.id).unwrap_err(),
            StorageError::AnimalNotFound(99)
        ));
        // The destination cage was created inside the failed transaction.
        assert!(d.get_cage(12).unwrap().is_none());
    }

    #[test]
    fn weight_query_orders_by_distance() {
        let mut d = db();
        let session = d.start_session().unwrap();
        for (rat, weight) in [(1, 248.0), (2, 252.0), (3, 235.0), (4, 300.0)] {
            d.get_or_create_animal(rat).unwrap();
            d.get_or_create_cage(rat).unwrap();
            d.record_reading(rat, rat, weight, session.id).unwrap();
        }

        let hits = d.animals_around_weight(250.0, 20.0).unwrap();
        let numbers: Vec<i64> = hits.iter().map(|a| a.number).collect();
        // 248 and 252 are both 2 away; 235 is 15 away; 300 is outside.
        assert_eq!(numbers.len(), 3);
        assert!(numbers[..2].contains(&1) && numbers[..2].contains(&2));
        assert_eq!(numbers[2], 3);
    }

    #[test]
    fn starting_a_session_closes_the_previous_one() {
        let d = db();
        let first = d.start_session().unwrap();
        assert!(first.is_active);

        let second = d.start_session().unwrap();
        assert_ne!(first.id, second.id);

        let current = d.current_session().unwrap().unwrap();
        assert_eq!(current.id, second.id);
    }

    #[test]
    fn context_upsert_merges_partial_updates() {
        let d = db();
        let session = d.start_session().unwrap();

        d.update_session_context(
            session.id,
            &ContextUpdate {
                last_rat: Some(5),
                last_cage: Some(3),
                last_weight: Some(280.0),
            },
        )
        .unwrap();

        // Partial update keeps unspecified fields.
        d.update_session_context(
            session.id,
            &ContextUpdate {
                last_weight: Some(300.0),
                ..ContextUpdate::default()
            },
        )
        .unwrap();

        let ctx = d.session_context(session.id).unwrap().unwrap();
        assert_eq!(ctx.last_rat, Some(5));
        assert_eq!(ctx.last_cage, Some(3));
        assert_eq!(ctx.last_weight, Some(300.0));

        d.clear_session_context(session.id).unwrap();
        assert!(d.session_context(session.id).unwrap().is_none());
    }

    #[test]
    fn command_history_is_recorded_newest_first() {
        let d = db();
        let session = d.start_session().unwrap();
        d.log_command(session.id, "rat 5 cage 3 weight 280 grams", "{}", 0.95, true)
            .unwrap();
        d.log_command(session.id, "gibberish", "{}", 0.3, false).unwrap();

        let history = d.command_history(session.id, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].raw_text, "gibberish");
        assert!(!history[0].executed);
        assert!(history[1].executed);
    }

    #[test]
    fn on_disk_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("labvoice.db");
        let config = DatabaseConfig::default();

        {
            let mut d = LabDb::open(&path, &config).unwrap();
            let session = d.start_session().unwrap();
            d.get_or_create_animal(5).unwrap();
            d.get_or_create_cage(3).unwrap();
            d.record_reading(5, 3, 280.0, session.id).unwrap();
        }

        let d = LabDb::open(&path, &config).unwrap();
        let animal = d.get_animal(5).unwrap().unwrap();
        assert_eq!(animal.current_weight, Some(280.0));
        assert!(d.current_session().unwrap().is_some());
    }

    #[test]
    fn timestamps_round_trip_through_chrono() {
        let d = db();
        let session = d.start_session().unwrap();
        let age = Utc::now() - session.start_time;
        assert!(age.num_seconds().abs() < 5);
    }
}
