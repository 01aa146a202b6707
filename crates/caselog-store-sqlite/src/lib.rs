use std::path::Path;

use anyhow::{anyhow, Context, Result};
use caselog_core::{parse_iso_date, CellValue, StoreError, TabularStore};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS sheets (
  name TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS cells (
  sheet TEXT NOT NULL,
  row_idx INTEGER NOT NULL CHECK (row_idx >= 1),
  col_idx INTEGER NOT NULL CHECK (col_idx >= 1),
  kind TEXT NOT NULL CHECK (kind IN ('text','number','date')),
  value TEXT NOT NULL,
  PRIMARY KEY (sheet, row_idx, col_idx),
  FOREIGN KEY (sheet) REFERENCES sheets(name)
);

CREATE INDEX IF NOT EXISTS idx_cells_sheet_row ON cells(sheet, row_idx);
";

/// A workbook of named sheets stored as sparse cell grids in SQLite. Empty
/// cells are not stored; reads pad the requested range with empties, so a
/// fully empty appended row is indistinguishable from no row at all.
pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed workbook and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        configure_connection(&conn)?;
        Ok(Self { conn })
    }

    /// Open a transient in-memory workbook; used by tests.
    ///
    /// # Errors
    /// Returns an error when the connection cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("failed to open in-memory sqlite database")?;
        configure_connection(&conn)?;
        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };
        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema
    /// version. Safe to call repeatedly.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step
    /// fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version < 1 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }
        Ok(())
    }

    /// Run SQLite's quick check plus a foreign-key scan.
    ///
    /// # Errors
    /// Returns an error when the checks themselves cannot be executed.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .context("failed to run quick_check")?;
        let quick_check_ok = quick_check_message == "ok";

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare foreign_key_check")?;
        let violations = stmt
            .query_map([], |row| {
                Ok(ForeignKeyViolation {
                    table: row.get(0)?,
                    rowid: row.get(1)?,
                    parent: row.get(2)?,
                    fk_index: row.get(3)?,
                })
            })
            .context("failed to run foreign_key_check")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to read foreign_key_check rows")?;

        Ok(IntegrityReport {
            quick_check_ok,
            quick_check_message,
            foreign_key_violations: violations,
            schema_status: self.schema_status()?,
        })
    }

    fn sheet_exists(&self, table: &str) -> Result<bool, StoreError> {
        self.conn
            .query_row("SELECT 1 FROM sheets WHERE name = ?1", params![table], |_| Ok(()))
            .optional()
            .map(|found| found.is_some())
            .map_err(backend)
    }

    fn require_sheet(&self, table: &str) -> Result<(), StoreError> {
        if self.sheet_exists(table)? {
            Ok(())
        } else {
            Err(StoreError::TableMissing(table.to_string()))
        }
    }

    fn max_row(&self, table: &str) -> Result<usize, StoreError> {
        let max: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(row_idx), 0) FROM cells WHERE sheet = ?1",
                params![table],
                |row| row.get(0),
            )
            .map_err(backend)?;
        Ok(to_usize(max))
    }
}

impl TabularStore for SqliteStore {
    fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        self.sheet_exists(table)
    }

    fn create_table(&mut self, table: &str, header: &[&str]) -> Result<(), StoreError> {
        if self.sheet_exists(table)? {
            return Err(StoreError::TableExists(table.to_string()));
        }
        let tx = self.conn.transaction().map_err(backend)?;
        tx.execute("INSERT INTO sheets(name) VALUES (?1)", params![table]).map_err(backend)?;
        for (offset, title) in header.iter().enumerate() {
            if title.is_empty() {
                continue;
            }
            tx.execute(
                "INSERT INTO cells(sheet, row_idx, col_idx, kind, value) VALUES (?1, 1, ?2, 'text', ?3)",
                params![table, to_i64(offset + 1), title],
            )
            .map_err(backend)?;
        }
        tx.commit().map_err(backend)
    }

    fn append_row(&mut self, table: &str, values: &[CellValue]) -> Result<(), StoreError> {
        self.require_sheet(table)?;
        let next_row = self.max_row(table)? + 1;
        let tx = self.conn.transaction().map_err(backend)?;
        for (offset, cell) in values.iter().enumerate() {
            let Some((kind, value)) = encode_cell(cell) else { continue };
            tx.execute(
                "INSERT INTO cells(sheet, row_idx, col_idx, kind, value) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![table, to_i64(next_row), to_i64(offset + 1), kind, value],
            )
            .map_err(backend)?;
        }
        tx.commit().map_err(backend)
    }

    fn read_range(
        &self,
        table: &str,
        row_start: usize,
        col_start: usize,
        rows: usize,
        cols: usize,
    ) -> Result<Vec<Vec<CellValue>>, StoreError> {
        if row_start == 0 || col_start == 0 {
            return Err(StoreError::Backend("range coordinates are 1-indexed".to_string()));
        }
        self.require_sheet(table)?;

        let mut grid = vec![vec![CellValue::Empty; cols]; rows];
        if rows == 0 || cols == 0 {
            return Ok(grid);
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT row_idx, col_idx, kind, value FROM cells
                 WHERE sheet = ?1 AND row_idx BETWEEN ?2 AND ?3 AND col_idx BETWEEN ?4 AND ?5",
            )
            .map_err(backend)?;
        let cells = stmt
            .query_map(
                params![
                    table,
                    to_i64(row_start),
                    to_i64(row_start + rows - 1),
                    to_i64(col_start),
                    to_i64(col_start + cols - 1)
                ],
                |row| {
                    let row_idx: i64 = row.get(0)?;
                    let col_idx: i64 = row.get(1)?;
                    let kind: String = row.get(2)?;
                    let value: String = row.get(3)?;
                    Ok((row_idx, col_idx, kind, value))
                },
            )
            .map_err(backend)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(backend)?;

        for (row_idx, col_idx, kind, value) in cells {
            let row_offset = to_usize(row_idx) - row_start;
            let col_offset = to_usize(col_idx) - col_start;
            if let Some(slot) = grid.get_mut(row_offset).and_then(|row| row.get_mut(col_offset)) {
                *slot = decode_cell(&kind, value);
            }
        }
        Ok(grid)
    }

    fn write_range(
        &mut self,
        table: &str,
        row_start: usize,
        col_start: usize,
        grid: &[Vec<CellValue>],
    ) -> Result<(), StoreError> {
        if row_start == 0 || col_start == 0 {
            return Err(StoreError::Backend("range coordinates are 1-indexed".to_string()));
        }
        self.require_sheet(table)?;

        let tx = self.conn.transaction().map_err(backend)?;
        for (row_offset, row) in grid.iter().enumerate() {
            for (col_offset, cell) in row.iter().enumerate() {
                let row_idx = to_i64(row_start + row_offset);
                let col_idx = to_i64(col_start + col_offset);
                match encode_cell(cell) {
                    Some((kind, value)) => {
                        tx.execute(
                            "INSERT OR REPLACE INTO cells(sheet, row_idx, col_idx, kind, value)
                             VALUES (?1, ?2, ?3, ?4, ?5)",
                            params![table, row_idx, col_idx, kind, value],
                        )
                        .map_err(backend)?;
                    }
                    None => {
                        tx.execute(
                            "DELETE FROM cells WHERE sheet = ?1 AND row_idx = ?2 AND col_idx = ?3",
                            params![table, row_idx, col_idx],
                        )
                        .map_err(backend)?;
                    }
                }
            }
        }
        tx.commit().map_err(backend)
    }

    fn delete_row(&mut self, table: &str, row_index: usize) -> Result<(), StoreError> {
        self.require_sheet(table)?;
        let last_row = self.max_row(table)?;
        if row_index == 0 || row_index > last_row {
            return Err(StoreError::Backend(format!("row {row_index} does not exist")));
        }

        let tx = self.conn.transaction().map_err(backend)?;
        tx.execute(
            "DELETE FROM cells WHERE sheet = ?1 AND row_idx = ?2",
            params![table, to_i64(row_index)],
        )
        .map_err(backend)?;

        // Re-home later rows one at a time in ascending order so the
        // composite primary key never collides mid-shift.
        let later_rows = {
            let mut stmt = tx
                .prepare(
                    "SELECT DISTINCT row_idx FROM cells
                     WHERE sheet = ?1 AND row_idx > ?2 ORDER BY row_idx ASC",
                )
                .map_err(backend)?;
            let rows = stmt
                .query_map(params![table, to_i64(row_index)], |row| row.get::<_, i64>(0))
                .map_err(backend)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(backend)?;
            rows
        };
        for row_idx in later_rows {
            tx.execute(
                "UPDATE cells SET row_idx = row_idx - 1 WHERE sheet = ?1 AND row_idx = ?2",
                params![table, row_idx],
            )
            .map_err(backend)?;
        }
        tx.commit().map_err(backend)
    }

    fn last_row(&self, table: &str) -> Result<usize, StoreError> {
        self.require_sheet(table)?;
        self.max_row(table)
    }

    fn last_column(&self, table: &str) -> Result<usize, StoreError> {
        self.require_sheet(table)?;
        let max: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(col_idx), 0) FROM cells WHERE sheet = ?1",
                params![table],
                |row| row.get(0),
            )
            .map_err(backend)?;
        Ok(to_usize(max))
    }
}

fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get(0)
    })
    .context("failed to read current schema version")
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc().format(&Rfc3339).context("failed to format current timestamp")
}

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn encode_cell(cell: &CellValue) -> Option<(&'static str, String)> {
    match cell {
        CellValue::Empty => None,
        CellValue::Text(value) => Some(("text", value.clone())),
        CellValue::Number(value) => Some(("number", value.to_string())),
        CellValue::Date(_) => Some(("date", cell.to_string())),
    }
}

fn decode_cell(kind: &str, value: String) -> CellValue {
    match kind {
        "number" => match value.parse::<f64>() {
            Ok(number) => CellValue::Number(number),
            Err(_) => CellValue::Text(value),
        },
        "date" => match parse_iso_date(&value) {
            Ok(date) => CellValue::Date(date),
            Err(_) => CellValue::Text(value),
        },
        _ => CellValue::Text(value),
    }
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_usize(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}
