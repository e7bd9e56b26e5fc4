use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::lock;
use crate::model::{AlertDirection, PriceAlert};

/// Write-through persistence for alerts, keyed by alert id.
pub trait AlertStore: Send + Sync {
    fn upsert(&self, alert: &PriceAlert) -> Result<()>;
    fn delete(&self, id: &str) -> Result<()>;
    fn load_all(&self) -> Result<Vec<PriceAlert>>;
}

#[derive(Debug, Default)]
pub struct MemoryAlertStore {
    alerts: Mutex<BTreeMap<String, PriceAlert>>,
}

impl MemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.alerts).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<PriceAlert> {
        lock(&self.alerts).get(id).cloned()
    }
}

impl AlertStore for MemoryAlertStore {
    fn upsert(&self, alert: &PriceAlert) -> Result<()> {
        lock(&self.alerts).insert(alert.id.clone(), alert.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        lock(&self.alerts).remove(id);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<PriceAlert>> {
        Ok(lock(&self.alerts).values().cloned().collect())
    }
}

pub struct SqliteAlertStore {
    conn: Mutex<Connection>,
}

impl SqliteAlertStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open alert store {}", path.display()))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS price_alerts (
                id TEXT PRIMARY KEY,
                exchange TEXT NOT NULL,
                pair TEXT NOT NULL,
                price REAL NOT NULL,
                direction TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                is_triggered INTEGER NOT NULL,
                triggered_at_ms INTEGER,
                updated_at_ms INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl AlertStore for SqliteAlertStore {
    fn upsert(&self, alert: &PriceAlert) -> Result<()> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        lock(&self.conn).execute(
            r#"
            INSERT INTO price_alerts (
                id, exchange, pair, price, direction,
                created_at_ms, is_triggered, triggered_at_ms, updated_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                price = excluded.price,
                direction = excluded.direction,
                is_triggered = excluded.is_triggered,
                triggered_at_ms = excluded.triggered_at_ms,
                updated_at_ms = excluded.updated_at_ms
            "#,
            params![
                alert.id,
                alert.exchange,
                alert.pair,
                alert.price,
                alert.direction.as_str(),
                alert.created_at,
                alert.is_triggered,
                alert.triggered_at,
                now_ms,
            ],
        )?;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        lock(&self.conn).execute("DELETE FROM price_alerts WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<PriceAlert>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            r#"
            SELECT id, exchange, pair, price, direction,
                   created_at_ms, is_triggered, triggered_at_ms
            FROM price_alerts
            ORDER BY created_at_ms ASC, id ASC
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            let direction: String = row.get(4)?;
            Ok(PriceAlert {
                id: row.get(0)?,
                exchange: row.get(1)?,
                pair: row.get(2)?,
                price: row.get(3)?,
                direction: AlertDirection::parse(&direction).unwrap_or(AlertDirection::Above),
                created_at: row.get(5)?,
                is_triggered: row.get(6)?,
                triggered_at: row.get(7)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
