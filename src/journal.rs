//! 事件日志：区域边沿与报警事件写入 SQLite
//!
//! 写入走 mpsc 通道，由 spawn_blocking 的后台线程串行落盘，不阻塞 tick 与检测路径。

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Journal writer closed")]
    Closed,

    #[error("Journal task failed: {0}")]
    Task(String),
}

/// 一条日志记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JournalEntry {
    pub id: Option<i64>,
    pub recorded_at: DateTime<Utc>,
    pub kind: String,
    pub zone_id: Option<String>,
    pub source_id: Option<String>,
    pub detail: serde_json::Value,
}

impl JournalEntry {
    pub fn new(kind: impl Into<String>, detail: serde_json::Value) -> Self {
        Self {
            id: None,
            recorded_at: Utc::now(),
            kind: kind.into(),
            zone_id: None,
            source_id: None,
            detail,
        }
    }

    pub fn zone(mut self, zone_id: impl Into<String>) -> Self {
        self.zone_id = Some(zone_id.into());
        self
    }

    pub fn source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }
}

enum JournalOp {
    Append(JournalEntry),
    Flush(oneshot::Sender<()>),
}

pub struct EventJournal {
    conn: Arc<Mutex<Connection>>,
    tx: Mutex<Option<mpsc::UnboundedSender<JournalOp>>>,
    writer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl EventJournal {
    /// 打开（必要时创建）数据库并启动后台写线程；需在 tokio 运行时内调用
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recorded_at TEXT NOT NULL,
                kind TEXT NOT NULL,
                zone_id TEXT,
                source_id TEXT,
                detail TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_zone ON events(zone_id);",
        )?;
        tracing::info!("Event journal opened at {}", path.display());

        let conn = Arc::new(Mutex::new(conn));
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::task::spawn_blocking({
            let conn = Arc::clone(&conn);
            move || write_loop(conn, rx)
        });
        Ok(Self {
            conn,
            tx: Mutex::new(Some(tx)),
            writer: tokio::sync::Mutex::new(Some(writer)),
        })
    }

    /// 非阻塞入队
    pub fn record(&self, entry: JournalEntry) -> Result<(), JournalError> {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let tx = tx.as_ref().ok_or(JournalError::Closed)?;
        tx.send(JournalOp::Append(entry))
            .map_err(|_| JournalError::Closed)
    }

    /// 等待此前入队的记录全部落盘
    pub async fn flush(&self) -> Result<(), JournalError> {
        let (done_tx, done_rx) = oneshot::channel();
        {
            let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
            let tx = tx.as_ref().ok_or(JournalError::Closed)?;
            tx.send(JournalOp::Flush(done_tx))
                .map_err(|_| JournalError::Closed)?;
        }
        done_rx.await.map_err(|_| JournalError::Closed)
    }

    /// 最近 limit 条记录，新的在前
    pub async fn recent(&self, limit: usize) -> Result<Vec<JournalEntry>, JournalError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            query_recent(&conn, limit)
        })
        .await
        .map_err(|e| JournalError::Task(e.to_string()))?
    }

    /// 关闭写通道并等待后台线程退出；之后 record 返回 Closed
    pub async fn close(&self) -> Result<(), JournalError> {
        let sender = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(sender);
        if let Some(writer) = self.writer.lock().await.take() {
            writer
                .await
                .map_err(|e| JournalError::Task(e.to_string()))?;
            tracing::info!("Event journal closed");
        }
        Ok(())
    }
}

fn write_loop(conn: Arc<Mutex<Connection>>, mut rx: mpsc::UnboundedReceiver<JournalOp>) {
    while let Some(op) = rx.blocking_recv() {
        match op {
            JournalOp::Append(entry) => {
                let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
                if let Err(e) = insert(&conn, &entry) {
                    tracing::warn!("Journal write failed for {}: {}", entry.kind, e);
                }
            }
            JournalOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

fn insert(conn: &Connection, entry: &JournalEntry) -> Result<(), JournalError> {
    conn.execute(
        "INSERT INTO events (recorded_at, kind, zone_id, source_id, detail) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entry.recorded_at.to_rfc3339(),
            entry.kind,
            entry.zone_id,
            entry.source_id,
            entry.detail.to_string(),
        ],
    )?;
    Ok(())
}

fn query_recent(conn: &Connection, limit: usize) -> Result<Vec<JournalEntry>, JournalError> {
    let mut stmt = conn.prepare(
        "SELECT id, recorded_at, kind, zone_id, source_id, detail FROM events ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        let recorded_at: String = row.get(1)?;
        let detail: String = row.get(5)?;
        Ok(JournalEntry {
            id: Some(row.get(0)?),
            recorded_at: DateTime::parse_from_rfc3339(&recorded_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            kind: row.get(2)?,
            zone_id: row.get(3)?,
            source_id: row.get(4)?,
            detail: serde_json::from_str(&detail).unwrap_or(serde_json::Value::Null),
        })
    })?;
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}
