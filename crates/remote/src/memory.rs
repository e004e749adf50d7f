/// In-process remote with connectivity and rejection injection
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::broadcast;

use crate::query::as_text;
use crate::{
    InsertHandler, RemoteError, RemoteRepository, RemoteRow, Result, SelectQuery, Subscription,
};

#[derive(Default)]
struct State {
    tables: BTreeMap<String, Vec<RemoteRow>>,
    blobs: HashMap<String, (Vec<u8>, String)>,
    next_id: u64,
    offline: bool,
    rejected_tables: HashMap<String, String>,
    write_counts: HashMap<String, usize>,
    upload_count: usize,
}

pub struct MemoryRemote {
    state: Mutex<State>,
    inserts: broadcast::Sender<(String, RemoteRow)>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let (inserts, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(State::default()),
            inserts,
        }
    }

    /// While offline every call fails with a network error
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Refuse every write to `table` with a validation error
    pub fn reject_writes(&self, table: &str, message: &str) {
        self.state
            .lock()
            .rejected_tables
            .insert(table.to_string(), message.to_string());
    }

    pub fn accept_writes(&self, table: &str) {
        self.state.lock().rejected_tables.remove(table);
    }

    pub fn rows(&self, table: &str) -> Vec<RemoteRow> {
        self.state
            .lock()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of insert/upsert calls that reached `table`
    pub fn write_count(&self, table: &str) -> usize {
        self.state
            .lock()
            .write_counts
            .get(table)
            .copied()
            .unwrap_or(0)
    }

    pub fn upload_count(&self) -> usize {
        self.state.lock().upload_count
    }

    pub fn blob(&self, url: &str) -> Option<Vec<u8>> {
        self.state.lock().blobs.get(url).map(|(b, _)| b.clone())
    }

    /// Write a row as another device would, notifying subscribers
    pub fn seed(&self, table: &str, row: RemoteRow) -> RemoteRow {
        let stored = {
            let mut state = self.state.lock();
            Self::store_new(&mut state, table, row)
        };
        let _ = self.inserts.send((table.to_string(), stored.clone()));
        stored
    }

    fn check_online(state: &State) -> Result<()> {
        if state.offline {
            return Err(RemoteError::Network("remote unreachable (offline)".into()));
        }
        Ok(())
    }

    fn check_write(state: &mut State, table: &str) -> Result<()> {
        Self::check_online(state)?;
        *state.write_counts.entry(table.to_string()).or_default() += 1;
        if let Some(message) = state.rejected_tables.get(table) {
            return Err(RemoteError::Rejected {
                status: 400,
                message: message.clone(),
            });
        }
        Ok(())
    }

    fn store_new(state: &mut State, table: &str, mut row: RemoteRow) -> RemoteRow {
        state.next_id += 1;
        row.entry("id".to_string())
            .or_insert_with(|| Value::from(state.next_id));
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        row
    }
}

#[async_trait::async_trait]
impl RemoteRepository for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn insert(&self, table: &str, row: RemoteRow) -> Result<RemoteRow> {
        let stored = {
            let mut state = self.state.lock();
            Self::check_write(&mut state, table)?;
            Self::store_new(&mut state, table, row)
        };
        let _ = self.inserts.send((table.to_string(), stored.clone()));
        Ok(stored)
    }

    async fn upsert(&self, table: &str, on_conflict: &str, row: RemoteRow) -> Result<RemoteRow> {
        let key = row.get(on_conflict).and_then(as_text).ok_or_else(|| {
            RemoteError::Rejected {
                status: 400,
                message: format!("upsert row lacks conflict column {on_conflict}"),
            }
        })?;

        let (stored, inserted) = {
            let mut state = self.state.lock();
            Self::check_write(&mut state, table)?;
            let existing = state.tables.get_mut(table).and_then(|rows| {
                rows.iter_mut()
                    .find(|r| r.get(on_conflict).and_then(as_text).as_deref() == Some(key.as_str()))
            });
            match existing {
                Some(current) => {
                    for (k, v) in row {
                        if k != "id" {
                            current.insert(k, v);
                        }
                    }
                    (current.clone(), false)
                }
                None => (Self::store_new(&mut state, table, row), true),
            }
        };
        if inserted {
            let _ = self.inserts.send((table.to_string(), stored.clone()));
        }
        Ok(stored)
    }

    async fn select(&self, table: &str, query: &SelectQuery) -> Result<Vec<RemoteRow>> {
        let state = self.state.lock();
        Self::check_online(&state)?;
        Ok(state
            .tables
            .get(table)
            .map(|rows| query.apply(rows))
            .unwrap_or_default())
    }

    async fn upload_blob(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        let mut state = self.state.lock();
        Self::check_online(&state)?;
        let url = format!("memory://{bucket}/{path}");
        state
            .blobs
            .insert(url.clone(), (bytes, content_type.to_string()));
        state.upload_count += 1;
        Ok(url)
    }

    async fn subscribe_inserts(&self, table: &str, handler: InsertHandler) -> Result<Subscription> {
        let mut rx = self.inserts.subscribe();
        let table = table.to_string();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok((t, row)) if t == table => handler(row),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(table = %table, skipped = n, "insert feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(task))
    }
}
