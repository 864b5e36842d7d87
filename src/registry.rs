use crate::handle::{ChildHandle, ExitInfo};
use crate::template::Template;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};

const ID_PREFIX: &str = "srv-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServerStatus {
    Running,
    Stopped,
    Failed,
}

impl ServerStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ServerStatus::Running)
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStatus::Running => write!(f, "RUNNING"),
            ServerStatus::Stopped => write!(f, "STOPPED"),
            ServerStatus::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub id: String,
    pub name: String,
    pub template: Template,
    pub port: u16,
    pub working_dir: PathBuf,
    pub pid: u32,
    pub start_time: DateTime<Utc>,
    pub status: ServerStatus,
}

/// Reserved id; turned into a record by [`ServerRegistry::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerId(u64);

impl ServerId {
    /// Only the canonical spelling resolves: `srv-01` and `srv-+1` do not.
    pub fn parse(id: &str) -> Option<Self> {
        let parsed = ServerId(id.strip_prefix(ID_PREFIX)?.parse().ok()?);
        (parsed.to_string() == id).then_some(parsed)
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{ID_PREFIX}{}", self.0)
    }
}

pub struct NewServer {
    pub id: ServerId,
    pub name: String,
    pub template: Template,
    pub port: u16,
    pub working_dir: PathBuf,
    pub pid: u32,
    pub exited: watch::Receiver<Option<ExitInfo>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("server not found: {0}")]
    NotFound(String),
    #[error("server {0} is already stopped")]
    AlreadyStopped(String),
}

/// Outcome of [`ServerRegistry::transition`].
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(ServerRecord),
    /// The record had already left RUNNING; nothing changed.
    AlreadyTerminal(ServerStatus),
    NotFound,
}

struct Entry {
    record: ServerRecord,
    stopping: bool,
    exited: watch::Receiver<Option<ExitInfo>>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<ServerId, Entry>,
    next_id: u64,
}

/// Server records keyed by id. Every read and write takes the one lock.
#[derive(Clone, Default)]
pub struct ServerRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next id. Ids are never reused, even when the launch fails.
    pub async fn allocate_id(&self) -> ServerId {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        ServerId(inner.next_id)
    }

    pub async fn insert(&self, new: NewServer) -> ServerRecord {
        let record = ServerRecord {
            id: new.id.to_string(),
            name: new.name,
            template: new.template,
            port: new.port,
            working_dir: new.working_dir,
            pid: new.pid,
            start_time: Utc::now(),
            status: ServerStatus::Running,
        };
        let mut inner = self.inner.lock().await;
        inner.entries.insert(
            new.id,
            Entry {
                record: record.clone(),
                stopping: false,
                exited: new.exited,
            },
        );
        record
    }

    pub async fn get(&self, id: &str) -> Option<ServerRecord> {
        let key = ServerId::parse(id)?;
        let inner = self.inner.lock().await;
        inner.entries.get(&key).map(|e| e.record.clone())
    }

    /// Snapshot ordered by id.
    pub async fn list(&self) -> Vec<ServerRecord> {
        let inner = self.inner.lock().await;
        inner.entries.values().map(|e| e.record.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Ids of records still RUNNING.
    pub async fn running_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .values()
            .filter(|e| e.record.status == ServerStatus::Running)
            .map(|e| e.record.id.clone())
            .collect()
    }

    /// Claim a RUNNING record for stopping and hand back its process handle.
    ///
    /// Only one caller can hold the claim; a second stop, or a stop of a
    /// terminal record, gets `AlreadyStopped`.
    pub async fn begin_stop(&self, id: &str) -> Result<ChildHandle, RegistryError> {
        let not_found = || RegistryError::NotFound(id.to_string());
        let key = ServerId::parse(id).ok_or_else(not_found)?;
        let mut inner = self.inner.lock().await;
        let entry = inner.entries.get_mut(&key).ok_or_else(not_found)?;
        if entry.record.status.is_terminal() || entry.stopping {
            return Err(RegistryError::AlreadyStopped(id.to_string()));
        }
        entry.stopping = true;
        Ok(ChildHandle::new(entry.record.pid, entry.exited.clone()))
    }

    /// Drop a stop claim after the stop could not be carried out.
    pub async fn release_stop(&self, id: &str) {
        let Some(key) = ServerId::parse(id) else {
            return;
        };
        if let Some(entry) = self.inner.lock().await.entries.get_mut(&key) {
            entry.stopping = false;
        }
    }

    /// Move a RUNNING record to a terminal status. Later calls are no-ops.
    pub async fn transition(&self, id: &str, to: ServerStatus) -> Transition {
        let Some(key) = ServerId::parse(id) else {
            return Transition::NotFound;
        };
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.entries.get_mut(&key) else {
            return Transition::NotFound;
        };
        if entry.record.status.is_terminal() {
            return Transition::AlreadyTerminal(entry.record.status);
        }
        entry.record.status = to;
        entry.stopping = false;
        Transition::Applied(entry.record.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn insert(registry: &ServerRegistry, pid: u32) -> (ServerRecord, watch::Sender<Option<ExitInfo>>) {
        let (tx, rx) = watch::channel(None);
        let id = registry.allocate_id().await;
        let record = registry
            .insert(NewServer {
                id,
                name: format!("server-{pid}"),
                template: Template::StaticHttp,
                port: 9000,
                working_dir: PathBuf::from("/tmp"),
                pid,
                exited: rx,
            })
            .await;
        (record, tx)
    }

    #[test]
    fn test_server_id_roundtrip() {
        assert_eq!(ServerId(7).to_string(), "srv-7");
        assert_eq!(ServerId::parse("srv-7"), Some(ServerId(7)));
        assert_eq!(ServerId::parse("7"), None);
        assert_eq!(ServerId::parse("srv-x"), None);
    }

    #[tokio::test]
    async fn test_non_canonical_ids_do_not_alias() {
        let registry = ServerRegistry::new();
        let (record, _tx) = insert(&registry, 4242).await;
        assert_eq!(record.id, "srv-1");

        for alias in ["srv-01", "srv-+1", "srv-0001", "srv- 1", "SRV-1"] {
            assert_eq!(ServerId::parse(alias), None, "{alias}");
            assert!(registry.get(alias).await.is_none(), "{alias}");
            assert_eq!(
                registry.transition(alias, ServerStatus::Stopped).await,
                Transition::NotFound
            );
            assert!(matches!(
                registry.begin_stop(alias).await,
                Err(RegistryError::NotFound(_))
            ));
        }
        assert_eq!(registry.get("srv-1").await.unwrap().status, ServerStatus::Running);
    }

    #[tokio::test]
    async fn test_ids_are_monotonic_and_list_is_ordered() {
        let registry = ServerRegistry::new();
        let skipped = registry.allocate_id().await;
        let (a, _ta) = insert(&registry, 100).await;
        let (b, _tb) = insert(&registry, 101).await;
        assert_eq!(skipped.to_string(), "srv-1");
        assert_eq!(a.id, "srv-2");
        assert_eq!(b.id, "srv-3");

        let ids: Vec<String> = registry.list().await.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["srv-2", "srv-3"]);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_insert_is_running() {
        let registry = ServerRegistry::new();
        let (record, _tx) = insert(&registry, 100).await;
        assert_eq!(record.status, ServerStatus::Running);
        assert_eq!(registry.get(&record.id).await, Some(record));
        assert_eq!(registry.running_ids().await.len(), 1);
    }

    #[tokio::test]
    async fn test_transition_applies_once() {
        let registry = ServerRegistry::new();
        let (record, _tx) = insert(&registry, 100).await;

        let first = registry.transition(&record.id, ServerStatus::Stopped).await;
        assert!(matches!(first, Transition::Applied(ref r) if r.status == ServerStatus::Stopped));

        let second = registry.transition(&record.id, ServerStatus::Failed).await;
        assert_eq!(second, Transition::AlreadyTerminal(ServerStatus::Stopped));
        assert_eq!(
            registry.get(&record.id).await.unwrap().status,
            ServerStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_transition_unknown_id() {
        let registry = ServerRegistry::new();
        assert_eq!(
            registry.transition("srv-9", ServerStatus::Stopped).await,
            Transition::NotFound
        );
        assert_eq!(
            registry.transition("bogus", ServerStatus::Stopped).await,
            Transition::NotFound
        );
    }

    #[tokio::test]
    async fn test_begin_stop_claims_once() {
        let registry = ServerRegistry::new();
        let (record, _tx) = insert(&registry, 100).await;

        let handle = registry.begin_stop(&record.id).await.unwrap();
        assert_eq!(crate::handle::ProcessHandle::pid(&handle), 100);
        assert_eq!(
            registry.begin_stop(&record.id).await.unwrap_err(),
            RegistryError::AlreadyStopped(record.id.clone())
        );
    }

    #[tokio::test]
    async fn test_release_stop_allows_new_claim() {
        let registry = ServerRegistry::new();
        let (record, _tx) = insert(&registry, 100).await;

        registry.begin_stop(&record.id).await.unwrap();
        registry.release_stop(&record.id).await;
        assert!(registry.begin_stop(&record.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_begin_stop_terminal_and_missing() {
        let registry = ServerRegistry::new();
        let (record, _tx) = insert(&registry, 100).await;
        registry.transition(&record.id, ServerStatus::Stopped).await;
        assert!(matches!(
            registry.begin_stop(&record.id).await,
            Err(RegistryError::AlreadyStopped(_))
        ));
        assert!(matches!(
            registry.begin_stop("srv-42").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_transitions_yield_single_winner() {
        let registry = ServerRegistry::new();
        let (record, _tx) = insert(&registry, 100).await;

        let mut tasks = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            let id = record.id.clone();
            let to = if i % 2 == 0 {
                ServerStatus::Stopped
            } else {
                ServerStatus::Failed
            };
            tasks.push(tokio::spawn(async move { registry.transition(&id, to).await }));
        }

        let mut applied = 0;
        for task in tasks {
            if matches!(task.await.unwrap(), Transition::Applied(_)) {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
    }

    #[test]
    fn test_record_json_shape() {
        let record = ServerRecord {
            id: "srv-1".to_string(),
            name: "docs".to_string(),
            template: Template::StaticHttp,
            port: 9000,
            working_dir: PathBuf::from("/tmp/site"),
            pid: 4321,
            start_time: DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            status: ServerStatus::Running,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["workingDir"], "/tmp/site");
        assert_eq!(json["template"], "static-http");
        assert_eq!(json["status"], "RUNNING");
        assert_eq!(json["startTime"], "2024-01-01T00:00:00Z");
    }
}
