//! Snapshot repository
//!
//! Persistence seam for stored schema versions. Implementations serialize
//! appends per project so that version numbers are assigned without gaps or
//! duplicates.

use crate::error::{EngineError, EngineResult};
use crate::schema::{SchemaSnapshot, VersionNumber};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Migration stored alongside a version, leading to it from its predecessor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMigration {
    pub from_version: Option<VersionNumber>,
    pub forward_sql: String,
    pub reverse_sql: String,
    pub breaking: bool,
    pub estimated_downtime_seconds: u64,
}

/// A stored version row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaVersion {
    #[serde(flatten)]
    pub snapshot: SchemaSnapshot,
    pub migration: Option<StoredMigration>,
}

impl SchemaVersion {
    pub fn version(&self) -> VersionNumber {
        self.snapshot.version
    }
}

/// What an append should do, decided against the latest stored version
#[derive(Debug, Clone, PartialEq)]
pub enum AppendDecision {
    Insert(SchemaVersion),
    Unchanged(SchemaVersion),
}

/// Decides the append given the latest version. Runs while the project is locked.
pub type VersionPlanner<'a> =
    &'a (dyn Fn(Option<&SchemaVersion>) -> EngineResult<AppendDecision> + Send + Sync);

#[async_trait]
pub trait SnapshotRepository: Send + Sync + 'static {
    /// Read the latest version, run `plan`, and insert its result, atomically per project.
    ///
    /// An insert that does not strictly follow the latest version fails with
    /// `Conflict`.
    async fn append(&self, project_id: Uuid, plan: VersionPlanner<'_>) -> EngineResult<AppendDecision>;

    async fn get(&self, project_id: Uuid, version: VersionNumber) -> EngineResult<Option<SchemaVersion>>;

    async fn latest(&self, project_id: Uuid) -> EngineResult<Option<SchemaVersion>>;

    /// Newest first
    async fn history(&self, project_id: Uuid, limit: usize) -> EngineResult<Vec<SchemaVersion>>;

    /// Oldest version whose checksum matches
    async fn find_by_checksum(
        &self,
        project_id: Uuid,
        checksum: &str,
    ) -> EngineResult<Option<SchemaVersion>>;
}

pub(crate) fn check_follows(latest: Option<&SchemaVersion>, candidate: &SchemaVersion) -> EngineResult<()> {
    if let Some(latest) = latest {
        if candidate.version() <= latest.version() {
            return Err(EngineError::Conflict(format!(
                "Version {} does not follow latest version {} of project {}",
                candidate.version(),
                latest.version(),
                candidate.snapshot.project_id
            )));
        }
    }
    Ok(())
}

type ProjectVersions = Arc<Mutex<Vec<SchemaVersion>>>;

/// In-memory repository
#[derive(Default)]
pub struct InMemorySnapshotRepository {
    /// Project ID -> versions, oldest first
    projects: RwLock<HashMap<Uuid, ProjectVersions>>,
}

impl InMemorySnapshotRepository {
    pub fn new() -> Self {
        Self::default()
    }

    async fn project(&self, project_id: Uuid) -> Option<ProjectVersions> {
        self.projects.read().await.get(&project_id).cloned()
    }

    async fn project_or_insert(&self, project_id: Uuid) -> ProjectVersions {
        if let Some(project) = self.project(project_id).await {
            return project;
        }
        self.projects.write().await.entry(project_id).or_default().clone()
    }
}

#[async_trait]
impl SnapshotRepository for InMemorySnapshotRepository {
    async fn append(&self, project_id: Uuid, plan: VersionPlanner<'_>) -> EngineResult<AppendDecision> {
        // Only this project's lock is held across planning
        let project = self.project_or_insert(project_id).await;
        let mut versions = project.lock().await;

        let decision = plan(versions.last())?;
        if let AppendDecision::Insert(ref version) = decision {
            check_follows(versions.last(), version)?;
            versions.push(version.clone());
        }
        Ok(decision)
    }

    async fn get(&self, project_id: Uuid, version: VersionNumber) -> EngineResult<Option<SchemaVersion>> {
        let Some(project) = self.project(project_id).await else {
            return Ok(None);
        };
        let versions = project.lock().await;
        Ok(versions.iter().find(|v| v.version() == version).cloned())
    }

    async fn latest(&self, project_id: Uuid) -> EngineResult<Option<SchemaVersion>> {
        let Some(project) = self.project(project_id).await else {
            return Ok(None);
        };
        let versions = project.lock().await;
        Ok(versions.last().cloned())
    }

    async fn history(&self, project_id: Uuid, limit: usize) -> EngineResult<Vec<SchemaVersion>> {
        let Some(project) = self.project(project_id).await else {
            return Ok(Vec::new());
        };
        let versions = project.lock().await;
        Ok(versions.iter().rev().take(limit).cloned().collect())
    }

    async fn find_by_checksum(
        &self,
        project_id: Uuid,
        checksum: &str,
    ) -> EngineResult<Option<SchemaVersion>> {
        let Some(project) = self.project(project_id).await else {
            return Ok(None);
        };
        let versions = project.lock().await;
        Ok(versions.iter().find(|v| v.snapshot.checksum == checksum).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, ColumnType, Table};
    use std::time::Duration;
    use tokio_test::assert_err;

    fn version(project_id: Uuid, number: VersionNumber) -> SchemaVersion {
        SchemaVersion {
            snapshot: SchemaSnapshot::new(
                project_id,
                number,
                vec![Table::new("t", vec![Column::new("id", ColumnType::Uuid).primary_key()])],
                Uuid::new_v4(),
            ),
            migration: None,
        }
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let repo = InMemorySnapshotRepository::new();
        let project = Uuid::new_v4();

        for n in [VersionNumber::new(1, 0, 0), VersionNumber::new(1, 0, 1)] {
            let v = version(project, n);
            repo.append(project, &move |_| Ok(AppendDecision::Insert(v.clone())))
                .await
                .unwrap();
        }

        let latest = repo.latest(project).await.unwrap().unwrap();
        assert_eq!(latest.version(), VersionNumber::new(1, 0, 1));

        let history = repo.history(project, 10).await.unwrap();
        assert_eq!(
            history.iter().map(|v| v.version()).collect::<Vec<_>>(),
            vec![VersionNumber::new(1, 0, 1), VersionNumber::new(1, 0, 0)]
        );
        assert_eq!(repo.history(project, 1).await.unwrap().len(), 1);

        assert!(repo.get(project, VersionNumber::new(1, 0, 0)).await.unwrap().is_some());
        assert!(repo.get(project, VersionNumber::new(9, 0, 0)).await.unwrap().is_none());
        assert!(repo.latest(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_non_increasing_insert_conflicts() {
        let repo = InMemorySnapshotRepository::new();
        let project = Uuid::new_v4();
        let first = version(project, VersionNumber::new(1, 0, 0));

        let insert = move |_: Option<&SchemaVersion>| -> EngineResult<AppendDecision> {
            Ok(AppendDecision::Insert(first.clone()))
        };
        repo.append(project, &insert).await.unwrap();
        let err = assert_err!(repo.append(project, &insert).await);
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_find_by_checksum_returns_oldest() {
        let repo = InMemorySnapshotRepository::new();
        let project = Uuid::new_v4();
        let a = version(project, VersionNumber::new(1, 0, 0));
        let b = version(project, VersionNumber::new(1, 0, 1));
        let checksum = a.snapshot.checksum.clone();

        repo.append(project, &move |_| Ok(AppendDecision::Insert(a.clone()))).await.unwrap();
        repo.append(project, &move |_| Ok(AppendDecision::Insert(b.clone()))).await.unwrap();

        let found = repo.find_by_checksum(project, &checksum).await.unwrap().unwrap();
        assert_eq!(found.version(), VersionNumber::new(1, 0, 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_other_projects_append_while_one_is_planning() {
        let repo = Arc::new(InMemorySnapshotRepository::new());
        let (slow_project, fast_project) = (Uuid::new_v4(), Uuid::new_v4());
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel::<()>();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let entered_tx = std::sync::Mutex::new(Some(entered_tx));
        let release_rx = std::sync::Mutex::new(release_rx);

        let slow = {
            let repo = repo.clone();
            let v = version(slow_project, VersionNumber::initial());
            tokio::spawn(async move {
                let planner = move |_: Option<&SchemaVersion>| -> EngineResult<AppendDecision> {
                    if let Some(tx) = entered_tx.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                    release_rx
                        .lock()
                        .unwrap()
                        .recv_timeout(Duration::from_secs(5))
                        .map_err(|_| EngineError::Internal("planner was never released".to_string()))?;
                    Ok(AppendDecision::Insert(v.clone()))
                };
                repo.append(slow_project, &planner).await
            })
        };

        entered_rx.await.unwrap();
        let other = version(fast_project, VersionNumber::initial());
        repo.append(fast_project, &move |_| Ok(AppendDecision::Insert(other.clone())))
            .await
            .unwrap();
        release_tx.send(()).unwrap();

        slow.await.unwrap().unwrap();
        assert!(repo.latest(slow_project).await.unwrap().is_some());
        assert!(repo.latest(fast_project).await.unwrap().is_some());
    }
}
