//! Catalog client (C6): typed facade over catalog queries and updates
//! (spec §4.5). The actual SQL schema and its high-level wrapper are out of
//! scope (spec §1) — this module defines the query/update surface every
//! other component depends on, plus an in-memory double used by this
//! crate's own test suite, grounded in how the teacher's `tests/shadow_fs`
//! integration tests exercise a full `Vfs` impl against a fixture instead
//! of a live NFS client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Replica status (spec §3 "Replica"): STALE=0, GOOD=1.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaStatus {
    Stale = 0,
    Good = 1,
}

/// A physical instantiation of a data object (spec §3 "Replica").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaMeta {
    pub object_id: i64,
    pub replica_number: i32,
    pub resource_name: String,
    pub resource_group: Option<String>,
    pub physical_path: String,
    pub size: u64,
    pub checksum: Option<String>,
    pub status: ReplicaStatus,
    pub write_locked: bool,
    pub expiry: Option<i64>,
}

/// The logical file (spec §3 "Data object").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataObjectMeta {
    pub object_id: i64,
    pub logical_path: String,
    pub owner: String,
    pub create_time: i64,
    pub modify_time: i64,
    pub logical_size: u64,
    pub checksum: Option<String>,
    pub data_type: String,
    pub collection_id: i64,
}

/// A resolved object plus its replicas, ordered GOOD-first then by replica
/// number (spec §4.5 `resolve`).
#[derive(Debug, Clone)]
pub struct ResolvedObject {
    pub meta: DataObjectMeta,
    pub replicas: Vec<ReplicaMeta>,
}

/// Patch applied by [`CatalogClient::update_replica`].
#[derive(Debug, Clone, Default)]
pub struct ReplicaUpdate {
    pub size: Option<u64>,
    pub checksum: Option<String>,
    pub status: Option<ReplicaStatus>,
    pub modify_time: Option<i64>,
}

/// Flags accepted by [`CatalogClient::query_collection`] (spec §4.5).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct QueryFlags {
    pub long_metadata: bool,
    pub very_long_metadata: bool,
    pub recur_query: bool,
    pub no_trim_replicas: bool,
}

/// One row of a [`CatalogClient::query_collection`] page: either a data
/// object or a sub-collection.
#[derive(Debug, Clone)]
pub enum CollectionRow {
    DataObject(DataObjectMeta),
    SubCollection { collection_id: i64, name: String },
}

/// Opaque continuation token for paged catalog queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContinuationToken(pub u64);

/// A special-collection association (spec §3 "Special collection"):
/// `collection_id`'s children are computed from a backing artifact instead
/// of being directly cataloged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpecialCollectionKind {
    /// Physical directory path backing the collection.
    MountedFs(String),
    /// Physical path to the backing bundle object's chosen replica.
    TarBundle(String),
    HaawBundle(String),
    /// Target collection id this collection transparently forwards to.
    LinkedColl(i64),
}

/// Typed facade over the catalog (spec §4.5). All operations execute in an
/// implicit per-request transaction; the caller commits or rolls back at
/// request boundaries via [`CatalogClient::commit`]/[`CatalogClient::rollback`].
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn resolve(&self, logical_path: &str) -> Result<ResolvedObject>;

    async fn register_replica(&self, object_id: i64, replica: ReplicaMeta) -> Result<()>;
    async fn unregister_replica(&self, object_id: i64, replica_number: i32) -> Result<()>;
    async fn update_replica(&self, object_id: i64, replica_number: i32, patch: ReplicaUpdate) -> Result<()>;

    /// Creates a brand-new data object row (used by create-on-open, spec
    /// §4.7). Returns the allocated object id.
    async fn create_object(&self, meta: DataObjectMeta) -> Result<i64>;

    async fn query_collection(
        &self,
        collection_id: i64,
        flags: QueryFlags,
        continuation: Option<ContinuationToken>,
    ) -> Result<(Vec<CollectionRow>, Option<ContinuationToken>)>;

    async fn rename_object(&self, object_id: i64, new_name: &str) -> Result<()>;
    async fn move_object(&self, object_id: i64, target_collection_id: i64) -> Result<()>;

    /// Looks up the special-collection association for a collection, if
    /// any (spec §4.11).
    async fn special_collection_for(&self, collection_id: i64) -> Result<Option<SpecialCollectionKind>>;
    /// Registers a special-collection association, replacing any existing
    /// one (spec §4.11 `mount_collection`).
    async fn mount_special_collection(&self, collection_id: i64, kind: SpecialCollectionKind) -> Result<()>;
    /// Removes a special-collection association (spec §4.11 `unmount_collection`).
    async fn unmount_special_collection(&self, collection_id: i64) -> Result<()>;

    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;
}

/// Orders replicas GOOD-first, then by replica number (spec §4.5).
pub fn order_replicas(mut replicas: Vec<ReplicaMeta>) -> Vec<ReplicaMeta> {
    replicas.sort_by_key(|r| (if r.status == ReplicaStatus::Good { 0 } else { 1 }, r.replica_number));
    replicas
}

/// In-memory catalog double. Good enough to exercise the I/O state machine,
/// replication engine, and collection cursor in tests without a real
/// catalog backend.
#[derive(Default)]
pub struct InMemoryCatalog {
    objects: Mutex<HashMap<i64, DataObjectMeta>>,
    replicas: Mutex<HashMap<i64, Vec<ReplicaMeta>>>,
    children: Mutex<HashMap<i64, Vec<CollectionRow>>>,
    special_collections: Mutex<HashMap<i64, SpecialCollectionKind>>,
    next_object_id: AtomicI64,
}

impl InMemoryCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { next_object_id: AtomicI64::new(1), ..Default::default() })
    }

    /// Seeds a collection's child rows directly, bypassing the usual
    /// create path — used to set up fixtures for collection-cursor tests.
    pub async fn seed_collection(&self, collection_id: i64, rows: Vec<CollectionRow>) {
        self.children.lock().await.insert(collection_id, rows);
    }
}

#[async_trait]
impl CatalogClient for InMemoryCatalog {
    async fn resolve(&self, logical_path: &str) -> Result<ResolvedObject> {
        let objects = self.objects.lock().await;
        let meta = objects
            .values()
            .find(|o| o.logical_path == logical_path)
            .cloned()
            .ok_or(Error::CatNoRowsFound)?;
        let replicas = self.replicas.lock().await.get(&meta.object_id).cloned().unwrap_or_default();
        Ok(ResolvedObject { meta, replicas: order_replicas(replicas) })
    }

    async fn register_replica(&self, object_id: i64, replica: ReplicaMeta) -> Result<()> {
        let mut replicas = self.replicas.lock().await;
        let entry = replicas.entry(object_id).or_default();
        if entry.iter().any(|r| r.replica_number == replica.replica_number) {
            return Err(Error::CatDuplicate(format!(
                "replica {} already exists for object {object_id}",
                replica.replica_number
            )));
        }
        entry.push(replica);
        Ok(())
    }

    async fn unregister_replica(&self, object_id: i64, replica_number: i32) -> Result<()> {
        let mut replicas = self.replicas.lock().await;
        if let Some(entry) = replicas.get_mut(&object_id) {
            entry.retain(|r| r.replica_number != replica_number);
        }
        Ok(())
    }

    async fn update_replica(&self, object_id: i64, replica_number: i32, patch: ReplicaUpdate) -> Result<()> {
        let mut replicas = self.replicas.lock().await;
        let entry = replicas.get_mut(&object_id).ok_or(Error::CatNoRowsFound)?;
        let replica = entry
            .iter_mut()
            .find(|r| r.replica_number == replica_number)
            .ok_or(Error::CatNoRowsFound)?;
        if let Some(size) = patch.size {
            replica.size = size;
        }
        if let Some(checksum) = patch.checksum {
            replica.checksum = Some(checksum);
        }
        if let Some(status) = patch.status {
            replica.status = status;
        }
        if let Some(object) = self.objects.lock().await.get_mut(&object_id) {
            if let Some(modify_time) = patch.modify_time {
                object.modify_time = modify_time;
            }
        }
        Ok(())
    }

    async fn create_object(&self, meta: DataObjectMeta) -> Result<i64> {
        let object_id = self.next_object_id.fetch_add(1, Ordering::SeqCst);
        let mut meta = meta;
        meta.object_id = object_id;
        self.objects.lock().await.insert(object_id, meta);
        Ok(object_id)
    }

    async fn query_collection(
        &self,
        collection_id: i64,
        _flags: QueryFlags,
        continuation: Option<ContinuationToken>,
    ) -> Result<(Vec<CollectionRow>, Option<ContinuationToken>)> {
        let children = self.children.lock().await;
        let rows = children.get(&collection_id).cloned().unwrap_or_default();
        if rows.is_empty() {
            return Err(Error::CatNoRowsFound);
        }
        let start = continuation.map(|t| t.0 as usize).unwrap_or(0);
        const PAGE_SIZE: usize = 2;
        let page: Vec<_> = rows.iter().skip(start).take(PAGE_SIZE).cloned().collect();
        let next = if start + PAGE_SIZE < rows.len() { Some(ContinuationToken((start + PAGE_SIZE) as u64)) } else { None };
        Ok((page, next))
    }

    async fn rename_object(&self, object_id: i64, new_name: &str) -> Result<()> {
        let mut objects = self.objects.lock().await;
        let object = objects.get_mut(&object_id).ok_or(Error::CatNoRowsFound)?;
        let parent = std::path::Path::new(&object.logical_path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        object.logical_path = format!("{parent}/{new_name}");
        Ok(())
    }

    async fn move_object(&self, object_id: i64, target_collection_id: i64) -> Result<()> {
        let mut objects = self.objects.lock().await;
        let object = objects.get_mut(&object_id).ok_or(Error::CatNoRowsFound)?;
        object.collection_id = target_collection_id;
        Ok(())
    }

    async fn special_collection_for(&self, collection_id: i64) -> Result<Option<SpecialCollectionKind>> {
        Ok(self.special_collections.lock().await.get(&collection_id).cloned())
    }

    async fn mount_special_collection(&self, collection_id: i64, kind: SpecialCollectionKind) -> Result<()> {
        self.special_collections.lock().await.insert(collection_id, kind);
        Ok(())
    }

    async fn unmount_special_collection(&self, collection_id: i64) -> Result<()> {
        self.special_collections.lock().await.remove(&collection_id);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        Ok(())
    }
}
