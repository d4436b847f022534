//! Collection cursor (C10) and special-collection admin (C12).
//!
//! The cursor state machine is spec §4.9: CLOSED -> OPENED ->
//! (DATA_OBJ_QUERIED <-> COLL_OBJ_QUERIED) -> CLOSED, with `RECUR_QUERY`
//! opening nested cursors depth-first and special-collection children
//! materialized by the driver rather than the catalog. Mount/unmount is
//! spec §4.11, grounded on `original_source/.../mcollUtil.c`.

use std::collections::VecDeque;

use crate::catalog::{CatalogClient, CollectionRow, DataObjectMeta, QueryFlags, ReplicaStatus, SpecialCollectionKind};
use crate::driver::{BundleDriver, MountedFsDriver};
use crate::error::{Error, Result};
use crate::session::SessionContext;

/// Cursor lifecycle (spec §4.9).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CursorState {
    Closed,
    Opened,
    DataObjQueried,
    CollObjQueried,
}

/// One row yielded by [`CollectionCursor::read_next`]: either a cataloged
/// row or an entry materialized straight from a special collection's
/// backing artifact (spec §4.9: "Special-collection children are
/// materialized by the driver rather than from the catalog").
#[derive(Debug, Clone)]
pub enum CollectionEntry {
    Cataloged(CollectionRow),
    Special { name: String, is_dir: bool, size: u64 },
}

/// Paged, optionally-recursive enumeration of one collection's contents
/// (spec §4.9).
pub struct CollectionCursor {
    collection_id: i64,
    flags: QueryFlags,
    state: CursorState,
    data_objects: VecDeque<DataObjectMeta>,
    sub_collections: VecDeque<(i64, String)>,
    special_entries: VecDeque<(String, bool, u64)>,
    drained_cataloged: bool,
    nested: Option<Box<CollectionCursor>>,
}

impl CollectionCursor {
    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn collection_id(&self) -> i64 {
        self.collection_id
    }
}

/// Opens a cursor over `collection_id` (spec §4.9 `open(collection, flags)`).
/// `LINKED_COLL` is followed transparently before anything is materialized,
/// so the returned cursor's `collection_id()` may differ from the one
/// requested.
#[tracing::instrument(skip(session, flags), fields(collection_id), err)]
pub async fn open(session: &SessionContext, collection_id: i64, flags: QueryFlags) -> Result<CollectionCursor> {
    open_following_links(session, collection_id, flags, 0).await
}

const MAX_LINK_DEPTH: u32 = 16;

async fn open_following_links(session: &SessionContext, collection_id: i64, flags: QueryFlags, depth: u32) -> Result<CollectionCursor> {
    if depth > MAX_LINK_DEPTH {
        return Err(Error::InvariantViolated("LINKED_COLL chain too deep"));
    }

    match session.catalog.special_collection_for(collection_id).await? {
        Some(SpecialCollectionKind::LinkedColl(target)) => {
            Box::pin(open_following_links(session, target, flags, depth + 1)).await
        }
        Some(SpecialCollectionKind::MountedFs(path)) => {
            let driver = MountedFsDriver::default();
            let entries = driver.scan(&path).await?;
            Ok(CollectionCursor {
                collection_id,
                flags,
                state: CursorState::Opened,
                data_objects: VecDeque::new(),
                sub_collections: VecDeque::new(),
                special_entries: entries.into_iter().map(|e| (e.name, e.is_dir, e.size)).collect(),
                drained_cataloged: true,
                nested: None,
            })
        }
        Some(SpecialCollectionKind::TarBundle(path)) | Some(SpecialCollectionKind::HaawBundle(path)) => {
            let driver = BundleDriver;
            let entries = driver.list_entries(&path)?;
            Ok(CollectionCursor {
                collection_id,
                flags,
                state: CursorState::Opened,
                data_objects: VecDeque::new(),
                sub_collections: VecDeque::new(),
                special_entries: entries.into_iter().map(|(name, size)| (name, false, size)).collect(),
                drained_cataloged: true,
                nested: None,
            })
        }
        None => Ok(CollectionCursor {
            collection_id,
            flags,
            state: CursorState::Opened,
            data_objects: VecDeque::new(),
            sub_collections: VecDeque::new(),
            special_entries: VecDeque::new(),
            drained_cataloged: false,
            nested: None,
        }),
    }
}

/// Pulls every row of `collection_id` into the cursor's two queues the
/// first time a cataloged cursor is advanced, following the paged
/// `query_collection` continuation chain to completion (spec §4.9:
/// "interleaving two paged queries (data objects then sub-collections at
/// each level)").
async fn drain_cataloged(session: &SessionContext, cursor: &mut CollectionCursor) -> Result<()> {
    if cursor.drained_cataloged {
        return Ok(());
    }
    let mut token = None;
    loop {
        let page = match session.catalog.query_collection(cursor.collection_id, cursor.flags, token).await {
            Ok(page) => page,
            Err(e) if e.is_no_rows() => break,
            Err(e) => return Err(e),
        };
        for row in page.0 {
            match row {
                CollectionRow::DataObject(meta) => cursor.data_objects.push_back(meta),
                CollectionRow::SubCollection { collection_id, name } => cursor.sub_collections.push_back((collection_id, name)),
            }
        }
        token = page.1;
        if token.is_none() {
            break;
        }
    }
    cursor.drained_cataloged = true;
    Ok(())
}

/// Advances the cursor and returns the next entry, or `None` once
/// exhausted (spec §4.9 `read_next`).
#[tracing::instrument(skip(session, cursor), fields(collection_id = cursor.collection_id()), err)]
pub async fn read_next(session: &SessionContext, cursor: &mut CollectionCursor) -> Result<Option<CollectionEntry>> {
    if cursor.state == CursorState::Closed {
        return Ok(None);
    }

    if let Some(nested) = cursor.nested.as_deref_mut() {
        if let Some(entry) = Box::pin(read_next(session, nested)).await? {
            return Ok(Some(entry));
        }
        cursor.nested = None;
    }

    if let Some((name, is_dir, size)) = cursor.special_entries.pop_front() {
        cursor.state = CursorState::DataObjQueried;
        return Ok(Some(CollectionEntry::Special { name, is_dir, size }));
    }

    drain_cataloged(session, cursor).await?;

    if let Some(meta) = cursor.data_objects.pop_front() {
        cursor.state = CursorState::DataObjQueried;
        return Ok(Some(CollectionEntry::Cataloged(CollectionRow::DataObject(meta))));
    }

    if let Some((sub_id, name)) = cursor.sub_collections.pop_front() {
        cursor.state = CursorState::CollObjQueried;
        if cursor.flags.recur_query {
            cursor.nested = Some(Box::new(open_following_links(session, sub_id, cursor.flags, 0).await?));
        }
        return Ok(Some(CollectionEntry::Cataloged(CollectionRow::SubCollection { collection_id: sub_id, name })));
    }

    cursor.state = CursorState::Closed;
    Ok(None)
}

pub fn close(cursor: &mut CollectionCursor) {
    cursor.state = CursorState::Closed;
}

/// Requested mount variant, carrying a bundle logical path rather than an
/// already-resolved physical one — validated by resolving it through the
/// catalog at mount time (spec §4.11).
pub enum MountRequest {
    MountedFs(String),
    TarBundle(String),
    HaawBundle(String),
    LinkedColl(i64),
}

/// Registers a special-collection association for `collection_id` (spec
/// §4.11 `mount_collection`). Mounting a bundle validates that its backing
/// object resolves to a GOOD replica in the catalog — since only data
/// objects resolve through [`CatalogClient::resolve`], this also rejects
/// an attempt to mount a collection as its own bundle source.
#[tracing::instrument(skip(session, request), fields(collection_id), err)]
pub async fn mount_collection(session: &SessionContext, collection_id: i64, request: MountRequest) -> Result<()> {
    let kind = match request {
        MountRequest::MountedFs(path) => SpecialCollectionKind::MountedFs(path),
        MountRequest::LinkedColl(target) => SpecialCollectionKind::LinkedColl(target),
        MountRequest::TarBundle(logical_path) => SpecialCollectionKind::TarBundle(resolve_bundle_physical_path(session, &logical_path).await?),
        MountRequest::HaawBundle(logical_path) => SpecialCollectionKind::HaawBundle(resolve_bundle_physical_path(session, &logical_path).await?),
    };
    session.catalog.mount_special_collection(collection_id, kind).await
}

async fn resolve_bundle_physical_path(session: &SessionContext, logical_path: &str) -> Result<String> {
    let resolved = session.catalog.resolve(logical_path).await?;
    let good = resolved.replicas.iter().find(|r| r.status == ReplicaStatus::Good).ok_or(Error::CatNoRowsFound)?;
    Ok(good.physical_path.clone())
}

#[tracing::instrument(skip(session), fields(collection_id), err)]
pub async fn unmount_collection(session: &SessionContext, collection_id: i64) -> Result<()> {
    session.catalog.unmount_special_collection(collection_id).await
}
