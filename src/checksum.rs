//! Recursive checksum (C11, supplemented): digest every data object under a
//! collection, tolerating per-object failures (spec §4.10).
//!
//! Grounded in `original_source/iRODS/lib/core/src/chksumUtil.c`, which
//! walks a collection computing a checksum per data object and keeps going
//! past individual failures rather than aborting the whole run.

use sha2::{Digest, Sha256};

use crate::catalog::{CollectionRow, DataObjectMeta, QueryFlags};
use crate::collection::{self, CollectionEntry};
use crate::condition::ConditionBag;
use crate::driver::OpenFlags;
use crate::error::{Error, Result};
use crate::io::{self, OpenRequest};
use crate::session::SessionContext;

pub struct ChecksumRequest {
    pub collection_id: i64,
    pub recursive: bool,
    pub owner: String,
    pub default_resource: String,
}

#[derive(Debug, Clone)]
pub struct ObjectChecksum {
    pub logical_path: String,
    pub checksum: String,
}

/// Aggregate result of [`checksum_collection`]: the first-failure-wins
/// policy from spec §9's Open Question resolution applies per object, not
/// across the whole traversal, so every readable object still gets a
/// checksum even when a sibling fails (spec §8 scenario S6).
#[derive(Debug, Default)]
pub struct ChecksumOutcome {
    pub checksums: Vec<ObjectChecksum>,
    pub errors: Vec<(String, Error)>,
}

impl ChecksumOutcome {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Walks `collection_id` (recursively if `recursive`) and checksums every
/// data object found, accumulating failures instead of aborting (spec
/// §4.10).
#[tracing::instrument(skip(session, req), fields(collection_id = req.collection_id, recursive = req.recursive), err)]
pub async fn checksum_collection(session: &mut SessionContext, req: ChecksumRequest) -> Result<ChecksumOutcome> {
    let flags = QueryFlags { recur_query: req.recursive, ..Default::default() };
    let mut cursor = collection::open(session, req.collection_id, flags).await?;
    let mut outcome = ChecksumOutcome::default();

    while let Some(entry) = collection::read_next(session, &mut cursor).await? {
        let meta = match entry {
            CollectionEntry::Cataloged(CollectionRow::DataObject(meta)) => meta,
            CollectionEntry::Cataloged(CollectionRow::SubCollection { .. }) => continue,
            CollectionEntry::Special { .. } => continue,
        };
        let logical_path = meta.logical_path.clone();
        match checksum_one(session, &meta, &req).await {
            Ok(digest) => outcome.checksums.push(ObjectChecksum { logical_path, checksum: digest }),
            Err(e) => outcome.errors.push((logical_path, e)),
        }
    }

    Ok(outcome)
}

async fn checksum_one(session: &mut SessionContext, meta: &DataObjectMeta, req: &ChecksumRequest) -> Result<String> {
    let l1 = io::open(
        session,
        OpenRequest {
            logical_path: meta.logical_path.clone(),
            flags: OpenFlags::read_only(),
            cond: ConditionBag::new(),
            mode: 0,
            owner: req.owner.clone(),
            data_type: meta.data_type.clone(),
            default_resource: req.default_resource.clone(),
        },
    )
    .await?;

    let digest = stream_digest(session, l1).await;
    let close_result = io::close(session, l1).await;
    match digest {
        Ok(d) => {
            close_result?;
            Ok(d)
        }
        Err(e) => Err(e),
    }
}

async fn stream_digest(session: &mut SessionContext, l1: i32) -> Result<String> {
    const CHUNK: usize = 8192;
    let mut hasher = Sha256::new();
    loop {
        let chunk = io::read(session, l1, CHUNK).await?;
        if chunk.is_empty() {
            break;
        }
        hasher.update(&chunk);
    }
    Ok(format!("sha2:{:x}", hasher.finalize()))
}
