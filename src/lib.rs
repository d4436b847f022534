//! Server-side data-object I/O core for a federated data-grid: the L1/L3
//! descriptor state machine, resource driver dispatch, the catalog client
//! facade, cross-zone forwarding, replication, collection enumeration, and
//! recursive checksum, layered the way the teacher layers its NFS request
//! handling over a per-connection session.

pub mod catalog;
pub mod checksum;
pub mod collection;
pub mod condition;
pub mod config;
pub mod descriptor;
pub mod driver;
pub mod error;
pub mod forwarder;
pub mod io;
pub mod replication;
pub mod resource;
pub mod session;
