//! Metadata storage layer.
//!
//! The metadata authority knows which objects exist and who may write
//! them.  The [`store::MetaStore`] trait defines the interface;
//! [`sqlite::LocalMetaStore`] keeps credentials and descriptors in one
//! SQLite file, [`remote::RemoteMetaStore`] asks an HTTP API through the
//! circuit breaker.

pub mod remote;
pub mod sqlite;
pub mod store;
