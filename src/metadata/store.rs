//! Metadata store trait and the records it works with.
//!
//! A metadata store answers three questions for a request: what is known
//! about an object ([`MetaStore::get`]), register it ([`MetaStore::put`]),
//! and confirm its bytes arrived ([`MetaStore::verify`]).  Methods return
//! pinned boxed futures borrowing both the store and the request context,
//! so handlers can hold stores as `Arc<dyn MetaStore>`.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

use crate::breaker::BackendError;

/// Future returned by store methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Failure kinds shared by metadata and content stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object, repository, or stored content is unknown.
    #[error("not found")]
    NotFound,

    /// Credential missing or rejected.
    #[error("unauthorized")]
    Unauthorized,

    /// Credential accepted but lacks permission.
    #[error("forbidden")]
    Forbidden,

    /// Size or content disagrees with the registered descriptor.
    #[error("object does not match its descriptor")]
    Inconsistent,

    /// This variant does not offer the operation.
    #[error("operation not supported")]
    Unsupported,

    /// I/O, transport, breaker, or unexpected backend response.
    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl From<BackendError> for StoreError {
    fn from(err: BackendError) -> Self {
        StoreError::Backend(err.into())
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Backend(err.into())
    }
}

/// An object as known to the metadata authority.
///
/// An empty `oid` means nothing is registered yet; the authority may still
/// report `writeable` so the caller can register it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    /// Content hash, hex encoded.
    #[serde(default)]
    pub oid: String,
    /// Length in bytes.
    #[serde(default)]
    pub size: u64,
    /// Whether the caller may upload content.
    #[serde(default)]
    pub writeable: bool,
    /// Key prefix inside the object store, when the authority assigns one.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path_prefix: String,
    /// Set by `put` when the oid was already registered. Never persisted.
    #[serde(skip)]
    pub existing: bool,
}

impl ObjectDescriptor {
    /// Whether the authority has a record for this object.
    pub fn is_registered(&self) -> bool {
        !self.oid.is_empty()
    }
}

/// Per-request values a store needs. Built by the handler and dropped with
/// the response.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub user: String,
    pub repo: String,
    pub oid: String,
    /// Size from the request body; zero when none was supplied.
    pub size: u64,
    /// `Authorization` header, verbatim.
    pub authorization: Option<String>,
    pub request_id: String,
    /// Upload status reported by the client on the verify callback.
    pub status: i64,
    /// Message reported by the client on the verify callback.
    pub body: String,
}

impl RequestContext {
    /// Descriptor built from the request alone.
    pub fn descriptor(&self) -> ObjectDescriptor {
        ObjectDescriptor {
            oid: self.oid.clone(),
            size: self.size,
            ..ObjectDescriptor::default()
        }
    }
}

/// Object registration and lookup.
pub trait MetaStore: Send + Sync + 'static {
    /// Look up the object named by `ctx.oid` on behalf of the caller.
    fn get<'a>(&'a self, ctx: &'a RequestContext) -> StoreFuture<'a, ObjectDescriptor>;

    /// Register `ctx.oid` with `ctx.size`. Re-registering returns the stored
    /// descriptor with `existing` set.
    fn put<'a>(&'a self, ctx: &'a RequestContext) -> StoreFuture<'a, ObjectDescriptor>;

    /// Confirm the object's content has been received.
    fn verify<'a>(&'a self, ctx: &'a RequestContext) -> StoreFuture<'a, ()>;
}
