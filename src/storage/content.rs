//! Content store trait.
//!
//! A content store either serves bytes itself ([`ContentGet::Stream`]) or
//! points the client at a location that does ([`ContentGet::Redirect`]).
//! Stores that cannot take uploads through this server report so via
//! [`ContentStore::accepts_uploads`] and hand out signed upload links
//! instead.

use std::collections::BTreeMap;

use axum::body::Body;
use serde::Serialize;

use crate::metadata::store::{ObjectDescriptor, StoreFuture};

/// A hypermedia link: where to go, and the headers to replay verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Link {
    pub href: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub header: BTreeMap<String, String>,
}

impl Link {
    /// A link with no headers.
    pub fn new(href: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            header: BTreeMap::new(),
        }
    }

    /// Add a header the client must send when following the link.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.header.insert(name.to_string(), value.into());
        self
    }
}

/// Result of [`ContentStore::get`].
pub enum ContentGet {
    /// Send the client elsewhere.
    Redirect(String),
    /// Serve these bytes.
    Stream { body: Body, size: u64 },
}

/// Byte placement and retrieval.
pub trait ContentStore: Send + Sync + 'static {
    /// Locate the object's bytes. `NotFound` when a local store has none.
    fn get<'a>(&'a self, desc: &'a ObjectDescriptor) -> StoreFuture<'a, ContentGet>;

    /// Store `body` as the object's content. The bytes must match `desc`.
    fn put<'a>(&'a self, desc: &'a ObjectDescriptor, body: Body) -> StoreFuture<'a, ()>;

    /// Whether the object's bytes are present.
    fn exists<'a>(&'a self, desc: &'a ObjectDescriptor) -> StoreFuture<'a, bool>;

    /// Whether `put` is supported.
    fn accepts_uploads(&self) -> bool;

    /// Link the client follows to upload content. `object_href` is this
    /// server's URL for the object; `authorization` is the caller's credential.
    fn upload_link(
        &self,
        desc: &ObjectDescriptor,
        object_href: &str,
        authorization: Option<&str>,
    ) -> Link;
}
