//! Content storage backends.
//!
//! The [`content::ContentStore`] trait abstracts over where object bytes
//! live.  [`filesystem::FilesystemContentStore`] keeps them on local disk
//! and accepts direct uploads; [`s3::S3ContentStore`] redirects clients to
//! signed object-store URLs and never handles bytes itself.

pub mod content;
pub mod filesystem;
pub mod s3;

/// Whether `oid` is a non-empty ASCII hex string.
pub fn valid_oid(oid: &str) -> bool {
    !oid.is_empty() && oid.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Sharded relative path for an object: `/<oid[0..2]>/<oid[2..4]>/<oid>`.
///
/// Oids shorter than five characters are stored flat.
pub fn oid_path(oid: &str) -> String {
    if oid.len() < 5 || !oid.is_ascii() {
        return format!("/{oid}");
    }
    format!("/{}/{}/{}", &oid[0..2], &oid[2..4], oid)
}
