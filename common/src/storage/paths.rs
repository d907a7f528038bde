//! Blob-store key layout. Every key the system writes is built here.
//!
//! ```text
//! docs/{tenant_hash}/{document_id}/{file_name}    placed, visible to the tenant's data source
//! pending/{tenant_id}/{document_id}/{file_name}   parked while the tenant's index is created
//! ```

use mime_guess::from_path;
use sha2::{Digest, Sha256};

use crate::error::AppError;

pub const DOCS_PREFIX: &str = "docs";
pub const PENDING_PREFIX: &str = "pending";

/// Hex characters of the tenant digest used in key prefixes and resource names.
pub const TENANT_HASH_LEN: usize = 16;

/// Stable, opaque short form of a tenant id.
pub fn tenant_hash(tenant_id: &str) -> String {
    let digest = Sha256::digest(tenant_id.as_bytes());
    let mut hex = String::with_capacity(TENANT_HASH_LEN);
    for byte in digest.iter().take(TENANT_HASH_LEN / 2) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Characters the blob store percent-encodes inside a key segment. A tenant id
/// containing one would be listed back under a different prefix than it was
/// written with.
const ENCODED_KEY_CHARS: &[char] = &[
    '/', '\\', '{', '}', '^', '%', '`', '[', ']', '"', '<', '>', '~', '#', '|', '*', '?',
];

/// Tenant ids become a key segment under `pending/`, so they must be a single
/// printable segment that the blob store keeps verbatim.
pub fn validate_tenant_id(tenant_id: &str) -> Result<(), AppError> {
    if tenant_id.trim().is_empty() {
        return Err(AppError::Validation("tenant_id is required".to_string()));
    }
    if tenant_id.contains(ENCODED_KEY_CHARS) || tenant_id.chars().any(char::is_control) {
        return Err(AppError::Validation(format!(
            "tenant_id contains unsupported characters: {tenant_id:?}"
        )));
    }
    if tenant_id == "." || tenant_id == ".." {
        return Err(AppError::Validation("tenant_id is not a valid key segment".to_string()));
    }
    Ok(())
}

/// Replaces anything outside `[A-Za-z0-9_.-]` with `_`, keeping the extension.
pub fn sanitize_file_name(file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name)
        .trim();

    let sanitized: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.chars().all(|c| c == '.' || c == '_') {
        "document".to_string()
    } else {
        sanitized
    }
}

/// Prefix the tenant's data source is scoped to.
pub fn tenant_docs_prefix(tenant_hash: &str) -> String {
    format!("{DOCS_PREFIX}/{tenant_hash}/")
}

pub fn final_document_key(tenant_hash: &str, document_id: &str, file_name: &str) -> String {
    format!(
        "{DOCS_PREFIX}/{tenant_hash}/{document_id}/{}",
        sanitize_file_name(file_name)
    )
}

pub fn pending_tenant_prefix(tenant_id: &str) -> String {
    format!("{PENDING_PREFIX}/{tenant_id}/")
}

pub fn pending_document_key(tenant_id: &str, document_id: &str, file_name: &str) -> String {
    format!(
        "{PENDING_PREFIX}/{tenant_id}/{document_id}/{}",
        sanitize_file_name(file_name)
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingKey {
    pub document_id: String,
    pub file_name: String,
}

/// Splits a pending key belonging to `tenant_id`. Keys of other tenants or with
/// a different shape yield `None`.
pub fn parse_pending_key(tenant_id: &str, key: &str) -> Option<PendingKey> {
    let rest = key.strip_prefix(&pending_tenant_prefix(tenant_id))?;
    let (document_id, file_name) = rest.split_once('/')?;
    if document_id.is_empty() || file_name.is_empty() || file_name.contains('/') {
        return None;
    }
    Some(PendingKey {
        document_id: document_id.to_string(),
        file_name: file_name.to_string(),
    })
}

/// Whether `key` is a placed document key under the tenant's prefix.
pub fn is_tenant_document_key(tenant_hash: &str, key: &str) -> bool {
    key.strip_prefix(&tenant_docs_prefix(tenant_hash))
        .and_then(|rest| rest.split_once('/'))
        .is_some_and(|(doc, file)| !doc.is_empty() && !file.is_empty() && !file.contains('/'))
}

/// Content type guessed from the file extension.
pub fn content_type_for(file_name: &str) -> String {
    from_path(file_name)
        .first_or(mime::APPLICATION_OCTET_STREAM)
        .to_string()
}
