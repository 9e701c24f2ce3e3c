//! Workspace identifiers handed to the provisioning service.
//!
//! The id is a pure function of the subject so that every retry, resume or
//! replica asks the provisioning service for the same workspace.

use sha2::{Digest, Sha256};

/// Prefix of every derived workspace id.
pub const WORKSPACE_ID_PREFIX: &str = "ws-";

/// Number of digest bytes kept in the id (hex encoded, so twice as many chars).
const WORKSPACE_DIGEST_BYTES: usize = 16;

/// Derive the workspace id for a subject.
pub fn workspace_id_for(subject_id: &str) -> String {
    let digest = Sha256::digest(subject_id.as_bytes());
    let hex: String = digest[..WORKSPACE_DIGEST_BYTES]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    format!("{WORKSPACE_ID_PREFIX}{hex}")
}
