//! Content checksums for sync record payloads

use sha2::{Digest, Sha256};

use crate::models::EntityPayload;

/// Checksum of a record payload: lowercase hex sha-256 of its JSON form
///
/// DELETE records carry no payload and hash the empty string, so every
/// record has a stable, comparable checksum.
#[must_use]
pub fn payload_checksum(data: Option<&EntityPayload>) -> String {
    let bytes = data
        .map(|payload| serde_json::to_vec(payload).unwrap_or_default())
        .unwrap_or_default();
    hex(&Sha256::digest(&bytes))
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(
        String::with_capacity(bytes.len() * 2),
        |mut out, byte| {
            let _ = write!(out, "{byte:02x}");
            out
        },
    )
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::models::{EntityPayload, TaskPayload};

    fn task(title: &str) -> EntityPayload {
        EntityPayload::Task(TaskPayload {
            title: title.to_string(),
            notes: None,
            done: false,
            project_id: None,
            due_at: None,
        })
    }

    #[test]
    fn checksum_is_deterministic() {
        let a = payload_checksum(Some(&task("hello")));
        let b = payload_checksum(Some(&task("hello")));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn checksum_differs_per_content() {
        assert_ne!(
            payload_checksum(Some(&task("hello"))),
            payload_checksum(Some(&task("goodbye")))
        );
    }

    #[test]
    fn delete_checksum_is_empty_string_hash() {
        // sha256 of the empty string
        assert_eq!(
            payload_checksum(None),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
