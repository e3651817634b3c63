use std::io::{self, Read};

use sha2::{Digest, Sha256};

use crate::{EvidenceFileRef, TaskWindow};

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Streams `reader` through SHA-256.
pub fn sha256_reader(mut reader: impl Read) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Content checksum of a whole bundle.
///
/// Order-insensitive: entries are sorted by filename before hashing, so the same
/// set of files always yields the same value. Files without a recorded checksum
/// contribute an empty digest.
pub fn fileset_checksum(files: &[EvidenceFileRef]) -> String {
    let mut entries: Vec<(&str, &str)> = files
        .iter()
        .map(|f| (f.filename.as_str(), f.checksum_sha256.as_deref().unwrap_or("")))
        .collect();
    entries.sort_unstable();

    let mut hasher = Sha256::new();
    for (name, sum) in entries {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(sum.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Fingerprint of a listing for change detection. Covers the content digests
/// plus the declared title, source and controls of each file, so an edit to the
/// generation metadata alone still counts as a change.
pub fn evidence_fingerprint(files: &[EvidenceFileRef]) -> String {
    let mut sorted: Vec<&EvidenceFileRef> = files.iter().collect();
    sorted.sort_by(|a, b| a.filename.cmp(&b.filename));

    let mut hasher = Sha256::new();
    for f in sorted {
        let mut controls: Vec<&str> = f.controls_satisfied.iter().map(String::as_str).collect();
        controls.sort_unstable();
        for part in [
            f.filename.as_str(),
            f.checksum_sha256.as_deref().unwrap_or(""),
            f.title.as_str(),
            f.source.as_deref().unwrap_or(""),
            &controls.join(","),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Deterministic token sent with the create-submission call. Retrying with the same
/// token lets the platform return the original record instead of creating a second one.
pub fn idempotency_token(key: &TaskWindow, fileset_checksum: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.task_ref.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(key.window.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(fileset_checksum.as_bytes());
    format!("evs-{}", hex::encode(hasher.finalize()))
}
