// Cryptographic utilities

use anyhow::Result;
use sha2::{Digest, Sha256};

/// SHA-256 hex digest (lowercase).
pub fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    finalize_hex(hasher)
}

/// Finish an incremental hash (streamed downloads, copies) as a lowercase hex digest.
pub fn finalize_hex(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Compare an expected checksum (as published, any case, surrounding blanks allowed)
/// with a computed lowercase one.
pub fn verify_sha256(expected: &str, actual: &str) -> Result<()> {
    let expected = expected.trim().to_ascii_lowercase();
    if expected.len() != 64 || !expected.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(anyhow::anyhow!(
            "Published checksum isn't a SHA-256 hex digest: '{}'",
            expected
        ));
    }
    if expected != actual {
        return Err(anyhow::anyhow!(
            "Checksum mismatch (expected={}, actual={})",
            expected,
            actual
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ABC_SHA: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn sha256_hex_matches_known_vector() {
        assert_eq!(sha256_hex(b"abc"), ABC_SHA);
    }

    #[test]
    fn incremental_hash_matches_one_shot() {
        let mut hasher = Sha256::new();
        hasher.update(b"a");
        hasher.update(b"bc");
        assert_eq!(finalize_hex(hasher), ABC_SHA);
    }

    #[test]
    fn verify_accepts_uppercase_published_digest() {
        assert!(verify_sha256(&format!("  {}\n", ABC_SHA.to_uppercase()), ABC_SHA).is_ok());
    }

    #[test]
    fn verify_rejects_mismatch_and_garbage() {
        let other = sha256_hex(b"abd");
        let err = verify_sha256(ABC_SHA, &other).unwrap_err();
        assert!(err.to_string().contains("mismatch"), "{}", err);
        assert!(verify_sha256("not-a-digest", ABC_SHA).is_err());
    }
}
