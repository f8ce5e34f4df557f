use sha2::{Digest, Sha256};

/// SHA-256 hex digest of a token string.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compare a presented operator token against a stored SHA-256 hex digest.
///
/// The digests are compared byte by byte without short-circuiting so the
/// comparison time does not depend on where the first mismatch is.
pub fn verify_operator_token(presented: &str, expected_sha256: &str) -> bool {
    let actual = hash_token(presented.trim());
    let expected = expected_sha256.trim().to_ascii_lowercase();
    if actual.len() != expected.len() {
        return false;
    }
    actual
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Normalise a free-text operator reason: trimmed, or the fallback when blank.
pub fn normalize_reason(reason: Option<&str>, fallback: &str) -> String {
    reason
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_hex() {
        let hash = hash_token("marshal_op_secret");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_token("marshal_op_secret"));
    }

    #[test]
    fn operator_token_matches_digest() {
        let digest = hash_token("marshal_op_secret");
        assert!(verify_operator_token("marshal_op_secret", &digest));
        assert!(verify_operator_token(" marshal_op_secret ", &digest.to_uppercase()));
        assert!(!verify_operator_token("marshal_op_other", &digest));
        assert!(!verify_operator_token("marshal_op_secret", "abc"));
    }

    #[test]
    fn normalize_reason_falls_back_on_blank() {
        assert_eq!(normalize_reason(Some("  fraud review "), "x"), "fraud review");
        assert_eq!(normalize_reason(Some("   "), "manual"), "manual");
        assert_eq!(normalize_reason(None, "manual"), "manual");
    }
}
