//! Zookie codec.
//!
//! A zookie is an opaque, URL-safe token naming a zone and a revision in that
//! zone. Callers hand it back as `min_zookie` to ask for a read no older than
//! the write that produced it. Nothing outside this module parses the format.
//!
//! Layout before encoding: `v1:{zone_id}:{revision}:{checksum}` where the
//! checksum is the first 8 bytes of SHA-256 over `{zone_id}:{revision}`, hex
//! encoded. The checksum makes truncated or mutated tokens fail loudly instead
//! of decoding to a different zone or revision.

use crate::error::RebacError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

const VERSION: &str = "v1";
const CHECKSUM_BYTES: usize = 8;

/// Opaque consistency token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Zookie(String);

impl Zookie {
    pub fn encode(zone_id: &str, revision: u64) -> Self {
        let payload = format!(
            "{}:{}:{}:{}",
            VERSION,
            zone_id,
            revision,
            checksum(zone_id, revision)
        );
        Self(URL_SAFE_NO_PAD.encode(payload.as_bytes()))
    }

    /// Decode a token into `(zone_id, revision)`.
    pub fn decode(token: &str) -> Result<(String, u64), RebacError> {
        if token.is_empty() {
            return Err(RebacError::InvalidZookie("empty token".to_string()));
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(token.as_bytes())
            .map_err(|e| RebacError::InvalidZookie(format!("bad encoding: {}", e)))?;
        let payload = String::from_utf8(bytes)
            .map_err(|_| RebacError::InvalidZookie("payload is not UTF-8".to_string()))?;

        let rest = payload
            .strip_prefix(VERSION)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(|| RebacError::InvalidZookie("unknown token version".to_string()))?;

        // Zone ids may contain ':', so peel fields off the right.
        let mut fields = rest.rsplitn(3, ':');
        let digest = fields.next();
        let revision = fields.next();
        let zone_id = fields.next();
        let (Some(zone_id), Some(revision), Some(digest)) = (zone_id, revision, digest) else {
            return Err(RebacError::InvalidZookie("wrong number of fields".to_string()));
        };

        if revision.is_empty() || !revision.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RebacError::InvalidZookie(format!(
                "revision '{}' is not numeric",
                revision
            )));
        }
        let revision: u64 = revision
            .parse()
            .map_err(|e| RebacError::InvalidZookie(format!("revision out of range: {}", e)))?;

        if digest != checksum(zone_id, revision) {
            return Err(RebacError::InvalidZookie("checksum mismatch".to_string()));
        }

        Ok((zone_id.to_string(), revision))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Zookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn checksum(zone_id: &str, revision: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(zone_id.as_bytes());
    hasher.update(b":");
    hasher.update(revision.to_string().as_bytes());
    hasher
        .finalize()
        .iter()
        .take(CHECKSUM_BYTES)
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_round_trip() {
        let token = Zookie::encode("acme", 42);
        assert_eq!(Zookie::decode(token.as_str()).unwrap(), ("acme".to_string(), 42));
    }

    #[test]
    fn test_zone_with_separators_round_trips() {
        let token = Zookie::encode("org:acme:eu", 0);
        assert_eq!(
            Zookie::decode(token.as_str()).unwrap(),
            ("org:acme:eu".to_string(), 0)
        );
    }

    #[test]
    fn test_rejects_garbage() {
        for bad in ["", "!!!", "bm90LWEtem9va2ll", "djE6YWNtZTp4OjA"] {
            assert!(
                matches!(Zookie::decode(bad), Err(RebacError::InvalidZookie(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_rejects_non_numeric_revision() {
        let forged = URL_SAFE_NO_PAD.encode(format!("v1:acme:12a:{}", checksum("acme", 12)));
        assert!(matches!(
            Zookie::decode(&forged),
            Err(RebacError::InvalidZookie(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_round_trip(zone in "[a-zA-Z0-9_:./-]{0,40}", revision in any::<u64>()) {
            let token = Zookie::encode(&zone, revision);
            prop_assert_eq!(Zookie::decode(token.as_str()).unwrap(), (zone, revision));
        }

        #[test]
        fn prop_truncation_is_rejected(zone in "[a-z]{1,20}", revision in any::<u64>(), cut in 1usize..8) {
            let token = Zookie::encode(&zone, revision).into_string();
            let truncated = &token[..token.len() - cut];
            prop_assert!(Zookie::decode(truncated).is_err());
        }

        #[test]
        fn prop_single_char_mutation_is_rejected(
            zone in "[a-z]{1,20}",
            revision in any::<u64>(),
            index in any::<prop::sample::Index>(),
            replacement in prop::sample::select(vec!['A', 'z', '0', '_', '-']),
        ) {
            let token = Zookie::encode(&zone, revision).into_string();
            let position = index.index(token.len());
            let mut chars: Vec<char> = token.chars().collect();
            prop_assume!(chars[position] != replacement);
            chars[position] = replacement;
            let mutated: String = chars.into_iter().collect();
            prop_assert!(Zookie::decode(&mutated).is_err());
        }
    }
}
