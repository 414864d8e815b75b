//! Hash functions shared by cache keys, payload entry names and response verification.
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Algorithm used to hash entry names in an initialize response (`hash_used` on the wire).
///
/// A delta response can only be merged into a snapshot that was produced with the same
/// algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Djb2,
    Sha256,
    None,
}

impl HashAlgorithm {
    /// Hash a gate/config/layer name the way the server keyed it.
    pub fn hash_name(self, name: &str) -> String {
        match self {
            HashAlgorithm::Djb2 => djb2(name),
            HashAlgorithm::Sha256 => sha256_base64(name),
            HashAlgorithm::None => name.to_owned(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HashAlgorithm::Djb2 => "djb2",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::None => "none",
        }
    }
}

/// 32-bit djb2 over UTF-16 code units, rendered as an unsigned decimal string.
///
/// Must stay bit-compatible with the server and with caches written by other SDKs.
pub fn djb2(value: &str) -> String {
    djb2_u32(value).to_string()
}

fn djb2_u32(value: &str) -> u32 {
    value.encode_utf16().fold(0i32, |hash, unit| {
        hash.wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit))
    }) as u32
}

fn sha256_base64(value: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(Sha256::digest(value.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn djb2_matches_reference_values() {
        assert_eq!(djb2(""), "0");
        assert_eq!(djb2("a"), "97");
        assert_eq!(djb2("ab"), "3105");
    }

    #[test]
    fn djb2_wraps_to_unsigned() {
        // Long inputs overflow i32; the result is always rendered unsigned.
        let hash = djb2("a_very_long_gate_name_that_overflows_thirty_two_bits");
        assert!(hash.parse::<u32>().is_ok());
        assert!(!hash.starts_with('-'));
    }

    #[test]
    fn djb2_uses_utf16_code_units() {
        // U+1F600 is a surrogate pair in UTF-16: two code units, not one char.
        let expected = {
            let hi = 0xD83Di32;
            let lo = 0xDE00i32;
            let h = hi;
            (h.wrapping_shl(5).wrapping_sub(h).wrapping_add(lo)) as u32
        };
        assert_eq!(djb2("\u{1F600}"), expected.to_string());
    }

    #[test]
    fn hash_name_per_algorithm() {
        assert_eq!(HashAlgorithm::None.hash_name("my_gate"), "my_gate");
        assert_eq!(HashAlgorithm::Djb2.hash_name("a"), "97");
        assert_eq!(
            HashAlgorithm::Sha256.hash_name("hello"),
            "LPJNul+wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ="
        );
    }

    #[test]
    fn serializes_as_wire_tag() {
        assert_eq!(
            serde_json::to_string(&HashAlgorithm::Djb2).unwrap(),
            "\"djb2\""
        );
        let parsed: HashAlgorithm = serde_json::from_str("\"none\"").unwrap();
        assert_eq!(parsed, HashAlgorithm::None);
    }
}
