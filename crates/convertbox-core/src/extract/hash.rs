//! Multi-algorithm file digests.

use bytes::Bytes;
use md5::Md5;
use serde::{Serialize, Serializer};
use sha1::{Digest as _, Sha1};
use sha2::Sha256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 3] = [HashAlgorithm::Md5, HashAlgorithm::Sha1, HashAlgorithm::Sha256];

    /// MD5 and SHA-1 are kept for matching against older references.
    pub fn is_legacy(&self) -> bool {
        matches!(self, HashAlgorithm::Md5 | HashAlgorithm::Sha1)
    }

    pub fn digest(&self, data: &[u8]) -> String {
        match self {
            HashAlgorithm::Md5 => hex::encode(Md5::digest(data)),
            HashAlgorithm::Sha1 => hex::encode(Sha1::digest(data)),
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HashAlgorithm::Md5 => write!(f, "MD5"),
            HashAlgorithm::Sha1 => write!(f, "SHA-1"),
            HashAlgorithm::Sha256 => write!(f, "SHA-256"),
        }
    }
}

/// A computed digest, or the sentinel for one that couldn't be computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Digest {
    Hex(String),
    Unavailable,
}

impl Digest {
    pub fn as_hex(&self) -> Option<&str> {
        match self {
            Digest::Hex(hex) => Some(hex),
            Digest::Unavailable => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Digest::Hex(_))
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Digest::Hex(hex) => write!(f, "{}", hex),
            Digest::Unavailable => write!(f, "unavailable"),
        }
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HashTriple {
    pub md5: Digest,
    pub sha1: Digest,
    pub sha256: Digest,
}

impl HashTriple {
    pub fn unavailable() -> Self {
        Self {
            md5: Digest::Unavailable,
            sha1: Digest::Unavailable,
            sha256: Digest::Unavailable,
        }
    }

    pub fn get(&self, algorithm: HashAlgorithm) -> &Digest {
        match algorithm {
            HashAlgorithm::Md5 => &self.md5,
            HashAlgorithm::Sha1 => &self.sha1,
            HashAlgorithm::Sha256 => &self.sha256,
        }
    }

    pub fn is_complete(&self) -> bool {
        HashAlgorithm::ALL.iter().all(|a| self.get(*a).is_available())
    }
}

/// Compute all three digests of `data` in parallel on blocking threads.
///
/// An algorithm whose worker dies yields [`Digest::Unavailable`] without
/// affecting the others.
pub async fn hash_all(data: Bytes) -> HashTriple {
    let spawn = |algorithm: HashAlgorithm| {
        let data = data.clone();
        tokio::task::spawn_blocking(move || algorithm.digest(&data))
    };

    let (md5, sha1, sha256) = tokio::join!(
        spawn(HashAlgorithm::Md5),
        spawn(HashAlgorithm::Sha1),
        spawn(HashAlgorithm::Sha256),
    );

    let settle = |algorithm: HashAlgorithm, joined: Result<String, tokio::task::JoinError>| match joined {
        Ok(hex) => Digest::Hex(hex),
        Err(e) => {
            tracing::error!(algorithm = %algorithm, error = %e, "Hash worker failed");
            Digest::Unavailable
        }
    };

    HashTriple {
        md5: settle(HashAlgorithm::Md5, md5),
        sha1: settle(HashAlgorithm::Sha1, sha1),
        sha256: settle(HashAlgorithm::Sha256, sha256),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_input_digests() {
        let hashes = hash_all(Bytes::new()).await;
        assert_eq!(hashes.md5.as_hex(), Some("d41d8cd98f00b204e9800998ecf8427e"));
        assert_eq!(
            hashes.sha1.as_hex(),
            Some("da39a3ee5e6b4b0d3255bfef95601890afd80709")
        );
        assert_eq!(
            hashes.sha256.as_hex(),
            Some("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
        );
        assert!(hashes.is_complete());
    }

    #[tokio::test]
    async fn test_known_digests() {
        let hashes = hash_all(Bytes::from_static(b"abc")).await;
        assert_eq!(hashes.md5.as_hex(), Some("900150983cd24fb0d6963f7d28e17f72"));
        assert_eq!(
            hashes.sha1.as_hex(),
            Some("a9993e364706816aba3e25717850c26c9cd0d89d")
        );
        assert_eq!(
            hashes.sha256.as_hex(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn test_sentinel_serialization() {
        let json = serde_json::to_value(HashTriple::unavailable()).unwrap();
        assert_eq!(json["md5"], "unavailable");
        assert_eq!(json["sha256"], "unavailable");
        assert!(!HashTriple::unavailable().is_complete());
    }
}
