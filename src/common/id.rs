//! Peer identities and Kademlia keys.
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use rand::Rng;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// The size of Kademlia keys in bytes.
pub const KEY_SIZE: usize = 32;
/// Upper bound on the length of a peer id multihash.
pub const MAX_PEER_ID_SIZE: usize = 128;

/// Multihash prefix of a sha2-256 digest (code 0x12, length 32).
const SHA256_MULTIHASH_PREFIX: [u8; 2] = [0x12, 0x20];

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Identity of a peer: the multihash of its public key.
///
/// Displayed and parsed as base58btc, the way peer ids are usually written.
pub struct PeerId(Box<[u8]>);

impl PeerId {
    /// Random peer id shaped like a sha2-256 multihash.
    pub fn random() -> PeerId {
        let digest: [u8; 32] = rand::thread_rng().gen();

        let mut bytes = Vec::with_capacity(SHA256_MULTIHASH_PREFIX.len() + digest.len());
        bytes.extend_from_slice(&SHA256_MULTIHASH_PREFIX);
        bytes.extend_from_slice(&digest);

        PeerId(bytes.into())
    }

    /// Create a new PeerId from raw multihash bytes. Returns Err if `bytes` is empty
    /// or longer than [MAX_PEER_ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<PeerId> {
        let bytes = bytes.as_ref();
        if bytes.is_empty() || bytes.len() > MAX_PEER_ID_SIZE {
            return Err(Error::InvalidPeerId(bytes.len()));
        }

        Ok(PeerId(bytes.into()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// The position of this peer in the Kademlia keyspace.
    pub fn to_key(&self) -> Key {
        Key::for_bytes(&self.0)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(&self.0).into_string())
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<PeerId> {
        let bytes = bs58::decode(s).into_vec()?;

        PeerId::from_bytes(bytes)
    }
}

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia key: the sha2-256 digest of a peer id or a record key.
pub struct Key(pub [u8; KEY_SIZE]);

impl Key {
    pub fn random() -> Key {
        Key(rand::thread_rng().gen())
    }

    /// Hash arbitrary bytes into the keyspace.
    pub fn for_bytes(bytes: &[u8]) -> Key {
        Key(Sha256::digest(bytes).into())
    }

    /// XOR distance between this key and `other`, comparable with `Ord`.
    pub fn distance(&self, other: &Key) -> Key {
        let mut xor = [0; KEY_SIZE];

        for (i, byte) in xor.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Key(xor)
    }

    /// Number of leading bits shared with `other`.
    ///
    /// Common prefix length with self is [KEY_SIZE] * 8.
    pub fn common_prefix_len(&self, other: &Key) -> usize {
        for i in 0..KEY_SIZE {
            let xor = self.0[i] ^ other.0[i];

            if xor != 0 {
                return i * 8 + xor.leading_zeros() as usize;
            }
        }

        KEY_SIZE * 8
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", hex::encode(self.0))
    }
}
