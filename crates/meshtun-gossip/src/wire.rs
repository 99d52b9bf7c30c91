//! Gossip datagram encoding
//!
//! Messages are bincode-encoded and, when the pool has an encryption key,
//! sealed with AES-256-GCM. Every datagram carries its own random nonce, so
//! frames are independent and loss-tolerant.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use meshtun_cluster::{Member, NetworkCoordinate};

use crate::GossipError;

const NONCE_SIZE: usize = 12;

/// Everything that travels between gossip peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    /// Liveness probe. Carries the sender's own record and coordinate so the
    /// receiver learns both in one datagram.
    Ping {
        seq: u64,
        from: Member,
        coordinate: NetworkCoordinate,
    },
    /// Probe response, echoing `seq` for RTT measurement.
    Ack {
        seq: u64,
        from: Member,
        coordinate: NetworkCoordinate,
    },
    /// Anti-entropy push of the sender's full member table.
    Sync { from: Member, members: Vec<Member> },
    /// Graceful departure announcement.
    Leave { name: String, incarnation: u64 },
}

/// Seals and unseals gossip datagrams.
///
/// With no key configured, datagrams travel in the clear; that mode exists
/// for single-host development and is warned about at startup.
pub struct Sealer {
    cipher: Option<Aes256Gcm>,
}

impl Sealer {
    /// Derive the datagram key from the configured pool key string. An empty
    /// string disables sealing.
    pub fn new(pool_key: &str) -> Sealer {
        if pool_key.is_empty() {
            return Sealer { cipher: None };
        }
        let key = Sha256::digest(pool_key.as_bytes());
        Sealer {
            cipher: Some(Aes256Gcm::new(&key)),
        }
    }

    pub fn is_sealing(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn seal(&self, msg: &GossipMessage) -> Result<Vec<u8>, GossipError> {
        let plain = bincode::serialize(msg)?;

        let cipher = match &self.cipher {
            Some(cipher) => cipher,
            None => return Ok(plain),
        };

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = cipher
            .encrypt(nonce, plain.as_ref())
            .map_err(|_| GossipError::Seal)?;

        let mut frame = Vec::with_capacity(NONCE_SIZE + sealed.len());
        frame.extend_from_slice(&nonce_bytes);
        frame.extend_from_slice(&sealed);
        Ok(frame)
    }

    pub fn unseal(&self, frame: &[u8]) -> Result<GossipMessage, GossipError> {
        let plain = match &self.cipher {
            None => frame.to_vec(),
            Some(cipher) => {
                if frame.len() < NONCE_SIZE {
                    return Err(GossipError::Unseal);
                }
                let (nonce_bytes, sealed) = frame.split_at(NONCE_SIZE);
                let nonce = Nonce::from_slice(nonce_bytes);
                cipher
                    .decrypt(nonce, sealed)
                    .map_err(|_| GossipError::Unseal)?
            }
        };

        Ok(bincode::deserialize(&plain)?)
    }
}
