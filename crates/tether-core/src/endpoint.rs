//! Endpoint identities.
//!
//! An endpoint is a participant in the pointer network: the origin of a
//! pointer, a subscriber, or a relay. Identity is the 18-byte fingerprint
//! plus an instance number; the human-readable name is advisory and never
//! part of equality.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::id::FINGERPRINT_LEN;

/// Identity of one endpoint in the network.
#[derive(Clone, Serialize, Deserialize)]
pub struct Endpoint {
    name: Option<String>,
    fingerprint: [u8; FINGERPRINT_LEN],
    instance: u16,
}

impl Endpoint {
    /// The local placeholder identity: a pointer whose origin is `LOCAL`
    /// has not been attached to any network identity yet.
    pub const LOCAL: Endpoint = Endpoint {
        name: None,
        fingerprint: [0; FINGERPRINT_LEN],
        instance: 0,
    };

    /// Creates an endpoint from a name, deriving the fingerprint.
    pub fn new(name: &str) -> Endpoint {
        Endpoint::with_instance(name, 0)
    }

    pub fn with_instance(name: &str, instance: u16) -> Endpoint {
        let digest = Sha256::digest(name.as_bytes());
        let mut fingerprint = [0u8; FINGERPRINT_LEN];
        fingerprint.copy_from_slice(&digest[..FINGERPRINT_LEN]);
        Endpoint {
            name: Some(name.to_string()),
            fingerprint,
            instance,
        }
    }

    /// Reconstructs an endpoint identity from raw id components. The name
    /// is unknown at this point; equality only needs the fingerprint.
    pub fn from_fingerprint(fingerprint: [u8; FINGERPRINT_LEN], instance: u16) -> Endpoint {
        Endpoint {
            name: None,
            fingerprint,
            instance,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn fingerprint(&self) -> [u8; FINGERPRINT_LEN] {
        self.fingerprint
    }

    pub fn instance(&self) -> u16 {
        self.instance
    }

    pub fn is_local(&self) -> bool {
        self.fingerprint == [0; FINGERPRINT_LEN]
    }

    /// The same identity without the instance number, used when any
    /// instance of the endpoint is an acceptable peer.
    pub fn main(&self) -> Endpoint {
        Endpoint {
            name: self.name.clone(),
            fingerprint: self.fingerprint,
            instance: 0,
        }
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Endpoint) -> bool {
        self.fingerprint == other.fingerprint && self.instance == other.instance
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fingerprint.hash(state);
        self.instance.hash(state);
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) if self.instance == 0 => write!(f, "@{name}"),
            Some(name) => write!(f, "@{name}/{}", self.instance),
            None => {
                write!(f, "@")?;
                for byte in &self.fingerprint[..6] {
                    write!(f, "{:02x}", byte)?;
                }
                if self.instance != 0 {
                    write!(f, "/{}", self.instance)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({self})")
    }
}

/// Capabilities an endpoint can be trusted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrustedPermission {
    /// May serve pointer values when the origin is unreachable.
    FallbackPointerSource,
    /// May relay updates on behalf of other endpoints.
    RelaySource,
}
