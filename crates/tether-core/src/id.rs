//! Pointer identifiers and the per-endpoint allocation scheme.
//!
//! A pointer id is 26 bytes: a one-byte address tag, the 18-byte origin
//! fingerprint, a two-byte origin instance, a four-byte timestamp in
//! seconds since the runtime epoch, and a one-byte rollover counter.
//! The layout makes the origin endpoint recoverable from the id alone,
//! so a loader can route a subscription without any directory lookup.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;
use crate::error::PointerError;

/// Total length of a pointer id in bytes.
pub const POINTER_ID_LEN: usize = 26;
/// Length of the endpoint fingerprint embedded in an id.
pub const FINGERPRINT_LEN: usize = 18;

/// Runtime epoch: 2022-01-01T00:00:00Z, as seconds since the Unix epoch.
/// Timestamps inside pointer ids count seconds from here.
pub const TETHER_EPOCH_SECS: u64 = 1_640_995_200;

/// Address tag, the first byte of every pointer id. Encodes what kind of
/// endpoint allocated the id and therefore how the loader should route a
/// resolution request for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AddressTag {
    /// Anonymous machine endpoint.
    Endpoint = 0x01,
    /// Named personal endpoint.
    PersonalEndpoint = 0x02,
    /// Named institutional endpoint.
    InstitutionEndpoint = 0x03,
    /// Endpoint identified by an IPv6 address.
    Ipv6 = 0x04,
    /// Statically assigned id, not derived from any endpoint.
    Static = 0x05,
    /// Publicly resolvable id.
    Public = 0x06,
    /// Id whose value is served by a relay rather than its origin.
    Relay = 0xBC,
}

impl AddressTag {
    pub fn from_byte(byte: u8) -> Option<AddressTag> {
        match byte {
            0x01 => Some(AddressTag::Endpoint),
            0x02 => Some(AddressTag::PersonalEndpoint),
            0x03 => Some(AddressTag::InstitutionEndpoint),
            0x04 => Some(AddressTag::Ipv6),
            0x05 => Some(AddressTag::Static),
            0x06 => Some(AddressTag::Public),
            0xBC => Some(AddressTag::Relay),
            _ => None,
        }
    }

    /// Tags that are routed through a relay instead of their origin.
    pub fn is_relayed(&self) -> bool {
        matches!(self, AddressTag::Relay)
    }
}

/// Globally unique pointer identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PointerId([u8; POINTER_ID_LEN]);

impl PointerId {
    /// The all-zero id used by anonymous pointers. Anonymous pointers are
    /// never transmitted by reference, so the id carries no routing data.
    pub const ANONYMOUS: PointerId = PointerId([0; POINTER_ID_LEN]);

    pub fn from_bytes(bytes: [u8; POINTER_ID_LEN]) -> PointerId {
        PointerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; POINTER_ID_LEN] {
        &self.0
    }

    pub fn is_anonymous(&self) -> bool {
        *self == PointerId::ANONYMOUS
    }

    pub fn tag(&self) -> Option<AddressTag> {
        AddressTag::from_byte(self.0[0])
    }

    /// The 18-byte fingerprint of the allocating endpoint.
    pub fn origin_fingerprint(&self) -> [u8; FINGERPRINT_LEN] {
        let mut fp = [0u8; FINGERPRINT_LEN];
        fp.copy_from_slice(&self.0[1..1 + FINGERPRINT_LEN]);
        fp
    }

    /// The instance number of the allocating endpoint.
    pub fn origin_instance(&self) -> u16 {
        u16::from_be_bytes([self.0[19], self.0[20]])
    }

    /// Reconstructs the origin endpoint identity embedded in this id.
    pub fn origin(&self) -> Endpoint {
        Endpoint::from_fingerprint(self.origin_fingerprint(), self.origin_instance())
    }

    /// Seconds since [`TETHER_EPOCH_SECS`] at which the id was allocated,
    /// including any rollover time shift.
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[21], self.0[22], self.0[23], self.0[24]])
    }

    pub fn counter(&self) -> u8 {
        self.0[25]
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(POINTER_ID_LEN * 2);
        for byte in &self.0 {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }

    pub fn from_hex(hex: &str) -> Result<PointerId, PointerError> {
        let hex = hex.strip_prefix('$').unwrap_or(hex);
        if hex.len() != POINTER_ID_LEN * 2 {
            return Err(PointerError::InvalidId(format!(
                "expected {} hex chars, got {}",
                POINTER_ID_LEN * 2,
                hex.len()
            )));
        }
        let mut bytes = [0u8; POINTER_ID_LEN];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk)
                .map_err(|_| PointerError::InvalidId("non-ascii hex".into()))?;
            bytes[i] = u8::from_str_radix(pair, 16)
                .map_err(|_| PointerError::InvalidId(format!("bad hex pair '{pair}'")))?;
        }
        Ok(PointerId(bytes))
    }
}

impl fmt::Display for PointerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.to_hex())
    }
}

impl fmt::Debug for PointerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PointerId(${})", self.to_hex())
    }
}

/// Allocates unique pointer ids for one endpoint.
///
/// Uniqueness within a second comes from the rollover counter. When the
/// counter exhausts inside a single second the allocator advances a time
/// shift instead, borrowing timestamps from the future. The shift decays
/// once the wall clock catches up past the borrowed range.
pub struct IdAllocator {
    tag: AddressTag,
    fingerprint: [u8; FINGERPRINT_LEN],
    instance: u16,
    last_timestamp: u32,
    counter: u8,
    time_shift: u32,
}

impl IdAllocator {
    pub fn new(tag: AddressTag, endpoint: &Endpoint) -> IdAllocator {
        IdAllocator {
            tag,
            fingerprint: endpoint.fingerprint(),
            instance: endpoint.instance(),
            last_timestamp: 0,
            counter: 0,
            time_shift: 0,
        }
    }

    /// Allocates the next id. `now_secs` is wall-clock seconds since the
    /// Unix epoch; callers drive time explicitly so allocation stays
    /// deterministic under test.
    pub fn allocate(&mut self, now_secs: u64) -> PointerId {
        let ts = now_secs.saturating_sub(TETHER_EPOCH_SECS) as u32;
        if ts != self.last_timestamp {
            // Clock moved past the borrowed range, shift no longer needed.
            if ts > self.last_timestamp.saturating_add(self.time_shift) {
                self.time_shift = 0;
            }
            if self.time_shift == 0 {
                self.counter = 0;
            }
            self.last_timestamp = ts;
        }
        let effective = self.last_timestamp.wrapping_add(self.time_shift);
        let counter = self.counter;
        if self.counter == u8::MAX {
            self.time_shift += 1;
            self.counter = 0;
        } else {
            self.counter += 1;
        }

        let mut bytes = [0u8; POINTER_ID_LEN];
        bytes[0] = self.tag as u8;
        bytes[1..1 + FINGERPRINT_LEN].copy_from_slice(&self.fingerprint);
        bytes[19..21].copy_from_slice(&self.instance.to_be_bytes());
        bytes[21..25].copy_from_slice(&effective.to_be_bytes());
        bytes[25] = counter;
        PointerId(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> IdAllocator {
        IdAllocator::new(AddressTag::Endpoint, &Endpoint::new("alice"))
    }

    #[test]
    fn test_id_layout() {
        let endpoint = Endpoint::with_instance("alice", 7);
        let mut alloc = IdAllocator::new(AddressTag::PersonalEndpoint, &endpoint);
        let id = alloc.allocate(TETHER_EPOCH_SECS + 42);
        assert_eq!(id.tag(), Some(AddressTag::PersonalEndpoint));
        assert_eq!(id.origin_fingerprint(), endpoint.fingerprint());
        assert_eq!(id.origin_instance(), 7);
        assert_eq!(id.timestamp(), 42);
        assert_eq!(id.counter(), 0);
        assert_eq!(id.origin(), endpoint);
    }

    #[test]
    fn test_unique_within_second() {
        let mut alloc = allocator();
        let now = TETHER_EPOCH_SECS + 100;
        let mut seen = std::collections::HashSet::new();
        for _ in 0..256 {
            assert!(seen.insert(alloc.allocate(now)));
        }
    }

    #[test]
    fn test_counter_rollover_shifts_time() {
        let mut alloc = allocator();
        let now = TETHER_EPOCH_SECS + 100;
        let mut seen = std::collections::HashSet::new();
        // Well past one counter's worth of ids in the same second.
        for _ in 0..600 {
            assert!(seen.insert(alloc.allocate(now)));
        }
        let shifted = alloc.allocate(now);
        assert!(shifted.timestamp() > 100);
    }

    #[test]
    fn test_shift_does_not_collide_with_next_second() {
        let mut alloc = allocator();
        let now = TETHER_EPOCH_SECS + 100;
        let mut seen = std::collections::HashSet::new();
        for _ in 0..300 {
            assert!(seen.insert(alloc.allocate(now)));
        }
        // Clock advances into the borrowed second; ids must stay unique.
        for _ in 0..300 {
            assert!(seen.insert(alloc.allocate(now + 1)));
        }
    }

    #[test]
    fn test_hex_round_trip() {
        let mut alloc = allocator();
        let id = alloc.allocate(TETHER_EPOCH_SECS + 5);
        let hex = id.to_hex();
        assert_eq!(PointerId::from_hex(&hex).unwrap(), id);
        assert_eq!(PointerId::from_hex(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn test_from_hex_rejects_malformed() {
        assert!(PointerId::from_hex("abc").is_err());
        assert!(PointerId::from_hex(&"zz".repeat(POINTER_ID_LEN)).is_err());
    }

    #[test]
    fn test_anonymous_id() {
        assert!(PointerId::ANONYMOUS.is_anonymous());
        assert_eq!(PointerId::ANONYMOUS.tag(), None);
    }
}
