//! Nonce - 64-bit correlation token for IPC round-trips
//!
//! Structure:
//! - Bits 63-22: Timestamp (milliseconds since custom epoch)
//! - Bits 21-12: Origin ID (0-1023, the cluster that minted it)
//! - Bits 11-0:  Sequence number (0-4095)
//!
//! Every process owns its own [`NonceGenerator`]; the origin bits keep nonces minted by
//! different clusters from colliding when the parent fans requests out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const ORIGIN_BITS: i64 = 10;
const SEQUENCE_BITS: i64 = 12;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;
const ORIGIN_MASK: i64 = (1 << ORIGIN_BITS) - 1;

/// Correlation token carried inside IPC request/reply payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Nonce(i64);

impl Nonce {
    /// Custom epoch: 2024-01-01 00:00:00 UTC (milliseconds)
    pub const EPOCH: i64 = 1_704_067_200_000;

    /// Origin reserved for the parent coordinator
    pub const PARENT_ORIGIN: u16 = 1023;

    #[inline]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn into_inner(self) -> i64 {
        self.0
    }

    /// Extract timestamp (milliseconds since Unix epoch)
    #[inline]
    pub fn timestamp(&self) -> i64 {
        (self.0 >> (ORIGIN_BITS + SEQUENCE_BITS)) + Self::EPOCH
    }

    /// When the nonce was minted
    pub fn created_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp()).unwrap_or_default()
    }

    /// Extract the origin (minting cluster)
    #[inline]
    pub fn origin(&self) -> u16 {
        ((self.0 >> SEQUENCE_BITS) & ORIGIN_MASK) as u16
    }

    /// Extract sequence number (0-4095)
    #[inline]
    pub fn sequence(&self) -> u16 {
        (self.0 & SEQUENCE_MASK) as u16
    }

    /// Parse from string representation
    pub fn parse(s: &str) -> Result<Self, NonceParseError> {
        s.parse::<i64>().map(Nonce).map_err(|_| NonceParseError::InvalidFormat)
    }

    fn compose(timestamp: i64, origin: u16, sequence: i64) -> Self {
        Self(
            ((timestamp - Self::EPOCH) << (ORIGIN_BITS + SEQUENCE_BITS))
                | (i64::from(origin) << SEQUENCE_BITS)
                | sequence,
        )
    }
}

/// Error when parsing a Nonce from string
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NonceParseError {
    #[error("invalid nonce format")]
    InvalidFormat,
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Nonce {
    type Err = NonceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Nonce::parse(s)
    }
}

// Serialized as a string so JSON consumers never lose precision
impl Serialize for Nonce {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Nonce {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct NonceVisitor;

        impl Visitor<'_> for NonceVisitor {
            type Value = Nonce;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a string or integer nonce")
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Nonce, E> {
                Ok(Nonce(value))
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Nonce, E> {
                i64::try_from(value)
                    .map(Nonce)
                    .map_err(|_| de::Error::custom("nonce out of range"))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Nonce, E> {
                Nonce::parse(value).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_any(NonceVisitor)
    }
}

/// Lock-free, strictly increasing nonce generator owned by one process
///
/// When more than 4096 nonces are requested within one millisecond the generator
/// borrows the next millisecond instead of waiting.
#[derive(Debug)]
pub struct NonceGenerator {
    origin: u16,
    last: AtomicI64,
}

impl NonceGenerator {
    /// Create a generator for the given origin (masked to 10 bits)
    pub fn new(origin: u16) -> Self {
        Self {
            origin: origin & ORIGIN_MASK as u16,
            last: AtomicI64::new(0),
        }
    }

    /// Generator for the parent coordinator
    pub fn for_parent() -> Self {
        Self::new(Nonce::PARENT_ORIGIN)
    }

    /// Generate the next nonce
    pub fn next(&self) -> Nonce {
        loop {
            let last = self.last.load(Ordering::Acquire);
            let fresh = Nonce::compose(current_timestamp(), self.origin, 0).0;

            let next = if fresh > last {
                fresh
            } else if last & SEQUENCE_MASK == SEQUENCE_MASK {
                let borrowed = Nonce(last).timestamp() + 1;
                Nonce::compose(borrowed, self.origin, 0).0
            } else {
                last + 1
            };

            if self
                .last
                .compare_exchange(last, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Nonce(next);
            }
        }
    }

    pub fn origin(&self) -> u16 {
        self.origin
    }
}

fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(Nonce::EPOCH)
}
