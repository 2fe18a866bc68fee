//! Last-known virtual pin values.
//!
//! Written by the reader when the device reports a `vw`, and by the bus
//! handler when a bus client writes a pin. Read by the command dispatcher to
//! answer `vr` requests. Entries are never removed.

use std::{str::FromStr, time::Instant};

use bytes::Bytes;
use dashmap::DashMap;

use crate::codec::ProtocolError;

/// Number of a virtual pin.
pub type PinNumber = u16;

/// Parse a pin number from a protocol field or topic segment.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidPin`] if `raw` is not a decimal pin.
pub fn parse_pin(raw: &[u8]) -> Result<PinNumber, ProtocolError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| PinNumber::from_str(text).ok())
        .ok_or_else(|| ProtocolError::InvalidPin {
            value: String::from_utf8_lossy(raw).into_owned(),
        })
}

/// Value last written to a pin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PinState {
    /// Raw value bytes.
    pub value: Bytes,
    /// When the value was stored.
    pub updated_at: Instant,
}

/// Concurrent pin value cache.
#[derive(Debug, Default)]
pub struct PinCache {
    pins: DashMap<PinNumber, PinState>,
}

impl PinCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Store `value` as the latest value of `pin`.
    pub fn update(&self, pin: PinNumber, value: Bytes) {
        self.pins.insert(
            pin,
            PinState {
                value,
                updated_at: Instant::now(),
            },
        );
    }

    /// Latest state of `pin`, if it was ever written.
    #[must_use]
    pub fn get(&self, pin: PinNumber) -> Option<PinState> {
        self.pins.get(&pin).map(|entry| entry.value().clone())
    }

    /// Latest value of `pin`, if it was ever written.
    #[must_use]
    pub fn value(&self, pin: PinNumber) -> Option<Bytes> {
        self.pins.get(&pin).map(|entry| entry.value.clone())
    }

    /// Number of distinct pins seen.
    #[must_use]
    pub fn len(&self) -> usize { self.pins.len() }

    /// Whether no pin has been written yet.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.pins.is_empty() }
}
