//! Probe payloads: cheaply clonable immutable byte buffers.

use crate::errors::ProbeError;
use crate::format::format_bytes;
use std::fmt;
use std::sync::Arc;

/// Filler byte used for generated payloads.
pub const FILLER: u8 = b'a';

#[derive(Clone, PartialEq, Eq)]
pub struct Payload(Arc<[u8]>);

impl Payload {
    pub fn empty() -> Self {
        Self(Arc::from(Vec::new()))
    }

    /// Serialize a JSON value into a payload.
    pub fn json(value: &serde_json::Value) -> Self {
        Self::from(value.to_string().into_bytes())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Arc::from(bytes))
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self(Arc::from(s.as_bytes()))
    }
}

/// Builds filler payloads, refusing sizes beyond what the host can address.
#[derive(Debug, Clone)]
pub struct PayloadFactory {
    max_bytes: u64,
}

impl Default for PayloadFactory {
    fn default() -> Self {
        Self {
            max_bytes: Self::DEFAULT_MAX_BYTES,
        }
    }
}

impl PayloadFactory {
    /// Largest payload generated by default (1 GiB).
    pub const DEFAULT_MAX_BYTES: u64 = 1 << 30;

    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Payload of `units * unit_bytes` filler bytes.
    pub fn filler_units(&self, units: u64, unit_bytes: u64) -> Result<Payload, ProbeError> {
        let bytes = units
            .checked_mul(unit_bytes)
            .ok_or_else(|| ProbeError::GenerationFailure {
                bytes: u64::MAX,
                detail: format!("{units} units of {unit_bytes} bytes overflow"),
            })?;
        self.filler(bytes)
    }

    /// Payload of exactly `bytes` filler bytes.
    ///
    /// Sizes under 10 bytes are wrapped as `{"padding":"a.."}` so the record
    /// is still a structured value.
    pub fn filler(&self, bytes: u64) -> Result<Payload, ProbeError> {
        if bytes == 0 {
            return Ok(Payload::empty());
        }
        if bytes > self.max_bytes {
            return Err(ProbeError::GenerationFailure {
                bytes,
                detail: format!(
                    "exceeds the payload limit of {}",
                    format_bytes(self.max_bytes)
                ),
            });
        }
        if bytes < 10 {
            let padding = "a".repeat(bytes as usize);
            return Ok(Payload::json(&serde_json::json!({ "padding": padding })));
        }
        let len = usize::try_from(bytes).map_err(|_| ProbeError::GenerationFailure {
            bytes,
            detail: "size is not addressable on this platform".to_string(),
        })?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|e| ProbeError::GenerationFailure {
                bytes,
                detail: e.to_string(),
            })?;
        buf.resize(len, FILLER);
        Ok(Payload::from(buf))
    }
}
