use anyhow::{anyhow, Result};
use base64::prelude::*;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::models::ClickEvent;

/// Position after the last event of a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCursor {
    pub timestamp_ms: i64,
    pub id: i64,
}

impl EventCursor {
    pub fn after(event: &ClickEvent) -> Self {
        Self {
            timestamp_ms: event.timestamp.timestamp_millis(),
            id: event.id,
        }
    }
}

/// Signs and verifies opaque paging cursors
pub struct CursorSigner {
    key: Vec<u8>,
}

impl CursorSigner {
    /// If secret is None, generates a random key (cursors won't survive restarts)
    pub fn new(secret: Option<&str>) -> Self {
        let key = match secret {
            Some(s) => s.as_bytes().to_vec(),
            None => rand::random::<[u8; 32]>().to_vec(),
        };
        Self { key }
    }

    fn mac(&self) -> Result<Hmac<Sha256>> {
        Hmac::<Sha256>::new_from_slice(&self.key).map_err(|e| anyhow!("Failed to create HMAC: {}", e))
    }

    /// Encode as `payload.signature`
    pub fn encode(&self, cursor: &EventCursor) -> Result<String> {
        let json = serde_json::to_string(cursor)?;
        let payload = BASE64_URL_SAFE_NO_PAD.encode(json.as_bytes());

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let signature_b64 = BASE64_URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{}.{}", payload, signature_b64))
    }

    pub fn decode(&self, cursor: &str) -> Result<EventCursor> {
        let (payload, signature_b64) = cursor
            .split_once('.')
            .filter(|(_, sig)| !sig.contains('.'))
            .ok_or_else(|| anyhow!("Invalid cursor format"))?;

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let expected_bytes = mac.finalize().into_bytes();

        let provided_bytes = BASE64_URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| anyhow!("Invalid cursor signature encoding"))?;

        // Constant-time comparison
        if !bool::from(expected_bytes.ct_eq(&provided_bytes[..])) {
            return Err(anyhow!("Cursor signature verification failed"));
        }

        let json_bytes = BASE64_URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| anyhow!("Invalid cursor payload encoding"))?;
        serde_json::from_slice(&json_bytes).map_err(|_| anyhow!("Invalid cursor data"))
    }
}
