use core::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Observability record stored at `{base}/claims/{slot}` while a claim is
/// live.
///
/// Records are informational only. Allocation never reads them, and failing
/// to write or delete one does not fail the claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub slot: u32,
    /// Id of the session that owns the claim.
    pub owner: String,
    /// Wall-clock expiry in milliseconds since the Unix epoch.
    pub expires_at_ms: u64,
}

impl ClaimRecord {
    /// Builds a record expiring `ttl` from now on the wall clock.
    pub fn new(slot: u32, owner: impl Into<String>, ttl: Duration) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            slot,
            owner: owner.into(),
            expires_at_ms: u64::try_from(now.saturating_add(ttl).as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::CorruptedData {
            path: format!("claim record for slot {}", self.slot),
            reason: e.to_string(),
        })
    }

    pub fn from_bytes(path: &str, data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::CorruptedData {
            path: path.to_owned(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_as_flat_json() {
        let record = ClaimRecord {
            slot: 12,
            owner: "memory-session-1".into(),
            expires_at_ms: 1_735_689_602_000,
        };
        let json: serde_json::Value = serde_json::from_slice(&record.to_bytes().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "slot": 12,
                "owner": "memory-session-1",
                "expires_at_ms": 1_735_689_602_000_u64,
            })
        );
    }

    #[test]
    fn expiry_lies_ttl_in_the_future() {
        let before = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        let record = ClaimRecord::new(3, "owner", Duration::from_secs(2));
        assert!(record.expires_at_ms >= before + 2_000);
        assert!(record.expires_at_ms < before + 60_000);
    }

    #[test]
    fn garbage_is_reported_with_its_path() {
        let err = ClaimRecord::from_bytes("/ids/claims/1", b"not json").unwrap_err();
        assert!(matches!(err, Error::CorruptedData { path, .. } if path == "/ids/claims/1"));
    }
}
