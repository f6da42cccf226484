//! Code snapshots for the display surface.
//!
//! Nothing here keeps state between calls; clients poll, and every snapshot
//! carries how long its codes stay valid.

use serde::Serialize;
use tracing::warn;

use crate::{store::SecretStore, totp};

/// Refresh cadence in seconds. Boundaries fall on :00 and :30 of every minute.
pub const REFRESH_PERIOD: u64 = 30;

/// Shown in place of a code when one secret cannot produce one.
pub const ERROR_TOKEN: &str = "ERROR";

pub trait Clock: Send + Sync {
    fn unix_seconds(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_seconds(&self) -> u64 {
        totp::unix_now()
    }
}

/// Always reports the same instant.
pub struct FixedClock(pub u64);

impl Clock for FixedClock {
    fn unix_seconds(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OtpEntry {
    pub id: String,
    pub name: String,
    pub note: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub otps: Vec<OtpEntry>,
    pub remaining_seconds: u64,
}

/// Seconds until the next :00 or :30 boundary, in `1..=30`.
pub fn remaining_seconds(unix_seconds: u64) -> u64 {
    let second_of_minute = unix_seconds % 60;

    REFRESH_PERIOD - second_of_minute % REFRESH_PERIOD
}

/// Current codes for every active credential, in display order.
///
/// A credential whose secret fails to generate is reported with
/// [`ERROR_TOKEN`] instead of being dropped.
pub fn snapshot(store: &SecretStore, unix_seconds: u64) -> Snapshot {
    let otps = store
        .active_records()
        .into_iter()
        .map(|record| {
            let token = match record.totp().generate(unix_seconds) {
                Ok(code) => code.to_string(),
                Err(e) => {
                    warn!(id = %record.id, name = %record.name, error = %e, "Failed to generate code");
                    ERROR_TOKEN.to_string()
                }
            };

            OtpEntry {
                id: record.id,
                name: record.name,
                note: record.note,
                token,
            }
        })
        .collect();

    Snapshot {
        otps,
        remaining_seconds: remaining_seconds(unix_seconds),
    }
}
