//! Session reports pushed by the observer running inside each VM.
//!
//! [`TelemetryPayload`] is the loose wire shape; [`TelemetryUpdate`] is what
//! the store accepts. Conversion validates the whole payload up front so a
//! malformed report is rejected as a unit and never partially applied.

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::{ActivityState, ProcessState, SessionState, TriggerContext, VmId};

pub const MAX_SCREEN_DUMP_BYTES: usize = 256 * 1024;

/// Epoch milliseconds or an RFC 3339 string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    Millis(u64),
    Text(String),
}

impl WireTimestamp {
    fn to_epoch_ms(&self, field: &'static str) -> Result<u64, TelemetryValidationError> {
        match self {
            WireTimestamp::Millis(ms) => Ok(*ms),
            WireTimestamp::Text(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .and_then(|dt| u64::try_from(dt.timestamp_millis()).ok())
                .ok_or_else(|| TelemetryValidationError::InvalidTimestamp {
                    field,
                    value: text.clone(),
                }),
        }
    }
}

impl From<u64> for WireTimestamp {
    fn from(ms: u64) -> Self {
        WireTimestamp::Millis(ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryPayload {
    pub vm_id: String,
    pub activity_state: String,
    pub process_state: String,
    #[serde(default)]
    pub screen_dump: String,
    pub last_activity: WireTimestamp,
    pub timestamp: WireTimestamp,
    #[serde(default)]
    pub idle_since: Option<WireTimestamp>,
    #[serde(default)]
    pub trigger_context: Option<TriggerContext>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TelemetryValidationError {
    #[error("vmId must not be empty")]
    EmptyVmId,

    #[error("unknown activityState: {0}")]
    InvalidActivityState(String),

    #[error("unknown processState: {0}")]
    InvalidProcessState(String),

    #[error("invalid timestamp in {field}: {value}")]
    InvalidTimestamp { field: &'static str, value: String },

    #[error("screenDump is {size} bytes, limit is {max}")]
    ScreenDumpTooLarge { size: usize, max: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryUpdate {
    pub vm_id: VmId,
    pub session: SessionState,
    pub trigger: Option<TriggerContext>,
}

impl TryFrom<TelemetryPayload> for TelemetryUpdate {
    type Error = TelemetryValidationError;

    fn try_from(payload: TelemetryPayload) -> Result<Self, Self::Error> {
        let vm_id = payload.vm_id.trim();
        if vm_id.is_empty() {
            return Err(TelemetryValidationError::EmptyVmId);
        }
        let activity_state = payload
            .activity_state
            .parse::<ActivityState>()
            .map_err(|_| TelemetryValidationError::InvalidActivityState(payload.activity_state.clone()))?;
        let process_state = payload
            .process_state
            .parse::<ProcessState>()
            .map_err(|_| TelemetryValidationError::InvalidProcessState(payload.process_state.clone()))?;
        if payload.screen_dump.len() > MAX_SCREEN_DUMP_BYTES {
            return Err(TelemetryValidationError::ScreenDumpTooLarge {
                size: payload.screen_dump.len(),
                max: MAX_SCREEN_DUMP_BYTES,
            });
        }
        let last_activity = payload.last_activity.to_epoch_ms("lastActivity")?;
        let reported_at = payload.timestamp.to_epoch_ms("timestamp")?;
        let idle_since = payload
            .idle_since
            .as_ref()
            .map(|ts| ts.to_epoch_ms("idleSince"))
            .transpose()?;

        Ok(TelemetryUpdate {
            vm_id: VmId::from(vm_id),
            session: SessionState {
                activity_state,
                process_state,
                last_activity,
                idle_since,
                screen_dump: payload.screen_dump,
                reported_at,
            },
            trigger: payload.trigger_context,
        })
    }
}
