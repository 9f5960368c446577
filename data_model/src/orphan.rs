use serde::{Deserialize, Serialize};
use thopter_utils::elapsed_secs;

use crate::FleetRecord;

/// Both the startup grace period and the session staleness limit.
pub const ORPHAN_THRESHOLD_MS: u64 = 2 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrphanReason {
    MachineStopped,
    NoObserver,
    StaleSession,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OrphanStatus {
    Healthy,
    /// Started recently and the observer has not reported yet.
    StartupGrace,
    Orphaned {
        reason: OrphanReason,
        last_seen: Option<u64>,
        seconds_since_last_update: Option<u64>,
    },
}

impl OrphanStatus {
    pub fn is_orphan(&self) -> bool {
        matches!(self, OrphanStatus::Orphaned { .. })
    }

    pub fn reason(&self) -> Option<OrphanReason> {
        match self {
            OrphanStatus::Orphaned { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

/// Classifies a record, first matching rule wins:
///
/// 1. machine not started: `machine_stopped`
/// 2. no session and younger than the threshold: startup grace
/// 3. no session and older: `no_observer`
/// 4. last activity older than the threshold: `stale_session`
/// 5. otherwise healthy
pub fn derive_orphan_status(record: &FleetRecord, now_ms: u64) -> OrphanStatus {
    if !record.is_started() {
        return OrphanStatus::Orphaned {
            reason: OrphanReason::MachineStopped,
            last_seen: record.session.as_ref().map(|s| s.last_activity),
            seconds_since_last_update: None,
        };
    }

    let Some(session) = &record.session else {
        if record.age_ms(now_ms) < ORPHAN_THRESHOLD_MS {
            return OrphanStatus::StartupGrace;
        }
        return OrphanStatus::Orphaned {
            reason: OrphanReason::NoObserver,
            last_seen: None,
            seconds_since_last_update: None,
        };
    };

    if now_ms.saturating_sub(session.last_activity) > ORPHAN_THRESHOLD_MS {
        return OrphanStatus::Orphaned {
            reason: OrphanReason::StaleSession,
            last_seen: Some(session.last_activity),
            seconds_since_last_update: Some(elapsed_secs(now_ms, session.last_activity)),
        };
    }

    OrphanStatus::Healthy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_objects::tests::{mock_record, mock_session},
        LifecycleState,
    };

    const NOW: u64 = 1_700_000_000_000;

    #[test]
    fn test_young_vm_without_session_is_in_grace() {
        let record = mock_record("m1", NOW - 30_000);
        let status = derive_orphan_status(&record, NOW);
        assert_eq!(status, OrphanStatus::StartupGrace);
        assert!(!status.is_orphan());
    }

    #[test]
    fn test_old_vm_without_session_has_no_observer() {
        let record = mock_record("m1", NOW - 150_000);
        let status = derive_orphan_status(&record, NOW);
        assert_eq!(status.reason(), Some(OrphanReason::NoObserver));
    }

    #[test]
    fn test_grace_boundary_is_exclusive() {
        let record = mock_record("m1", NOW - ORPHAN_THRESHOLD_MS);
        assert_eq!(
            derive_orphan_status(&record, NOW).reason(),
            Some(OrphanReason::NoObserver)
        );
    }

    #[test]
    fn test_stale_session() {
        let mut record = mock_record("m1", NOW - 3_600_000);
        record.session = Some(mock_session(NOW - 190_000));
        match derive_orphan_status(&record, NOW) {
            OrphanStatus::Orphaned {
                reason,
                last_seen,
                seconds_since_last_update,
            } => {
                assert_eq!(reason, OrphanReason::StaleSession);
                assert_eq!(last_seen, Some(NOW - 190_000));
                assert_eq!(seconds_since_last_update, Some(190));
            }
            other => panic!("expected stale session, got {:?}", other),
        }
    }

    #[test]
    fn test_recent_session_is_healthy() {
        let mut record = mock_record("m1", NOW - 3_600_000);
        record.session = Some(mock_session(NOW - 10_000));
        assert_eq!(derive_orphan_status(&record, NOW), OrphanStatus::Healthy);
    }

    #[test]
    fn test_stopped_machine_wins_over_everything() {
        let mut record = mock_record("m1", NOW - 10_000);
        record.session = Some(mock_session(NOW - 1_000));
        record.infra.lifecycle_state = LifecycleState::Suspended;
        assert_eq!(
            derive_orphan_status(&record, NOW).reason(),
            Some(OrphanReason::MachineStopped)
        );
    }
}
