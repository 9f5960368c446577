//! Process-wide operating mode.
//!
//! Every periodic loop (reconciliation, scheduler, poller, reaper) consults
//! the [`ModeController`] at the top of each tick. `Stopping` ends the loop,
//! any mode other than `Running` turns the tick into a no-op. There is no way
//! back from `Stopping`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::{sync::watch, time::Interval};
use tracing::info;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperatingMode {
    Initializing,
    Starting,
    Running,
    Paused,
    Stopping,
}

impl OperatingMode {
    pub fn can_transition_to(self, next: OperatingMode) -> bool {
        use OperatingMode::*;
        match (self, next) {
            (Stopping, _) => false,
            (_, Stopping) => true,
            (Initializing, Starting) |
            (Starting, Running) |
            (Running, Paused) |
            (Paused, Running) => true,
            _ => false,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid operating mode transition: {from} -> {to}")]
pub struct ModeTransitionError {
    pub from: OperatingMode,
    pub to: OperatingMode,
}

/// What a loop should do with the tick it just woke up for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickGate {
    Run,
    Skip,
    Exit,
}

impl From<OperatingMode> for TickGate {
    fn from(mode: OperatingMode) -> Self {
        match mode {
            OperatingMode::Running => TickGate::Run,
            OperatingMode::Stopping => TickGate::Exit,
            _ => TickGate::Skip,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModeController {
    tx: Arc<watch::Sender<OperatingMode>>,
}

impl Default for ModeController {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeController {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(OperatingMode::Initializing);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> OperatingMode {
        *self.tx.borrow()
    }

    pub fn gate(&self) -> TickGate {
        self.current().into()
    }

    pub fn subscribe(&self) -> watch::Receiver<OperatingMode> {
        self.tx.subscribe()
    }

    /// Moves to `next`. Setting the current mode again is a no-op.
    pub fn transition(&self, next: OperatingMode) -> Result<(), ModeTransitionError> {
        let mut outcome = Ok(());
        let mut previous = None;
        self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(next) {
                outcome = Err(ModeTransitionError {
                    from: *current,
                    to: next,
                });
                return false;
            }
            previous = Some(*current);
            *current = next;
            true
        });
        if let Some(previous) = previous {
            info!(from = %previous, to = %next, "operating mode changed");
        }
        outcome
    }

    /// Moves to `Stopping` from whatever mode we are in.
    pub fn stop(&self) {
        // any mode may move to Stopping and Stopping -> Stopping is a no-op
        let _ = self.transition(OperatingMode::Stopping);
    }

    /// Waits for the next tick of `ticker` or for a mode change, whichever
    /// comes first, and reports whether the caller should do work now.
    pub async fn wait_tick(
        &self,
        ticker: &mut Interval,
        mode_rx: &mut watch::Receiver<OperatingMode>,
    ) -> TickGate {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = mode_rx.changed() => {
                if changed.is_err() {
                    return TickGate::Exit;
                }
            }
        }
        self.gate()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_startup_sequence() {
        let mode = ModeController::new();
        assert_eq!(mode.current(), OperatingMode::Initializing);
        assert_eq!(mode.gate(), TickGate::Skip);

        mode.transition(OperatingMode::Starting).unwrap();
        mode.transition(OperatingMode::Running).unwrap();
        assert_eq!(mode.gate(), TickGate::Run);

        mode.transition(OperatingMode::Paused).unwrap();
        assert_eq!(mode.gate(), TickGate::Skip);
        mode.transition(OperatingMode::Running).unwrap();
        assert_eq!(mode.gate(), TickGate::Run);
    }

    #[test]
    fn test_no_way_back_from_stopping() {
        let mode = ModeController::new();
        mode.stop();
        assert_eq!(mode.gate(), TickGate::Exit);
        assert_eq!(
            mode.transition(OperatingMode::Running),
            Err(ModeTransitionError {
                from: OperatingMode::Stopping,
                to: OperatingMode::Running,
            })
        );
        // stopping twice is harmless
        assert!(mode.transition(OperatingMode::Stopping).is_ok());
        assert_eq!(mode.current(), OperatingMode::Stopping);
    }

    #[test]
    fn test_rejects_skipping_startup() {
        let mode = ModeController::new();
        assert!(mode.transition(OperatingMode::Paused).is_err());
        assert!(mode.transition(OperatingMode::Running).is_err());
        assert_eq!(mode.current(), OperatingMode::Initializing);
    }

    #[test]
    fn test_mode_parses_from_str() {
        assert_eq!(
            "paused".parse::<OperatingMode>().unwrap(),
            OperatingMode::Paused
        );
        assert_eq!(OperatingMode::Stopping.to_string(), "stopping");
    }

    #[tokio::test]
    async fn test_wait_tick_wakes_on_mode_change() {
        let mode = ModeController::new();
        let mut rx = mode.subscribe();
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        // the first tick of an interval completes immediately
        ticker.tick().await;

        let stopper = mode.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            stopper.stop();
        });

        let gate = tokio::time::timeout(Duration::from_secs(5), mode.wait_tick(&mut ticker, &mut rx))
            .await
            .unwrap();
        assert_eq!(gate, TickGate::Exit);
    }
}
