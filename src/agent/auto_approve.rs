//! Auto-approve: a flag that switches itself off after ten minutes, and the
//! task that keeps the loop moving while it is on.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::controller::{AdvanceOutcome, AgentLoop};

pub const AUTO_APPROVE_LIMIT_SECS: u32 = 600;
pub const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AutoApprove {
    enabled: bool,
    elapsed_secs: u32,
}

impl AutoApprove {
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[cfg(test)]
    pub fn elapsed_secs(&self) -> u32 {
        self.elapsed_secs
    }

    pub fn remaining_secs(&self) -> u32 {
        if self.enabled { AUTO_APPROVE_LIMIT_SECS.saturating_sub(self.elapsed_secs) } else { 0 }
    }

    /// Any external toggle restarts the clock.
    pub fn set(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.elapsed_secs = 0;
    }

    pub fn tick(&mut self) -> bool {
        if !self.enabled {
            return false;
        }
        self.elapsed_secs += 1;
        if self.elapsed_secs >= AUTO_APPROVE_LIMIT_SECS {
            info!(after_secs = self.elapsed_secs, "auto-approve expired");
            self.set(false);
        }
        self.enabled
    }
}

/// Ticks once per second until `shutdown` flips. Each tick while auto-approve
/// is on and the loop is idle starts a step; outcomes are forwarded to
/// `outcomes`.
pub async fn drive(
    agent_loop: Arc<AgentLoop>,
    mut shutdown: watch::Receiver<bool>,
    outcomes: mpsc::UnboundedSender<AdvanceOutcome>,
) {
    let mut interval = tokio::time::interval(TICK);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("auto-approve driver stopping");
                    return;
                }
                continue;
            }
        }
        if !agent_loop.tick_auto_approve()
            || agent_loop.is_busy()
            || !agent_loop.state().accepts_input()
        {
            continue;
        }
        let l = agent_loop.clone();
        let tx = outcomes.clone();
        tokio::spawn(async move {
            let outcome = l.advance(None).await;
            if outcome != AdvanceOutcome::Busy {
                let _ = tx.send(outcome);
            }
        });
    }
}
