//! Things that happen on every tick of the bridge clock.
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Bridge, Command, ConnectionState};
use crate::catalog::Register;
use crate::registry::DeviceRegistry;

impl<R: DeviceRegistry> Bridge<R> {
    pub(super) fn tick(&mut self, now: Instant) {
        if self.is_stuck(now) {
            self.restart(now);
            return;
        }
        let refresh_due = self
            .last_refresh
            .is_none_or(|last| now.saturating_duration_since(last) >= self.settings.refresh_rate);
        if refresh_due {
            self.refresh(now);
        }
        self.mark_stale(now);
    }

    /// Whether work has been waiting on a connection that stopped making progress.
    pub(super) fn is_stuck(&self, now: Instant) -> bool {
        let busy = matches!(self.state, ConnectionState::Connecting | ConnectionState::Sending);
        busy && !self.queue.is_empty()
            && now.saturating_duration_since(self.state_since) > self.settings.stuck_timeout
    }

    /// Retry an incomplete discovery and read every bridged message once.
    fn refresh(&mut self, now: Instant) {
        self.last_refresh = Some(now);
        if !self.catalog.is_complete() {
            self.request_discovery();
        }
        let targets = self
            .catalog
            .rows()
            .filter_map(|(key, _)| {
                let entry = self.catalog.entries().find(|e| e.register.message == *key)?;
                Some(entry.register.clone())
            })
            .collect::<Vec<Register>>();
        debug!(message = "refreshing", messages = targets.len());
        for target in targets {
            self.enqueue(Command::read(target), now);
        }
    }

    fn mark_stale(&mut self, now: Instant) {
        for entry in self.catalog.entries() {
            let Some(last_seen) = entry.last_seen else {
                continue;
            };
            if now.saturating_duration_since(last_seen) <= self.settings.stale_after {
                continue;
            }
            let timed_out = self.registry.snapshot(entry.device).is_some_and(|s| s.timed_out);
            if !timed_out {
                warn!(message = "device timed out", register = %entry.register);
                self.registry.set_timed_out(entry.device, true);
            }
        }
    }
}
