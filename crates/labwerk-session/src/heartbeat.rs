// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Heartbeat monitor: periodic beats over the multiplexer and silent-peer
// detection.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, sleep_until};
use tracing::{debug, warn};

use labwerk_core::config::HeartbeatSettings;

use crate::mux::MuxHandle;

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatMonitor {
    interval: Duration,
    dead_after: Duration,
}

impl HeartbeatMonitor {
    pub fn new(settings: &HeartbeatSettings) -> Self {
        Self {
            interval: settings.interval(),
            dead_after: settings.dead_after(),
        }
    }

    /// Start beating on `mux`. The returned guard yields the death signal
    /// and stops the monitor when dropped.
    pub fn spawn(self, mux: MuxHandle) -> Heartbeat {
        let (death_tx, death_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(mux, death_tx));
        Heartbeat {
            death: Some(death_rx),
            task,
        }
    }

    async fn run(self, mux: MuxHandle, death: oneshot::Sender<()>) {
        let mut seen = mux.liveness();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut seq: u64 = 0;

        loop {
            let deadline = *seen.borrow_and_update() + self.dead_after;
            tokio::select! {
                _ = ticker.tick() => {
                    seq += 1;
                    if mux.send_heartbeat(seq).is_err() {
                        debug!("heartbeat writer gone; monitor stopping");
                        return;
                    }
                }
                changed = seen.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = sleep_until(deadline) => {
                    warn!(
                        silent_ms = self.dead_after.as_millis() as u64,
                        "no heartbeat from peer; declaring it dead"
                    );
                    // The receiver may already be gone during teardown.
                    let _ = death.send(());
                    return;
                }
            }
        }
    }
}

/// A running heartbeat monitor bound to one connection.
pub struct Heartbeat {
    death: Option<oneshot::Receiver<()>>,
    task: JoinHandle<()>,
}

impl Heartbeat {
    /// Resolves once when the peer is declared dead. Never resolves if the
    /// monitor stops for any other reason, or on a second call.
    pub async fn dead(&mut self) {
        match self.death.take() {
            Some(rx) => {
                if rx.await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
            None => std::future::pending::<()>().await,
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::time::Instant;

    use labwerk_core::error::Result;

    use crate::mux::{MethodHandler, Multiplexer, Payload};
    use crate::protocol::{Call, Method};

    struct Idle;

    #[async_trait]
    impl MethodHandler for Idle {
        fn methods(&self) -> Vec<Method> {
            Vec::new()
        }

        async fn handle(&self, _call: Call, _payload: Payload) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    fn settings() -> HeartbeatSettings {
        HeartbeatSettings::default()
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_declared_dead_once() {
        // The far end is held open but never speaks.
        let (ours, _theirs) = tokio::io::duplex(64 * 1024);
        let mux = Multiplexer::start(ours, Arc::new(Idle));

        let started = Instant::now();
        let mut heartbeat = HeartbeatMonitor::new(&settings()).spawn(mux.handle());
        heartbeat.dead().await;
        assert_eq!(started.elapsed(), Duration::from_millis(10_500));

        // No second signal for the same connection.
        let again = tokio::time::timeout(Duration::from_secs(60), heartbeat.dead()).await;
        assert!(again.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn answering_peer_stays_alive() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let agent = Multiplexer::start(a, Arc::new(Idle));
        let _controller = Multiplexer::start(b, Arc::new(Idle));

        let mut heartbeat = HeartbeatMonitor::new(&settings()).spawn(agent.handle());
        let outcome = tokio::time::timeout(Duration::from_secs(120), heartbeat.dead()).await;
        assert!(outcome.is_err(), "acks should keep the peer alive");
    }

    #[tokio::test(start_paused = true)]
    async fn closed_connection_does_not_count_as_death() {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let mux = Multiplexer::start(ours, Arc::new(Idle));
        let mut heartbeat = HeartbeatMonitor::new(&settings()).spawn(mux.handle());

        drop(theirs);
        drop(mux);
        let outcome = tokio::time::timeout(Duration::from_secs(60), heartbeat.dead()).await;
        assert!(outcome.is_err());
    }
}
