// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Session manager: connect, serve, detect death, back off, reconnect.
//
// Idle -> Connecting -> Connected -> Dead -> Connecting -> ...
//
// Only the very first failed connect of the process is retried at once;
// every later failure, and every lost connection, waits for the backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use labwerk_core::config::{AgentConfig, BackoffSettings, HeartbeatSettings};
use labwerk_core::error::LabwerkError;
use labwerk_core::types::SessionState;
use labwerk_transport::{BoxedStream, TransportProvider};

use crate::backoff::Backoff;
use crate::heartbeat::HeartbeatMonitor;
use crate::mux::{MethodHandler, Multiplexer, PeerProxy};

/// Immutable connection parameters handed over at construction.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub heartbeat: HeartbeatSettings,
    pub backoff: BackoffSettings,
}

impl From<&AgentConfig> for SessionConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            heartbeat: config.heartbeat.clone(),
            backoff: config.backoff.clone(),
        }
    }
}

/// Callbacks at connection milestones.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    /// The peer's method table arrived. Called at most once per connection.
    async fn on_peer_ready(&self, peer: PeerProxy);

    /// The connection is gone; stop anything that was using it.
    async fn on_disconnect(&self);
}

pub struct SessionManager {
    config: SessionConfig,
    transport: Arc<dyn TransportProvider>,
    handler: Arc<dyn MethodHandler>,
    hooks: Arc<dyn SessionHooks>,
    state: watch::Sender<SessionState>,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn TransportProvider>,
        handler: Arc<dyn MethodHandler>,
        hooks: Arc<dyn SessionHooks>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            config,
            transport,
            handler,
            hooks,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Run forever.
    pub async fn run(&self) {
        self.run_until(CancellationToken::new()).await;
    }

    /// Run until `cancel` fires. Connection errors never end the loop.
    pub async fn run_until(&self, cancel: CancellationToken) {
        let peer = self.transport.describe();
        let mut backoff = Backoff::from_settings(&self.config.backoff);
        let mut immediate_retry = true;

        loop {
            self.set_state(SessionState::Connecting);
            info!("Connecting to {peer}");

            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.transport.connect() => result,
            };

            let delay = match connected {
                Err(e) => {
                    let attempt = backoff.attempt() + 1;
                    if e.is_transient() {
                        warn!(error = %e, attempt, "connection failed");
                    } else {
                        error!(error = %e, attempt, "connection refused by configuration; retrying anyway");
                    }
                    if immediate_retry {
                        immediate_retry = false;
                        Duration::ZERO
                    } else {
                        backoff.next_delay()
                    }
                }
                Ok(stream) => {
                    immediate_retry = false;
                    backoff.reset();
                    self.set_state(SessionState::Connected);
                    info!("Connected to {peer}");

                    let ended = self.serve(stream, &cancel).await;
                    self.hooks.on_disconnect().await;
                    self.set_state(SessionState::Dead);
                    match ended {
                        Some(reason) => info!(reason = %reason, "socket closed"),
                        None => break,
                    }
                    backoff.next_delay()
                }
            };

            if !delay.is_zero() {
                info!("Retrying in {} seconds", delay.as_secs_f64());
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(SessionState::Idle);
        info!("session stopped");
    }

    /// Serve one connection until it dies. `None` means cancelled.
    ///
    /// The multiplexer and heartbeat monitor are dropped before returning,
    /// so nothing from this connection outlives it.
    async fn serve(&self, stream: BoxedStream, cancel: &CancellationToken) -> Option<LabwerkError> {
        let mut mux = Multiplexer::start(stream, Arc::clone(&self.handler));
        let handle = mux.handle();
        let mut heartbeat = HeartbeatMonitor::new(&self.config.heartbeat).spawn(handle.clone());
        let mut peer_ready = mux.take_peer_ready();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = heartbeat.dead() => return Some(LabwerkError::PeerDeath),
                reason = handle.closed() => return Some(reason),
                peer = async {
                    match peer_ready.as_mut() {
                        Some(rx) => rx.await.ok(),
                        None => None,
                    }
                }, if peer_ready.is_some() => {
                    peer_ready = None;
                    if let Some(peer) = peer {
                        self.hooks.on_peer_ready(peer).await;
                    }
                }
            }
        }
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }
}
