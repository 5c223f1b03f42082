//! Concurrent delivery of one event to many users.

use crate::registry::{ConnectionHandle, SessionRegistry};
use futures_util::stream::{self, StreamExt};
use sixin_core::{ServerEvent, UserId};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How long a single send may wait on a full outbound queue.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one fan-out call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Connections a send was attempted on.
    pub attempted: usize,
    /// Sends that failed (closed connection or timeout).
    pub failed: usize,
}

impl DeliveryReport {
    #[cfg(test)]
    pub fn delivered(&self) -> usize {
        self.attempted - self.failed
    }
}

/// Resolves recipients through the registry and emits on every live connection.
///
/// A failure on one connection never aborts delivery to the others.
pub struct FanoutDispatcher {
    registry: Arc<SessionRegistry>,
    workers: usize,
    send_timeout: Duration,
}

impl FanoutDispatcher {
    pub fn new(registry: Arc<SessionRegistry>, workers: usize) -> Self {
        Self {
            registry,
            workers: workers.max(1),
            send_timeout: SEND_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Deliver `event` to every live connection of every user in `recipients`.
    ///
    /// Duplicate user ids are collapsed; users with no live connection are
    /// logged and skipped. Returns once every attempt has completed.
    pub async fn dispatch(&self, event: &ServerEvent, recipients: &[UserId]) -> DeliveryReport {
        let mut seen = HashSet::with_capacity(recipients.len());
        let mut targets: Vec<(UserId, ConnectionHandle)> = Vec::new();
        for &user in recipients {
            if !seen.insert(user) {
                continue;
            }
            let handles = self.registry.connections_for(user).await;
            if handles.is_empty() {
                debug!(user_id = user, event = event.name(), "recipient offline, skipped");
                continue;
            }
            targets.extend(handles.into_iter().map(|handle| (user, handle)));
        }

        let attempted = targets.len();
        let failed = AtomicUsize::new(0);
        let send_timeout = self.send_timeout;
        let failed_ref = &failed;

        stream::iter(targets)
            .for_each_concurrent(self.workers, |(user, handle)| {
                let event = event.clone();
                async move {
                    match handle.tx.send_timeout(event, send_timeout).await {
                        Ok(()) => {}
                        Err(e) => {
                            failed_ref.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                user_id = user,
                                conn_id = handle.id,
                                transport = ?handle.kind,
                                error = %e,
                                "fan-out send failed"
                            );
                        }
                    }
                }
            })
            .await;

        let report = DeliveryReport {
            attempted,
            failed: failed.into_inner(),
        };
        debug!(
            event = event.name(),
            recipients = seen.len(),
            attempted = report.attempted,
            failed = report.failed,
            "fan-out complete"
        );
        report
    }
}
