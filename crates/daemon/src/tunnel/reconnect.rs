//! Automatic reconnection of tunnels that lost their broker session

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use rtunnel_common::{Error, TunnelConfig};

use super::TunnelManager;

/// Backoff schedule for one reconnecting tunnel
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &TunnelConfig) -> Self {
        Self {
            initial_backoff: Duration::from_secs(config.reconnect_interval.max(1)),
            max_attempts: match config.max_reconnect_attempts {
                0 => None,
                n => Some(n),
            },
            ..Default::default()
        }
    }

    /// Delay before attempt `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

/// Restart `tunnel_id` in the background until it is live again
///
/// At most one supervisor runs per tunnel id. The loop ends when a restart
/// succeeds, the attempts run out, or the tunnel was stopped meanwhile.
pub(super) fn spawn_supervisor(manager: TunnelManager, tunnel_id: String, policy: ReconnectPolicy) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!(
            "No runtime available, tunnel {} will not reconnect",
            tunnel_id
        );
        return;
    };

    if !manager.inner.begin_reconnect(&tunnel_id) {
        debug!("Tunnel {} is already reconnecting", tunnel_id);
        return;
    }

    runtime.spawn(async move {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if !policy.allows(attempt) {
                warn!(
                    "Giving up on tunnel {} after {} reconnection attempts",
                    tunnel_id,
                    attempt - 1
                );
                break;
            }

            let delay = policy.delay(attempt);
            debug!(
                "Reconnecting tunnel {} in {:?} (attempt {})",
                tunnel_id, delay, attempt
            );
            sleep(delay).await;

            match manager.restart_tunnel(&tunnel_id).await {
                Ok(result) => {
                    info!(
                        "Tunnel {} reconnected after {} attempt(s): {}",
                        tunnel_id,
                        attempt,
                        result.urls.join(", ")
                    );
                    break;
                }
                Err(Error::NotFound(_)) => {
                    debug!("Tunnel {} was removed, stopping reconnection", tunnel_id);
                    break;
                }
                Err(e) => warn!(
                    "Reconnection attempt {} for tunnel {} failed: {}",
                    attempt, tunnel_id, e
                ),
            }
        }
        manager.inner.end_reconnect(&tunnel_id);
    });
}
