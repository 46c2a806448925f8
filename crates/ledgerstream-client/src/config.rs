//! Client configuration.

use std::time::Duration;

/// Configuration for the [`EventClient`](crate::client::EventClient).
///
/// Attempt counts follow one convention: `1` means a single attempt with no
/// retry, `0` means unbounded.
#[derive(Debug, Clone)]
pub struct ClientParams {
    /// Connect attempts before [`connect`](crate::client::EventClient::connect)
    /// gives up.
    pub max_connect_attempts: u32,
    /// Connect attempts per reconnect before the client closes itself.
    pub max_reconnect_attempts: u32,
    /// Spacing between connect attempts. Values under one second are clamped
    /// up to one second.
    pub time_between_connect_attempts: Duration,
    /// Wait before the first reconnect attempt after a lost connection.
    pub reconnect_initial_delay: Duration,
    /// How long the client waits for a disconnect acknowledgement when
    /// backing out of a failed after-connect hook.
    pub response_timeout: Duration,
    /// Whether a lost connection triggers reconnection. When `false`, a lost
    /// connection closes the client.
    pub reconnect: bool,
}

impl Default for ClientParams {
    fn default() -> Self {
        Self {
            max_connect_attempts: 1,
            max_reconnect_attempts: 0,
            time_between_connect_attempts: Duration::from_secs(5),
            reconnect_initial_delay: Duration::ZERO,
            response_timeout: Duration::from_secs(5),
            reconnect: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_default() {
        let params = ClientParams::default();
        assert_eq!(params.max_connect_attempts, 1);
        assert_eq!(params.max_reconnect_attempts, 0);
        assert_eq!(params.time_between_connect_attempts, Duration::from_secs(5));
        assert_eq!(params.reconnect_initial_delay, Duration::ZERO);
        assert_eq!(params.response_timeout, Duration::from_secs(5));
        assert!(params.reconnect);
    }
}
