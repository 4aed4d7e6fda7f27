//! Configuration for the client engine.

use std::time::Duration;

/// Credentials replayed on every freshly dialed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    /// Authentication scheme (e.g. `digest`).
    pub scheme: String,
    /// Scheme-specific credential bytes.
    pub auth: Vec<u8>,
}

impl AuthInfo {
    /// Creates a new credential.
    pub fn new(scheme: impl Into<String>, auth: impl Into<Vec<u8>>) -> Self {
        Self {
            scheme: scheme.into(),
            auth: auth.into(),
        }
    }
}

/// Configuration for a [`crate::Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Ensemble connect string (`host:port,host:port/chroot`).
    pub connect_string: String,
    /// Session timeout requested from the ensemble.
    pub session_timeout: Duration,
    /// How long an operation waits for a usable connection when the caller
    /// gave no deadline of its own.
    pub connection_timeout: Duration,
    /// Whether a read-only server is acceptable.
    pub can_be_read_only: bool,
    /// Maximum time spent `Suspended` before degrading to `Lost`.
    ///
    /// `None` leaves the decision to the ensemble's session-expired event.
    pub suspended_max: Option<Duration>,
    /// Pause between dial rounds once the retry policy has given up.
    pub redial_backoff: Duration,
    /// Namespace prepended to every path.
    pub namespace: Option<String>,
    /// Credentials added to every new connection.
    pub auth: Vec<AuthInfo>,
}

impl ClientConfig {
    /// Creates a new configuration for the given connect string.
    pub fn new(connect_string: impl Into<String>) -> Self {
        Self {
            connect_string: connect_string.into(),
            session_timeout: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(15),
            can_be_read_only: false,
            suspended_max: None,
            redial_backoff: Duration::from_secs(1),
            namespace: None,
            auth: Vec::new(),
        }
    }

    /// Sets the session timeout.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Sets the connection timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Allows read-only servers.
    pub fn with_read_only(mut self, can_be_read_only: bool) -> Self {
        self.can_be_read_only = can_be_read_only;
        self
    }

    /// Degrades `Suspended` to `Lost` after the given duration.
    pub fn with_suspended_max(mut self, max: Duration) -> Self {
        self.suspended_max = Some(max);
        self
    }

    /// Sets the pause between dial rounds.
    pub fn with_redial_backoff(mut self, backoff: Duration) -> Self {
        self.redial_backoff = backoff;
        self
    }

    /// Sets the namespace. An empty namespace clears it.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let trimmed = namespace.trim_matches('/');
        self.namespace = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
        self
    }

    /// Adds a credential.
    pub fn with_auth(mut self, scheme: impl Into<String>, auth: impl Into<Vec<u8>>) -> Self {
        self.auth.push(AuthInfo::new(scheme, auth));
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("127.0.0.1:2181")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_builder() {
        let config = ClientConfig::new("zk1:2181,zk2:2181")
            .with_session_timeout(Duration::from_secs(10))
            .with_connection_timeout(Duration::from_secs(3))
            .with_read_only(true)
            .with_suspended_max(Duration::from_secs(5))
            .with_auth("digest", "user:pass");

        assert_eq!(config.connect_string, "zk1:2181,zk2:2181");
        assert_eq!(config.session_timeout, Duration::from_secs(10));
        assert_eq!(config.connection_timeout, Duration::from_secs(3));
        assert!(config.can_be_read_only);
        assert_eq!(config.suspended_max, Some(Duration::from_secs(5)));
        assert_eq!(config.auth, vec![AuthInfo::new("digest", "user:pass")]);
    }

    #[test]
    fn suspended_max_defaults_to_unbounded() {
        assert_eq!(ClientConfig::default().suspended_max, None);
    }

    #[test]
    fn namespace_is_trimmed() {
        assert_eq!(
            ClientConfig::default().with_namespace("/app/").namespace,
            Some("app".to_string())
        );
        assert_eq!(ClientConfig::default().with_namespace("/").namespace, None);
    }
}
