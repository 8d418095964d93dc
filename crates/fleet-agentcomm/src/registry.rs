//! Registry of connections to agents.
//!
//! The registry holds at most one live connection per known endpoint.
//! Connections are opened lazily on first use and replaced when a caller
//! reports a failure through [`ConnectionRegistry::reconnect`]. A
//! replacement is only published if the slot still holds the connection the
//! caller saw fail, so concurrent reconnects converge on one connection.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleet_core::AgentEndpoint;
use parking_lot::RwLock;

use crate::error::{AgentCommError, Result};
use crate::transport::{AgentClient, AgentConnector};

/// An established connection to one agent.
pub struct Connection {
    endpoint: AgentEndpoint,
    client: Arc<dyn AgentClient>,
    established_at: DateTime<Utc>,
}

impl Connection {
    /// The agent endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &AgentEndpoint {
        &self.endpoint
    }

    /// The RPC client bound to this connection.
    #[must_use]
    pub fn client(&self) -> &dyn AgentClient {
        self.client.as_ref()
    }

    /// When the connection was established.
    #[must_use]
    pub const fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("established_at", &self.established_at)
            .finish_non_exhaustive()
    }
}

/// Maps agent endpoints to their live connection.
pub struct ConnectionRegistry {
    connector: Arc<dyn AgentConnector>,
    slots: RwLock<HashMap<AgentEndpoint, Option<Arc<Connection>>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry that opens connections with `connector`.
    #[must_use]
    pub fn new(connector: Arc<dyn AgentConnector>) -> Self {
        Self {
            connector,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Make an endpoint known to the registry. No connection is opened yet.
    ///
    /// Registering a known endpoint keeps its current connection.
    pub fn register_endpoint(&self, endpoint: AgentEndpoint) {
        self.slots.write().entry(endpoint).or_insert(None);
    }

    /// Forget an endpoint and drop its connection.
    ///
    /// Returns true if the endpoint was known.
    pub fn forget_endpoint(&self, endpoint: &AgentEndpoint) -> bool {
        self.slots.write().remove(endpoint).is_some()
    }

    /// All known endpoints.
    #[must_use]
    pub fn known_endpoints(&self) -> Vec<AgentEndpoint> {
        self.slots.read().keys().cloned().collect()
    }

    /// Return the cached connection to `endpoint`, opening one on first use.
    ///
    /// Two calls without an intervening reconnect return the same connection.
    ///
    /// # Errors
    ///
    /// Returns `AgentCommError::NoSuchAgent` if the endpoint is unknown, or
    /// `AgentCommError::Connect` if a connection cannot be opened.
    pub async fn get_connected_agent(&self, endpoint: &AgentEndpoint) -> Result<Arc<Connection>> {
        if let Some(connection) = self.current(endpoint)? {
            return Ok(connection);
        }

        let fresh = self.open(endpoint).await?;

        // Another task may have connected while we were; keep the first one
        let mut slots = self.slots.write();
        let Some(slot) = slots.get_mut(endpoint) else {
            return Err(AgentCommError::NoSuchAgent(endpoint.clone()));
        };
        if let Some(existing) = slot.as_ref() {
            return Ok(Arc::clone(existing));
        }

        *slot = Some(Arc::clone(&fresh));
        tracing::debug!(endpoint = %endpoint, "Connected to agent");
        Ok(fresh)
    }

    /// Replace `stale` with a new connection to the same agent.
    ///
    /// If another task already replaced `stale`, its connection is returned
    /// and no new one is published.
    ///
    /// # Errors
    ///
    /// Returns `AgentCommError::NoSuchAgent` if the endpoint was forgotten,
    /// or `AgentCommError::Connect` if a connection cannot be opened.
    pub async fn reconnect(
        &self,
        endpoint: &AgentEndpoint,
        stale: &Arc<Connection>,
    ) -> Result<Arc<Connection>> {
        if let Some(current) = self.current(endpoint)? {
            if !Arc::ptr_eq(&current, stale) {
                return Ok(current);
            }
        }

        let fresh = self.open(endpoint).await?;

        let mut slots = self.slots.write();
        let Some(slot) = slots.get_mut(endpoint) else {
            return Err(AgentCommError::NoSuchAgent(endpoint.clone()));
        };

        if let Some(current) = slot.as_ref().filter(|c| !Arc::ptr_eq(*c, stale)) {
            return Ok(Arc::clone(current));
        }

        *slot = Some(Arc::clone(&fresh));
        tracing::info!(endpoint = %endpoint, "Reconnected to agent");
        Ok(fresh)
    }

    fn current(&self, endpoint: &AgentEndpoint) -> Result<Option<Arc<Connection>>> {
        self.slots
            .read()
            .get(endpoint)
            .cloned()
            .ok_or_else(|| AgentCommError::NoSuchAgent(endpoint.clone()))
    }

    async fn open(&self, endpoint: &AgentEndpoint) -> Result<Arc<Connection>> {
        let client = self.connector.connect(endpoint).await.map_err(|e| {
            tracing::warn!(endpoint = %endpoint, error = %e, "Failed to connect to agent");
            AgentCommError::Connect {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            }
        })?;

        Ok(Arc::new(Connection {
            endpoint: endpoint.clone(),
            client,
            established_at: Utc::now(),
        }))
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    //! Scripted agents for tests.

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::{AgentClient, AgentConnector, AgentEndpoint, Arc};
    use crate::error::RpcError;
    use crate::transport::MachineState;

    /// Outcome of one scripted RPC.
    pub type Scripted = std::result::Result<String, RpcError>;

    /// A connector whose clients answer from a shared script.
    ///
    /// Each forwarded command pops the next outcome; when the script is
    /// empty the agent answers with a single success response.
    #[derive(Default)]
    pub struct ScriptedConnector {
        script: Arc<Mutex<VecDeque<Scripted>>>,
        requests: Arc<Mutex<Vec<(AgentEndpoint, String)>>>,
        connects: AtomicUsize,
        refuse: Mutex<bool>,
        delay: Arc<Mutex<Option<Duration>>>,
    }

    impl ScriptedConnector {
        /// Create a connector with an empty script.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue an outcome.
        pub fn push(&self, outcome: Scripted) {
            self.script.lock().push_back(outcome);
        }

        /// Make subsequent connects fail.
        pub fn refuse_connections(&self, refuse: bool) {
            *self.refuse.lock() = refuse;
        }

        /// Delay every forwarded command by `delay`.
        pub fn delay_commands(&self, delay: Duration) {
            *self.delay.lock() = Some(delay);
        }

        /// Number of connections opened so far.
        #[must_use]
        pub fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        /// Every forwarded request, in order.
        #[must_use]
        pub fn requests(&self) -> Vec<(AgentEndpoint, String)> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl AgentConnector for ScriptedConnector {
        async fn connect(
            &self,
            endpoint: &AgentEndpoint,
        ) -> std::result::Result<Arc<dyn AgentClient>, RpcError> {
            if *self.refuse.lock() {
                return Err(RpcError::Transport("connection refused".to_string()));
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(ScriptedClient {
                endpoint: endpoint.clone(),
                script: Arc::clone(&self.script),
                requests: Arc::clone(&self.requests),
                delay: Arc::clone(&self.delay),
            }))
        }
    }

    struct ScriptedClient {
        endpoint: AgentEndpoint,
        script: Arc<Mutex<VecDeque<Scripted>>>,
        requests: Arc<Mutex<Vec<(AgentEndpoint, String)>>>,
        delay: Arc<Mutex<Option<Duration>>>,
    }

    impl ScriptedClient {
        fn next(&self) -> Scripted {
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(r#"[{"result": 0, "text": "ok"}]"#.to_string()))
        }
    }

    #[async_trait]
    impl AgentClient for ScriptedClient {
        async fn get_state(&self) -> std::result::Result<MachineState, RpcError> {
            let body = self.next()?;
            serde_json::from_str(&body).map_err(|e| RpcError::Protocol(e.to_string()))
        }

        async fn forward_command(
            &self,
            _daemon_url: &str,
            request: &str,
        ) -> std::result::Result<String, RpcError> {
            self.requests
                .lock()
                .push((self.endpoint.clone(), request.to_string()));
            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.next()
        }

        async fn tail_file(
            &self,
            _path: &str,
            _offset: u64,
        ) -> std::result::Result<Vec<String>, RpcError> {
            let body = self.next()?;
            serde_json::from_str(&body).map_err(|e| RpcError::Protocol(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedConnector;
    use super::*;

    fn endpoint() -> AgentEndpoint {
        "192.0.2.1:8080".parse().unwrap()
    }

    fn setup() -> (ConnectionRegistry, Arc<ScriptedConnector>) {
        let connector = Arc::new(ScriptedConnector::new());
        let registry = ConnectionRegistry::new(connector.clone());
        (registry, connector)
    }

    #[tokio::test]
    async fn unknown_endpoint_is_rejected() {
        let (registry, connector) = setup();
        let result = registry.get_connected_agent(&endpoint()).await;
        assert!(matches!(result, Err(AgentCommError::NoSuchAgent(_))));
        assert_eq!(connector.connects(), 0);
    }

    #[tokio::test]
    async fn connection_is_cached() {
        let (registry, connector) = setup();
        registry.register_endpoint(endpoint());

        let first = registry.get_connected_agent(&endpoint()).await.unwrap();
        let second = registry.get_connected_agent(&endpoint()).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn reconnect_replaces_stale_connection() {
        let (registry, connector) = setup();
        registry.register_endpoint(endpoint());

        let stale = registry.get_connected_agent(&endpoint()).await.unwrap();
        let fresh = registry.reconnect(&endpoint(), &stale).await.unwrap();

        assert!(!Arc::ptr_eq(&stale, &fresh));
        let cached = registry.get_connected_agent(&endpoint()).await.unwrap();
        assert!(Arc::ptr_eq(&fresh, &cached));
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn concurrent_reconnects_converge() {
        let (registry, connector) = setup();
        registry.register_endpoint(endpoint());

        let stale = registry.get_connected_agent(&endpoint()).await.unwrap();
        let first = registry.reconnect(&endpoint(), &stale).await.unwrap();
        // A second caller that also saw `stale` fail reuses the replacement
        let second = registry.reconnect(&endpoint(), &stale).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn connect_failure_is_typed() {
        let (registry, connector) = setup();
        registry.register_endpoint(endpoint());
        connector.refuse_connections(true);

        let result = registry.get_connected_agent(&endpoint()).await;
        assert!(matches!(result, Err(AgentCommError::Connect { .. })));
    }

    #[tokio::test]
    async fn forgotten_endpoint_is_unknown() {
        let (registry, _connector) = setup();
        registry.register_endpoint(endpoint());
        registry.get_connected_agent(&endpoint()).await.unwrap();

        assert!(registry.forget_endpoint(&endpoint()));
        assert!(registry.known_endpoints().is_empty());
        let result = registry.get_connected_agent(&endpoint()).await;
        assert!(matches!(result, Err(AgentCommError::NoSuchAgent(_))));
    }
}
