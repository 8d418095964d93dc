//! Forwarding of commands to daemons through their agents.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fleet_core::AgentEndpoint;
use fleet_hooks::HookManager;

use crate::command::{ControlledDaemon, DaemonCommand, DaemonResponse};
use crate::error::{AgentCommError, Result, RpcError};
use crate::registry::{Connection, ConnectionRegistry};
use crate::transport::MachineState;

/// Configuration for the command forwarder.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Upper bound on a single RPC attempt.
    pub rpc_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(10),
        }
    }
}

/// Sends commands to daemons through the connection registry.
///
/// Every call makes at most two attempts. When the first fails on the
/// transport, the cached connection is replaced and the identical request
/// is issued once more. Protocol failures are returned immediately. A
/// successful first attempt never touches the registry.
pub struct CommandForwarder {
    registry: Arc<ConnectionRegistry>,
    hooks: Arc<HookManager>,
    config: ForwarderConfig,
}

impl CommandForwarder {
    /// Create a forwarder.
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        hooks: Arc<HookManager>,
        config: ForwarderConfig,
    ) -> Self {
        Self {
            registry,
            hooks,
            config,
        }
    }

    /// The registry connections are taken from.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Send `command` to the daemon described by `target`.
    ///
    /// Returns one response per targeted service. Daemon-reported errors are
    /// part of a successful return; see [`crate::command::first_error`].
    ///
    /// # Errors
    ///
    /// Returns `AgentCommError::Transport` if both attempts fail on the
    /// transport, `AgentCommError::Protocol` if the answer cannot be decoded,
    /// and `AgentCommError::NoSuchAgent` if the agent is unknown.
    pub async fn forward_command(
        &self,
        target: &ControlledDaemon,
        command: &DaemonCommand,
    ) -> Result<Vec<DaemonResponse>> {
        let endpoint = &target.machine;
        self.hooks.on_before_forward(endpoint, &command.command);

        let request = serde_json::to_string(command)
            .map_err(|e| AgentCommError::Serialization(e.to_string()))?;
        let daemon_url = target.control_url();

        let body = self
            .call(endpoint, &command.command, |connection| {
                let daemon_url = daemon_url.as_str();
                let request = request.as_str();
                async move {
                    connection
                        .client()
                        .forward_command(daemon_url, request)
                        .await
                }
            })
            .await?;

        let responses: Vec<DaemonResponse> =
            serde_json::from_str(&body).map_err(|e| AgentCommError::Protocol {
                endpoint: endpoint.clone(),
                command: command.command.clone(),
                reason: format!("failed to decode daemon response: {e}"),
            })?;

        tracing::debug!(
            endpoint = %endpoint,
            command = %command.command,
            daemon = %target.daemon_name,
            responses = responses.len(),
            "Forwarded command to daemon"
        );
        Ok(responses)
    }

    /// Fetch the state of the machine behind `endpoint`.
    ///
    /// # Errors
    ///
    /// Same as [`forward_command`](Self::forward_command).
    pub async fn get_state(&self, endpoint: &AgentEndpoint) -> Result<MachineState> {
        self.call(endpoint, "get-state", |connection| async move {
            connection.client().get_state().await
        })
        .await
    }

    /// Read lines of `path` on the machine behind `endpoint`, from `offset`.
    ///
    /// # Errors
    ///
    /// Same as [`forward_command`](Self::forward_command).
    pub async fn tail_file(
        &self,
        endpoint: &AgentEndpoint,
        path: &str,
        offset: u64,
    ) -> Result<Vec<String>> {
        self.call(endpoint, "tail-file", |connection| async move {
            connection.client().tail_file(path, offset).await
        })
        .await
    }

    /// Run `op` against the agent, reconnecting and retrying once on a
    /// transport failure.
    async fn call<T, F, Fut>(&self, endpoint: &AgentEndpoint, what: &str, op: F) -> Result<T>
    where
        F: Fn(Arc<Connection>) -> Fut,
        Fut: Future<Output = std::result::Result<T, RpcError>>,
    {
        let connection = self.registry.get_connected_agent(endpoint).await?;

        let error = match self.attempt(&op, Arc::clone(&connection)).await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transport() => error,
            Err(error) => return Err(Self::protocol(endpoint, what, &error)),
        };

        tracing::warn!(
            endpoint = %endpoint,
            command = what,
            error = %error,
            "Agent call failed, reconnecting and retrying once"
        );

        let fresh = match self.registry.reconnect(endpoint, &connection).await {
            Ok(fresh) => fresh,
            Err(AgentCommError::Connect { reason, .. }) => {
                return Err(AgentCommError::Transport {
                    endpoint: endpoint.clone(),
                    command: what.to_string(),
                    retried: true,
                    source: RpcError::Transport(reason),
                })
            }
            Err(other) => return Err(other),
        };

        match self.attempt(&op, fresh).await {
            Ok(value) => {
                tracing::info!(endpoint = %endpoint, command = what, "Agent call succeeded after reconnect");
                Ok(value)
            }
            Err(error) if error.is_transport() => {
                tracing::error!(
                    endpoint = %endpoint,
                    command = what,
                    error = %error,
                    "Agent call failed after reconnect"
                );
                Err(AgentCommError::Transport {
                    endpoint: endpoint.clone(),
                    command: what.to_string(),
                    retried: true,
                    source: error,
                })
            }
            Err(error) => Err(Self::protocol(endpoint, what, &error)),
        }
    }

    async fn attempt<T, F, Fut>(
        &self,
        op: &F,
        connection: Arc<Connection>,
    ) -> std::result::Result<T, RpcError>
    where
        F: Fn(Arc<Connection>) -> Fut,
        Fut: Future<Output = std::result::Result<T, RpcError>>,
    {
        let limit = self.config.rpc_timeout;
        tokio::time::timeout(limit, op(connection))
            .await
            .unwrap_or(Err(RpcError::Timeout(limit)))
    }

    fn protocol(endpoint: &AgentEndpoint, what: &str, error: &RpcError) -> AgentCommError {
        AgentCommError::Protocol {
            endpoint: endpoint.clone(),
            command: what.to_string(),
            reason: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::testing::ScriptedConnector;
    use fleet_hooks::{BeforeForwardCallout, CalloutCarrier, Callouts};
    use parking_lot::Mutex;
    use serde_json::json;

    fn target() -> ControlledDaemon {
        ControlledDaemon {
            machine: "192.0.2.1:8080".parse().unwrap(),
            daemon_name: "dhcp4".to_string(),
            control: "127.0.0.1:8000".parse().unwrap(),
            control_secure: false,
        }
    }

    fn command() -> DaemonCommand {
        DaemonCommand::new(
            "reservation-add",
            vec!["dhcp4".to_string()],
            Some(json!({"reservation": {"subnet-id": 1}})),
        )
    }

    fn setup(config: ForwarderConfig) -> (CommandForwarder, Arc<ScriptedConnector>) {
        let connector = Arc::new(ScriptedConnector::new());
        let registry = Arc::new(ConnectionRegistry::new(connector.clone()));
        registry.register_endpoint(target().machine);
        let forwarder = CommandForwarder::new(registry, Arc::new(HookManager::new()), config);
        (forwarder, connector)
    }

    fn refused() -> RpcError {
        RpcError::Transport("connection refused".to_string())
    }

    #[tokio::test]
    async fn first_attempt_success() {
        let (forwarder, connector) = setup(ForwarderConfig::default());

        let responses = forwarder.forward_command(&target(), &command()).await.unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].result, 0);
        assert_eq!(connector.connects(), 1);

        let requests = connector.requests();
        let sent: serde_json::Value = serde_json::from_str(&requests[0].1).unwrap();
        assert_eq!(sent["command"], "reservation-add");
        assert_eq!(sent["service"], json!(["dhcp4"]));
    }

    #[tokio::test]
    async fn transport_failure_then_success() {
        let (forwarder, connector) = setup(ForwarderConfig::default());
        connector.push(Err(refused()));

        let before = forwarder
            .registry()
            .get_connected_agent(&target().machine)
            .await
            .unwrap();
        let responses = forwarder.forward_command(&target(), &command()).await.unwrap();
        assert_eq!(responses[0].result, 0);

        // Reissued the identical request on a new connection
        let requests = connector.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].1, requests[1].1);
        assert_eq!(connector.connects(), 2);

        let after = forwarder
            .registry()
            .get_connected_agent(&target().machine)
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn both_attempts_fail() {
        let (forwarder, connector) = setup(ForwarderConfig::default());
        connector.push(Err(refused()));
        connector.push(Err(refused()));

        let err = forwarder
            .forward_command(&target(), &command())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AgentCommError::Transport { retried: true, .. }
        ));
        let message = err.to_string();
        assert!(message.contains("192.0.2.1:8080"));
        assert!(message.contains("reservation-add"));
        assert!(message.contains("retrying once"));

        // Never more than two attempts
        assert_eq!(connector.requests().len(), 2);
    }

    #[tokio::test]
    async fn protocol_error_is_not_retried() {
        let (forwarder, connector) = setup(ForwarderConfig::default());
        connector.push(Err(RpcError::Protocol("bad frame".to_string())));

        let err = forwarder
            .forward_command(&target(), &command())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentCommError::Protocol { .. }));
        assert_eq!(connector.requests().len(), 1);
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn undecodable_response_is_protocol_error() {
        let (forwarder, connector) = setup(ForwarderConfig::default());
        connector.push(Ok("definitely not json".to_string()));

        let err = forwarder
            .forward_command(&target(), &command())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentCommError::Protocol { .. }));
        assert_eq!(connector.requests().len(), 1);
    }

    #[tokio::test]
    async fn timeouts_count_as_transport_failures() {
        let (forwarder, connector) = setup(ForwarderConfig {
            rpc_timeout: Duration::from_millis(20),
        });
        connector.delay_commands(Duration::from_millis(500));

        let err = forwarder
            .forward_command(&target(), &command())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AgentCommError::Transport {
                retried: true,
                source: RpcError::Timeout(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn failed_reconnect_is_reported_as_retried_transport() {
        let (forwarder, connector) = setup(ForwarderConfig::default());
        forwarder
            .registry()
            .get_connected_agent(&target().machine)
            .await
            .unwrap();
        connector.push(Err(refused()));
        connector.refuse_connections(true);

        let err = forwarder
            .forward_command(&target(), &command())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AgentCommError::Transport { retried: true, .. }
        ));
    }

    #[tokio::test]
    async fn unknown_agent() {
        let connector = Arc::new(ScriptedConnector::new());
        let registry = Arc::new(ConnectionRegistry::new(connector));
        let forwarder =
            CommandForwarder::new(registry, Arc::new(HookManager::new()), ForwarderConfig::default());

        let err = forwarder
            .forward_command(&target(), &command())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentCommError::NoSuchAgent(_)));
    }

    #[tokio::test]
    async fn tail_file_goes_through_agent() {
        let (forwarder, connector) = setup(ForwarderConfig::default());
        connector.push(Ok(r#"["line one", "line two"]"#.to_string()));

        let lines = forwarder
            .tail_file(&target().machine, "/var/log/kea.log", 0)
            .await
            .unwrap();
        assert_eq!(lines, vec!["line one", "line two"]);
    }

    #[tokio::test]
    async fn before_forward_hooks_observe_commands() {
        #[derive(Default)]
        struct Audit(Mutex<Vec<String>>);

        impl BeforeForwardCallout for Audit {
            fn on_before_forward(&self, endpoint: &AgentEndpoint, command: &str) {
                self.0.lock().push(format!("{endpoint} {command}"));
            }
        }

        impl CalloutCarrier for Audit {
            fn name(&self) -> &str {
                "audit"
            }

            fn callouts(self: Arc<Self>) -> Callouts {
                Callouts::default().with_before_forward(self)
            }
        }

        let connector = Arc::new(ScriptedConnector::new());
        let registry = Arc::new(ConnectionRegistry::new(connector));
        registry.register_endpoint(target().machine);
        let hooks = Arc::new(HookManager::new());
        let audit = Arc::new(Audit::default());
        hooks.register(audit.clone());

        let forwarder = CommandForwarder::new(registry, hooks, ForwarderConfig::default());
        forwarder.forward_command(&target(), &command()).await.unwrap();

        assert_eq!(*audit.0.lock(), vec!["192.0.2.1:8080 reservation-add"]);
    }
}
