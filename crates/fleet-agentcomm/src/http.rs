//! HTTP implementation of the agent RPC surface.
//!
//! Each connection owns its own `reqwest` client, so replacing a connection
//! also drops any pooled sockets that went bad with it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::AgentEndpoint;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::RpcError;
use crate::transport::{AgentClient, AgentConnector, MachineState};

/// Client certificate material for mutual TLS with agents.
#[derive(Clone)]
pub struct ClientTls {
    /// PEM bundle with the client certificate and its private key.
    pub identity_pem: Vec<u8>,
    /// PEM of the CA that signed the agents' certificates.
    pub ca_pem: Vec<u8>,
}

impl std::fmt::Debug for ClientTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTls").finish_non_exhaustive()
    }
}

/// Configuration for HTTP connections to agents.
#[derive(Debug, Clone)]
pub struct HttpAgentConfig {
    /// Overall request timeout.
    pub request_timeout: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Mutual TLS material; plain HTTP when `None`.
    pub tls: Option<ClientTls>,
}

impl Default for HttpAgentConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            tls: None,
        }
    }
}

/// Opens HTTP connections to agents.
#[derive(Debug, Clone, Default)]
pub struct HttpAgentConnector {
    config: HttpAgentConfig,
}

impl HttpAgentConnector {
    /// Create a connector.
    #[must_use]
    pub fn new(config: HttpAgentConfig) -> Self {
        Self { config }
    }

    fn build_client(&self) -> Result<reqwest::Client, RpcError> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.config.request_timeout)
            .connect_timeout(self.config.connect_timeout);

        if let Some(tls) = &self.config.tls {
            let identity = reqwest::Identity::from_pem(&tls.identity_pem)
                .map_err(|e| RpcError::Transport(format!("invalid client identity: {e}")))?;
            let ca = reqwest::Certificate::from_pem(&tls.ca_pem)
                .map_err(|e| RpcError::Transport(format!("invalid CA certificate: {e}")))?;
            builder = builder
                .use_rustls_tls()
                .identity(identity)
                .add_root_certificate(ca)
                .tls_built_in_root_certs(false);
        }

        builder
            .build()
            .map_err(|e| RpcError::Transport(format!("failed to create HTTP client: {e}")))
    }
}

#[async_trait]
impl AgentConnector for HttpAgentConnector {
    async fn connect(&self, endpoint: &AgentEndpoint) -> Result<Arc<dyn AgentClient>, RpcError> {
        let client = self.build_client()?;
        Ok(Arc::new(HttpAgentClient {
            client,
            base_url: endpoint.url(self.config.tls.is_some()),
        }))
    }
}

/// HTTP client bound to one agent.
#[derive(Debug, Clone)]
pub struct HttpAgentClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAgentClient {
    /// The agent's base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, RpcError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("agent returned status {status}: {body}");
            // A gateway in front of the agent reports the agent as unreachable
            return Err(
                if matches!(
                    status,
                    StatusCode::BAD_GATEWAY
                        | StatusCode::SERVICE_UNAVAILABLE
                        | StatusCode::GATEWAY_TIMEOUT
                ) {
                    RpcError::Transport(message)
                } else {
                    RpcError::Protocol(message)
                },
            );
        }

        response
            .json::<T>()
            .await
            .map_err(|e| RpcError::Protocol(format!("failed to decode agent response: {e}")))
    }
}

fn transport(e: &reqwest::Error) -> RpcError {
    RpcError::Transport(e.to_string())
}

#[derive(Serialize)]
struct ForwardRequest<'a> {
    url: &'a str,
    request: &'a str,
}

#[derive(Deserialize)]
struct ForwardResponse {
    response: String,
}

#[derive(Serialize)]
struct TailRequest<'a> {
    path: &'a str,
    offset: u64,
}

#[derive(Deserialize)]
struct TailResponse {
    lines: Vec<String>,
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn get_state(&self) -> Result<MachineState, RpcError> {
        let response = self
            .client
            .post(format!("{}state", self.base_url))
            .send()
            .await
            .map_err(|e| transport(&e))?;
        Self::decode(response).await
    }

    async fn forward_command(&self, daemon_url: &str, request: &str) -> Result<String, RpcError> {
        let response = self
            .client
            .post(format!("{}forward", self.base_url))
            .json(&ForwardRequest {
                url: daemon_url,
                request,
            })
            .send()
            .await
            .map_err(|e| transport(&e))?;
        Self::decode::<ForwardResponse>(response)
            .await
            .map(|r| r.response)
    }

    async fn tail_file(&self, path: &str, offset: u64) -> Result<Vec<String>, RpcError> {
        let response = self
            .client
            .post(format!("{}tail", self.base_url))
            .json(&TailRequest { path, offset })
            .send()
            .await
            .map_err(|e| transport(&e))?;
        Self::decode::<TailResponse>(response)
            .await
            .map(|r| r.lines)
    }
}
