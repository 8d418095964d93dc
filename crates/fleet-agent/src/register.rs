//! Agent registration with the controller.
//!
//! ```text
//!  parse URL ─▶ ensure_identity ─▶ [agent token] ─▶ POST api/machines
//!                                                        │
//!         ┌──────────────────────────────────────────────┘
//!         ▼
//!  verify + store certs ─▶ [POST api/machines/{id}/ping × 3]
//! ```
//!
//! The bracketed steps depend on whether a controller token was supplied.
//! Without one the key fingerprint becomes the agent token, and an
//! administrator approves the machine by comparing fingerprints. With one
//! the machine is trusted immediately and the ping confirms that the
//! controller can reach the agent over TLS.

use fleet_core::{AgentEndpoint, MachineId};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{AgentPaths, RegistrationConfig};
use crate::error::{AgentError, RegistrationStep, Result};
use crate::identity::{
    ensure_identity, load_key, parse_certificate, verify_pair, write_restricted,
};

/// The outcome of a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Machine ID assigned by the controller.
    pub machine_id: MachineId,
    /// Self-asserted agent token, when no controller token was supplied.
    pub agent_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest<'a> {
    address: &'a str,
    agent_port: u16,
    #[serde(rename = "agentCSR")]
    agent_csr: &'a str,
    server_token: &'a str,
    agent_token: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PingRequest<'a> {
    server_token: &'a str,
    agent_token: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterResponse {
    id: i64,
    #[serde(rename = "serverCACert")]
    server_ca_cert: String,
    agent_cert: String,
}

/// Registers this agent with a controller.
#[derive(Debug, Clone)]
pub struct Registrar {
    client: reqwest::Client,
    paths: AgentPaths,
    config: RegistrationConfig,
}

impl Registrar {
    /// Create a registrar.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Http` if the HTTP client cannot be built.
    pub fn new(paths: AgentPaths, config: RegistrationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .http1_only()
            .use_rustls_tls()
            .build()
            .map_err(|e| AgentError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            paths,
            config,
        })
    }

    /// Register the agent reachable at `endpoint` with the controller at
    /// `controller_url`.
    ///
    /// With `retry`, a refused connection to the controller is retried every
    /// `retry_interval` until it succeeds. Every other failure is terminal.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Registration` tagged with the step that failed.
    pub async fn register(
        &self,
        controller_url: &str,
        controller_token: Option<&str>,
        endpoint: &AgentEndpoint,
        regenerate: bool,
        retry: bool,
    ) -> Result<Registration> {
        let result = self
            .run(controller_url, controller_token, endpoint, regenerate, retry)
            .await;
        if let Err(e) = &result {
            tracing::error!(
                step = ?e.step(),
                endpoint = %endpoint,
                error = %e,
                "Registration failed"
            );
        }
        result
    }

    async fn run(
        &self,
        controller_url: &str,
        controller_token: Option<&str>,
        endpoint: &AgentEndpoint,
        regenerate: bool,
        retry: bool,
    ) -> Result<Registration> {
        let base = base_url(controller_url)
            .map_err(|e| AgentError::registration(RegistrationStep::ParseUrl, e))?;

        let bundle = ensure_identity(&self.paths, endpoint.host(), regenerate)
            .map_err(|e| AgentError::registration(RegistrationStep::Identity, e))?;

        let controller_token = controller_token.filter(|t| !t.is_empty());
        let agent_token = if controller_token.is_none() {
            write_restricted(&self.paths.agent_token, bundle.fingerprint.as_bytes())
                .map_err(|e| AgentError::registration(RegistrationStep::StoreToken, e))?;
            tracing::info!(fingerprint = %bundle.fingerprint, "Agent token stored");
            Some(bundle.fingerprint.clone())
        } else {
            None
        };
        let server_token = controller_token.unwrap_or_default();
        let agent_token_str = agent_token.as_deref().unwrap_or_default();

        let request = RegisterRequest {
            address: endpoint.host(),
            agent_port: endpoint.port(),
            agent_csr: &bundle.csr_pem,
            server_token,
            agent_token: agent_token_str,
        };
        let url = join(&base, "api/machines")
            .map_err(|e| AgentError::registration(RegistrationStep::Register, e))?;

        tracing::info!(controller = %base, endpoint = %endpoint, "Registering agent");
        let response = self.post_register(&url, &request, retry).await?;
        let machine_id = MachineId::new(response.id);
        tracing::info!(machine_id = %machine_id, "Machine registered");

        self.store_certificates(&response)
            .map_err(|e| AgentError::registration(RegistrationStep::StoreCertificates, e))?;

        if controller_token.is_some() {
            let ping_url = join(&base, &format!("api/machines/{machine_id}/ping"))
                .map_err(|e| AgentError::registration(RegistrationStep::Ping, e))?;
            let ping = PingRequest {
                server_token,
                agent_token: agent_token_str,
            };
            self.ping(&ping_url, &ping).await?;
        }

        Ok(Registration {
            machine_id,
            agent_token,
        })
    }

    async fn post_register(
        &self,
        url: &Url,
        request: &RegisterRequest<'_>,
        retry: bool,
    ) -> Result<RegisterResponse> {
        let fail = |reason: String| AgentError::registration(RegistrationStep::Register, reason);

        let response = loop {
            match self.client.post(url.clone()).json(request).send().await {
                Ok(response) => break response,
                Err(e) if retry && is_connection_refused(&e) => {
                    tracing::info!(
                        controller = %url,
                        retry_in = ?self.config.retry_interval,
                        "Controller refused connection, retrying"
                    );
                    tokio::time::sleep(self.config.retry_interval).await;
                }
                Err(e) => return Err(fail(e.to_string())),
            }
        };

        let body = checked_body(response).await.map_err(fail)?;
        serde_json::from_value(body).map_err(|e| fail(format!("malformed response: {e}")))
    }

    fn store_certificates(&self, response: &RegisterResponse) -> Result<()> {
        parse_certificate(&response.server_ca_cert, |_| Ok(()))
            .map_err(|e| AgentError::Certificate(format!("controller CA: {e}")))?;
        let key = load_key(&self.paths)?;
        verify_pair(&response.agent_cert, &key)?;

        write_restricted(&self.paths.cert_pem, response.agent_cert.as_bytes())?;
        write_restricted(&self.paths.root_ca_pem, response.server_ca_cert.as_bytes())?;
        tracing::info!(
            cert = %self.paths.cert_pem.display(),
            ca = %self.paths.root_ca_pem.display(),
            "Stored agent certificate and controller CA"
        );
        Ok(())
    }

    async fn ping(&self, url: &Url, request: &PingRequest<'_>) -> Result<()> {
        let attempts = self.config.ping_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.ping_once(url, request).await {
                Ok(()) => {
                    tracing::info!(attempt, "Machine ping succeeded");
                    return Ok(());
                }
                Err(reason) => {
                    tracing::warn!(attempt, reason = %reason, "Machine ping failed");
                    last_error = reason;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.ping_backoff_unit * attempt).await;
            }
        }

        Err(AgentError::registration(
            RegistrationStep::Ping,
            format!("no success after {attempts} attempts: {last_error}"),
        ))
    }

    async fn ping_once(
        &self,
        url: &Url,
        request: &PingRequest<'_>,
    ) -> std::result::Result<(), String> {
        let response = self
            .client
            .post(url.clone())
            .json(request)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        checked_body(response).await.map(|_| ())
    }
}

/// Read a controller response, failing on an `error` field or a status of
/// 400 or above.
async fn checked_body(response: reqwest::Response) -> std::result::Result<Value, String> {
    let status = response.status();
    let bytes = response.bytes().await.map_err(|e| e.to_string())?;
    let body: Option<Value> = serde_json::from_slice(&bytes).ok();

    if let Some(error) = body
        .as_ref()
        .and_then(|b| b.get("error"))
        .filter(|e| !e.is_null())
    {
        return Err(json_text(error));
    }
    if status.is_client_error() || status.is_server_error() {
        return Err(body
            .as_ref()
            .and_then(|b| b.get("message"))
            .map_or_else(|| format!("HTTP status {status}"), json_text));
    }
    body.ok_or_else(|| "response is not JSON".to_string())
}

fn json_text(value: &Value) -> String {
    value
        .as_str()
        .map_or_else(|| value.to_string(), ToString::to_string)
}

fn base_url(raw: &str) -> std::result::Result<Url, String> {
    let mut url = Url::parse(raw).map_err(|e| format!("invalid controller URL {raw}: {e}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme in controller URL {raw}"));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn join(base: &Url, suffix: &str) -> std::result::Result<Url, String> {
    base.join(suffix).map_err(|e| format!("invalid URL {base}{suffix}: {e}"))
}

fn is_connection_refused(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        source = e.source();
    }
    false
}
