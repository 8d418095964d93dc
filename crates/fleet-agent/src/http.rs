//! Controller-facing HTTP client.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;

use crate::config::AgentPaths;
use crate::credentials::CredentialsStore;
use crate::error::{AgentError, Result};
use crate::identity::load_identity;

/// Settings for [`HttpClient`].
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Overall request timeout.
    pub timeout: Duration,
    /// Accept server certificates that do not verify, such as the
    /// self-signed certificate of a daemon control channel.
    pub skip_tls_verification: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            skip_tls_verification: false,
        }
    }
}

/// HTTP/1.1 client that posts JSON, with optional mutual TLS and per-endpoint
/// basic auth.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    credentials: CredentialsStore,
    tls: bool,
    skip_tls_verification: bool,
}

impl HttpClient {
    /// Build a client from the agent's files.
    ///
    /// Mutual TLS is configured when the key, certificate, and CA files all
    /// exist and belong together. When none exist the client has no client
    /// certificate. Server certificates are verified unless
    /// `skip_tls_verification` is set.
    ///
    /// # Errors
    ///
    /// Returns an error when the TLS files are present but incomplete or
    /// invalid, or when the credentials file is unreadable or malformed.
    pub fn new(paths: &AgentPaths, config: &HttpClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .http1_only()
            .use_rustls_tls()
            .danger_accept_invalid_certs(config.skip_tls_verification);
        if config.skip_tls_verification {
            tracing::warn!("Server certificate verification is disabled");
        }

        let identity = load_identity(paths)?;
        let tls = identity.is_some();
        if let Some(identity) = identity {
            let client_identity = reqwest::Identity::from_pem(&identity.identity_pem())
                .map_err(|e| AgentError::Tls(format!("invalid client identity: {e}")))?;
            let ca = reqwest::Certificate::from_pem(identity.ca_pem.as_bytes())
                .map_err(|e| AgentError::Tls(format!("invalid CA certificate: {e}")))?;
            builder = builder
                .identity(client_identity)
                .add_root_certificate(ca)
                .tls_built_in_root_certs(false);
        } else {
            tracing::debug!("No TLS files, client certificate disabled");
        }

        let credentials = CredentialsStore::load(&paths.credentials)?;
        let client = builder
            .build()
            .map_err(|e| AgentError::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            credentials,
            tls,
            skip_tls_verification: config.skip_tls_verification,
        })
    }

    /// POST `payload` as JSON to `url`.
    ///
    /// Basic auth is attached when the credentials store has an entry for the
    /// URL's host and port.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Http` if the URL is invalid, the payload cannot
    /// be serialized, or the request fails in transport. HTTP error statuses
    /// are returned as responses.
    pub async fn call(&self, url: &str, payload: &impl Serialize) -> Result<reqwest::Response> {
        let parsed =
            reqwest::Url::parse(url).map_err(|e| AgentError::Http(format!("invalid URL {url}: {e}")))?;
        let body = serde_json::to_vec(payload)
            .map_err(|e| AgentError::Http(format!("failed to serialize request: {e}")))?;

        let mut request = self
            .client
            .post(parsed.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body);

        if let Some(auth) = self.credentials.get_by_url(&parsed) {
            let token = STANDARD.encode(format!("{}:{}", auth.user, auth.password));
            request = request.header(AUTHORIZATION, format!("Basic {token}"));
            tracing::debug!(url = %parsed, user = %auth.user, "Using basic auth");
        }

        request.send().await.map_err(|e| {
            tracing::warn!(url = %parsed, error = %e, "Request failed");
            AgentError::Http(e.to_string())
        })
    }

    /// Whether any basic auth credentials are configured.
    #[must_use]
    pub fn has_authentication_credentials(&self) -> bool {
        !self.credentials.is_empty()
    }

    /// Whether a client certificate is configured.
    #[must_use]
    pub fn uses_tls(&self) -> bool {
        self.tls
    }

    /// Whether server certificates go unverified.
    #[must_use]
    pub fn skips_tls_verification(&self) -> bool {
        self.skip_tls_verification
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{ensure_identity, testing::TestCa};
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config() -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(5),
            ..HttpClientConfig::default()
        }
    }

    #[tokio::test]
    async fn call_posts_json_without_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/config"))
            .and(header("content-type", "application/json"))
            .and(body_json(json!({"command": "config-get"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"result": 0}])))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let client = HttpClient::new(&AgentPaths::under(dir.path()), &config()).unwrap();
        assert!(!client.uses_tls());
        assert!(!client.has_authentication_credentials());

        let response = client
            .call(
                &format!("{}/config", server.uri()),
                &json!({"command": "config-get"}),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let received = server.received_requests().await.unwrap();
        assert!(received[0].headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn call_attaches_matching_basic_auth() {
        let server = MockServer::start().await;
        let addr = server.address();
        // "kea:secret"
        Mock::given(method("POST"))
            .and(header("authorization", "Basic a2VhOnNlY3JldA=="))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let paths = AgentPaths::under(dir.path());
        std::fs::write(
            &paths.credentials,
            json!({"basic_auth": [{
                "ip": addr.ip().to_string(),
                "port": addr.port(),
                "user": "kea",
                "password": "secret"
            }]})
            .to_string(),
        )
        .unwrap();

        let client = HttpClient::new(&paths, &config()).unwrap();
        assert!(client.has_authentication_credentials());
        let response = client.call(&server.uri(), &json!({})).await.unwrap();
        assert_eq!(response.status(), 200);
    }

    #[test]
    fn partial_tls_files_fail_construction() {
        let dir = TempDir::new().unwrap();
        let paths = AgentPaths::under(dir.path());
        ensure_identity(&paths, "192.0.2.1", false).unwrap();

        let err = HttpClient::new(&paths, &config()).unwrap_err();
        assert!(matches!(err, AgentError::Tls(_)));
    }

    #[test]
    fn invalid_tls_files_fail_construction() {
        let dir = TempDir::new().unwrap();
        let paths = AgentPaths::under(dir.path());
        ensure_identity(&paths, "192.0.2.1", false).unwrap();
        std::fs::write(&paths.cert_pem, "garbage").unwrap();
        std::fs::write(&paths.root_ca_pem, "garbage").unwrap();

        assert!(HttpClient::new(&paths, &config()).is_err());
    }

    #[test]
    fn consistent_tls_files_enable_client_certificate() {
        let dir = TempDir::new().unwrap();
        let paths = AgentPaths::under(dir.path());
        let bundle = ensure_identity(&paths, "192.0.2.1", false).unwrap();
        let ca = TestCa::new();
        std::fs::write(&paths.cert_pem, ca.sign(&bundle.csr_pem)).unwrap();
        std::fs::write(&paths.root_ca_pem, &ca.cert_pem).unwrap();

        let client = HttpClient::new(&paths, &config()).unwrap();
        assert!(client.uses_tls());
    }

    #[test]
    fn server_certificates_verified_by_default() {
        assert!(!HttpClientConfig::default().skip_tls_verification);

        let dir = TempDir::new().unwrap();
        let client = HttpClient::new(&AgentPaths::under(dir.path()), &config()).unwrap();
        assert!(!client.skips_tls_verification());
    }

    #[tokio::test]
    async fn skipping_verification_keeps_client_certificate() {
        let dir = TempDir::new().unwrap();
        let paths = AgentPaths::under(dir.path());
        let bundle = ensure_identity(&paths, "192.0.2.1", false).unwrap();
        let ca = TestCa::new();
        std::fs::write(&paths.cert_pem, ca.sign(&bundle.csr_pem)).unwrap();
        std::fs::write(&paths.root_ca_pem, &ca.cert_pem).unwrap();

        let insecure = HttpClientConfig {
            skip_tls_verification: true,
            ..config()
        };
        let client = HttpClient::new(&paths, &insecure).unwrap();
        assert!(client.skips_tls_verification());
        assert!(client.uses_tls());

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let response = client.call(&server.uri(), &json!({})).await.unwrap();
        assert_eq!(response.status(), 200);
    }

    #[test]
    fn malformed_credentials_fail_construction() {
        let dir = TempDir::new().unwrap();
        let paths = AgentPaths::under(dir.path());
        std::fs::write(&paths.credentials, "not json").unwrap();

        let err = HttpClient::new(&paths, &config()).unwrap_err();
        assert!(matches!(err, AgentError::Credentials(_)));
    }
}
