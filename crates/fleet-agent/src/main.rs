//! Fleet agent command line.
//!
//! Registers the agent with a controller, or posts a JSON request through the
//! controller-facing client.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use fleet_agent::{AgentPaths, HttpClient, HttpClientConfig, Registrar, RegistrationConfig};
use fleet_core::AgentEndpoint;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Fleet agent onboarding tool.
#[derive(Parser, Debug)]
#[command(name = "fleet-agent")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding the key, certificates, token, and credentials.
    /// Defaults to the system locations.
    #[arg(long, global = true, env = "FLEET_AGENT_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register this agent with a controller.
    Register {
        /// Controller URL.
        #[arg(long, env = "FLEET_CONTROLLER_URL")]
        controller_url: String,

        /// Controller access token. Without it the key fingerprint is used
        /// as the agent token and the machine awaits approval.
        #[arg(long, env = "FLEET_CONTROLLER_TOKEN", hide_env_values = true)]
        controller_token: Option<String>,

        /// Address the controller uses to reach this agent.
        #[arg(long, env = "FLEET_AGENT_HOST")]
        host: String,

        /// Port the agent listens on.
        #[arg(long, env = "FLEET_AGENT_PORT", default_value = "8080")]
        port: u16,

        /// Generate a new key even if one exists.
        #[arg(long)]
        regenerate: bool,

        /// Keep retrying while the controller refuses connections.
        #[arg(long)]
        retry: bool,
    },

    /// POST a JSON body and print the response.
    Call {
        /// Target URL.
        #[arg(long)]
        url: String,

        /// JSON request body.
        #[arg(long, default_value = "{}")]
        body: String,

        /// Request timeout in seconds.
        #[arg(long, default_value = "30")]
        timeout: u64,

        /// Accept a server certificate that does not verify, such as a
        /// self-signed one.
        #[arg(long)]
        skip_tls_verification: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fleet=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let paths = args
        .state_dir
        .as_deref()
        .map_or_else(AgentPaths::default, AgentPaths::under);

    match args.command {
        Command::Register {
            controller_url,
            controller_token,
            host,
            port,
            regenerate,
            retry,
        } => {
            let endpoint = AgentEndpoint::new(host, port).context("invalid agent address")?;
            let registrar = Registrar::new(paths, RegistrationConfig::default())?;
            let registration = registrar
                .register(
                    &controller_url,
                    controller_token.as_deref(),
                    &endpoint,
                    regenerate,
                    retry,
                )
                .await?;

            tracing::info!(machine_id = %registration.machine_id, "Registration complete");
            if let Some(token) = registration.agent_token {
                println!("Agent token: {token}");
                println!("Approve the machine in the controller once the token matches.");
            }
        }
        Command::Call {
            url,
            body,
            timeout,
            skip_tls_verification,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&body).context("request body is not valid JSON")?;
            let config = HttpClientConfig {
                timeout: Duration::from_secs(timeout),
                skip_tls_verification,
            };
            let client = HttpClient::new(&paths, &config)?;
            let response = client.call(&url, &payload).await?;
            let status = response.status();
            let text = response.text().await.context("failed to read response")?;
            println!("{text}");
            anyhow::ensure!(status.is_success(), "request failed with status {status}");
        }
    }

    Ok(())
}
