use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use flow_proxy::auth::token::TokenIssuer;
use flow_proxy::balancer::LoadBalancer;
use flow_proxy::config::{Env, ProxySettings};
use flow_proxy::dispatch::Dispatcher;
use flow_proxy::gateway::{self, GatewayState};

/// Authenticating forward proxy for the Flow LLM gateway.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file (TOML). Built-in defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Credential array file (overrides `secrets_file`).
    #[arg(short, long)]
    secrets: Option<PathBuf>,

    /// Listen address, HOST:PORT (overrides `server.listen`).
    #[arg(long)]
    listen: Option<String>,

    /// Log level (overrides `log_level`; `RUST_LOG` still wins).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,

    /// `.env` file read before the process environment.
    #[arg(long, default_value = ".env")]
    dotenv: PathBuf,

    /// Export spans over OTLP/HTTP.
    #[cfg(feature = "otel")]
    #[arg(long)]
    otel: bool,

    /// OTLP endpoint (defaults to the exporter's standard endpoint).
    #[cfg(feature = "otel")]
    #[arg(long)]
    otel_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut settings = match args.config.as_deref() {
        Some(path) => ProxySettings::load(path)?,
        None => ProxySettings::default(),
    };
    settings.apply_env(&Env::from_dotenv_file(&args.dotenv)?)?;
    if let Some(secrets) = args.secrets {
        settings.secrets_file = secrets;
    }
    if let Some(listen) = args.listen {
        settings.server.listen = listen;
    }
    if let Some(level) = args.log_level {
        settings.log_level = level;
    }
    settings.json_logs |= args.json_logs;
    settings.validate()?;

    #[cfg(feature = "otel")]
    let _otel_guard = if args.otel {
        Some(flow_proxy::logging::init_tracing_with_otel(
            &settings.log_level,
            settings.json_logs,
            args.otel_endpoint.as_deref(),
        )?)
    } else {
        flow_proxy::logging::init_tracing(&settings.log_level, settings.json_logs)?;
        None
    };
    #[cfg(not(feature = "otel"))]
    flow_proxy::logging::init_tracing(&settings.log_level, settings.json_logs)?;

    let pool = match settings.load_credentials() {
        Ok(pool) => pool,
        Err(err) => {
            error!(code = %err.code(), error = %err, "failed to load credentials");
            return Err(err.into());
        }
    };

    let dispatcher = Dispatcher::new(
        Arc::new(LoadBalancer::from_pool(pool)?),
        Arc::new(TokenIssuer::new(settings.tokens)),
        Arc::new(settings.forwarder()),
    );
    let state = GatewayState::new(
        Arc::new(dispatcher),
        Arc::new(settings.upstream_client()?),
        settings.server.admin_token.clone(),
    );

    let listen = settings.listen_addr()?;
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(
        listen = %listen,
        upstream = %settings.upstream.base_url,
        "flow-proxy listening"
    );
    gateway::serve(listener, state).await?;
    Ok(())
}
