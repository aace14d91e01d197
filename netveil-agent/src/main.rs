use anyhow::Context;
use clap::Parser;
use netveil_core::auth::AuthenticationStorage;
use netveil_core::classify::HttpImageClassifier;
use netveil_core::dns::{HickoryDnsProbe, HttpConnectivityProbe};
use netveil_core::notify::TracingSink;
use netveil_core::platform::{LocalClock, LoggingInternetSwitch, NoWifi, UnmanagedNetwork};
use netveil_core::web_service::HttpRemoteApi;
use netveil_core::{FilterService, Notifier, ServiceDeps};
use netveil_proxy::{ConfigLoader, PolicyStore, ProxyServer, ProxyServerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "netveil-agent")]
#[command(about = "Content-filtering proxy agent")]
struct Args {
    /// Policy file path (defaults to $NETVEIL_CONFIG or ~/.config/netveil/policy.toml)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Address the filtering proxy listens on
    #[arg(long, short = 'l', default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Directory for settings, certificate exemptions and captive-portal memory
    #[arg(long, env = "NETVEIL_STATE_DIR", default_value = "/var/lib/netveil")]
    state_dir: PathBuf,

    /// Bearer token for the management server
    #[arg(long, env = "NETVEIL_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Validate the policy and exit
    #[arg(long)]
    check: bool,

    /// Enable debug logging
    #[arg(long, short = 'v')]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(tracing_subscriber::filter::LevelFilter::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config = ConfigLoader::load_or_default(args.config).context("Failed to load policy")?;
    if args.check {
        netveil_proxy::LoadedPolicy::compile(config).context("Policy is invalid")?;
        println!("Policy OK");
        return Ok(());
    }

    let auth = Arc::new(match args.token {
        Some(token) => AuthenticationStorage::with_token(token),
        None => AuthenticationStorage::new(),
    });
    let notifier = Arc::new(Notifier::new());
    notifier.subscribe(Arc::new(TracingSink));

    let policy = Arc::new(PolicyStore::new());
    let api = Arc::new(HttpRemoteApi::new(auth.clone()).context("Failed to build API client")?);
    let classifier =
        Arc::new(HttpImageClassifier::new(policy.clone()).context("Failed to build image classifier")?);
    let service = FilterService::new(ServiceDeps {
        state_dir: args.state_dir.clone(),
        policy: policy.clone(),
        auth,
        notifier,
        clock: Arc::new(LocalClock::new()),
        interfaces: Arc::new(UnmanagedNetwork),
        wifi: Arc::new(NoWifi),
        switch: Arc::new(LoggingInternetSwitch),
        api,
        dns_probe: Arc::new(HickoryDnsProbe),
        connectivity: Arc::new(HttpConnectivityProbe::new().context("Failed to build connectivity probe")?),
        classifier: Some(classifier),
    })
    .with_context(|| format!("Failed to open state in {}", args.state_dir.display()))?;

    service.reload(config).await.context("Failed to apply policy")?;

    let server = Arc::new(ProxyServer::new(ProxyServerConfig {
        listen_addr: args.listen,
        policy,
        callbacks: service.filter(),
    }));
    service
        .start(server.clone())
        .await
        .context("Failed to start filtering proxy")?;
    tracing::info!(
        "Filtering on {}",
        server.local_addr().unwrap_or(args.listen)
    );

    tokio::signal::ctrl_c().await.context("Failed to wait for shutdown signal")?;
    tracing::info!("Shutting down");
    service.shutdown().await;
    Ok(())
}
