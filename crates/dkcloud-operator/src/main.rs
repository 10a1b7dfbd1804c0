//! dkcloud operator - Cloud.dk load balancers for Kubernetes Services

use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::Client;

use dkcloud_common::events::TracingEventSink;
use dkcloud_common::telemetry::{init_logging, LogFormat};
use dkcloud_common::{ProviderConfig, DEFAULT_API_ENDPOINT, DEFAULT_LOCATION, DEFAULT_TEMPLATE};
use dkcloud_lb::api::HttpServerApi;
use dkcloud_lb::instances::NodeMetadata;
use dkcloud_lb::provision::{parse_private_key, Provisioner, SshConnector};
use dkcloud_lb::store::InstanceStore;
use dkcloud_lb::LoadBalancerController;
use dkcloud_operator::controller_runner::build_service_controller;
use dkcloud_operator::{Context, KubeServiceClient};

/// dkcloud - HAProxy load balancers on Cloud.dk servers for LoadBalancer Services
#[derive(Parser, Debug)]
#[command(name = "dkcloud-operator", version, about, long_about = None)]
struct Cli {
    /// Cloud.dk API endpoint
    #[arg(long, env = "CLOUDDK_API_ENDPOINT", default_value = DEFAULT_API_ENDPOINT)]
    api_endpoint: String,

    /// Cloud.dk API key
    #[arg(long, env = "CLOUDDK_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Base64-encoded private key used to reach load balancers
    #[arg(long, env = "CLOUDDK_SSH_PRIVATE_KEY", hide_env_values = true)]
    ssh_private_key: String,

    /// Base64-encoded public key authorized on load balancers
    #[arg(long, env = "CLOUDDK_SSH_PUBLIC_KEY")]
    ssh_public_key: String,

    /// Cluster name mixed into load balancer hostnames
    #[arg(long, env = "CLUSTER_NAME", default_value = "kubernetes")]
    cluster_name: String,

    /// Location for new load balancers
    #[arg(long, env = "CLOUDDK_LOCATION", default_value = DEFAULT_LOCATION)]
    location: String,

    /// OS template for new load balancers
    #[arg(long, env = "CLOUDDK_TEMPLATE", default_value = DEFAULT_TEMPLATE)]
    template: String,

    /// Log output format (json or text)
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the Service controller (default mode)
    Controller,

    /// Print what the store knows about a node, as JSON
    Node {
        /// Hostname of the node
        hostname: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // reqwest and kube both use rustls; pick the provider before either starts
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_logging(cli.log_format)?;

    let config = ProviderConfig::new(
        &cli.api_endpoint,
        &cli.api_key,
        &cli.ssh_private_key,
        &cli.ssh_public_key,
    )?
    .with_location(cli.location)
    .with_template(cli.template);

    match cli.command {
        Some(Commands::Controller) | None => run_controller(config, cli.cluster_name).await,
        Some(Commands::Node { hostname }) => describe_node(&config, &hostname).await,
    }
}

fn instance_store(config: &ProviderConfig) -> anyhow::Result<InstanceStore> {
    let api = HttpServerApi::new(config)?;
    Ok(InstanceStore::new(Arc::new(api), config))
}

async fn run_controller(config: ProviderConfig, cluster_name: String) -> anyhow::Result<()> {
    tracing::info!(
        endpoint = %config.api_endpoint(),
        location = %config.location(),
        cluster = %cluster_name,
        "Starting dkcloud operator"
    );

    // Fail before any instance is created
    parse_private_key(config.ssh_private_key())?;

    let engine = LoadBalancerController::new(
        instance_store(&config)?,
        Provisioner::new(Arc::new(SshConnector::new()), &config),
        Arc::new(TracingEventSink),
        &config,
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let ctx = Arc::new(Context::new(
        Arc::new(KubeServiceClient::new(client.clone())),
        Arc::new(engine),
        cluster_name,
    ));

    tracing::info!("Starting controllers:");
    build_service_controller(client, ctx).await;

    tracing::info!("Controller shut down");
    Ok(())
}

async fn describe_node(config: &ProviderConfig, hostname: &str) -> anyhow::Result<()> {
    let metadata = NodeMetadata::new(instance_store(config)?);
    let info = metadata.describe(hostname).await?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}
