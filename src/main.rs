use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use kube::api::{Api, ListParams};
use kube::ResourceExt;
use nvmesh_operator::controller::conditions::{is_condition_true, CONDITION_TYPE_READY};
use nvmesh_operator::controller::options::{DEFAULT_CORE_IMAGE_TAG, DEFAULT_RESOURCES_DIR};
use nvmesh_operator::controller::{self, OperatorOptions};
use nvmesh_operator::crd::NVMesh;
use nvmesh_operator::Error;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version information
    Version,
    /// List the NVMesh clusters visible to the operator
    Info(InfoArgs),
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Plain,
    Json,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Watch only this namespace (all namespaces when unset)
    #[arg(long, env = "OPERATOR_NAMESPACE")]
    namespace: Option<String>,

    /// Directory holding the core, management, mongodb and csi manifests
    #[arg(long, env = "NVMESH_RESOURCES_DIR", default_value = DEFAULT_RESOURCES_DIR)]
    resources_dir: PathBuf,

    /// Core image tag used when a cluster does not set one
    #[arg(long, env = "DEFAULT_CORE_IMAGE_TAG", default_value = DEFAULT_CORE_IMAGE_TAG)]
    default_core_image_tag: String,

    /// Running on OpenShift
    #[arg(long, env = "OPENSHIFT")]
    openshift: bool,

    /// Operator runs outside the cluster; MongoDB is reached on localhost
    #[arg(long, env = "DEVELOPMENT")]
    development: bool,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Plain)]
    log_format: LogFormat,
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Namespace to list (all namespaces when unset)
    #[arg(long, env = "OPERATOR_NAMESPACE")]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("NVMesh Operator v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    let api: Api<NVMesh> = match args.namespace.as_deref() {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    };
    let clusters = api
        .list(&ListParams::default())
        .await
        .map_err(Error::KubeError)?;

    println!("Managed NVMesh clusters: {}", clusters.items.len());
    for cluster in &clusters.items {
        let status = cluster.status.clone().unwrap_or_default();
        let state = status
            .reconcile_status
            .status
            .map(|s| format!("{s:?}"))
            .unwrap_or_else(|| "Unknown".to_string());
        let ready = if is_condition_true(&status.conditions, CONDITION_TYPE_READY) {
            "Ready"
        } else {
            "NotReady"
        };
        println!(
            "  {}/{}: {} ({})",
            cluster.namespace().unwrap_or_default(),
            cluster.name_any(),
            state,
            ready
        );
        if !status.reconcile_status.reason.is_empty() {
            println!("    reason: {}", status.reconcile_status.reason);
        }
    }
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Plain => registry.with(fmt::layer().with_target(true)).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_format);

    info!("Starting NVMesh Operator v{}", env!("CARGO_PKG_VERSION"));

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    let options = OperatorOptions {
        resources_dir: args.resources_dir,
        default_core_image_tag: args.default_core_image_tag,
        openshift: args.openshift,
        development: args.development,
        namespace: args.namespace,
    };
    info!(
        "Watching {} with manifests from {}",
        options.namespace.as_deref().unwrap_or("all namespaces"),
        options.resources_dir.display()
    );

    controller::run_controller(client, options).await
}
