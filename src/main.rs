//! NFS-e command line client.
//!
//! Run with: `nfse-soap-client --config nfse.yaml query --number 1024`

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nfse_soap_client::rps::{CancellationRequest, Invoice};
use nfse_soap_client::service::ServiceOperation;
use nfse_soap_client::{CertificateMaterial, ClientConfig, InvoiceService, ResponseInterpreter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Issue, query and cancel NFS-e through the municipal SOAP webservice.
///
/// Authenticates with the PKCS#12 certificate named in the configuration
/// and prints the interpreted response as JSON.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML)
    #[arg(short, long, default_value = "nfse.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the provider's municipal registration
    Registration,

    /// Issue an NFS-e from an invoice file (YAML)
    Issue {
        #[arg(short, long)]
        invoice: PathBuf,
    },

    /// Query an issued NFS-e
    Query {
        #[arg(short, long)]
        number: String,
    },

    /// Cancel an issued NFS-e
    Cancel {
        #[arg(short, long)]
        number: String,

        #[arg(short, long)]
        reason: String,

        #[arg(long)]
        verification_code: Option<String>,
    },

    /// Query the processing state of an RPS batch
    QueryBatch {
        #[arg(short, long)]
        protocol: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = args.log_level.parse().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Starting NFS-e client v{}", env!("CARGO_PKG_VERSION"));
    info!("Config file: {}", args.config.display());

    let content = tokio::fs::read_to_string(&args.config)
        .await
        .context("Failed to read config file")?;
    let config = ClientConfig::from_yaml(&content).context("Failed to parse config file")?;

    let password = config
        .certificate
        .resolve_password()
        .context("Certificate password unavailable")?;
    let container = tokio::fs::read(&config.certificate.path)
        .await
        .with_context(|| format!("Failed to read certificate {}", config.certificate.path.display()))?;
    let material = CertificateMaterial::load(&container, &password)
        .context("Failed to load certificate")?;

    let service = InvoiceService::new(&config, Arc::new(material))
        .context("Failed to configure NFS-e service")?;

    tokio::select! {
        result = run(&service, args.command) => result,
        _ = shutdown_signal() => {
            info!("Shutdown signal received, abandoning request");
            anyhow::bail!("interrupted")
        }
    }
}

async fn run(service: &InvoiceService, command: Command) -> Result<()> {
    let (operation, envelope) = match command {
        Command::Registration => {
            let registration = service.registration().await?;
            println!("{}", registration);
            return Ok(());
        }
        Command::Issue { invoice } => {
            let content = tokio::fs::read_to_string(&invoice)
                .await
                .context("Failed to read invoice file")?;
            let invoice: Invoice =
                serde_yaml::from_str(&content).context("Failed to parse invoice file")?;
            (ServiceOperation::EnviarLoteRps, service.issue(&invoice).await?)
        }
        Command::Query { number } => (ServiceOperation::ConsultarNfse, service.query(&number).await?),
        Command::Cancel {
            number,
            reason,
            verification_code,
        } => {
            let mut request = CancellationRequest::new(number, reason);
            request.verification_code = verification_code;
            (ServiceOperation::CancelarNfse, service.cancel(&request).await?)
        }
        Command::QueryBatch { protocol } => (
            ServiceOperation::ConsultarLoteRps,
            service.query_batch(&protocol).await?,
        ),
    };

    let result = ResponseInterpreter::default()
        .normalize(Some(&envelope), Some(operation.result_path().as_str()));
    println!("{}", serde_json::to_string_pretty(&result)?);

    if !result.success {
        anyhow::bail!(
            "{} was rejected: {}",
            operation.name(),
            result.error.unwrap_or_default()
        );
    }
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
