//! QUIC File Transfer CLI - Main Entry Point
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          CLI Application                                │
//! │  ┌─────────┐  ┌─────────┐  ┌────────┐  ┌──────────┐  ┌──────┐  ┌───────┐ │
//! │  │  cert   │  │  serve  │  │ upload │  │ download │  │ list │  │ shell │ │
//! │  └─────────┘  └─────────┘  └────────┘  └──────────┘  └──────┘  └───────┘ │
//! │                                    │                                    │
//! │  ┌─────────────────────────────────────────────────────────────────────┐│
//! │  │                 Dispatcher (one operation at a time)                ││
//! │  └─────────────────────────────────────────────────────────────────────┘│
//! │                                    │                                    │
//! │  ┌─────────────────────────────────────────────────────────────────────┐│
//! │  │                 Protocol Layer (frames per stream)                  ││
//! │  └─────────────────────────────────────────────────────────────────────┘│
//! │                                    │                                    │
//! │  ┌─────────────────────────────────────────────────────────────────────┐│
//! │  │            QUIC (quinn) + TLS 1.3 (rustls) + trust policy           ││
//! │  └─────────────────────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use quic_file_transfer::client::{format_size, ClientConfig, DEFAULT_SERVER_ADDR};
use quic_file_transfer::dispatcher::{Dispatcher, Operation, Outcome};
use quic_file_transfer::protocol::{FilenameFraming, DEFAULT_ALPN};
use quic_file_transfer::server::{Server, ServerConfig};
use quic_file_transfer::tls::{
    fingerprint_from_file, generate_self_signed_cert, save_cert_and_key, ServerTlsConfig,
    TrustPolicy,
};

/// QUIC File Transfer CLI
///
/// Upload, download and list files over independent QUIC streams.
#[derive(Parser)]
#[command(name = "qft")]
#[command(version)]
#[command(about = "File transfer over QUIC streams", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Certificate management commands
    Cert {
        #[command(subcommand)]
        action: CertCommands,
    },

    /// Start the file transfer server
    Serve {
        /// Address to bind to
        #[arg(short, long, default_value = "0.0.0.0:4242")]
        bind: SocketAddr,

        /// Path to the server certificate (PEM)
        #[arg(long)]
        cert: PathBuf,

        /// Path to the server private key (PEM)
        #[arg(long)]
        key: PathBuf,

        /// Storage directory for files
        #[arg(short, long, default_value = "./server_files")]
        storage: PathBuf,

        /// Maximum file size in MB
        #[arg(long, default_value = "1024")]
        max_size: u64,

        /// Close connections idle for this many seconds
        #[arg(long)]
        idle_timeout: Option<u64>,

        /// Application protocol identifier
        #[arg(long, default_value = DEFAULT_ALPN)]
        alpn: String,
    },

    /// Upload a file from the upload directory
    Upload {
        #[command(flatten)]
        connect: ConnectArgs,

        /// File name inside the upload directory
        name: String,
    },

    /// Download a file into the download directory
    Download {
        #[command(flatten)]
        connect: ConnectArgs,

        /// Remote file name
        name: String,
    },

    /// List files on the server
    List {
        #[command(flatten)]
        connect: ConnectArgs,
    },

    /// Run operations from stdin over one session (upload <name> | download <name> | list | exit)
    Shell {
        #[command(flatten)]
        connect: ConnectArgs,
    },
}

#[derive(Subcommand)]
enum CertCommands {
    /// Generate a self-signed certificate for testing
    Generate {
        /// Output directory for certificate and key
        #[arg(short, long, default_value = "./certs")]
        output: PathBuf,

        /// Common name for the certificate
        #[arg(long, default_value = "localhost")]
        cn: String,

        /// Additional DNS names (comma-separated)
        #[arg(long)]
        dns: Option<String>,

        /// Additional IP addresses (comma-separated)
        #[arg(long)]
        ip: Option<String>,
    },

    /// Print the SHA-256 fingerprint of a certificate
    Fingerprint {
        /// Path to the certificate (PEM)
        cert: PathBuf,
    },
}

#[derive(Args)]
struct ConnectArgs {
    /// Server address
    #[arg(short, long, default_value = DEFAULT_SERVER_ADDR)]
    server: SocketAddr,

    /// Server hostname for TLS verification
    #[arg(long, default_value = "localhost")]
    hostname: String,

    /// Application protocol identifier
    #[arg(long, default_value = DEFAULT_ALPN)]
    alpn: String,

    /// Verify the server against this CA certificate (PEM)
    #[arg(long, conflicts_with_all = ["pin", "insecure"])]
    ca: Option<PathBuf>,

    /// Accept only the server certificate with this SHA-256 fingerprint
    #[arg(long, conflicts_with = "insecure")]
    pin: Option<String>,

    /// Known hosts file used for trust-on-first-use
    #[arg(long, default_value = "known_hosts.json")]
    known_hosts: PathBuf,

    /// Skip certificate verification (INSECURE!)
    #[arg(long)]
    insecure: bool,

    /// Directory holding files to upload
    #[arg(long, default_value = "./client_files")]
    upload_dir: PathBuf,

    /// Directory receiving downloads
    #[arg(long, default_value = "./client_downloads")]
    download_dir: PathBuf,

    /// Send filenames without a length prefix (legacy servers)
    #[arg(long)]
    raw_filenames: bool,

    /// Per-operation deadline in seconds
    #[arg(long, default_value = "300")]
    timeout: u64,

    /// Disable progress bars
    #[arg(long)]
    no_progress: bool,
}

impl ConnectArgs {
    fn trust_policy(&self) -> TrustPolicy {
        if self.insecure {
            TrustPolicy::SkipVerification
        } else if let Some(pin) = &self.pin {
            TrustPolicy::PinFingerprint(pin.clone())
        } else if let Some(ca) = &self.ca {
            TrustPolicy::VerifyChain {
                ca: Some(ca.clone()),
            }
        } else {
            TrustPolicy::TrustOnFirstUse {
                known_hosts: self.known_hosts.clone(),
            }
        }
    }

    fn into_config(self) -> ClientConfig {
        let trust = self.trust_policy();
        let mut config = ClientConfig::default()
            .with_server(self.server, &self.hostname)
            .with_trust(trust)
            .with_directories(self.upload_dir, self.download_dir);
        config.alpn = self.alpn;
        config.operation_timeout = Duration::from_secs(self.timeout);
        config.show_progress = !self.no_progress;
        if self.raw_filenames {
            config.filename_framing = FilenameFraming::Raw;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Only fails if a provider is already installed
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Cert { action } => handle_cert_command(action),
        Commands::Serve {
            bind,
            cert,
            key,
            storage,
            max_size,
            idle_timeout,
            alpn,
        } => {
            let max_file_size = megabytes_to_bytes(max_size)?;
            let idle_timeout = idle_timeout.map(Duration::from_secs);
            run_server(bind, cert, key, storage, max_file_size, idle_timeout, &alpn).await
        }
        Commands::Upload { connect, name } => {
            run_once(connect.into_config(), Operation::Upload { name }).await
        }
        Commands::Download { connect, name } => {
            run_once(connect.into_config(), Operation::Download { name }).await
        }
        Commands::List { connect } => run_once(connect.into_config(), Operation::List).await,
        Commands::Shell { connect } => run_shell(connect.into_config()).await,
    }
}

fn handle_cert_command(action: CertCommands) -> Result<()> {
    match action {
        CertCommands::Generate {
            output,
            cn,
            dns,
            ip,
        } => {
            info!("🔐 Generating self-signed certificate...");

            let dns_names: Vec<String> = dns
                .as_deref()
                .map(|s| s.split(',').map(|x| x.trim().to_string()).collect())
                .unwrap_or_else(|| vec![cn.clone()]);
            let dns_refs: Vec<&str> = dns_names.iter().map(|s| s.as_str()).collect();

            let ip_addrs: Vec<std::net::IpAddr> = match ip.as_deref() {
                Some(s) => s
                    .split(',')
                    .filter_map(|ip| ip.trim().parse().ok())
                    .collect(),
                None => vec![std::net::IpAddr::from([127, 0, 0, 1])],
            };

            let cert = generate_self_signed_cert(&cn, &dns_refs, &ip_addrs)?;

            std::fs::create_dir_all(&output)?;

            let cert_path = output.join("cert.pem");
            let key_path = output.join("key.pem");

            save_cert_and_key(&cert.cert_pem, &cert.key_pem, &cert_path, &key_path)?;

            info!("✅ Certificate generated successfully!");
            info!("   Certificate: {:?}", cert_path);
            info!("   Private key: {:?}", key_path);
            info!("   SHA-256:     {}", cert.fingerprint);
            info!("");
            info!("📝 Usage:");
            info!("   Server: qft serve --cert {:?} --key {:?}", cert_path, key_path);
            info!("   Client: qft list --pin {}", cert.fingerprint);

            Ok(())
        }
        CertCommands::Fingerprint { cert } => {
            println!("{}", fingerprint_from_file(&cert)?);
            Ok(())
        }
    }
}

fn megabytes_to_bytes(megabytes: u64) -> Result<u64> {
    megabytes
        .checked_mul(1024 * 1024)
        .ok_or_else(|| anyhow::anyhow!("--max-size {} MB does not fit in 64 bits", megabytes))
}

async fn run_server(
    bind: SocketAddr,
    cert: PathBuf,
    key: PathBuf,
    storage: PathBuf,
    max_file_size: u64,
    idle_timeout: Option<Duration>,
    alpn: &str,
) -> Result<()> {
    info!("🚀 Starting QUIC file transfer server...");

    let tls_config = ServerTlsConfig::from_files(&cert, &key, alpn)?;

    let config = ServerConfig {
        bind_addr: bind,
        storage_dir: storage,
        tls_config,
        max_file_size,
        idle_timeout,
    };

    let server = Server::bind(config).await?;

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            server.close();
            Ok(())
        }
    }
}

/// Run a single operation, then close the session
async fn run_once(config: ClientConfig, operation: Operation) -> Result<()> {
    config.ensure_directories().await?;

    let mut dispatcher = Dispatcher::new(config);
    let result = dispatcher.dispatch(operation).await;
    dispatcher.shutdown().await;

    let outcome = result?;
    report_outcome(&outcome);

    if let Outcome::Downloaded(report) = &outcome {
        report.ensure_complete()?;
    }
    Ok(())
}

/// Read operations line by line and run them over one session
async fn run_shell(config: ClientConfig) -> Result<()> {
    config.ensure_directories().await?;

    let mut dispatcher = Dispatcher::new(config);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("Commands: upload <name> | download <name> | list | exit");
    loop {
        print!("qft> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit") {
            break;
        }

        let operation: Operation = match line.parse() {
            Ok(operation) => operation,
            Err(e) => {
                warn!("{}", e);
                continue;
            }
        };

        match dispatcher.dispatch(operation).await {
            Ok(outcome) => report_outcome(&outcome),
            Err(e) => error!("❌ {}", e),
        }
    }

    dispatcher.shutdown().await;
    Ok(())
}

fn report_outcome(outcome: &Outcome) {
    match outcome {
        Outcome::Uploaded(report) => {
            println!(
                "'{}' uploaded: {} bytes sent ({} content), sha256 {}",
                report.filename,
                report.total_bytes(),
                report.content_bytes,
                report.sha256
            );
        }
        Outcome::Downloaded(report) if report.is_complete() => {
            println!(
                "'{}' downloaded: {} bytes -> {:?}, sha256 {}",
                report.filename, report.received, report.local_path, report.sha256
            );
        }
        Outcome::Downloaded(report) => {
            println!(
                "'{}' downloaded partially: {}/{} bytes ({} missing), kept at {:?}",
                report.filename,
                report.received,
                report.advertised,
                report.shortfall(),
                report.local_path
            );
        }
        Outcome::Listed(listing) if listing.is_empty() => {
            println!("(no files on server)");
        }
        Outcome::Listed(listing) => {
            println!();
            println!("{:<48} {:>12}", "Name", "Size");
            println!("{:-<61}", "");
            for entry in &listing.entries {
                println!("{:<48} {:>12}", entry.name, format_size(entry.size));
            }
            for line in &listing.unparsed {
                println!("{}", line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_megabytes_to_bytes() {
        assert_eq!(megabytes_to_bytes(1024).unwrap(), 1024 * 1024 * 1024);
        assert_eq!(megabytes_to_bytes(0).unwrap(), 0);
        assert!(megabytes_to_bytes(u64::MAX / 1024).is_err());
    }

    #[test]
    fn test_trust_precedence() {
        let cli = Cli::parse_from(["qft", "list", "--pin", "ab", "--known-hosts", "k.json"]);
        let Commands::List { connect } = cli.command else {
            panic!("expected list");
        };
        assert_eq!(connect.trust_policy(), TrustPolicy::PinFingerprint("ab".to_string()));

        let cli = Cli::parse_from(["qft", "list"]);
        let Commands::List { connect } = cli.command else {
            panic!("expected list");
        };
        assert!(matches!(
            connect.trust_policy(),
            TrustPolicy::TrustOnFirstUse { .. }
        ));
    }
}
