//! QUIC File Transfer Client Module
//!
//! This module implements the client side of the protocol:
//! - [`ClientConfig`]: endpoint, trust policy, local directories and deadlines
//! - [`Session`]: one QUIC connection that hands out a fresh stream per operation
//! - [`list_files`], [`upload_file`], [`download_file`]: the per-stream exchanges
//!
//! The exchanges are written against tokio's `AsyncRead`/`AsyncWrite`, so they
//! run unchanged over a `quinn` stream pair or an in-memory pipe.
//!
//! ## Stream Lifecycle
//!
//! ```text
//! Session (one connection)
//!   |
//!   |-- open_bi --> stream #0: LIST ............ closed
//!   |-- open_bi --> stream #4: UP name data .... closed
//!   |-- open_bi --> stream #8: DOWN name ....... closed
//!   |
//!   `-- close (client exit)
//! ```

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use quinn::{Connection, Endpoint, ReadError, ReadToEndError, RecvStream, SendStream};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info, warn};

use crate::protocol::{
    decode_size, encode_filename, read_size_frame, validate_filename, Command, FilenameFraming,
    ProtocolError, StreamingHasher, ACK_TOKEN, CHUNK_SIZE, DEFAULT_ALPN,
};
use crate::tls::{ClientTlsConfig, TrustPolicy};

/// Default server endpoint
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:4242";

/// Default time allowed for the QUIC handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for a single operation
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(300);

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Failed to open stream: {0}")]
    StreamOpenFailed(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Malformed size frame: {0}")]
    MalformedSizeFrame(String),

    #[error("Remote file not found: {0}")]
    RemoteFileNotFound(String),

    #[error("Server abandoned the upload (stream error code {0})")]
    UploadRejected(u64),

    #[error("Transfer incomplete: received {received} of {advertised} bytes")]
    TransferIncomplete { advertised: u64, received: u64 },

    #[error("Local I/O failed on {path:?}: {source}")]
    LocalIoFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Listing failed: {0}")]
    ListFailed(#[source] io::Error),

    #[error("Stream I/O error: {0}")]
    Stream(#[source] io::Error),

    #[error("Invalid filename: {0}")]
    InvalidFilename(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("TLS configuration error: {0}")]
    Tls(String),
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => ClientError::Stream(e),
            ProtocolError::InvalidCommand(msg) | ProtocolError::MalformedFrame(msg) => {
                ClientError::MalformedFrame(msg)
            }
            ProtocolError::InvalidFilename(msg) => ClientError::InvalidFilename(msg),
        }
    }
}

fn local_io(path: &Path) -> impl FnOnce(io::Error) -> ClientError + '_ {
    move |source| ClientError::LocalIoFailed {
        path: path.to_path_buf(),
        source,
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address to connect to
    pub server_addr: SocketAddr,
    /// Server name for SNI and certificate checks
    pub server_name: String,
    /// Application protocol identifier
    pub alpn: String,
    /// How the server certificate is judged
    pub trust: TrustPolicy,
    /// Directory holding files eligible for upload
    pub upload_dir: PathBuf,
    /// Directory receiving downloaded files
    pub download_dir: PathBuf,
    /// Filename field encoding on the wire
    pub filename_framing: FilenameFraming,
    /// Handshake deadline
    pub connect_timeout: Duration,
    /// Deadline for one operation, including connecting
    pub operation_timeout: Duration,
    /// Draw progress bars for bulk transfers
    pub show_progress: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 4242)),
            server_name: "localhost".to_string(),
            alpn: DEFAULT_ALPN.to_string(),
            trust: TrustPolicy::TrustOnFirstUse {
                known_hosts: PathBuf::from("known_hosts.json"),
            },
            upload_dir: PathBuf::from("./client_files"),
            download_dir: PathBuf::from("./client_downloads"),
            filename_framing: FilenameFraming::LengthPrefixed,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            show_progress: true,
        }
    }
}

impl ClientConfig {
    /// Sets the server endpoint and SNI name.
    pub fn with_server(mut self, addr: SocketAddr, server_name: &str) -> Self {
        self.server_addr = addr;
        self.server_name = server_name.to_string();
        self
    }

    /// Sets the trust policy.
    pub fn with_trust(mut self, trust: TrustPolicy) -> Self {
        self.trust = trust;
        self
    }

    /// Sets the upload and download directories.
    pub fn with_directories(mut self, upload_dir: PathBuf, download_dir: PathBuf) -> Self {
        self.upload_dir = upload_dir;
        self.download_dir = download_dir;
        self
    }

    /// Create the local directories if they are missing
    pub async fn ensure_directories(&self) -> Result<(), ClientError> {
        for dir in [&self.upload_dir, &self.download_dir] {
            fs::create_dir_all(dir).await.map_err(local_io(dir))?;
            debug!("Directory ready: {:?}", dir);
        }
        Ok(())
    }
}

/// One QUIC connection to the server
pub struct Session {
    endpoint: Endpoint,
    connection: Connection,
}

impl Session {
    /// Establish a connection using the configured endpoint and trust policy
    pub async fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        info!("🔗 Connecting to {}...", config.server_addr);

        let tls = ClientTlsConfig::new(&config.trust, &config.server_name, &config.alpn)
            .map_err(|e| ClientError::Tls(format!("{:#}", e)))?;

        let bind_addr: SocketAddr = if config.server_addr.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };

        let mut endpoint = Endpoint::client(bind_addr)
            .map_err(|e| ClientError::ConnectionFailed(format!("bind {}: {}", bind_addr, e)))?;
        endpoint.set_default_client_config(tls.config);

        let connecting = endpoint
            .connect(config.server_addr, &tls.server_name)
            .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;

        let connection = match tokio::time::timeout(config.connect_timeout, connecting).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                return Err(ClientError::ConnectionFailed(format!(
                    "{}: {}",
                    config.server_addr, e
                )))
            }
            Err(_) => {
                endpoint.close(0u32.into(), b"connect timeout");
                return Err(ClientError::ConnectionFailed(format!(
                    "{}: handshake timed out after {:?}",
                    config.server_addr, config.connect_timeout
                )));
            }
        };

        let session = Self {
            endpoint,
            connection,
        };

        info!("🔐 QUIC connection established");
        if let Some(protocol) = session.protocol() {
            info!("  Protocol: {}", protocol);
        }

        Ok(session)
    }

    /// Address of the connected peer
    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Application protocol negotiated during the handshake
    pub fn protocol(&self) -> Option<String> {
        self.connection
            .handshake_data()
            .and_then(|data| data.downcast::<quinn::crypto::rustls::HandshakeData>().ok())
            .and_then(|data| data.protocol)
            .map(|protocol| String::from_utf8_lossy(&protocol).into_owned())
    }

    pub fn is_open(&self) -> bool {
        self.connection.close_reason().is_none()
    }

    /// Open a new bidirectional stream for one operation
    pub async fn open_stream(&self) -> Result<(SendStream, RecvStream), ClientError> {
        let (send, recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|e| ClientError::StreamOpenFailed(e.to_string()))?;
        debug!("Opened stream {}", send.id());
        Ok((send, recv))
    }

    /// Close the connection and wait for the endpoint to drain
    pub async fn close(self) {
        self.connection.close(0u32.into(), b"client exit");
        self.endpoint.wait_idle().await;
        debug!("Session with {} closed", self.connection.remote_address());
    }
}

/// Upper bound on bytes accepted back on an upload stream
const UPLOAD_REPLY_LIMIT: usize = 1024;

/// Wait until the server has finished with an upload stream.
///
/// The send side must already be finished. The server closes its half once
/// the file is stored, or stops and resets the stream when it gives up on the
/// upload (bad name, size limit, disk error).
pub async fn confirm_upload(
    send: &mut SendStream,
    recv: &mut RecvStream,
) -> Result<(), ClientError> {
    match send.stopped().await {
        Ok(None) => debug!("Upload stream fully acknowledged"),
        Ok(Some(code)) => return Err(ClientError::UploadRejected(code.into_inner())),
        Err(e) => debug!("Upload stream state unknown: {}", e),
    }

    match recv.read_to_end(UPLOAD_REPLY_LIMIT).await {
        Ok(reply) if reply.is_empty() => Ok(()),
        Ok(reply) => {
            warn!("Ignoring {} unexpected byte(s) after upload", reply.len());
            Ok(())
        }
        Err(ReadToEndError::Read(ReadError::Reset(code))) => {
            Err(ClientError::UploadRejected(code.into_inner()))
        }
        Err(e) => Err(ClientError::Stream(io::Error::other(e))),
    }
}

/// A remote file as reported by a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
}

impl FileEntry {
    /// Parse a `<name> (<size> bytes)` listing line
    pub fn parse(line: &str) -> Option<Self> {
        let (name, rest) = line.rsplit_once(" (")?;
        let size = rest.strip_suffix(" bytes)")?.trim().parse().ok()?;
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            size,
        })
    }
}

/// Result of a successful listing, in server order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub entries: Vec<FileEntry>,
    /// Non-blank lines that did not match the entry format
    pub unparsed: Vec<String>,
}

impl Listing {
    pub fn parse(text: &str) -> Self {
        let mut listing = Listing::default();
        for line in text.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
            match FileEntry::parse(line) {
                Some(entry) => listing.entries.push(entry),
                None => listing.unparsed.push(line.to_string()),
            }
        }
        listing
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.unparsed.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<&FileEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }
}

/// Outcome of an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub filename: String,
    /// Bytes of the filename field, including any length prefix
    pub filename_bytes: u64,
    pub content_bytes: u64,
    pub sha256: String,
}

impl UploadReport {
    pub fn total_bytes(&self) -> u64 {
        self.filename_bytes + self.content_bytes
    }
}

/// Outcome of a download that reached end-of-stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub filename: String,
    pub local_path: PathBuf,
    pub advertised: u64,
    pub received: u64,
    pub sha256: String,
}

impl DownloadReport {
    pub fn is_complete(&self) -> bool {
        self.received == self.advertised
    }

    /// Bytes announced but never received
    pub fn shortfall(&self) -> u64 {
        self.advertised.saturating_sub(self.received)
    }

    pub fn ensure_complete(&self) -> Result<(), ClientError> {
        if self.is_complete() {
            Ok(())
        } else {
            Err(ClientError::TransferIncomplete {
                advertised: self.advertised,
                received: self.received,
            })
        }
    }
}

/// A local file opened and checked before any stream is touched
pub struct UploadSource {
    name: String,
    path: PathBuf,
    file: File,
    size: u64,
}

impl UploadSource {
    pub async fn open(path: &Path, remote_name: &str) -> Result<Self, ClientError> {
        let name = validate_filename(remote_name)?;

        let file = File::open(path).await.map_err(local_io(path))?;
        let metadata = file.metadata().await.map_err(local_io(path))?;
        if metadata.is_dir() {
            return Err(ClientError::LocalIoFailed {
                path: path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "is a directory"),
            });
        }

        Ok(Self {
            name,
            path: path.to_path_buf(),
            file,
            size: metadata.len(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Request the remote listing.
///
/// The listing ends when the peer closes its side of the stream. An empty
/// listing is a successful, empty [`Listing`].
pub async fn list_files<W, R>(writer: &mut W, reader: &mut R) -> Result<Listing, ClientError>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    writer
        .write_all(&Command::List.frame())
        .await
        .map_err(ClientError::Stream)?;
    writer.shutdown().await.map_err(ClientError::Stream)?;

    let mut raw = Vec::new();
    reader
        .read_to_end(&mut raw)
        .await
        .map_err(ClientError::ListFailed)?;

    let listing = Listing::parse(&String::from_utf8_lossy(&raw));
    debug!(
        "Listing: {} entries, {} unparsed lines",
        listing.entries.len(),
        listing.unparsed.len()
    );
    if !listing.unparsed.is_empty() {
        warn!("Listing contained {} unrecognized line(s)", listing.unparsed.len());
    }

    Ok(listing)
}

/// Send a file: command frame, filename field, content, then close.
///
/// No acknowledgment is awaited; success means every write went through.
pub async fn upload_file<W>(
    writer: &mut W,
    source: UploadSource,
    framing: FilenameFraming,
    show_progress: bool,
) -> Result<UploadReport, ClientError>
where
    W: AsyncWrite + Unpin,
{
    let UploadSource {
        name,
        path,
        file,
        size,
    } = source;
    let field = encode_filename(&name, framing)?;

    writer
        .write_all(&Command::Upload.frame())
        .await
        .map_err(ClientError::Stream)?;
    writer.write_all(&field).await.map_err(ClientError::Stream)?;

    info!("📤 Uploading {} ({} bytes)", name, size);

    let pb = create_progress_bar(size, show_progress);
    pb.set_message("Uploading");

    let mut file_reader = BufReader::new(file);
    let mut hasher = StreamingHasher::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let bytes_read = file_reader
            .read(&mut buffer)
            .await
            .map_err(local_io(&path))?;
        if bytes_read == 0 {
            break;
        }

        writer
            .write_all(&buffer[..bytes_read])
            .await
            .map_err(ClientError::Stream)?;

        hasher.update(&buffer[..bytes_read]);
        pb.set_position(hasher.bytes_processed());
    }

    writer.shutdown().await.map_err(ClientError::Stream)?;
    pb.finish_with_message("Upload complete");

    let content_bytes = hasher.bytes_processed();
    let report = UploadReport {
        filename: name,
        filename_bytes: field.len() as u64,
        content_bytes,
        sha256: hasher.finalize(),
    };

    info!(
        "✅ Uploaded {}: {} bytes sent, sha256 {}",
        report.filename,
        report.total_bytes(),
        report.sha256
    );

    Ok(report)
}

/// Fetch a file into `download_dir`.
///
/// Nothing is written locally until the peer has announced a size and the
/// `READY` token has been sent. A short transfer is returned as an incomplete
/// [`DownloadReport`] and the partial file is kept.
pub async fn download_file<W, R>(
    writer: &mut W,
    reader: &mut R,
    remote_name: &str,
    download_dir: &Path,
    framing: FilenameFraming,
    show_progress: bool,
) -> Result<DownloadReport, ClientError>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let name = validate_filename(remote_name)?;
    let field = encode_filename(&name, framing)?;

    // Request
    writer
        .write_all(&Command::Download.frame())
        .await
        .map_err(ClientError::Stream)?;
    writer.write_all(&field).await.map_err(ClientError::Stream)?;
    writer.flush().await.map_err(ClientError::Stream)?;

    // Size negotiation
    let frame = read_size_frame(reader).await?;
    let (advertised, is_error) = match decode_size(&frame) {
        Ok(decoded) => decoded,
        Err(e) => {
            let _ = writer.shutdown().await;
            return Err(ClientError::MalformedSizeFrame(e.to_string()));
        }
    };
    if is_error {
        let _ = writer.shutdown().await;
        return Err(ClientError::RemoteFileNotFound(name));
    }

    // Acknowledge
    writer.write_all(ACK_TOKEN).await.map_err(ClientError::Stream)?;
    writer.shutdown().await.map_err(ClientError::Stream)?;

    info!("📥 Downloading {} ({} bytes)", name, advertised);

    // Bulk transfer
    let local_path = download_dir.join(&name);
    if let Some(parent) = local_path.parent() {
        fs::create_dir_all(parent).await.map_err(local_io(parent))?;
    }
    let file = File::create(&local_path)
        .await
        .map_err(local_io(&local_path))?;
    let mut file_writer = BufWriter::new(file);

    let pb = create_progress_bar(advertised, show_progress);
    pb.set_message("Downloading");

    let mut hasher = StreamingHasher::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let chunk_size = match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                let _ = file_writer.flush().await;
                pb.abandon_with_message("Download failed");
                warn!(
                    "Partial file left at {:?} ({} bytes)",
                    local_path,
                    hasher.bytes_processed()
                );
                return Err(ClientError::Stream(e));
            }
        };

        file_writer
            .write_all(&buffer[..chunk_size])
            .await
            .map_err(local_io(&local_path))?;
        hasher.update(&buffer[..chunk_size]);
        pb.set_position(hasher.bytes_processed());
    }

    file_writer.flush().await.map_err(local_io(&local_path))?;

    // Verification
    let received = hasher.bytes_processed();
    let report = DownloadReport {
        filename: name,
        local_path,
        advertised,
        received,
        sha256: hasher.finalize(),
    };

    if report.is_complete() {
        pb.finish_with_message("Download complete");
        info!(
            "✅ Downloaded {}: {} bytes, sha256 {}",
            report.filename, report.received, report.sha256
        );
    } else {
        pb.abandon_with_message("Download incomplete");
        warn!(
            "⚠️  Downloaded {}: {}/{} bytes",
            report.filename, report.received, report.advertised
        );
    }

    Ok(report)
}

/// Create progress bar for transfers
fn create_progress_bar(total_size: u64, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(total_size);
    if let Ok(style) = ProgressStyle::default_bar().template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
    ) {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

/// Format file size for display
pub fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} B", size)
    }
}
