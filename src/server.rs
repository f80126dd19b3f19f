//! QUIC File Transfer Server Module
//!
//! This module implements the serving side of the protocol:
//! - Accepts QUIC connections (TLS 1.3 is built into the transport)
//! - Handles every incoming bidirectional stream in its own task
//! - Serves listing, upload and download requests from one storage directory
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  QUIC Endpoint (quinn)                  │
//! │  - Certificate-based server authentication              │
//! │  - Connection limit (semaphore)                         │
//! └─────────────────────────────────────────────────────────┘
//!                          │ one task per connection
//! ┌─────────────────────────────────────────────────────────┐
//! │                   Stream Handler                        │
//! │  - Command frame dispatch (LIST / UP / DOWN)            │
//! │  - Filename validation (prevent traversal)              │
//! │  - Size limits                                          │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────────┐
//! │                     File System                         │
//! │  - Sandboxed storage directory                          │
//! └─────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use quinn::{ConnectionError, Endpoint, IdleTimeout, TransportConfig, VarInt};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::protocol::{
    encode_error_frame, encode_size, read_filename, validate_filename, Command, StreamingHasher,
    ACK_TOKEN, CHUNK_SIZE, COMMAND_FRAME_LEN, STREAM_ABORT_CODE,
};
use crate::tls::ServerTlsConfig;

/// Maximum concurrent connections
const MAX_CONNECTIONS: usize = 100;

/// Maximum file size (1 GB)
pub const MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// Server configuration
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Directory to store files
    pub storage_dir: PathBuf,
    /// TLS configuration
    pub tls_config: ServerTlsConfig,
    /// Maximum file size in bytes
    pub max_file_size: u64,
    /// Close connections that stay silent this long (quinn default when `None`)
    pub idle_timeout: Option<Duration>,
}

/// QUIC file transfer server
pub struct Server {
    endpoint: Endpoint,
    storage_dir: PathBuf,
    max_file_size: u64,
    connection_semaphore: Arc<Semaphore>,
}

impl Server {
    /// Prepare storage and bind the QUIC endpoint
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        setup_storage_directory(&config.storage_dir).await?;

        let mut server_config = config.tls_config.config;
        if let Some(idle_timeout) = config.idle_timeout {
            let mut transport = TransportConfig::default();
            let idle_timeout =
                IdleTimeout::try_from(idle_timeout).context("Idle timeout out of range")?;
            transport.max_idle_timeout(Some(idle_timeout));
            server_config.transport_config(Arc::new(transport));
        }

        let endpoint = Endpoint::server(server_config, config.bind_addr)
            .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

        Ok(Self {
            endpoint,
            storage_dir: config.storage_dir,
            max_file_size: config.max_file_size,
            connection_semaphore: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint
            .local_addr()
            .context("Failed to read endpoint address")
    }

    /// Accept connections until the endpoint is closed
    pub async fn run(&self) -> Result<()> {
        info!("🔒 QUIC file transfer server listening on {}", self.local_addr()?);
        info!("📁 Storage directory: {:?}", self.storage_dir);

        while let Some(incoming) = self.endpoint.accept().await {
            let peer_addr = incoming.remote_address();

            let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("Connection limit reached, rejecting {}", peer_addr);
                    incoming.refuse();
                    continue;
                }
            };

            let connecting = match incoming.accept() {
                Ok(connecting) => connecting,
                Err(e) => {
                    error!("Failed to accept connection from {}: {}", peer_addr, e);
                    continue;
                }
            };

            let storage_dir = self.storage_dir.clone();
            let max_file_size = self.max_file_size;

            tokio::spawn(async move {
                let _permit = permit;

                match handle_connection(connecting, peer_addr, storage_dir, max_file_size).await {
                    Ok(()) => debug!("Connection from {} closed normally", peer_addr),
                    Err(e) => warn!("Connection from {} error: {:#}", peer_addr, e),
                }
            });
        }

        Ok(())
    }

    /// Stop accepting and close every connection
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"server shutdown");
    }
}

/// Set up storage directory with proper permissions
async fn setup_storage_directory(storage_dir: &Path) -> Result<()> {
    if !storage_dir.exists() {
        fs::create_dir_all(storage_dir)
            .await
            .with_context(|| format!("Failed to create storage directory: {:?}", storage_dir))?;
        info!("Created storage directory: {:?}", storage_dir);
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = fs::metadata(storage_dir).await?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o700);
        fs::set_permissions(storage_dir, permissions).await?;
    }

    Ok(())
}

async fn handle_connection(
    connecting: quinn::Connecting,
    peer_addr: SocketAddr,
    storage_dir: PathBuf,
    max_file_size: u64,
) -> Result<()> {
    let connection = connecting.await.context("QUIC handshake failed")?;
    info!("📥 New connection from {}", peer_addr);

    loop {
        let (mut send, mut recv) = match connection.accept_bi().await {
            Ok(streams) => streams,
            Err(ConnectionError::ApplicationClosed(_)) | Err(ConnectionError::LocallyClosed) => {
                info!("Client {} disconnected", peer_addr);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let storage_dir = storage_dir.clone();
        tokio::spawn(async move {
            let stream_id = send.id();
            match serve_stream(&mut send, &mut recv, &storage_dir, max_file_size).await {
                Ok(command) => debug!("Stream {} ({}) done", stream_id, command),
                Err(e) => {
                    warn!("Stream {} from {} failed: {:#}", stream_id, peer_addr, e);
                    // A reset tells the client the request was abandoned
                    let code = VarInt::from_u32(STREAM_ABORT_CODE);
                    let _ = send.reset(code);
                    let _ = recv.stop(code);
                }
            }
        });
    }
}

/// Serve one stream: read the command frame and run the matching handler.
///
/// The writer is shut down only when the request succeeds. On error it is
/// left open so the caller can abort the stream instead.
pub async fn serve_stream<W, R>(
    writer: &mut W,
    reader: &mut R,
    storage_dir: &Path,
    max_file_size: u64,
) -> Result<Command>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let mut frame = [0u8; COMMAND_FRAME_LEN];
    reader
        .read_exact(&mut frame)
        .await
        .context("Failed to read command frame")?;
    let command = Command::from_frame(&frame)?;

    let result = match command {
        Command::List => handle_list(writer, storage_dir).await,
        Command::Upload => handle_upload(reader, storage_dir, max_file_size).await,
        Command::Download => handle_download(writer, reader, storage_dir).await,
    };

    result?;
    writer.shutdown().await?;
    Ok(command)
}

/// Write `<name> (<size> bytes)` lines, descending into subdirectories.
///
/// Nested files are listed as `dir/name`, the same form an upload to that
/// path uses.
async fn handle_list<W>(writer: &mut W, storage_dir: &Path) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut listing = String::new();
    let mut count = 0;
    let mut pending = vec![(storage_dir.to_path_buf(), String::new())];

    while let Some((dir, prefix)) = pending.pop() {
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to read directory: {:?}", dir))?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let relative = format!("{}{}", prefix, name);

            // Symlinks are neither files nor directories here
            match entry.metadata().await {
                Ok(m) if m.is_file() => {
                    listing.push_str(&format!("{} ({} bytes)\n", relative, m.len()));
                    count += 1;
                }
                Ok(m) if m.is_dir() => pending.push((entry.path(), format!("{}/", relative))),
                _ => {}
            }
        }
    }

    writer.write_all(listing.as_bytes()).await?;
    info!("📋 Listed {} file(s)", count);
    Ok(())
}

/// Receive a file until the client closes the stream
async fn handle_upload<R>(reader: &mut R, storage_dir: &Path, max_file_size: u64) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let filename = read_filename(reader).await?;
    let safe_filename = validate_filename(&filename)?;
    let file_path = storage_dir.join(&safe_filename);

    if let Some(parent) = file_path.parent() {
        fs::create_dir_all(parent)
            .await
            .context("Failed to create directory")?;
    }

    let file = File::create(&file_path)
        .await
        .with_context(|| format!("Failed to create file: {:?}", file_path))?;
    let mut file_writer = BufWriter::new(file);
    let mut hasher = StreamingHasher::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    info!("📤 Receiving file: {}", safe_filename);

    loop {
        let chunk_size = match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                drop(file_writer);
                let _ = fs::remove_file(&file_path).await;
                return Err(e).context("Failed to receive data");
            }
        };

        if hasher.bytes_processed() + chunk_size as u64 > max_file_size {
            drop(file_writer);
            let _ = fs::remove_file(&file_path).await;
            anyhow::bail!(
                "File too large: more than {} bytes (max: {})",
                hasher.bytes_processed(),
                max_file_size
            );
        }

        file_writer.write_all(&buffer[..chunk_size]).await?;
        hasher.update(&buffer[..chunk_size]);
    }

    file_writer.flush().await?;

    let total = hasher.bytes_processed();
    info!(
        "✅ File received: {} ({} bytes, sha256: {})",
        safe_filename,
        total,
        hasher.finalize()
    );

    Ok(())
}

/// Announce the size, wait for `READY`, then stream the file
async fn handle_download<W, R>(writer: &mut W, reader: &mut R, storage_dir: &Path) -> Result<()>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let filename = read_filename(reader).await?;

    let file_path = match validate_filename(&filename) {
        Ok(safe) => storage_dir.join(safe),
        Err(e) => {
            writer.write_all(&encode_error_frame()).await?;
            warn!("Refused download of {:?}: {}", filename, e);
            return Ok(());
        }
    };

    let file_size = match fs::metadata(&file_path).await {
        Ok(metadata) if metadata.is_file() => metadata.len(),
        _ => {
            writer.write_all(&encode_error_frame()).await?;
            info!("File not found: {}", filename);
            return Ok(());
        }
    };

    writer.write_all(&encode_size(file_size)).await?;
    writer.flush().await?;

    let mut ack = [0u8; ACK_TOKEN.len()];
    reader
        .read_exact(&mut ack)
        .await
        .context("Client did not acknowledge size frame")?;
    if &ack != ACK_TOKEN {
        anyhow::bail!("Expected READY, got {:?}", String::from_utf8_lossy(&ack));
    }

    info!("📥 Sending file: {} ({} bytes)", filename, file_size);

    let file = File::open(&file_path)
        .await
        .with_context(|| format!("Failed to open file: {:?}", file_path))?;
    let mut file_reader = BufReader::new(file);
    let sent = tokio::io::copy(&mut file_reader, writer)
        .await
        .context("Failed to send data")?;

    info!("✅ File sent: {} ({} bytes)", filename, sent);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{download_file, list_files, upload_file, UploadSource};
    use crate::protocol::FilenameFraming;
    use tokio::io::{duplex, split};

    const PIPE_CAPACITY: usize = 256 * 1024;

    /// Run one server-side stream against an in-memory pipe
    fn spawn_stream(
        storage: PathBuf,
        max_file_size: u64,
    ) -> (
        tokio::io::ReadHalf<tokio::io::DuplexStream>,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
        tokio::task::JoinHandle<Result<Command>>,
    ) {
        let (client, server) = duplex(PIPE_CAPACITY);
        let handle = tokio::spawn(async move {
            let (mut read, mut write) = split(server);
            serve_stream(&mut write, &mut read, &storage, max_file_size).await
        });
        let (read, write) = split(client);
        (read, write, handle)
    }

    #[tokio::test]
    async fn test_upload_then_download_round_trip() {
        let storage = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let upload_path = local.path().join("blob.bin");
        std::fs::write(&upload_path, &content).unwrap();

        let (_read, mut write, handle) = spawn_stream(storage.path().to_path_buf(), MAX_FILE_SIZE);
        let source = UploadSource::open(&upload_path, "blob.bin").await.unwrap();
        upload_file(&mut write, source, FilenameFraming::LengthPrefixed, false)
            .await
            .unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), Command::Upload);
        assert_eq!(std::fs::read(storage.path().join("blob.bin")).unwrap(), content);

        let downloads = local.path().join("downloads");
        let (mut read, mut write, handle) =
            spawn_stream(storage.path().to_path_buf(), MAX_FILE_SIZE);
        let report = download_file(
            &mut write,
            &mut read,
            "blob.bin",
            &downloads,
            FilenameFraming::LengthPrefixed,
            false,
        )
        .await
        .unwrap();
        handle.await.unwrap().unwrap();

        assert!(report.is_complete());
        assert_eq!(report.received, content.len() as u64);
        assert_eq!(std::fs::read(downloads.join("blob.bin")).unwrap(), content);
    }

    #[tokio::test]
    async fn test_list_skips_hidden_and_directories() {
        let storage = tempfile::tempdir().unwrap();
        std::fs::write(storage.path().join("a.txt"), b"abc").unwrap();
        std::fs::write(storage.path().join(".secret"), b"x").unwrap();
        std::fs::create_dir(storage.path().join("sub")).unwrap();

        let (mut read, mut write, handle) = spawn_stream(storage.path().to_path_buf(), MAX_FILE_SIZE);
        let listing = list_files(&mut write, &mut read).await.unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(listing.entries.len(), 1);
        assert_eq!(listing.entries[0].name, "a.txt");
        assert_eq!(listing.entries[0].size, 3);
        assert!(listing.unparsed.is_empty());
    }

    #[tokio::test]
    async fn test_list_includes_nested_uploads() {
        let storage = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let path = local.path().join("notes.txt");
        std::fs::write(&path, b"nested").unwrap();
        std::fs::create_dir_all(storage.path().join("empty").join(".hidden")).unwrap();

        let (_read, mut write, handle) = spawn_stream(storage.path().to_path_buf(), MAX_FILE_SIZE);
        let source = UploadSource::open(&path, "docs/notes.txt").await.unwrap();
        upload_file(&mut write, source, FilenameFraming::LengthPrefixed, false)
            .await
            .unwrap();
        handle.await.unwrap().unwrap();

        let (mut read, mut write, handle) = spawn_stream(storage.path().to_path_buf(), MAX_FILE_SIZE);
        let listing = list_files(&mut write, &mut read).await.unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(listing.entries.len(), 1);
        assert_eq!(listing.find("docs/notes.txt").unwrap().size, 6);

        // The listed name is a valid download name
        let downloads = local.path().join("downloads");
        let (mut read, mut write, handle) = spawn_stream(storage.path().to_path_buf(), MAX_FILE_SIZE);
        let report = download_file(
            &mut write,
            &mut read,
            "docs/notes.txt",
            &downloads,
            FilenameFraming::LengthPrefixed,
            false,
        )
        .await
        .unwrap();
        handle.await.unwrap().unwrap();
        assert!(report.is_complete());
        assert_eq!(std::fs::read(downloads.join("docs").join("notes.txt")).unwrap(), b"nested");
    }

    #[tokio::test]
    async fn test_download_invalid_name_sends_error_frame() {
        let storage = tempfile::tempdir().unwrap();
        let (mut read, mut write, handle) = spawn_stream(storage.path().to_path_buf(), MAX_FILE_SIZE);

        write.write_all(&Command::Download.frame()).await.unwrap();
        write.write_all(b"\x00\x0b../etc/pass").await.unwrap();

        let mut response = Vec::new();
        read.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, encode_error_frame());
        assert_eq!(handle.await.unwrap().unwrap(), Command::Download);
    }

    #[tokio::test]
    async fn test_download_missing_file_sends_error_frame() {
        let storage = tempfile::tempdir().unwrap();
        let (mut read, mut write, handle) = spawn_stream(storage.path().to_path_buf(), MAX_FILE_SIZE);

        write.write_all(&Command::Download.frame()).await.unwrap();
        write.write_all(b"\x00\x04none").await.unwrap();

        let mut response = Vec::new();
        read.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, encode_error_frame());
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_upload_rejects_traversal() {
        let storage = tempfile::tempdir().unwrap();
        let (_read, mut write, handle) = spawn_stream(storage.path().to_path_buf(), MAX_FILE_SIZE);

        write.write_all(&Command::Upload.frame()).await.unwrap();
        write.write_all(b"\x00\x09../x.txt!").await.unwrap();
        write.shutdown().await.unwrap();

        assert!(handle.await.unwrap().is_err());
        assert_eq!(std::fs::read_dir(storage.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_upload_over_limit_is_removed() {
        let storage = tempfile::tempdir().unwrap();
        let (_read, mut write, handle) = spawn_stream(storage.path().to_path_buf(), 8);

        write.write_all(&Command::Upload.frame()).await.unwrap();
        write.write_all(b"\x00\x05b.bin0123456789").await.unwrap();
        write.shutdown().await.unwrap();

        assert!(handle.await.unwrap().is_err());
        assert!(!storage.path().join("b.bin").exists());
    }

    #[tokio::test]
    async fn test_unknown_command_is_rejected() {
        let storage = tempfile::tempdir().unwrap();
        let (_read, mut write, handle) = spawn_stream(storage.path().to_path_buf(), MAX_FILE_SIZE);

        write.write_all(b"DELETE\0\0\0\0").await.unwrap();
        assert!(handle.await.unwrap().is_err());
    }
}
