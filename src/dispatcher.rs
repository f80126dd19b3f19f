//! Operation Dispatcher
//!
//! Runs one [`Operation`] at a time over a lazily established [`Session`].
//! The session survives between operations; each operation gets its own
//! stream. A failed connect leaves no session behind, so the next operation
//! simply tries again.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::{
    confirm_upload, download_file, list_files, upload_file, ClientConfig, ClientError,
    DownloadReport, Listing, Session, UploadReport, UploadSource,
};

/// A validated user request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Send `upload_dir/<name>` to the server as `<name>`
    Upload { name: String },
    /// Fetch `<name>` into `download_dir`
    Download { name: String },
    List,
}

/// Why a line of text is not an [`Operation`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseOperationError {
    #[error("'{0}' needs a file name")]
    MissingName(String),

    #[error("unknown operation: {0}")]
    Unknown(String),
}

impl FromStr for Operation {
    type Err = ParseOperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (verb, arg) = match s.split_once(char::is_whitespace) {
            Some((verb, arg)) => (verb, arg.trim()),
            None => (s, ""),
        };

        match (verb.to_ascii_lowercase().as_str(), arg) {
            ("list" | "ls", "") => Ok(Operation::List),
            ("upload" | "up", name) if !name.is_empty() => Ok(Operation::Upload {
                name: name.to_string(),
            }),
            ("download" | "down", name) if !name.is_empty() => Ok(Operation::Download {
                name: name.to_string(),
            }),
            ("upload" | "up" | "download" | "down", _) => {
                Err(ParseOperationError::MissingName(verb.to_string()))
            }
            _ => Err(ParseOperationError::Unknown(s.to_string())),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Upload { name } => write!(f, "upload {}", name),
            Operation::Download { name } => write!(f, "download {}", name),
            Operation::List => f.write_str("list"),
        }
    }
}

/// Typed result of a dispatched operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Uploaded(UploadReport),
    Downloaded(DownloadReport),
    Listed(Listing),
}

/// Sequences operations over one session
pub struct Dispatcher {
    config: ClientConfig,
    session: Option<Session>,
}

impl Dispatcher {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Whether a usable session is currently held
    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(Session::is_open)
    }

    /// Run one operation to completion under the configured deadline
    pub async fn dispatch(&mut self, operation: Operation) -> Result<Outcome, ClientError> {
        debug!("Dispatching: {}", operation);

        let deadline = self.config.operation_timeout;
        let result = match tokio::time::timeout(deadline, self.run(operation)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(deadline)),
        };

        if matches!(
            result,
            Err(ClientError::StreamOpenFailed(_)) | Err(ClientError::Timeout(_))
        ) {
            // The connection may be wedged; start fresh next time
            if let Some(session) = self.session.take() {
                warn!("Dropping session to {}", session.remote_address());
            }
        }

        result
    }

    /// Close the session, if any
    pub async fn shutdown(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
            info!("👋 Disconnected");
        }
    }

    async fn run(&mut self, operation: Operation) -> Result<Outcome, ClientError> {
        let config = &self.config;

        match operation {
            Operation::List => {
                let session = Self::ensure_session(&mut self.session, config).await?;
                let (mut send, mut recv) = session.open_stream().await?;
                let listing = list_files(&mut send, &mut recv).await?;
                Ok(Outcome::Listed(listing))
            }
            Operation::Upload { name } => {
                let local_path = config.upload_dir.join(&name);
                let source = UploadSource::open(&local_path, &name).await?;

                let session = Self::ensure_session(&mut self.session, config).await?;
                let (mut send, mut recv) = session.open_stream().await?;
                let report =
                    upload_file(&mut send, source, config.filename_framing, config.show_progress)
                        .await?;
                confirm_upload(&mut send, &mut recv).await?;

                Ok(Outcome::Uploaded(report))
            }
            Operation::Download { name } => {
                let session = Self::ensure_session(&mut self.session, config).await?;
                let (mut send, mut recv) = session.open_stream().await?;
                let report = download_file(
                    &mut send,
                    &mut recv,
                    &name,
                    &config.download_dir,
                    config.filename_framing,
                    config.show_progress,
                )
                .await?;
                Ok(Outcome::Downloaded(report))
            }
        }
    }

    async fn ensure_session<'a>(
        slot: &'a mut Option<Session>,
        config: &ClientConfig,
    ) -> Result<&'a Session, ClientError> {
        if slot.as_ref().is_some_and(|session| !session.is_open()) {
            warn!("Session closed by peer, reconnecting");
            *slot = None;
        }

        let session = match slot.take() {
            Some(session) => session,
            None => Session::connect(config).await?,
        };

        Ok(slot.insert(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::protocol::{Command, COMMAND_FRAME_LEN, DEFAULT_ALPN};
    use crate::tls::{generate_self_signed_cert, ServerTlsConfig, TrustPolicy};

    /// QUIC peer that answers LIST with an empty listing and never answers
    /// anything else. Returns its address and a count of accepted connections.
    fn spawn_stalling_peer() -> (SocketAddr, Arc<AtomicUsize>) {
        let cert = generate_self_signed_cert("localhost", &["localhost"], &[]).unwrap();
        let tls = ServerTlsConfig::from_pem(&cert.cert_pem, &cert.key_pem, DEFAULT_ALPN).unwrap();
        let endpoint =
            quinn::Endpoint::server(tls.config, SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        let addr = endpoint.local_addr().unwrap();

        let connections = Arc::new(AtomicUsize::new(0));
        let accepted = connections.clone();
        tokio::spawn(async move {
            while let Some(incoming) = endpoint.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let Ok(connection) = incoming.await else {
                        return;
                    };
                    while let Ok((mut send, mut recv)) = connection.accept_bi().await {
                        tokio::spawn(async move {
                            let mut frame = [0u8; COMMAND_FRAME_LEN];
                            if recv.read_exact(&mut frame).await.is_err() {
                                return;
                            }
                            if matches!(Command::from_frame(&frame), Ok(Command::List)) {
                                let _ = send.finish();
                                let _ = send.stopped().await;
                            } else {
                                std::future::pending::<()>().await;
                            }
                        });
                    }
                });
            }
        });

        (addr, connections)
    }

    #[test]
    fn test_parse_operations() {
        assert_eq!("list".parse::<Operation>().unwrap(), Operation::List);
        assert_eq!(
            "upload upload2.txt".parse::<Operation>().unwrap(),
            Operation::Upload {
                name: "upload2.txt".to_string()
            }
        );
        assert_eq!(
            "  DOWNLOAD   my file.txt ".parse::<Operation>().unwrap(),
            Operation::Download {
                name: "my file.txt".to_string()
            }
        );
    }

    #[test]
    fn test_parse_operation_errors() {
        assert_eq!(
            "upload".parse::<Operation>(),
            Err(ParseOperationError::MissingName("upload".to_string()))
        );
        assert_eq!(
            "down   ".parse::<Operation>(),
            Err(ParseOperationError::MissingName("down".to_string()))
        );
        assert_eq!(
            "delete x".parse::<Operation>(),
            Err(ParseOperationError::Unknown("delete x".to_string()))
        );
        assert!(matches!(
            "list extra".parse::<Operation>(),
            Err(ParseOperationError::Unknown(_))
        ));
        assert!("".parse::<Operation>().is_err());
    }

    #[test]
    fn test_operation_display_round_trips() {
        let op = Operation::Download {
            name: "a.txt".to_string(),
        };
        assert_eq!(op.to_string().parse::<Operation>().unwrap(), op);
    }

    #[tokio::test]
    async fn test_upload_of_missing_file_never_connects() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::default()
            .with_directories(dir.path().join("up"), dir.path().join("down"))
            .with_trust(TrustPolicy::SkipVerification);
        let mut dispatcher = Dispatcher::new(config);

        let result = dispatcher
            .dispatch(Operation::Upload {
                name: "nope.txt".to_string(),
            })
            .await;

        assert!(matches!(result, Err(ClientError::LocalIoFailed { .. })));
        assert!(!dispatcher.is_connected());
    }

    #[tokio::test]
    async fn test_timeout_drops_session_and_next_operation_reconnects() {
        let (addr, connections) = spawn_stalling_peer();
        let dir = tempfile::tempdir().unwrap();
        let mut config = ClientConfig::default()
            .with_server(addr, "localhost")
            .with_trust(TrustPolicy::SkipVerification)
            .with_directories(dir.path().join("up"), dir.path().join("down"));
        config.operation_timeout = Duration::from_secs(1);
        config.show_progress = false;
        let mut dispatcher = Dispatcher::new(config);

        // The peer never sends a size frame
        let result = dispatcher
            .dispatch(Operation::Download {
                name: "stuck.bin".to_string(),
            })
            .await;
        assert!(matches!(result, Err(ClientError::Timeout(_))), "{:?}", result);
        assert!(!dispatcher.is_connected());
        assert!(!dir.path().join("down").join("stuck.bin").exists());
        assert_eq!(connections.load(Ordering::SeqCst), 1);

        let outcome = dispatcher.dispatch(Operation::List).await.unwrap();
        assert_eq!(outcome, Outcome::Listed(Listing::default()));
        assert!(dispatcher.is_connected());
        assert_eq!(connections.load(Ordering::SeqCst), 2);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_no_session() {
        // Nothing listens here; the handshake can only time out or be refused
        let unused: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let mut config = ClientConfig::default()
            .with_server(unused, "localhost")
            .with_trust(TrustPolicy::SkipVerification);
        config.connect_timeout = Duration::from_millis(300);
        config.show_progress = false;
        let mut dispatcher = Dispatcher::new(config);

        for _ in 0..2 {
            let result = dispatcher.dispatch(Operation::List).await;
            assert!(matches!(result, Err(ClientError::ConnectionFailed(_))));
            assert!(!dispatcher.is_connected());
        }
    }
}
