//! QUIC File Transfer
//!
//! A small file transfer protocol carried over QUIC: every operation runs on
//! its own bidirectional stream inside one long-lived, encrypted connection.
//!
//! ## Features
//! - List, upload and download over independent streams
//! - Size negotiation with an explicit go-ahead before downloads
//! - Pluggable server trust (CA chain, pinned fingerprint, trust-on-first-use)
//! - Self-signed certificate generation and a reference server
//!
//! ## Usage
//!
//! ```bash
//! # Generate certificates
//! qft cert generate --output ./certs
//!
//! # Start server
//! qft serve --cert ./certs/cert.pem --key ./certs/key.pem --storage ./server_files
//!
//! # Upload ./client_files/upload2.txt
//! qft upload --pin <sha256> upload2.txt
//!
//! # Keep one session open for several operations
//! qft shell --pin <sha256>
//! ```

pub mod client;
pub mod dispatcher;
pub mod protocol;
pub mod server;
pub mod tls;

pub use client::{ClientConfig, ClientError, DownloadReport, FileEntry, Listing, Session, UploadReport};
pub use dispatcher::{Dispatcher, Operation, Outcome, ParseOperationError};
pub use protocol::{decode_size, encode_command, Command, FilenameFraming, ProtocolError};
pub use server::{Server, ServerConfig};
pub use tls::{ClientTlsConfig, ServerTlsConfig, TrustPolicy};
