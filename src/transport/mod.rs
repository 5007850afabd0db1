//! Transport layer for the gRPC server and the application client.
//!
//! Supports:
//! - TCP: Standard network transport (default)
//! - UDS: Unix Domain Sockets for local IPC with a co-located application

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::{UnixListener, UnixStream};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::server::Router;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::info;

/// Boxed error returned by transport helpers.
pub type TransportError = Box<dyn std::error::Error + Send + Sync>;

/// Transport type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// TCP transport (network).
    #[default]
    Tcp,
    /// Unix Domain Socket transport (local IPC).
    Uds,
}

/// Transport configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Transport type discriminator.
    #[serde(rename = "type")]
    pub transport_type: TransportType,
    /// TCP-specific configuration.
    pub tcp: TcpConfig,
    /// UDS-specific configuration.
    pub uds: UdsConfig,
}

/// TCP transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to bind to.
    pub port: u16,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 50001,
        }
    }
}

impl TcpConfig {
    /// Get the socket address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// UDS transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UdsConfig {
    /// Socket file the server binds.
    pub path: PathBuf,
}

impl Default for UdsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/courier/runtime.sock"),
        }
    }
}

/// RAII guard for cleaning up UDS socket files.
pub struct UdsCleanupGuard {
    path: PathBuf,
}

impl UdsCleanupGuard {
    /// Create a new cleanup guard for the given socket path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UdsCleanupGuard {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to clean up UDS socket"
                );
            } else {
                tracing::debug!(
                    path = %self.path.display(),
                    "Cleaned up UDS socket"
                );
            }
        }
    }
}

/// Prepare a UDS socket path for binding.
///
/// - Creates parent directories if needed
/// - Removes stale socket file if exists
/// - Returns a cleanup guard that removes the socket on drop
pub fn prepare_uds_socket(path: &Path) -> std::io::Result<UdsCleanupGuard> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if path.exists() {
        info!(path = %path.display(), "Removing stale UDS socket");
        std::fs::remove_file(path)?;
    }

    Ok(UdsCleanupGuard::new(path))
}

/// Serve a gRPC router on the configured transport until `signal` completes.
pub async fn serve_with_shutdown<F>(
    router: Router,
    config: &TransportConfig,
    signal: F,
) -> Result<(), TransportError>
where
    F: Future<Output = ()> + Send,
{
    match config.transport_type {
        TransportType::Tcp => {
            let addr: SocketAddr = config.tcp.addr().parse()?;
            info!(address = %addr, transport = "tcp", "Server listening");
            router.serve_with_shutdown(addr, signal).await?;
        }
        TransportType::Uds => {
            let _guard = prepare_uds_socket(&config.uds.path)?;
            let uds = UnixListener::bind(&config.uds.path)?;
            let stream = UnixListenerStream::new(uds);

            info!(
                path = %config.uds.path.display(),
                transport = "uds",
                "Server listening"
            );

            router.serve_with_incoming_shutdown(stream, signal).await?;
        }
    }

    Ok(())
}

// ============================================================================
// Client Connection
// ============================================================================

/// Check if an address is a UDS path.
pub fn is_uds_address(address: &str) -> bool {
    address.starts_with('/') || address.starts_with("./")
}

/// Connect to a gRPC service by address.
///
/// - Paths starting with `/` or `./` are treated as Unix domain sockets
/// - `http://` and `https://` URLs are used as-is
/// - Everything else is treated as a TCP `host:port`
pub async fn connect_to_address(address: &str) -> Result<Channel, TransportError> {
    if is_uds_address(address) {
        let socket_path = PathBuf::from(address);
        info!(
            path = %socket_path.display(),
            transport = "uds",
            "Connecting to service"
        );

        // UDS requires a dummy URI and custom connector
        let channel = Endpoint::try_from("http://[::]:50051")?
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = socket_path.clone();
                async move {
                    let stream = UnixStream::connect(path).await?;
                    Ok::<_, std::io::Error>(TokioIo::new(stream))
                }
            }))
            .await?;

        Ok(channel)
    } else {
        let uri = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };

        info!(address = %address, transport = "tcp", "Connecting to service");

        let channel = Channel::from_shared(uri)?.connect().await?;
        Ok(channel)
    }
}
