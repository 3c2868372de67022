//! Relay Server
//!
//! TCP (optionally TLS) listener that feeds every connection into the
//! signaling [`Router`].

use anyhow::Result;
use log::{debug, error, info, warn};
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use rustls::pki_types::PrivateKeyDer;
use tokio_rustls::TlsAcceptor;

use crate::protocol::{read_frame, write_message, ClientMessage, ProtocolError, MAX_MESSAGE_SIZE};
use crate::registry::IdentityRegistry;
use crate::router::Router;

/// How long a client may take to finish the TLS handshake
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Build a TLS acceptor from PEM certificate and key files
pub fn load_tls_acceptor(certfile: &Path, keyfile: &Path) -> Result<TlsAcceptor> {
    let certs = load_certs(certfile)?;
    let key = load_key(keyfile)?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// Accept connections forever.
///
/// A failing or panicking session never takes the listener down.
pub async fn serve(listener: TcpListener, router: Arc<Router>, acceptor: Option<TlsAcceptor>) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let router = router.clone();
        let acceptor = acceptor.clone();

        let session = tokio::spawn(async move {
            let result = match acceptor {
                Some(acceptor) => match handshake_within(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                    Ok(tls_stream) => handle_connection(tls_stream, peer_addr, router).await,
                    Err(e) => {
                        error!("TLS handshake failed for {}: {}", peer_addr, e);
                        return;
                    }
                },
                None => handle_connection(stream, peer_addr, router).await,
            };
            if let Err(e) = result {
                error!("Client {} error: {}", peer_addr, e);
            }
        });

        tokio::spawn(async move {
            if let Err(e) = session.await {
                if e.is_panic() {
                    error!("Session task for {} panicked", peer_addr);
                }
            }
        });
    }
}

/// Bound a handshake so a stalled client cannot hold its task forever
async fn handshake_within<F, T>(limit: Duration, handshake: F) -> std::io::Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    tokio::time::timeout(limit, handshake)
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "TLS handshake timed out"))?
}

/// Runs the router's disconnect step however the session ends, unwinding included
struct SessionGuard {
    router: Arc<Router>,
    handle: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.router.disconnect(&self.handle);
    }
}

/// Serve one connected client until it goes away
pub async fn handle_connection<S>(stream: S, peer_addr: SocketAddr, router: Arc<Router>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handle = IdentityRegistry::new_handle();
    let (outbox, mut inbox) = mpsc::unbounded_channel();
    let peer_id = router.connect(&handle, outbox);
    let guard = SessionGuard {
        router: router.clone(),
        handle: handle.clone(),
    };
    info!("Connection {} is peer {}", peer_addr, peer_id);

    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let writer = tokio::spawn(async move {
        while let Some(message) = inbox.recv().await {
            if let Err(e) = write_message(&mut write_half, &message).await {
                debug!("Write to {} failed: {}", peer_addr, e);
                break;
            }
        }
    });

    let result = async {
        loop {
            let buf = match read_frame(&mut read_half, MAX_MESSAGE_SIZE).await {
                Ok(Some(buf)) => buf,
                Ok(None) => break,
                Err(ProtocolError::TooLarge(len)) => {
                    error!("Message too large from {} ({} bytes)", peer_addr, len);
                    break;
                }
                Err(e) => return Err(e.into()),
            };

            match serde_json::from_slice::<ClientMessage>(&buf) {
                Ok(message) => {
                    router.handle_message(&handle, message);
                }
                Err(e) => warn!("Invalid message from {}: {}", peer_addr, e),
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    drop(guard);
    writer.abort();
    info!("Client {} disconnected", peer_addr);

    result
}

/// Load TLS certificates
fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    Ok(certs)
}

/// Load TLS private key
fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    let key = rustls_pemfile::private_key(&mut reader)?;
    key.ok_or_else(|| anyhow::anyhow!("No private key found in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{read_message, write_frame, ServerMessage};

    #[tokio::test]
    async fn test_session_lifecycle_over_duplex() {
        let router = Arc::new(Router::default());
        let (client, server) = tokio::io::duplex(4096);
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();

        let task = tokio::spawn(handle_connection(server, addr, router.clone()));
        let (mut rx, mut tx) = tokio::io::split(client);

        let me: Option<ServerMessage> = read_message(&mut rx).await.unwrap();
        let id = match me {
            Some(ServerMessage::Me { id }) => id,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(id.len(), 4);
        assert_eq!(router.session_count(), 1);

        // Garbage is skipped, the session stays up
        write_frame(&mut tx, b"not json").await.unwrap();
        write_message(
            &mut tx,
            &ClientMessage::CallUser {
                user_to_call: "nobody".to_string(),
                signal_data: crate::protocol::Signal::new(serde_json::json!({"type": "offer"})),
                from: id.clone(),
                name: None,
            },
        )
        .await
        .unwrap();
        let reply: Option<ServerMessage> = read_message(&mut rx).await.unwrap();
        assert_eq!(
            reply,
            Some(ServerMessage::UserUnavailable {
                user_to_call: "nobody".to_string()
            })
        );

        drop(tx);
        drop(rx);
        task.await.unwrap().unwrap();
        assert_eq!(router.session_count(), 0);
        assert!(router.registry().is_empty());
    }

    #[tokio::test]
    async fn test_stalled_handshake_times_out() {
        let stalled = std::future::pending::<std::io::Result<()>>();
        let result = handshake_within(Duration::from_millis(20), stalled).await;
        assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::TimedOut);

        let finished = async { Ok::<_, std::io::Error>(7) };
        assert_eq!(handshake_within(Duration::from_secs(1), finished).await.unwrap(), 7);
    }

    #[test]
    fn test_missing_tls_files() {
        let result = load_tls_acceptor(Path::new("/nonexistent.crt"), Path::new("/nonexistent.key"));
        assert!(result.is_err());
    }
}
