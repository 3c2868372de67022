//! Relay Client
//!
//! Keeps a connection to the relay open, reconnecting a bounded number of
//! times, and reports connectivity changes alongside relay messages.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use crate::config::ClientConfig;
use crate::protocol::{read_message, write_message, ClientMessage, ServerMessage};

/// Connection status towards the relay
#[derive(Debug, Clone, PartialEq)]
pub enum Connectivity {
    Connected,
    Disconnected(String),
    ConnectError(String),
    /// Reconnection attempts are exhausted
    Failed { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Message(ServerMessage),
    Status(Connectivity),
}

/// Where and how to reach the relay
#[derive(Debug, Clone)]
pub struct RelayTarget {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub ca_certfile: Option<PathBuf>,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl From<&ClientConfig> for RelayTarget {
    fn from(config: &ClientConfig) -> Self {
        Self {
            host: config.server_host.clone(),
            port: config.server_port,
            use_tls: config.use_tls,
            ca_certfile: config.ca_certfile.clone(),
            reconnect_attempts: config.reconnect_attempts,
            reconnect_delay: config.reconnect_delay(),
        }
    }
}

trait RelayStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RelayStream for T {}

/// Sending side of the relay connection
#[derive(Clone)]
pub struct RelayClient {
    outbound: mpsc::UnboundedSender<ClientMessage>,
}

impl RelayClient {
    /// Queue a message for the relay, false once the client has stopped
    pub fn send(&self, message: ClientMessage) -> bool {
        self.outbound.send(message).is_ok()
    }

    /// Start the connection supervisor.
    ///
    /// Events arrive on `events`; the task ends after reporting
    /// [`Connectivity::Failed`] or once every `RelayClient` clone is dropped.
    pub fn spawn(target: RelayTarget, events: mpsc::UnboundedSender<RelayEvent>) -> (Self, JoinHandle<()>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(supervise(target, outbound_rx, events));
        (Self { outbound }, task)
    }
}

enum SessionEnd {
    Lost(String),
    Shutdown,
}

async fn supervise(
    target: RelayTarget,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    events: mpsc::UnboundedSender<RelayEvent>,
) {
    let connector = if target.use_tls {
        match build_connector(target.ca_certfile.as_deref()) {
            Ok(connector) => Some(connector),
            Err(e) => {
                let _ = events.send(RelayEvent::Status(Connectivity::ConnectError(e.to_string())));
                let _ = events.send(RelayEvent::Status(Connectivity::Failed { attempts: 0 }));
                return;
            }
        }
    } else {
        None
    };

    let mut failures = 0u32;
    loop {
        match connect(&target, connector.as_ref()).await {
            Ok(stream) => {
                failures = 0;
                log::info!("Connected to relay {}:{}", target.host, target.port);
                let _ = events.send(RelayEvent::Status(Connectivity::Connected));

                match run_session(stream, &mut outbound, &events).await {
                    SessionEnd::Shutdown => return,
                    SessionEnd::Lost(reason) => {
                        log::warn!("Relay connection lost: {}", reason);
                        let _ = events.send(RelayEvent::Status(Connectivity::Disconnected(reason)));
                        // Signals queued for the old session are meaningless now
                        while outbound.try_recv().is_ok() {}
                    }
                }
            }
            Err(e) => {
                failures += 1;
                log::warn!("Relay connect attempt {} failed: {}", failures, e);
                let _ = events.send(RelayEvent::Status(Connectivity::ConnectError(e.to_string())));
                if failures >= target.reconnect_attempts {
                    let _ = events.send(RelayEvent::Status(Connectivity::Failed { attempts: failures }));
                    return;
                }
            }
        }

        if events.is_closed() {
            return;
        }
        tokio::time::sleep(target.reconnect_delay).await;
    }
}

async fn connect(target: &RelayTarget, connector: Option<&TlsConnector>) -> Result<Box<dyn RelayStream>> {
    let stream = TcpStream::connect((target.host.as_str(), target.port)).await?;
    let _ = stream.set_nodelay(true);

    match connector {
        Some(connector) => {
            let server_name = ServerName::try_from(target.host.clone())?;
            let tls_stream = connector.connect(server_name, stream).await?;
            Ok(Box::new(tls_stream))
        }
        None => Ok(Box::new(stream)),
    }
}

async fn run_session(
    stream: Box<dyn RelayStream>,
    outbound: &mut mpsc::UnboundedReceiver<ClientMessage>,
    events: &mpsc::UnboundedSender<RelayEvent>,
) -> SessionEnd {
    let (mut reader, mut writer) = tokio::io::split(stream);

    // Reads are not cancel-safe, so they get their own task
    let events_tx = events.clone();
    let mut reader_task = tokio::spawn(async move {
        loop {
            match read_message::<_, ServerMessage>(&mut reader).await {
                Ok(Some(message)) => {
                    if events_tx.send(RelayEvent::Message(message)).is_err() {
                        return "client gone".to_string();
                    }
                }
                Ok(None) => return "closed by relay".to_string(),
                Err(e) => return e.to_string(),
            }
        }
    });

    loop {
        tokio::select! {
            ended = &mut reader_task => {
                return SessionEnd::Lost(ended.unwrap_or_else(|e| e.to_string()));
            }
            message = outbound.recv() => match message {
                Some(message) => {
                    if let Err(e) = write_message(&mut writer, &message).await {
                        reader_task.abort();
                        return SessionEnd::Lost(e.to_string());
                    }
                }
                None => {
                    reader_task.abort();
                    return SessionEnd::Shutdown;
                }
            }
        }
    }
}

/// TLS connector trusting the web PKI plus an optional extra CA
fn build_connector(ca_certfile: Option<&Path>) -> Result<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = ca_certfile {
        let file = std::fs::File::open(path)?;
        let mut reader = std::io::BufReader::new(file);
        for cert in rustls_pemfile::certs(&mut reader) {
            roots.add(cert?)?;
        }
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(tls_config)))
}
