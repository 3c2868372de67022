//! Direct TCP negotiation
//!
//! A minimal [`Negotiator`] for peers that can reach each other directly
//! (same LAN or host). The caller listens on an ephemeral port and offers its
//! address; the callee dials it and answers. No candidates are trickled.

use serde_json::json;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::handshake::{EventSink, NegotiationError, NegotiationEvent, Negotiator, NegotiatorFactory, Role};
use crate::protocol::Signal;

/// A TCP stream produced by a finished negotiation
#[derive(Debug)]
pub struct EstablishedLink {
    /// Attempt the stream belongs to, to drop links from abandoned calls
    pub attempt: u64,
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
}

/// Builds [`DirectNegotiator`]s; established streams go to `links`
pub struct DirectFactory {
    host: String,
    links: mpsc::UnboundedSender<EstablishedLink>,
}

impl DirectFactory {
    pub fn new(host: impl Into<String>, links: mpsc::UnboundedSender<EstablishedLink>) -> Self {
        Self {
            host: host.into(),
            links,
        }
    }
}

impl NegotiatorFactory for DirectFactory {
    type Negotiator = DirectNegotiator;

    fn create(&mut self, role: Role, events: EventSink) -> Result<DirectNegotiator, NegotiationError> {
        let mut negotiator = DirectNegotiator {
            role,
            events,
            links: self.links.clone(),
            task: None,
        };
        if role == Role::Caller {
            negotiator.listen(self.host.clone());
        }
        Ok(negotiator)
    }
}

pub struct DirectNegotiator {
    role: Role,
    events: EventSink,
    links: mpsc::UnboundedSender<EstablishedLink>,
    task: Option<JoinHandle<()>>,
}

impl DirectNegotiator {
    fn listen(&mut self, host: String) {
        let events = self.events.clone();
        let links = self.links.clone();
        self.task = Some(tokio::spawn(async move {
            let listener = match TcpListener::bind((host.as_str(), 0)).await {
                Ok(listener) => listener,
                Err(e) => {
                    events.emit(NegotiationEvent::Failed(format!("bind {}: {}", host, e)));
                    return;
                }
            };
            let addr = match listener.local_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    events.emit(NegotiationEvent::Failed(e.to_string()));
                    return;
                }
            };
            log::info!("Waiting for peer on {}", addr);
            events.emit(NegotiationEvent::LocalSignal(Signal::new(json!({
                "type": "offer",
                "addr": addr.to_string(),
            }))));

            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let _ = stream.set_nodelay(true);
                    hand_over(&events, &links, stream, peer_addr);
                }
                Err(e) => {
                    events.emit(NegotiationEvent::Failed(format!("accept: {}", e)));
                }
            }
        }));
    }

    fn dial(&mut self, addr: SocketAddr) {
        let events = self.events.clone();
        let links = self.links.clone();
        self.task = Some(tokio::spawn(async move {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    events.emit(NegotiationEvent::LocalSignal(Signal::new(json!({
                        "type": "answer",
                    }))));
                    hand_over(&events, &links, stream, addr);
                }
                Err(e) => {
                    events.emit(NegotiationEvent::Failed(format!("connect {}: {}", addr, e)));
                }
            }
        }));
    }
}

fn hand_over(
    events: &EventSink,
    links: &mpsc::UnboundedSender<EstablishedLink>,
    stream: TcpStream,
    peer_addr: SocketAddr,
) {
    log::info!("Direct link established with {}", peer_addr);
    let link = EstablishedLink {
        attempt: events.attempt(),
        stream,
        peer_addr,
    };
    if links.send(link).is_err() {
        events.emit(NegotiationEvent::Failed("link queue closed".to_string()));
        return;
    }
    events.emit(NegotiationEvent::Connected);
}

impl Negotiator for DirectNegotiator {
    fn apply_signal(&mut self, signal: Signal) -> Result<(), NegotiationError> {
        match (self.role, signal.kind()) {
            (Role::Callee, Some("offer")) => {
                if self.task.is_some() {
                    return Err(NegotiationError::Rejected("duplicate offer".to_string()));
                }
                let addr = signal
                    .0
                    .get("addr")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| NegotiationError::Rejected("offer without address".to_string()))?
                    .parse::<SocketAddr>()
                    .map_err(|e| NegotiationError::Rejected(format!("bad offer address: {}", e)))?;
                self.dial(addr);
                Ok(())
            }
            (Role::Caller, Some("answer")) => {
                log::debug!("Peer answered");
                Ok(())
            }
            (_, kind) => {
                log::debug!("Ignoring {:?} signal as {:?}", kind, self.role);
                Ok(())
            }
        }
    }

    fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for DirectNegotiator {
    fn drop(&mut self) {
        self.close();
    }
}
