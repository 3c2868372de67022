//! Handshake Controller
//!
//! Per-call state machine driving the offer/answer/candidate exchange over
//! the relay. The negotiation engine itself sits behind [`Negotiator`]; the
//! controller only moves opaque [`Signal`]s between it and the relay, and
//! buffers the callee's incoming signals until the user accepts.
//!
//! ```text
//! idle -> dialing (caller) | ringing (callee) -> negotiating -> connected
//!   ^                                                               |
//!   +------------------------- closed <------------ (any non-idle) -+
//! ```

use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{ClientMessage, ServerMessage, Signal};

/// Which side of the call this endpoint plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiator: produces the offer
    Caller,
    /// Non-initiator: applies the offer, produces the answer
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Dialing,
    Ringing,
    Negotiating,
    Connected,
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Dialing => "dialing",
            Phase::Ringing => "ringing",
            Phase::Negotiating => "negotiating",
            Phase::Connected => "connected",
            Phase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Negotiation engine errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NegotiationError {
    #[error("Negotiation setup failed: {0}")]
    Setup(String),
    #[error("Signal rejected: {0}")]
    Rejected(String),
}

/// Handshake errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HandshakeError {
    #[error("Cannot {action} while {phase}")]
    InvalidAction { action: &'static str, phase: Phase },
    #[error("No dial target given")]
    EmptyTarget,
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
}

/// What the negotiation engine reports back
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationEvent {
    /// A locally produced blob that must reach the other side
    LocalSignal(Signal),
    /// The direct transport is up
    Connected,
    /// The engine gave up
    Failed(String),
}

/// Everything that can move the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Dial { target: String },
    Accept,
    Hangup,
    Relay(ServerMessage),
    /// The relay connection dropped
    RelayLost,
    Negotiation { attempt: u64, event: NegotiationEvent },
}

/// Handle given to a negotiator for reporting back into the controller's queue.
///
/// Events are stamped with the attempt they belong to, so anything a torn-down
/// negotiator still emits is ignored.
#[derive(Debug, Clone)]
pub struct EventSink {
    attempt: u64,
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    pub fn new(attempt: u64, tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { attempt, tx }
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Queue an event, false once the controller's queue is gone
    pub fn emit(&self, event: NegotiationEvent) -> bool {
        self.tx
            .send(Event::Negotiation {
                attempt: self.attempt,
                event,
            })
            .is_ok()
    }
}

/// The local transport-negotiation object
pub trait Negotiator: Send {
    /// Feed a remote blob into the engine
    fn apply_signal(&mut self, signal: Signal) -> Result<(), NegotiationError>;

    /// Tear everything down; no further events matter after this
    fn close(&mut self);
}

/// Creates a negotiator for each call attempt
pub trait NegotiatorFactory {
    type Negotiator: Negotiator;

    fn create(&mut self, role: Role, events: EventSink) -> Result<Self::Negotiator, NegotiationError>;
}

/// Why a call attempt ended
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    LocalHangup,
    RemoteEnded,
    Unavailable,
    RelayLost,
    NegotiationFailed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::LocalHangup => write!(f, "hung up"),
            CloseReason::RemoteEnded => write!(f, "call ended by peer"),
            CloseReason::Unavailable => write!(f, "peer unavailable"),
            CloseReason::RelayLost => write!(f, "relay connection lost"),
            CloseReason::NegotiationFailed(e) => write!(f, "negotiation failed: {}", e),
        }
    }
}

/// User-facing notifications
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// The relay assigned us a peer id
    Identity(String),
    IncomingCall { from: String, name: Option<String> },
    Connected { peer: String },
    Unavailable { target: String },
    Closed { reason: CloseReason },
}

/// Side effects the caller of [`HandshakeController::handle`] must carry out
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send(ClientMessage),
    Notify(Notice),
}

/// One call at a time, from first signal to teardown
pub struct HandshakeController<F: NegotiatorFactory> {
    factory: F,
    events: mpsc::UnboundedSender<Event>,
    local_id: Option<String>,
    display_name: Option<String>,
    phase: Phase,
    role: Option<Role>,
    counterpart: Option<String>,
    negotiator: Option<F::Negotiator>,
    /// Remote signals received while ringing, before the negotiator exists
    pending: VecDeque<Signal>,
    attempt: u64,
}

impl<F: NegotiatorFactory> HandshakeController<F> {
    pub fn new(factory: F, events: mpsc::UnboundedSender<Event>, display_name: Option<String>) -> Self {
        Self {
            factory,
            events,
            local_id: None,
            display_name,
            phase: Phase::Idle,
            role: None,
            counterpart: None,
            negotiator: None,
            pending: VecDeque::new(),
            attempt: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }

    pub fn counterpart(&self) -> Option<&str> {
        self.counterpart.as_deref()
    }

    /// Current call attempt; bumped on every new negotiator and every teardown
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Signals waiting for the user to accept
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Advance the state machine by one event
    pub fn handle(&mut self, event: Event) -> Result<Vec<Effect>, HandshakeError> {
        let mut effects = Vec::new();
        match event {
            Event::Dial { target } => self.dial(target)?,
            Event::Accept => self.accept(&mut effects)?,
            Event::Hangup => {
                if self.phase != Phase::Idle {
                    self.close(CloseReason::LocalHangup, &mut effects);
                }
            }
            Event::Relay(message) => self.on_relay(message, &mut effects),
            Event::RelayLost => {
                // An established direct transport does not need the relay
                if !matches!(self.phase, Phase::Idle | Phase::Connected) {
                    self.close(CloseReason::RelayLost, &mut effects);
                }
            }
            Event::Negotiation { attempt, event } => {
                if attempt == self.attempt && self.negotiator.is_some() {
                    self.on_negotiation(event, &mut effects);
                } else {
                    log::debug!("Dropping event from stale attempt {}", attempt);
                }
            }
        }
        Ok(effects)
    }

    /// Start a call to `target`, which must be a peer id.
    ///
    /// The relay also routes to raw connection handles, but departures are
    /// announced by peer id only, so a call dialed by handle never sees its
    /// counterpart's `callEnded` and has to be hung up locally.
    fn dial(&mut self, target: String) -> Result<(), HandshakeError> {
        if self.phase != Phase::Idle {
            return Err(HandshakeError::InvalidAction {
                action: "dial",
                phase: self.phase,
            });
        }
        let target = target.trim().to_string();
        if target.is_empty() {
            return Err(HandshakeError::EmptyTarget);
        }

        let negotiator = self.create_negotiator(Role::Caller)?;
        self.negotiator = Some(negotiator);
        self.role = Some(Role::Caller);
        self.counterpart = Some(target);
        self.transition(Phase::Dialing);
        Ok(())
    }

    fn accept(&mut self, effects: &mut Vec<Effect>) -> Result<(), HandshakeError> {
        if self.phase != Phase::Ringing {
            return Err(HandshakeError::InvalidAction {
                action: "accept",
                phase: self.phase,
            });
        }

        let negotiator = match self.create_negotiator(Role::Callee) {
            Ok(negotiator) => negotiator,
            Err(e) => {
                self.close(CloseReason::NegotiationFailed(e.to_string()), effects);
                return Ok(());
            }
        };
        self.negotiator = Some(negotiator);
        self.transition(Phase::Negotiating);

        // Offer first, then candidates: arrival order is the only valid order
        let pending = std::mem::take(&mut self.pending);
        log::debug!("Draining {} buffered signals", pending.len());
        for signal in pending {
            if let Err(e) = self.apply(signal) {
                self.close(CloseReason::NegotiationFailed(e.to_string()), effects);
                break;
            }
        }
        Ok(())
    }

    fn on_relay(&mut self, message: ServerMessage, effects: &mut Vec<Effect>) {
        match message {
            ServerMessage::Me { id } => {
                self.local_id = Some(id.clone());
                effects.push(Effect::Notify(Notice::Identity(id)));
            }
            ServerMessage::CallUser { signal, from, name } => self.on_incoming(signal, from, name, effects),
            ServerMessage::CallAccepted { signal } => {
                if self.role != Some(Role::Caller) || self.negotiator.is_none() {
                    log::debug!("Ignoring callAccepted while {}", self.phase);
                    return;
                }
                if self.phase == Phase::Dialing {
                    self.transition(Phase::Negotiating);
                }
                if let Err(e) = self.apply(signal) {
                    self.close(CloseReason::NegotiationFailed(e.to_string()), effects);
                }
            }
            ServerMessage::UserUnavailable { user_to_call } => {
                let ours = self.counterpart.as_deref() == Some(user_to_call.trim());
                effects.push(Effect::Notify(Notice::Unavailable {
                    target: user_to_call,
                }));
                if ours && self.phase != Phase::Idle {
                    self.close(CloseReason::Unavailable, effects);
                }
            }
            ServerMessage::CallEnded { id } => {
                if self.phase == Phase::Idle {
                    return;
                }
                // The relay tells everyone; only our counterpart's departure matters
                match (&id, &self.counterpart) {
                    (Some(gone), Some(peer)) if gone != peer => {
                        log::debug!("Ignoring callEnded for unrelated peer {}", gone);
                    }
                    _ => self.close(CloseReason::RemoteEnded, effects),
                }
            }
        }
    }

    fn on_incoming(&mut self, signal: Signal, from: String, name: Option<String>, effects: &mut Vec<Effect>) {
        match self.phase {
            Phase::Idle => {
                self.role = Some(Role::Callee);
                self.counterpart = Some(from.clone());
                self.pending.push_back(signal);
                self.transition(Phase::Ringing);
                effects.push(Effect::Notify(Notice::IncomingCall { from, name }));
            }
            Phase::Ringing if self.counterpart.as_deref() == Some(from.as_str()) => {
                let offer = signal.is_offer();
                if offer && self.pending.iter().any(Signal::is_offer) {
                    // A second offer before we accepted means the caller redialed
                    log::info!("{} redialed, dropping {} stale signals", from, self.pending.len());
                    self.pending.clear();
                }
                self.pending.push_back(signal);
                if offer {
                    effects.push(Effect::Notify(Notice::IncomingCall { from, name }));
                }
            }
            Phase::Negotiating | Phase::Connected
                if self.role == Some(Role::Callee) && self.counterpart.as_deref() == Some(from.as_str()) =>
            {
                if let Err(e) = self.apply(signal) {
                    self.close(CloseReason::NegotiationFailed(e.to_string()), effects);
                }
            }
            _ => {
                log::warn!("Busy: ignoring call signal from {} while {}", from, self.phase);
            }
        }
    }

    fn on_negotiation(&mut self, event: NegotiationEvent, effects: &mut Vec<Effect>) {
        match event {
            NegotiationEvent::LocalSignal(signal) => {
                let Some(peer) = self.counterpart.clone() else {
                    return;
                };
                // Trickle: every blob goes out the moment it exists
                let message = match self.role {
                    Some(Role::Caller) => ClientMessage::CallUser {
                        user_to_call: peer,
                        signal_data: signal,
                        from: self.local_id.clone().unwrap_or_default(),
                        name: self.display_name.clone(),
                    },
                    Some(Role::Callee) => ClientMessage::AnswerCall { signal, to: peer },
                    None => return,
                };
                effects.push(Effect::Send(message));
            }
            NegotiationEvent::Connected => {
                if self.phase != Phase::Connected {
                    self.transition(Phase::Connected);
                    effects.push(Effect::Notify(Notice::Connected {
                        peer: self.counterpart.clone().unwrap_or_default(),
                    }));
                }
            }
            NegotiationEvent::Failed(reason) => {
                self.close(CloseReason::NegotiationFailed(reason), effects);
            }
        }
    }

    fn create_negotiator(&mut self, role: Role) -> Result<F::Negotiator, NegotiationError> {
        self.attempt += 1;
        let sink = EventSink::new(self.attempt, self.events.clone());
        self.factory.create(role, sink)
    }

    fn apply(&mut self, signal: Signal) -> Result<(), NegotiationError> {
        match self.negotiator.as_mut() {
            Some(negotiator) => negotiator.apply_signal(signal),
            None => Ok(()),
        }
    }

    /// Tear down the attempt and return to idle
    fn close(&mut self, reason: CloseReason, effects: &mut Vec<Effect>) {
        self.transition(Phase::Closed);
        if let Some(mut negotiator) = self.negotiator.take() {
            negotiator.close();
        }
        self.pending.clear();
        self.role = None;
        self.counterpart = None;
        // Anything the old negotiator still emits is now stale
        self.attempt += 1;
        self.transition(Phase::Idle);
        effects.push(Effect::Notify(Notice::Closed { reason }));
    }

    fn transition(&mut self, next: Phase) {
        log::debug!("Handshake {} -> {}", self.phase, next);
        self.phase = next;
    }
}
