//! PeerCall Interactive Client
//!
//! Registers with the relay, dials or answers one peer at a time and then
//! chats and sends files over the direct link.

use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use peercall::channel::{ChannelEvent, FileMeta, Multiplexer, Sender};
use peercall::direct::{DirectFactory, EstablishedLink};
use peercall::handshake::{Effect, Event, HandshakeController, Notice};
use peercall::link::{spawn_heartbeat, FramedLink};
use peercall::protocol::ClientMessage;
use peercall::relay_client::{Connectivity, RelayClient, RelayEvent, RelayTarget};
use peercall::share::{dial_target, share_link};
use peercall::ClientConfig;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "peercall-client")]
#[command(about = "PeerCall interactive client")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/client.toml")]
    config: PathBuf,

    /// Relay host
    #[arg(long)]
    host: Option<String>,

    /// Relay port
    #[arg(short, long)]
    port: Option<u16>,

    /// Display name shown to the people you call
    #[arg(short, long)]
    name: Option<String>,

    /// Connect to the relay over TLS
    #[arg(long)]
    tls: bool,

    /// Peer id or shared link to pre-fill as the dial target
    #[arg(long)]
    target: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

/// An open direct link with its multiplexer
struct Session {
    mux: Multiplexer<FramedLink>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    heartbeat: JoinHandle<()>,
}

impl Session {
    fn start(link: EstablishedLink, config: &ClientConfig) -> Self {
        let (framed, inbound) = FramedLink::spawn(link.stream);
        let heartbeat = spawn_heartbeat(framed.clone(), config.heartbeat_interval());
        Self {
            mux: Multiplexer::new(framed),
            inbound,
            heartbeat,
        }
    }

    fn close(mut self) {
        self.mux.abandon_transfer();
        self.mux.sink().close();
        self.heartbeat.abort();
    }
}

struct App {
    config: ClientConfig,
    relay: RelayClient,
    controller: HandshakeController<DirectFactory>,
    session: Option<Session>,
    prefill: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if args.config.exists() {
        ClientConfig::from_file(&args.config)?
    } else {
        ClientConfig::default()
    };

    // Initialize logging
    let log_level = args.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&log_level)).init();

    if !args.config.exists() {
        info!("Config file {} not found, using defaults", args.config.display());
    }

    if let Some(host) = args.host {
        config.server_host = host;
    }
    if let Some(port) = args.port {
        config.server_port = port;
    }
    if args.tls {
        config.use_tls = true;
    }
    if args.name.is_some() {
        config.display_name = args.name;
    }

    println!("📞 PeerCall Client");
    println!("==================");
    println!("Relay: {}:{}", config.server_host, config.server_port);
    println!();

    let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
    let (relay, _relay_task) = RelayClient::spawn(RelayTarget::from(&config), relay_tx);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let (links_tx, mut links_rx) = mpsc::unbounded_channel();
    let factory = DirectFactory::new(config.direct_host.clone(), links_tx);
    let controller = HandshakeController::new(factory, event_tx, config.display_name.clone());

    let mut app = App {
        config,
        relay,
        controller,
        session: None,
        prefill: args.target.as_deref().and_then(dial_target),
    };

    if let Some(target) = &app.prefill {
        println!("🎯 Dial target set to {} (type 'call' to dial)", target);
    }
    print_help();

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<String>();
    let input_task = tokio::spawn(handle_user_input(cmd_tx));

    loop {
        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(line) => {
                    if !app.on_command(&line).await {
                        break;
                    }
                }
                None => break,
            },
            Some(event) = relay_rx.recv() => app.on_relay_event(event),
            Some(event) = event_rx.recv() => app.drive(event),
            Some(link) = links_rx.recv() => app.on_link(link),
            frame = next_frame(&mut app.session) => match frame {
                Some(frame) => app.on_frame(&frame).await,
                None => app.on_link_lost(),
            },
        }
        prompt();
    }

    if let Some(session) = app.session.take() {
        session.close();
    }
    input_task.abort();
    println!("👋 Goodbye!");
    Ok(())
}

impl App {
    /// Returns false when the user wants to quit
    async fn on_command(&mut self, line: &str) -> bool {
        let line = line.trim();
        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        match command.to_lowercase().as_str() {
            "" => {}
            "call" => {
                let target = if rest.is_empty() {
                    self.prefill.clone()
                } else {
                    dial_target(rest)
                };
                match target {
                    Some(target) => {
                        println!("📡 Calling {}...", target);
                        self.drive(Event::Dial { target });
                    }
                    None => println!("Usage: call <peer id | link>"),
                }
            }
            "accept" => self.drive(Event::Accept),
            "hangup" => {
                self.drive(Event::Hangup);
                self.end_session();
            }
            "say" => {
                if rest.is_empty() {
                    println!("Usage: say <message>");
                    return true;
                }
                match self.session.as_mut() {
                    Some(session) => {
                        if let Err(e) = session.mux.send_chat(rest) {
                            println!("❌ Message not sent: {}", e);
                        }
                    }
                    None => println!("Not connected to a peer"),
                }
            }
            "send" => {
                if rest.is_empty() {
                    println!("Usage: send <path>");
                    return true;
                }
                self.send_file(Path::new(rest)).await;
            }
            "feedback" => {
                self.relay.send(ClientMessage::SendFeedback {
                    text: rest.to_string(),
                });
                println!("🙏 Thanks for the feedback");
            }
            "status" => self.print_status(),
            "help" => print_help(),
            "quit" | "exit" => return false,
            other => println!("Unknown command: {}. Type 'help' for available commands.", other),
        }
        true
    }

    /// Feed one event through the handshake and carry out its effects
    fn drive(&mut self, event: Event) {
        match self.controller.handle(event) {
            Ok(effects) => {
                for effect in effects {
                    self.apply(effect);
                }
            }
            Err(e) => println!("⚠️  {}", e),
        }
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::Send(message) => {
                if !self.relay.send(message) {
                    warn!("Relay client stopped, signal dropped");
                }
            }
            Effect::Notify(notice) => self.notify(notice),
        }
    }

    fn notify(&mut self, notice: Notice) {
        match notice {
            Notice::Identity(id) => {
                println!("🆔 Your id: {}", id);
                match share_link(&self.config.share_base_url, &id) {
                    Ok(link) => println!("🔗 Share link: {}", link),
                    Err(e) => warn!("Bad share_base_url: {}", e),
                }
            }
            Notice::IncomingCall { from, name } => {
                let who = name.map(|n| format!("{} ({})", n, from)).unwrap_or(from);
                println!("🔔 Incoming call from {} - type 'accept' to answer", who);
            }
            Notice::Connected { peer } => println!("✅ Connected to {}", peer),
            Notice::Unavailable { target } => println!("❌ {} is not available", target),
            Notice::Closed { reason } => {
                println!("📴 Call closed: {}", reason);
                self.end_session();
            }
        }
    }

    fn on_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Message(message) => self.drive(Event::Relay(message)),
            RelayEvent::Status(status) => {
                match &status {
                    Connectivity::Connected => println!("🟢 Relay connected"),
                    Connectivity::Disconnected(reason) => println!("🟠 Relay disconnected: {}", reason),
                    Connectivity::ConnectError(reason) => println!("🔴 Relay unreachable: {}", reason),
                    Connectivity::Failed { attempts } => {
                        println!("🔴 Giving up on the relay after {} attempts", attempts)
                    }
                }
                if matches!(status, Connectivity::Disconnected(_) | Connectivity::Failed { .. }) {
                    self.drive(Event::RelayLost);
                }
            }
        }
    }

    fn on_link(&mut self, link: EstablishedLink) {
        if link.attempt != self.controller.attempt() {
            info!("Dropping link from abandoned attempt {}", link.attempt);
            return;
        }
        self.end_session();
        self.session = Some(Session::start(link, &self.config));
    }

    fn on_link_lost(&mut self) {
        println!("🔌 Peer link closed");
        self.end_session();
        self.drive(Event::Hangup);
    }

    async fn on_frame(&mut self, frame: &[u8]) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.mux.receive(frame) {
            Some(ChannelEvent::Chat(entry)) if entry.sender == Sender::Peer => {
                println!("💬 [{}] peer: {}", entry.at.format("%H:%M:%S"), entry.text);
            }
            Some(ChannelEvent::FileIncoming(meta)) => {
                println!("📥 Receiving {} ({})", meta.name, meta.media_type);
            }
            Some(ChannelEvent::FileComplete(file)) => {
                let path = download_path(&self.config.download_dir, &file.meta.name);
                match tokio::fs::write(&path, &file.data).await {
                    Ok(()) => println!("📥 100% - saved {} ({} bytes)", path.display(), file.data.len()),
                    Err(e) => println!("❌ Could not save {}: {}", path.display(), e),
                }
            }
            _ => {}
        }
    }

    async fn send_file(&mut self, path: &Path) {
        let Some(session) = self.session.as_mut() else {
            println!("Not connected to a peer");
            return;
        };
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) => {
                println!("❌ Cannot read {}: {}", path.display(), e);
                return;
            }
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let meta = FileMeta::new(name.clone(), media_type_for(path));

        let mut last_percent = 0;
        let result = session.mux.send_file(meta, data, |progress| {
            let percent = (progress * 100.0) as u32;
            if percent >= last_percent + 10 || percent == 100 {
                last_percent = percent;
                println!("📤 {}: {}%", name, percent);
            }
        });
        if let Err(e) = result {
            println!("❌ Transfer of {} failed: {}", name, e);
        }
    }

    fn end_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
        }
    }

    fn print_status(&self) {
        println!("📋 Phase: {}", self.controller.phase());
        if let Some(id) = self.controller.local_id() {
            println!("   Your id: {}", id);
        }
        if let Some(peer) = self.controller.counterpart() {
            println!("   Peer: {}", peer);
        }
        if let Some(session) = &self.session {
            println!("   Chat messages: {}", session.mux.chat_log().len());
        }
    }
}

async fn next_frame(session: &mut Option<Session>) -> Option<Vec<u8>> {
    match session {
        Some(session) => session.inbound.recv().await,
        None => std::future::pending().await,
    }
}

/// Keep only the final path component of a peer-supplied name
fn download_path(dir: &Path, name: &str) -> PathBuf {
    let file_name = Path::new(name)
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "download".into());
    dir.join(file_name)
}

fn media_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "md" => "text/plain",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

fn print_help() {
    println!();
    println!("💬 Commands:");
    println!("  call [id|link] - Dial a peer (defaults to --target)");
    println!("  accept         - Answer an incoming call");
    println!("  hangup         - End the current call");
    println!("  say <text>     - Send a chat message");
    println!("  send <path>    - Send a file");
    println!("  feedback <txt> - Send feedback to the relay operator");
    println!("  status         - Show call state");
    println!("  quit           - Exit client");
    println!();
}

fn prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}

async fn handle_user_input(cmd_tx: mpsc::UnboundedSender<String>) -> Result<()> {
    let stdin = tokio::io::stdin();
    let reader = BufReader::new(stdin);
    let mut lines = reader.lines();

    prompt();
    while let Some(line) = lines.next_line().await? {
        if cmd_tx.send(line).is_err() {
            break;
        }
    }
    Ok(())
}
