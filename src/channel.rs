//! Channel Multiplexer
//!
//! Carries chat text, file metadata, file bytes and keep-alives over one
//! ordered message stream. Frames carry no type tag; the receiver tells them
//! apart by content:
//!
//! | frame                              | meaning                     |
//! |------------------------------------|-----------------------------|
//! | `__heartbeat__`                    | keep-alive, dropped         |
//! | `{"text": ...}`                    | chat message                |
//! | `{"meta": {"name": .., "type": ..}}` | metadata of the next file |
//! | `__EOF__`                          | end of the current file     |
//! | anything else                      | file chunk                  |
//!
//! A file chunk that happens to equal a marker or start like a JSON control
//! frame is misread. An explicit type/length header would close that gap;
//! the untagged layout is kept for compatibility with existing peers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::link::{FrameSink, LinkError};

/// Size of each file chunk frame (16 KiB)
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Keep-alive frame content
pub const KEEP_ALIVE_MARKER: &str = "__heartbeat__";

/// End-of-file frame content
pub const EOF_MARKER: &str = "__EOF__";

const DEFAULT_FILE_NAME: &str = "download";
const DEFAULT_MEDIA_TYPE: &str = "application/octet-stream";

/// Name and media type of a file in transit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub media_type: String,
}

impl FileMeta {
    pub fn new(name: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            media_type: media_type.into(),
        }
    }
}

impl Default for FileMeta {
    fn default() -> Self {
        Self::new(DEFAULT_FILE_NAME, DEFAULT_MEDIA_TYPE)
    }
}

#[derive(Serialize, Deserialize)]
struct ChatFrame {
    text: String,
}

#[derive(Serialize, Deserialize)]
struct MetaFrame {
    meta: FileMeta,
}

/// Encode a chat message frame
pub fn encode_chat(text: &str) -> Vec<u8> {
    serde_json::to_vec(&ChatFrame {
        text: text.to_string(),
    })
    .unwrap_or_default()
}

/// Encode a file metadata frame
pub fn encode_meta(meta: &FileMeta) -> Vec<u8> {
    serde_json::to_vec(&MetaFrame { meta: meta.clone() }).unwrap_or_default()
}

/// What an inbound frame turned out to be
#[derive(Debug, PartialEq)]
pub enum InboundFrame<'a> {
    KeepAlive,
    Chat(String),
    Meta(FileMeta),
    EndOfFile,
    Chunk(&'a [u8]),
}

/// Sniff a frame. Never fails: whatever is not recognized is file data.
pub fn classify(frame: &[u8]) -> InboundFrame<'_> {
    if frame == KEEP_ALIVE_MARKER.as_bytes() {
        return InboundFrame::KeepAlive;
    }
    if frame == EOF_MARKER.as_bytes() {
        return InboundFrame::EndOfFile;
    }
    if frame.starts_with(b"{\"text\"") {
        if let Ok(chat) = serde_json::from_slice::<ChatFrame>(frame) {
            return InboundFrame::Chat(chat.text);
        }
    }
    if frame.starts_with(b"{\"meta\"") {
        if let Ok(meta) = serde_json::from_slice::<MetaFrame>(frame) {
            return InboundFrame::Meta(meta.meta);
        }
    }
    InboundFrame::Chunk(frame)
}

/// Who wrote a chat line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    Me,
    Peer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatEntry {
    pub sender: Sender,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Chat history of the current connection
#[derive(Debug, Default)]
pub struct ChatLog {
    entries: Vec<ChatEntry>,
}

impl ChatLog {
    pub fn push(&mut self, sender: Sender, text: String) -> &ChatEntry {
        self.entries.push(ChatEntry {
            sender,
            text,
            at: Utc::now(),
        });
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One frame ready to go out, with the transfer progress after sending it
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    pub payload: Vec<u8>,
    /// Fraction of the file sent once this frame is out (0.0 ..= 1.0)
    pub progress: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Meta,
    Chunks,
    Done,
}

/// Send side of a file transfer: metadata, ordered chunks, terminal marker
#[derive(Debug)]
pub struct OutgoingTransfer {
    meta: FileMeta,
    data: Vec<u8>,
    offset: usize,
    chunk_size: usize,
    stage: Stage,
}

impl OutgoingTransfer {
    pub fn new(meta: FileMeta, data: Vec<u8>) -> Self {
        Self::with_chunk_size(meta, data, CHUNK_SIZE)
    }

    pub fn with_chunk_size(meta: FileMeta, data: Vec<u8>, chunk_size: usize) -> Self {
        Self {
            meta,
            data,
            offset: 0,
            chunk_size: chunk_size.max(1),
            stage: Stage::Meta,
        }
    }

    pub fn meta(&self) -> &FileMeta {
        &self.meta
    }

    pub fn total(&self) -> usize {
        self.data.len()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes sent over total bytes; an empty file counts as done
    pub fn progress(&self) -> f64 {
        if self.data.is_empty() {
            return if self.stage == Stage::Meta { 0.0 } else { 1.0 };
        }
        self.offset as f64 / self.data.len() as f64
    }

    /// Number of chunk frames this transfer produces
    pub fn chunk_count(&self) -> usize {
        self.data.len().div_ceil(self.chunk_size)
    }
}

impl Iterator for OutgoingTransfer {
    type Item = OutboundFrame;

    fn next(&mut self) -> Option<OutboundFrame> {
        match self.stage {
            Stage::Meta => {
                self.stage = Stage::Chunks;
                Some(OutboundFrame {
                    payload: encode_meta(&self.meta),
                    progress: 0.0,
                })
            }
            Stage::Chunks if self.offset < self.data.len() => {
                let end = (self.offset + self.chunk_size).min(self.data.len());
                let payload = self.data[self.offset..end].to_vec();
                self.offset = end;
                Some(OutboundFrame {
                    payload,
                    progress: self.progress(),
                })
            }
            Stage::Chunks => {
                self.stage = Stage::Done;
                Some(OutboundFrame {
                    payload: EOF_MARKER.as_bytes().to_vec(),
                    progress: 1.0,
                })
            }
            Stage::Done => None,
        }
    }
}

/// A fully reassembled inbound file
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFile {
    pub meta: FileMeta,
    pub data: Vec<u8>,
}

/// What the receive side surfaces to the application
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Chat(ChatEntry),
    FileIncoming(FileMeta),
    /// A chunk was stored; `received` counts bytes of the current file so far
    Chunk { received: usize },
    /// Terminal marker seen: the file is complete (100%)
    FileComplete(ReceivedFile),
}

/// Receive side: chunk accumulator plus pending metadata
#[derive(Debug, Default)]
pub struct Demultiplexer {
    pending_meta: Option<FileMeta>,
    chunks: Vec<Vec<u8>>,
    received: usize,
}

impl Demultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of the in-flight file received so far
    pub fn received(&self) -> usize {
        self.received
    }

    pub fn pending_meta(&self) -> Option<&FileMeta> {
        self.pending_meta.as_ref()
    }

    /// Handle one inbound frame; keep-alives produce nothing
    pub fn on_frame(&mut self, frame: &[u8], chat: &mut ChatLog) -> Option<ChannelEvent> {
        match classify(frame) {
            InboundFrame::KeepAlive => None,
            InboundFrame::Chat(text) => Some(ChannelEvent::Chat(chat.push(Sender::Peer, text).clone())),
            InboundFrame::Meta(meta) => {
                self.pending_meta = Some(meta.clone());
                Some(ChannelEvent::FileIncoming(meta))
            }
            InboundFrame::Chunk(bytes) => {
                self.received += bytes.len();
                self.chunks.push(bytes.to_vec());
                Some(ChannelEvent::Chunk {
                    received: self.received,
                })
            }
            InboundFrame::EndOfFile => {
                let data = std::mem::take(&mut self.chunks).concat();
                let meta = self.pending_meta.take().unwrap_or_default();
                self.received = 0;
                Some(ChannelEvent::FileComplete(ReceivedFile { meta, data }))
            }
        }
    }

    /// Discard a half-received file, e.g. after the link dropped
    pub fn abandon(&mut self) {
        self.pending_meta = None;
        self.chunks.clear();
        self.received = 0;
    }
}

/// Both directions of the channel over one frame sink
pub struct Multiplexer<S: FrameSink> {
    sink: S,
    chat: ChatLog,
    inbound: Demultiplexer,
}

impl<S: FrameSink> Multiplexer<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            chat: ChatLog::default(),
            inbound: Demultiplexer::new(),
        }
    }

    pub fn chat_log(&self) -> &ChatLog {
        &self.chat
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Send a chat line and record it locally
    pub fn send_chat(&mut self, text: &str) -> Result<(), LinkError> {
        self.sink.send_frame(encode_chat(text))?;
        self.chat.push(Sender::Me, text.to_string());
        Ok(())
    }

    /// Queue a whole file, reporting progress after every chunk
    pub fn send_file<P>(&mut self, meta: FileMeta, data: Vec<u8>, mut on_progress: P) -> Result<(), LinkError>
    where
        P: FnMut(f64),
    {
        let transfer = OutgoingTransfer::new(meta, data);
        log::info!(
            "Sending {} ({} bytes, {} chunks)",
            transfer.meta().name,
            transfer.total(),
            transfer.chunk_count()
        );
        let chunks = transfer.chunk_count();
        for (index, frame) in transfer.enumerate() {
            self.sink.send_frame(frame.payload)?;
            // Frame 0 is the metadata, the last one the terminal marker
            if (1..=chunks).contains(&index) {
                on_progress(frame.progress);
            }
        }
        Ok(())
    }

    /// Handle one inbound frame
    pub fn receive(&mut self, frame: &[u8]) -> Option<ChannelEvent> {
        self.inbound.on_frame(frame, &mut self.chat)
    }

    /// Drop partial inbound state after the transport went away
    pub fn abandon_transfer(&mut self) {
        if self.inbound.received() > 0 || self.inbound.pending_meta().is_some() {
            log::warn!("Abandoning partial file ({} bytes)", self.inbound.received());
        }
        self.inbound.abandon();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct VecSink {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl FrameSink for VecSink {
        fn send_frame(&self, frame: Vec<u8>) -> Result<(), LinkError> {
            self.frames.lock().push(frame);
            Ok(())
        }

        fn is_live(&self) -> bool {
            true
        }
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_classify_markers_and_control() {
        assert_eq!(classify(b"__heartbeat__"), InboundFrame::KeepAlive);
        assert_eq!(classify(b"__EOF__"), InboundFrame::EndOfFile);
        assert_eq!(
            classify(br#"{"text":"hello"}"#),
            InboundFrame::Chat("hello".to_string())
        );
        assert_eq!(
            classify(br#"{"meta":{"name":"a.png","type":"image/png"}}"#),
            InboundFrame::Meta(FileMeta::new("a.png", "image/png"))
        );
        assert_eq!(classify(b"\x89PNG"), InboundFrame::Chunk(b"\x89PNG"));
        // Looks like chat but is not valid JSON: treated as data
        assert_eq!(classify(br#"{"text":"#), InboundFrame::Chunk(br#"{"text":"#));
    }

    #[test]
    fn test_transfer_frame_layout() {
        let size = CHUNK_SIZE * 2 + 100;
        let transfer = OutgoingTransfer::new(FileMeta::new("f.bin", "application/octet-stream"), sample(size));
        assert_eq!(transfer.chunk_count(), 3);

        let frames: Vec<OutboundFrame> = transfer.collect();
        assert_eq!(frames.len(), 1 + 3 + 1);
        assert_eq!(classify(&frames[0].payload), InboundFrame::Meta(FileMeta::new("f.bin", "application/octet-stream")));
        assert_eq!(frames[1].payload.len(), CHUNK_SIZE);
        assert_eq!(frames[3].payload.len(), 100);
        assert_eq!(frames[4].payload, EOF_MARKER.as_bytes());

        let progress: Vec<f64> = frames[1..4].iter().map(|f| f.progress).collect();
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(progress[2], 1.0);
    }

    #[test]
    fn test_chunk_count_edges() {
        let exact = OutgoingTransfer::new(FileMeta::default(), sample(CHUNK_SIZE));
        assert_eq!(exact.chunk_count(), 1);
        assert_eq!(exact.count(), 3);

        let empty = OutgoingTransfer::new(FileMeta::default(), Vec::new());
        assert_eq!(empty.chunk_count(), 0);
        let frames: Vec<OutboundFrame> = empty.collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].progress, 1.0);
    }

    #[test]
    fn test_file_round_trip() {
        let size = CHUNK_SIZE * 3 + 7;
        let data = sample(size);
        let sink = VecSink::default();
        let mut sender = Multiplexer::new(sink.clone());

        let mut reports = Vec::new();
        sender
            .send_file(FileMeta::new("photo.jpg", "image/jpeg"), data.clone(), |p| reports.push(p))
            .unwrap();
        assert_eq!(reports.len(), 4);
        assert_eq!(reports.last(), Some(&1.0));

        let frames = sink.frames.lock().clone();
        let chunk_frames = frames
            .iter()
            .filter(|f| matches!(classify(f), InboundFrame::Chunk(_)))
            .count();
        assert_eq!(chunk_frames, size.div_ceil(CHUNK_SIZE));
        assert_eq!(
            frames.iter().filter(|f| f.as_slice() == EOF_MARKER.as_bytes()).count(),
            1
        );

        let mut receiver = Multiplexer::new(VecSink::default());
        let completions: Vec<ReceivedFile> = frames
            .iter()
            .filter_map(|f| match receiver.receive(f) {
                Some(ChannelEvent::FileComplete(file)) => Some(file),
                _ => None,
            })
            .collect();

        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].meta, FileMeta::new("photo.jpg", "image/jpeg"));
        assert_eq!(completions[0].data, data);
        assert_eq!(receiver.inbound.received(), 0);
    }

    #[test]
    fn test_keep_alive_mid_transfer() {
        let mut demux = Demultiplexer::new();
        let mut chat = ChatLog::default();

        demux.on_frame(&encode_meta(&FileMeta::new("a.txt", "text/plain")), &mut chat);
        demux.on_frame(b"first ", &mut chat);
        assert_eq!(demux.received(), 6);

        assert!(demux.on_frame(KEEP_ALIVE_MARKER.as_bytes(), &mut chat).is_none());
        assert_eq!(demux.received(), 6);

        demux.on_frame(b"second", &mut chat);
        match demux.on_frame(EOF_MARKER.as_bytes(), &mut chat) {
            Some(ChannelEvent::FileComplete(file)) => assert_eq!(file.data, b"first second"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(chat.is_empty());
    }

    #[test]
    fn test_chat_framing() {
        let sink = VecSink::default();
        let mut alice = Multiplexer::new(sink.clone());
        alice.send_chat("hello").unwrap();
        assert_eq!(alice.chat_log().entries()[0].sender, Sender::Me);

        let frame = sink.frames.lock()[0].clone();
        assert_eq!(frame, br#"{"text":"hello"}"#);

        let mut bob = Multiplexer::new(VecSink::default());
        match bob.receive(&frame) {
            Some(ChannelEvent::Chat(entry)) => {
                assert_eq!(entry.sender, Sender::Peer);
                assert_eq!(entry.text, "hello");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(bob.chat_log().len(), 1);
        assert_eq!(bob.inbound.received(), 0);
    }

    #[test]
    fn test_eof_without_meta_uses_defaults() {
        let mut demux = Demultiplexer::new();
        let mut chat = ChatLog::default();
        demux.on_frame(b"raw", &mut chat);
        match demux.on_frame(EOF_MARKER.as_bytes(), &mut chat) {
            Some(ChannelEvent::FileComplete(file)) => {
                assert_eq!(file.meta, FileMeta::default());
                assert_eq!(file.data, b"raw");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_abandon_discards_partial_file() {
        let mut mux = Multiplexer::new(VecSink::default());
        mux.receive(&encode_meta(&FileMeta::new("big.iso", "application/x-iso9660-image")));
        mux.receive(b"partial");
        mux.abandon_transfer();
        match mux.receive(EOF_MARKER.as_bytes()) {
            Some(ChannelEvent::FileComplete(file)) => {
                assert!(file.data.is_empty());
                assert_eq!(file.meta, FileMeta::default());
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
