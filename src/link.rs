//! Direct Link
//!
//! Ordered, message-oriented duplex transport between two peers once the
//! handshake is done, plus the keep-alive loop that runs over it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};

use crate::channel::KEEP_ALIVE_MARKER;
use crate::protocol::{read_frame, write_frame};

/// Largest frame accepted from a peer (1 MiB)
pub const MAX_LINK_FRAME: usize = 1024 * 1024;

/// Link errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("Link closed")]
    Closed,
}

/// Anything frames can be pushed into without blocking
pub trait FrameSink {
    fn send_frame(&self, frame: Vec<u8>) -> Result<(), LinkError>;

    /// False once the link has been torn down
    fn is_live(&self) -> bool;
}

/// Outbound half of an established link.
///
/// Frames are queued and written by a background task in order; the same
/// length prefix as the relay protocol delimits them on the wire.
#[derive(Clone)]
pub struct FramedLink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    torn_down: Arc<AtomicBool>,
    tasks: Arc<Vec<AbortHandle>>,
}

impl FramedLink {
    /// Start reader and writer tasks over `stream`.
    ///
    /// Returns the link and the queue of inbound frames; the queue ends when
    /// the peer closes or the stream fails.
    pub fn spawn<S>(stream: S) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let (tx, mut outbound) = mpsc::unbounded_channel::<Vec<u8>>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let torn_down = Arc::new(AtomicBool::new(false));

        let writer_flag = torn_down.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                if let Err(e) = write_frame(&mut write_half, &frame).await {
                    log::debug!("Link write failed: {}", e);
                    break;
                }
            }
            writer_flag.store(true, Ordering::SeqCst);
        });

        let reader_flag = torn_down.clone();
        let reader = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half, MAX_LINK_FRAME).await {
                    Ok(Some(frame)) => {
                        if inbound_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        log::info!("Peer closed the link");
                        break;
                    }
                    Err(e) => {
                        log::warn!("Link read failed: {}", e);
                        break;
                    }
                }
            }
            reader_flag.store(true, Ordering::SeqCst);
        });

        let link = Self {
            tx,
            torn_down,
            tasks: Arc::new(vec![writer.abort_handle(), reader.abort_handle()]),
        };
        (link, inbound)
    }

    /// Tear the link down; queued frames are dropped
    pub fn close(&self) {
        self.torn_down.store(true, Ordering::SeqCst);
        for task in self.tasks.iter() {
            task.abort();
        }
    }
}

impl FrameSink for FramedLink {
    fn send_frame(&self, frame: Vec<u8>) -> Result<(), LinkError> {
        if !self.is_live() {
            return Err(LinkError::Closed);
        }
        self.tx.send(frame).map_err(|_| LinkError::Closed)
    }

    fn is_live(&self) -> bool {
        !self.torn_down.load(Ordering::SeqCst) && !self.tx.is_closed()
    }
}

/// Send a keep-alive frame every `interval` while the link is live.
///
/// Send failures are ignored; the task ends once the link is torn down.
pub fn spawn_heartbeat<S>(sink: S, interval: Duration) -> JoinHandle<()>
where
    S: FrameSink + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !sink.is_live() {
                log::debug!("Heartbeat stopped");
                break;
            }
            if let Err(e) = sink.send_frame(KEEP_ALIVE_MARKER.as_bytes().to_vec()) {
                log::debug!("Heartbeat not sent: {}", e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let (link_a, _in_a) = FramedLink::spawn(a);
        let (_link_b, mut in_b) = FramedLink::spawn(b);

        for i in 0..10u8 {
            link_a.send_frame(vec![i; 100]).unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(in_b.recv().await.unwrap(), vec![i; 100]);
        }
    }

    #[tokio::test]
    async fn test_close_ends_peer_stream() {
        let (a, b) = tokio::io::duplex(1024);
        let (link_a, _in_a) = FramedLink::spawn(a);
        let (_link_b, mut in_b) = FramedLink::spawn(b);

        link_a.close();
        assert!(!link_a.is_live());
        assert_eq!(link_a.send_frame(b"late".to_vec()), Err(LinkError::Closed));

        // Aborting both tasks drops the stream, so the peer sees EOF
        let end = tokio::time::timeout(Duration::from_secs(1), in_b.recv()).await;
        assert_eq!(end, Ok(None));
    }

    #[derive(Clone, Default)]
    struct CountingSink {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
        dead: Arc<AtomicBool>,
        failing: bool,
    }

    impl FrameSink for CountingSink {
        fn send_frame(&self, frame: Vec<u8>) -> Result<(), LinkError> {
            self.frames.lock().push(frame);
            if self.failing {
                return Err(LinkError::Closed);
            }
            Ok(())
        }

        fn is_live(&self) -> bool {
            !self.dead.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_heartbeat_sends_markers_until_torn_down() {
        let sink = CountingSink::default();
        let task = spawn_heartbeat(sink.clone(), Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(110)).await;
        let sent = sink.frames.lock().len();
        assert!(sent >= 2, "only {} heartbeats", sent);
        assert!(sink
            .frames
            .lock()
            .iter()
            .all(|f| f.as_slice() == KEEP_ALIVE_MARKER.as_bytes()));

        sink.dead.store(true, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("heartbeat should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_swallows_send_errors() {
        let sink = CountingSink {
            failing: true,
            ..Default::default()
        };
        let task = spawn_heartbeat(sink.clone(), Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(sink.frames.lock().len() >= 2);
        assert!(!task.is_finished());
        task.abort();
    }
}
