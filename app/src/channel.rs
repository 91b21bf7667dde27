//! Publish/subscribe channel between the controller and its worker.
//!
//! Each direction is one TCP connection carrying length-prefixed frames.
//! The controller binds both ends on ephemeral ports and the worker connects
//! to them, so the pair forms a full-duplex link:
//!
//! ```text
//! controller Publisher  --bind-->  <--connect-- worker Subscriber
//! controller Subscriber --bind-->  <--connect-- worker Publisher
//! ```
//!
//! Publishing never blocks. Messages published while no subscriber is
//! connected are dropped, as with any pub/sub socket; the liveness CHECKs and
//! the worker's startup FETCH make up for that.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fabric_utils::{FrameReader, FrameWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{JoinHandle, JoinSet};

use crate::message::Message;

const BROADCAST_CAPACITY: usize = 1024;

/// Called for every decoded inbound message, in arrival order.
pub type Handler = Arc<dyn Fn(Message) + Send + Sync>;

type Frame = Arc<[u8]>;

pub struct Publisher {
    tx: broadcast::Sender<Frame>,
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Publisher {
    /// Listen on an ephemeral port of `host`. Every subscriber that connects
    /// receives the messages published after it connected.
    pub async fn bind(host: &str) -> io::Result<Self> {
        let listener = TcpListener::bind((host, 0)).await?;
        let addr = listener.local_addr()?;
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let accept_tx = tx.clone();
        let task = tokio::spawn(async move {
            let mut connections = JoinSet::new();
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "Subscriber connected");
                        while connections.try_join_next().is_some() {}
                        connections.spawn(forward(stream, accept_tx.subscribe(), peer));
                    }
                    Err(e) => {
                        tracing::warn!(%addr, "Publisher accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        Ok(Self { tx, addr, task })
    }

    /// Publish into the subscriber listening at `addr`.
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (tx, rx) = broadcast::channel(BROADCAST_CAPACITY);
        let task = tokio::spawn(forward(stream, rx, addr));
        Ok(Self { tx, addr, task })
    }

    /// Address bound (for `bind`) or connected to (for `connect`).
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn publish(&self, message: &Message) {
        let action = message.action().as_str();
        match message.encode() {
            Ok(bytes) => {
                if self.tx.send(Frame::from(bytes)).is_err() {
                    tracing::debug!(action, "No subscriber connected, message dropped");
                }
            }
            Err(e) => tracing::error!(action, "Failed to encode message: {e}"),
        }
    }

    /// Wait until every connected subscriber has taken the published
    /// messages off the queue, or `timeout` elapses.
    pub async fn drain(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.tx.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Whether the connection of a `connect`ed publisher is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn forward(stream: TcpStream, mut rx: broadcast::Receiver<Frame>, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(%peer, "Failed to disable Nagle: {e}");
    }
    let mut writer = FrameWriter::new(stream);
    loop {
        match rx.recv().await {
            Ok(frame) => {
                if let Err(e) = writer.write_frame(&frame).await {
                    tracing::debug!(%peer, "Subscriber went away: {e}");
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(%peer, skipped, "Subscriber fell behind, messages lost");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

pub struct Subscriber {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Subscriber {
    /// Listen on an ephemeral port of `host`, feeding every connected
    /// publisher's messages to `handler`.
    pub async fn bind(host: &str, handler: Handler) -> io::Result<Self> {
        let listener = TcpListener::bind((host, 0)).await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            let mut connections = JoinSet::new();
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "Publisher connected");
                        while connections.try_join_next().is_some() {}
                        connections.spawn(receive(stream, Arc::clone(&handler), peer));
                    }
                    Err(e) => {
                        tracing::warn!(%addr, "Subscriber accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        Ok(Self { addr, task })
    }

    /// Subscribe to the publisher listening at `addr`.
    pub async fn connect(addr: SocketAddr, handler: Handler) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let task = tokio::spawn(receive(stream, handler, addr));
        Ok(Self { addr, task })
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether the connection of a `connect`ed subscriber is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn receive(stream: TcpStream, handler: Handler, peer: SocketAddr) {
    let mut reader = FrameReader::new(stream);
    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => match Message::decode(&frame) {
                Ok(message) => handler(message),
                Err(e) => tracing::warn!(%peer, "Dropping malformed message: {e}"),
            },
            Ok(None) => {
                tracing::debug!(%peer, "Publisher closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!(%peer, "Channel read failed: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use fabric_types::Qid;

    use super::*;

    fn collector() -> (Handler, Arc<Mutex<Vec<Message>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: Handler = Arc::new(move |message: Message| sink.lock().unwrap().push(message));
        (handler, seen)
    }

    async fn wait_for(seen: &Mutex<Vec<Message>>, count: usize) {
        for _ in 0..200 {
            if seen.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bound_publisher_reaches_connected_subscriber_in_order() {
        let publisher = Publisher::bind("127.0.0.1").await.unwrap();
        let (handler, seen) = collector();
        let _subscriber = Subscriber::connect(publisher.addr(), handler).await.unwrap();
        // Give the accept loop a moment to register the connection.
        tokio::time::sleep(Duration::from_millis(50)).await;

        publisher.publish(&Message::Add(Qid::from("a")));
        publisher.publish(&Message::Remove(Qid::from("a")));
        wait_for(&seen, 2).await;

        let seen = seen.lock().unwrap();
        assert!(matches!(&seen[0], Message::Add(qid) if qid.as_str() == "a"));
        assert!(matches!(&seen[1], Message::Remove(qid) if qid.as_str() == "a"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connected_publisher_reaches_bound_subscriber() {
        let (handler, seen) = collector();
        let subscriber = Subscriber::bind("127.0.0.1", handler).await.unwrap();
        let publisher = Publisher::connect(subscriber.addr()).await.unwrap();

        publisher.publish(&Message::Fetch("queue".to_string()));
        publisher.drain(Duration::from_secs(1)).await;
        wait_for(&seen, 1).await;

        assert!(matches!(&seen.lock().unwrap()[0], Message::Fetch(what) if what == "queue"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn publishing_without_subscribers_is_silent() {
        let publisher = Publisher::bind("127.0.0.1").await.unwrap();
        publisher.publish(&Message::Exit("closing".to_string()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_frames_are_skipped() {
        let (handler, seen) = collector();
        let subscriber = Subscriber::bind("127.0.0.1", handler).await.unwrap();
        let stream = TcpStream::connect(subscriber.addr()).await.unwrap();
        let mut writer = FrameWriter::new(stream);
        writer.write_frame(br#"{"action":"bogus"}"#).await.unwrap();
        writer.write_frame(b"not json").await.unwrap();
        writer
            .write_frame(&Message::Check(Qid::from("q")).encode().unwrap())
            .await
            .unwrap();
        wait_for(&seen, 1).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(&seen[0], Message::Check(qid) if qid.as_str() == "q"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connected_ends_notice_peer_shutdown() {
        let publisher = Publisher::bind("127.0.0.1").await.unwrap();
        let (handler, _seen) = collector();
        let subscriber = Subscriber::connect(publisher.addr(), handler).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(publisher);

        for _ in 0..200 {
            if subscriber.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(subscriber.is_closed());
    }
}
