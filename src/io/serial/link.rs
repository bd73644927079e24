// src/io/serial/link.rs
//
// The single controller link: negotiation, inbound frame delivery, command
// transmit and teardown.
//
// State machine: Disconnected -> Negotiating -> Connected -> Disconnected.
// A new negotiation always releases the previous link first, so at most one
// open handle exists per SerialLink.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self as std_mpsc, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use super::framer::{BufferGuard, Frame, FrameExtractor};
use super::negotiator::{
    candidate_list, fixed_candidate, BaudCandidate, ConnectionAttempt, LinkNegotiator,
    Negotiated, NegotiatorConfig,
};
use super::reader::spawn_link_reader;
use super::transport::SerialTransport;
use crate::error::{Result, SerialError};

/// How long `send` waits for the read loop to report the write result
pub const TRANSMIT_TIMEOUT: Duration = Duration::from_millis(500);

const TRANSMIT_QUEUE_DEPTH: usize = 32;

// ============================================================================
// Types
// ============================================================================

/// Link state as seen by the readiness query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Negotiating,
    Connected,
}

/// Downstream consumer of frames. Called once per frame, in emission order,
/// from the read loop thread. Must not block.
pub type FrameSink = Arc<dyn Fn(Frame) + Send + Sync>;

/// Result of a successful negotiation
#[derive(Debug, Clone, Serialize)]
pub struct LinkInfo {
    pub path: String,
    pub baud_rate: u32,
    pub attempts: Vec<ConnectionAttempt>,
}

/// Write request handed to the read loop
pub(crate) struct TransmitRequest {
    pub data: Vec<u8>,
    pub result_tx: oneshot::Sender<std::io::Result<()>>,
}

pub(crate) type TransmitSender = std_mpsc::SyncSender<TransmitRequest>;

// ============================================================================
// Shared Link State
// ============================================================================

/// State shared between the owner and the read loop of one open handle.
pub(crate) struct LinkShared {
    closed: AtomicBool,
    /// Held while frames are handed to the sink, and while closing.
    delivery: Mutex<()>,
    state_tx: Arc<watch::Sender<LinkState>>,
}

impl LinkShared {
    fn new(state_tx: Arc<watch::Sender<LinkState>>) -> Self {
        LinkShared {
            closed: AtomicBool::new(false),
            delivery: Mutex::new(()),
            state_tx,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Owner-side close. Once this returns the sink sees no more frames.
    fn close(&self) {
        let _delivery = self.delivery.lock().unwrap_or_else(|e| e.into_inner());
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Transport-side failure. Publishes Disconnected unless the owner already closed.
    pub(crate) fn fail(&self, reason: &str) {
        let _delivery = self.delivery.lock().unwrap_or_else(|e| e.into_inner());
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tlog!("[serial] Link lost: {}", reason);
        self.state_tx.send_replace(LinkState::Disconnected);
    }
}

// ============================================================================
// Inbound Pump
// ============================================================================

/// Feeds inbound chunks through this link's own FrameExtractor and forwards
/// the frames to the sink. Owned by the read loop.
pub(crate) struct InboundPump {
    extractor: FrameExtractor,
    shared: Arc<LinkShared>,
    sink: FrameSink,
}

impl InboundPump {
    pub(crate) fn new(shared: Arc<LinkShared>, sink: FrameSink, guard: BufferGuard) -> Self {
        InboundPump {
            extractor: FrameExtractor::with_guard(guard),
            shared,
            sink,
        }
    }

    /// Handle one inbound data event. Returns false once the link is closed,
    /// in which case the chunk is dropped.
    pub(crate) fn on_data(&mut self, chunk: &[u8]) -> bool {
        if self.shared.is_closed() {
            return false;
        }

        let frames = self.extractor.feed(chunk);
        if frames.is_empty() {
            return true;
        }

        let _delivery = self.shared.delivery.lock().unwrap_or_else(|e| e.into_inner());
        if self.shared.is_closed() {
            return false;
        }
        for frame in frames {
            (self.sink)(frame);
        }
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub(crate) fn fail(&self, reason: &str) {
        self.shared.fail(reason);
    }
}

// ============================================================================
// Active Link
// ============================================================================

struct ActiveLink {
    path: String,
    baud_rate: u32,
    shared: Arc<LinkShared>,
    transmit_tx: TransmitSender,
    reader: Option<JoinHandle<()>>,
}

impl Drop for ActiveLink {
    fn drop(&mut self) {
        // Lets the read loop exit and release the handle
        self.shared.close();
    }
}

/// Publishes Disconnected if a negotiation future is dropped before it finishes
struct NegotiationGuard {
    state_tx: Arc<watch::Sender<LinkState>>,
    armed: bool,
}

impl Drop for NegotiationGuard {
    fn drop(&mut self) {
        if self.armed {
            self.state_tx.send_replace(LinkState::Disconnected);
        }
    }
}

// ============================================================================
// Serial Link
// ============================================================================

/// Owner of the one active controller link
pub struct SerialLink {
    negotiator: LinkNegotiator,
    sink: FrameSink,
    guard: BufferGuard,
    state_tx: Arc<watch::Sender<LinkState>>,
    active: Option<ActiveLink>,
}

impl SerialLink {
    pub fn new(
        transport: Arc<dyn SerialTransport>,
        config: NegotiatorConfig,
        sink: FrameSink,
    ) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        SerialLink {
            negotiator: LinkNegotiator::new(transport, config),
            sink,
            guard: BufferGuard::default(),
            state_tx: Arc::new(state_tx),
            active: None,
        }
    }

    /// Override the buffer ceiling used for each new link's extractor
    pub fn with_buffer_guard(mut self, guard: BufferGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == LinkState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    /// Path and committed speed of the live link
    pub fn current(&self) -> Option<(&str, u32)> {
        self.live().map(|a| (a.path.as_str(), a.baud_rate))
    }

    /// Negotiate a speed for `path`, starting from `preferred_baud`.
    pub async fn negotiate(&mut self, path: &str, preferred_baud: u32) -> Result<LinkInfo> {
        self.open_with(path, candidate_list(preferred_baud)).await
    }

    /// Connect at exactly `baud_rate`, without trying other speeds.
    pub async fn connect_fixed(&mut self, path: &str, baud_rate: u32) -> Result<LinkInfo> {
        self.open_with(path, fixed_candidate(baud_rate)).await
    }

    async fn open_with(&mut self, path: &str, candidates: Vec<BaudCandidate>) -> Result<LinkInfo> {
        self.close().await;

        self.state_tx.send_replace(LinkState::Negotiating);
        let mut guard = NegotiationGuard {
            state_tx: self.state_tx.clone(),
            armed: true,
        };

        let Negotiated {
            port,
            baud_rate,
            attempts,
        } = self.negotiator.negotiate_candidates(path, candidates).await?;

        let shared = Arc::new(LinkShared::new(self.state_tx.clone()));
        let pump = InboundPump::new(shared.clone(), self.sink.clone(), self.guard);
        let (transmit_tx, transmit_rx) = std_mpsc::sync_channel(TRANSMIT_QUEUE_DEPTH);

        // Published before the read loop starts so an early failure is not overwritten
        guard.armed = false;
        self.state_tx.send_replace(LinkState::Connected);

        let reader = spawn_link_reader(port, pump, transmit_rx, path.to_string());
        self.active = Some(ActiveLink {
            path: path.to_string(),
            baud_rate,
            shared,
            transmit_tx,
            reader: Some(reader),
        });

        tlog!("[serial] Connected to {} at {} baud", path, baud_rate);

        Ok(LinkInfo {
            path: path.to_string(),
            baud_rate,
            attempts,
        })
    }

    /// Write `command` followed by a newline.
    /// Writes are performed one at a time by the read loop, in call order.
    pub async fn send(&self, command: &str) -> Result<()> {
        let active = self.live().ok_or(SerialError::NotConnected)?;

        let mut data = Vec::with_capacity(command.len() + 1);
        data.extend_from_slice(command.as_bytes());
        data.push(b'\n');

        let (result_tx, result_rx) = oneshot::channel();
        active
            .transmit_tx
            .try_send(TransmitRequest { data, result_tx })
            .map_err(|e| match e {
                TrySendError::Full(_) => SerialError::TransmitQueueFull,
                TrySendError::Disconnected(_) => {
                    SerialError::LinkClosed("read loop has stopped".to_string())
                }
            })?;

        match tokio::time::timeout(TRANSMIT_TIMEOUT, result_rx).await {
            Ok(Ok(Ok(()))) => {
                tlog!("[serial] Sent command: {}", command);
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(SerialError::Io(e)),
            Ok(Err(_)) => Err(SerialError::LinkClosed(
                "read loop stopped before writing".to_string(),
            )),
            Err(_) => Err(SerialError::TransmitTimeout),
        }
    }

    /// Close the link if open. Idempotent.
    /// No frame reaches the sink after this returns.
    pub async fn close(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.shared.close();
            if let Some(reader) = active.reader.take() {
                if let Err(e) = reader.await {
                    tlog!("[serial] Read loop for {} panicked: {:?}", active.path, e);
                }
            }
            tlog!("[serial] Closed {}", active.path);
        }
        self.state_tx.send_replace(LinkState::Disconnected);
    }

    fn live(&self) -> Option<&ActiveLink> {
        self.active.as_ref().filter(|a| !a.shared.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::serial::fake::{FakeOpen, FakePort, FakeTransport};
    use crate::io::serial::framer::FrameKind;

    type Collected = Arc<Mutex<Vec<Frame>>>;

    fn collecting_sink() -> (FrameSink, Collected) {
        let frames: Collected = Arc::new(Mutex::new(Vec::new()));
        let captured = frames.clone();
        let sink: FrameSink = Arc::new(move |frame| captured.lock().unwrap().push(frame));
        (sink, frames)
    }

    fn fast_config() -> NegotiatorConfig {
        NegotiatorConfig {
            attempt_timeout: Duration::from_millis(50),
            retry_delay: Duration::ZERO,
            settle_timeout: Duration::from_millis(50),
        }
    }

    fn link_with(port: &FakePort) -> (SerialLink, Collected) {
        let transport = Arc::new(FakeTransport::new().with(115_200, FakeOpen::Open(port.clone())));
        let (sink, frames) = collecting_sink();
        (SerialLink::new(transport, fast_config(), sink), frames)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..400 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_negotiate_reports_committed_speed() {
        let port = FakePort::new();
        let transport = Arc::new(
            FakeTransport::new()
                .with(9_600, FakeOpen::Fail("Device busy"))
                .with(115_200, FakeOpen::Hang)
                .with(921_600, FakeOpen::Open(port)),
        );
        let (sink, _) = collecting_sink();
        let mut link = SerialLink::new(transport.clone(), fast_config(), sink);
        assert_eq!(link.state(), LinkState::Disconnected);

        let info = link.negotiate("/dev/ttyUSB0", 9_600).await.unwrap();

        assert_eq!(info.baud_rate, 921_600);
        assert_eq!(info.attempts.len(), 3);
        assert_eq!(transport.attempted(), vec![9_600, 115_200, 921_600]);
        assert!(link.is_ready());
        assert_eq!(link.current(), Some(("/dev/ttyUSB0", 921_600)));

        link.close().await;
        assert_eq!(link.state(), LinkState::Disconnected);
        assert_eq!(link.current(), None);
    }

    #[tokio::test]
    async fn test_negotiation_failure_leaves_link_disconnected() {
        let (sink, _) = collecting_sink();
        let mut link = SerialLink::new(Arc::new(FakeTransport::new()), fast_config(), sink);

        match link.negotiate("/dev/ttyUSB9", 115_200).await {
            Err(SerialError::Negotiation(failure)) => {
                assert_eq!(failure.attempted_speeds(), candidate_list(115_200).iter().map(|c| c.baud_rate).collect::<Vec<_>>());
            }
            other => panic!("expected negotiation failure, got {:?}", other.map(|i| i.baud_rate)),
        }
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_frames_forwarded_in_order() {
        let port = FakePort::new();
        port.push_read(b"{\"seq\":1}\r\n{\"se");
        port.push_read(b"q\":2}\r\n====== SENT DATA ======\nT: 1\n");
        port.push_read(b"========================\n");
        let (mut link, frames) = link_with(&port);

        link.negotiate("/dev/ttyUSB0", 115_200).await.unwrap();
        assert!(wait_until(|| frames.lock().unwrap().len() == 3).await);

        let frames = frames.lock().unwrap().clone();
        assert_eq!(frames[0].text, r#"{"seq":1}"#);
        assert_eq!(frames[1].text, r#"{"seq":2}"#);
        assert_eq!(frames[2].kind, FrameKind::Block);

        link.close().await;
    }

    #[tokio::test]
    async fn test_send_appends_newline() {
        let port = FakePort::new();
        let (mut link, _) = link_with(&port);
        link.negotiate("/dev/ttyUSB0", 115_200).await.unwrap();

        link.send("CAPTURE").await.unwrap();
        link.send("STATUS").await.unwrap();

        assert_eq!(port.written(), b"CAPTURE\nSTATUS\n".to_vec());
        link.close().await;
    }

    #[tokio::test]
    async fn test_send_without_link_fails_locally() {
        let (sink, _) = collecting_sink();
        let link = SerialLink::new(Arc::new(FakeTransport::new()), fast_config(), sink);

        assert!(matches!(link.send("PING").await, Err(SerialError::NotConnected)));
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_no_frames_after_close() {
        let port = FakePort::new();
        port.repeat(b"{\"tick\":1}\n");
        let (mut link, frames) = link_with(&port);

        link.negotiate("/dev/ttyUSB0", 115_200).await.unwrap();
        assert!(wait_until(|| !frames.lock().unwrap().is_empty()).await);

        link.close().await;
        let delivered = frames.lock().unwrap().len();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(frames.lock().unwrap().len(), delivered);
        assert!(matches!(link.send("PING").await, Err(SerialError::NotConnected)));
    }

    #[tokio::test]
    async fn test_new_negotiation_replaces_previous_link() {
        let first = FakePort::new();
        first.repeat(b"{\"src\":\"first\"}\n");
        let transport = Arc::new(FakeTransport::new().with(115_200, FakeOpen::Open(first)));
        let (sink, frames) = collecting_sink();
        let mut link = SerialLink::new(transport.clone(), fast_config(), sink);

        link.negotiate("/dev/ttyUSB0", 115_200).await.unwrap();
        assert!(wait_until(|| !frames.lock().unwrap().is_empty()).await);

        let second = FakePort::new();
        second.repeat(b"{\"src\":\"second\"}\n");
        transport.set(115_200, FakeOpen::Open(second));

        link.negotiate("/dev/ttyUSB1", 115_200).await.unwrap();
        frames.lock().unwrap().clear();
        assert!(wait_until(|| frames.lock().unwrap().len() >= 3).await);

        assert!(frames
            .lock()
            .unwrap()
            .iter()
            .all(|f| f.text == r#"{"src":"second"}"#));
        assert_eq!(link.current(), Some(("/dev/ttyUSB1", 115_200)));
        link.close().await;
    }

    #[tokio::test]
    async fn test_device_eof_disconnects() {
        let port = FakePort::new();
        port.push_read(b"{\"last\":true}");
        port.push_eof();
        let (mut link, frames) = link_with(&port);

        link.negotiate("/dev/ttyUSB0", 115_200).await.unwrap();
        assert!(wait_until(|| link.state() == LinkState::Disconnected).await);

        assert_eq!(frames.lock().unwrap().len(), 1);
        assert_eq!(link.current(), None);
        assert!(matches!(link.send("PING").await, Err(SerialError::NotConnected)));

        link.close().await;
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_read_error_disconnects() {
        let port = FakePort::new();
        port.push_error(std::io::ErrorKind::BrokenPipe);
        let (mut link, _) = link_with(&port);
        let mut state_rx = link.subscribe_state();

        link.negotiate("/dev/ttyUSB0", 115_200).await.unwrap();
        let state = tokio::time::timeout(
            Duration::from_secs(2),
            state_rx.wait_for(|s| *s == LinkState::Disconnected),
        )
        .await;
        assert!(matches!(state, Ok(Ok(_))));
    }

    #[tokio::test]
    async fn test_write_error_reported_and_disconnects() {
        let port = FakePort::new();
        port.fail_writes();
        let (mut link, _) = link_with(&port);
        link.negotiate("/dev/ttyUSB0", 115_200).await.unwrap();

        assert!(matches!(link.send("PING").await, Err(SerialError::Io(_))));
        assert!(wait_until(|| link.state() == LinkState::Disconnected).await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let port = FakePort::new();
        let (mut link, _) = link_with(&port);
        link.negotiate("/dev/ttyUSB0", 115_200).await.unwrap();

        link.close().await;
        link.close().await;
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_pump_drops_data_after_close() {
        let (state_tx, _) = watch::channel(LinkState::Connected);
        let shared = Arc::new(LinkShared::new(Arc::new(state_tx)));
        let (sink, frames) = collecting_sink();
        let mut pump = InboundPump::new(shared.clone(), sink, BufferGuard::default());

        assert!(pump.on_data(b"{\"a\":1}"));
        shared.close();
        assert!(!pump.on_data(b"{\"a\":2}"));

        assert_eq!(frames.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_failure_after_owner_close_keeps_state() {
        let (state_tx, state_rx) = watch::channel(LinkState::Connected);
        let shared = LinkShared::new(Arc::new(state_tx));

        shared.close();
        shared.fail("late read error");
        assert_eq!(*state_rx.borrow(), LinkState::Connected);
    }
}
