//! Request/response orchestration over ISO-TP
//!
//! `IsoTpChannel` combines a [`SegmentationSender`], a [`ReassemblySession`]
//! and a deadline into one `send_request` call. Inbound frames are consumed by
//! a single listener task in arrival order. The session and the pending
//! exchange share one mutex-guarded state struct; every way an exchange can
//! end goes through [`ExchangeState::resolve`], which delivers at most once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::{self, FlowControl, IsoTpFrame, MAX_PAYLOAD_LEN};
use crate::config::SegmentConfig;
use crate::error::IsoTpError;
use crate::reassembly::{ReassemblyEvent, ReassemblySession};
use crate::sender::SegmentationSender;
use crate::transport::{Direction, FrameTransport, TransportError, TransportFrame};

const EVENT_CAPACITY: usize = 256;

/// Human-readable protocol trace line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolEvent {
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    /// CAN identifier the frame travelled on
    pub id: u32,
    /// Decoded frame, e.g. `FF: Length=20, Data=62F190574444`
    pub message: String,
}

impl ProtocolEvent {
    fn new(direction: Direction, id: u32, message: String) -> Self {
        Self {
            timestamp: Utc::now(),
            direction,
            id,
            message,
        }
    }

    fn for_frame(frame: &TransportFrame) -> Self {
        let message = match codec::decode(&frame.data) {
            Ok(decoded) => decoded.to_string(),
            Err(_) => format!("Invalid: {}", hex::encode_upper(&frame.data)),
        };
        Self::new(frame.direction, frame.id, message)
    }
}

impl std::fmt::Display for ProtocolEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {:03X} {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.direction,
            self.id,
            self.message
        )
    }
}

/// Notification published by the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A complete payload arrived; `solicited` is false when no request was
    /// waiting for it
    Response { payload: Vec<u8>, solicited: bool },
    Trace(ProtocolEvent),
}

/// The exchange currently waiting for a response
struct PendingExchange {
    id: u64,
    result_tx: oneshot::Sender<Result<Vec<u8>, IsoTpError>>,
    flow_control_tx: mpsc::UnboundedSender<FlowControl>,
    cancel_tx: watch::Sender<bool>,
}

/// Receive-side state shared by the listener and the request path
struct ExchangeState {
    /// Configuration for the next exchange and for idle listening
    config: SegmentConfig,
    session: ReassemblySession,
    pending: Option<PendingExchange>,
    next_id: u64,
}

impl ExchangeState {
    fn pending_id(&self) -> Option<u64> {
        self.pending.as_ref().map(|p| p.id)
    }

    /// End exchange `id` with `outcome`
    ///
    /// Returns false if `id` is not the pending exchange (already resolved or
    /// superseded); the outcome is dropped in that case. The session is
    /// rebuilt from the current configuration, so addresses changed by
    /// `configure` mid-exchange take effect as soon as it ends.
    fn resolve(&mut self, id: u64, outcome: Result<Vec<u8>, IsoTpError>) -> bool {
        if self.pending_id() != Some(id) {
            return false;
        }
        let Some(pending) = self.pending.take() else {
            return false;
        };
        self.session = ReassemblySession::new(self.config.clone());
        let _ = pending.cancel_tx.send(true);
        let _ = pending.result_tx.send(outcome);
        true
    }

    /// Resolve whatever exchange is pending
    fn resolve_pending(&mut self, outcome: Result<Vec<u8>, IsoTpError>) -> bool {
        match self.pending_id() {
            Some(id) => self.resolve(id, outcome),
            None => false,
        }
    }
}

/// Cancels exchange `id` if `send_request` is dropped before it resolves
struct ExchangeGuard<'a> {
    state: &'a Mutex<ExchangeState>,
    id: u64,
}

impl Drop for ExchangeGuard<'_> {
    fn drop(&mut self) {
        let cancelled = self.state.lock().resolve(
            self.id,
            Err(IsoTpError::Cancelled("request dropped".to_string())),
        );
        if cancelled {
            debug!(exchange = self.id, "Request dropped before completion");
        }
    }
}

/// Transport wrapper publishing a trace event for every transmitted frame
#[derive(Clone)]
struct TracedTransport {
    inner: Arc<dyn FrameTransport>,
    events: broadcast::Sender<ChannelEvent>,
}

#[async_trait]
impl FrameTransport for TracedTransport {
    async fn send(&self, frame: &TransportFrame) -> Result<(), TransportError> {
        self.inner.send(frame).await?;
        let _ = self
            .events
            .send(ChannelEvent::Trace(ProtocolEvent::for_frame(frame)));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportFrame> {
        self.inner.subscribe()
    }

    async fn is_connected(&self) -> bool {
        self.inner.is_connected().await
    }
}

/// What the listener has to do once the state lock is released
enum ListenerAction {
    None,
    SendFlowControl { id: u32, data: Vec<u8> },
    Publish { payload: Vec<u8>, solicited: bool },
}

/// ISO-TP request/response channel on one address pair
///
/// At most one exchange is in flight: a new request cancels the previous one.
pub struct IsoTpChannel {
    transport: TracedTransport,
    state: Arc<Mutex<ExchangeState>>,
    events: broadcast::Sender<ChannelEvent>,
    /// Serializes frame transmission between overlapping requests
    send_lock: tokio::sync::Mutex<()>,
    closed: Arc<AtomicBool>,
    listener_handle: Mutex<Option<JoinHandle<()>>>,
}

impl IsoTpChannel {
    /// Validate `config`, subscribe to `transport` and start the listener
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(
        transport: Arc<dyn FrameTransport>,
        config: SegmentConfig,
    ) -> Result<Self, IsoTpError> {
        config.validate()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let channel = Self {
            transport: TracedTransport {
                inner: transport,
                events: events.clone(),
            },
            state: Arc::new(Mutex::new(ExchangeState {
                session: ReassemblySession::new(config.clone()),
                config,
                pending: None,
                next_id: 0,
            })),
            events,
            send_lock: tokio::sync::Mutex::new(()),
            closed: Arc::new(AtomicBool::new(false)),
            listener_handle: Mutex::new(None),
        };
        channel.start_listener();
        Ok(channel)
    }

    /// Send `payload` and wait for the complete response
    ///
    /// The timeout runs from the moment of the call and covers both the
    /// transmission and the response.
    pub async fn send_request(&self, payload: &[u8]) -> Result<Vec<u8>, IsoTpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IsoTpError::Connection("channel is shut down".to_string()));
        }
        if !self.transport.is_connected().await {
            return Err(IsoTpError::Connection(
                "transport not connected".to_string(),
            ));
        }
        if payload.is_empty() {
            return Err(IsoTpError::InvalidRequest("empty payload".to_string()));
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(IsoTpError::PayloadTooLarge(payload.len()));
        }

        let started = Instant::now();
        let (result_tx, mut result_rx) = oneshot::channel();
        let (flow_control_tx, mut flow_control_rx) = mpsc::unbounded_channel();
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        let (id, config) = {
            let mut state = self.state.lock();
            // Checked under the lock so a concurrent shutdown cannot miss us
            if self.closed.load(Ordering::SeqCst) {
                return Err(IsoTpError::Connection("channel is shut down".to_string()));
            }
            if let Some(previous) = state.pending_id() {
                state.resolve(
                    previous,
                    Err(IsoTpError::Cancelled(
                        "superseded by a newer request".to_string(),
                    )),
                );
                info!(exchange = previous, "Pending exchange superseded");
            }
            state.next_id += 1;
            let id = state.next_id;
            let config = state.config.clone();
            state.session = ReassemblySession::new(config.clone());
            state.pending = Some(PendingExchange {
                id,
                result_tx,
                flow_control_tx,
                cancel_tx,
            });
            (id, config)
        };
        let _guard = ExchangeGuard {
            state: &self.state,
            id,
        };
        let deadline = started + config.timeout();

        debug!(
            exchange = id,
            id = format!("0x{:03X}", config.request_id),
            len = payload.len(),
            "Sending request"
        );

        let sender = SegmentationSender::new(config.clone());
        let transmitted = tokio::time::timeout_at(deadline, async {
            let _sending = self.send_lock.lock().await;
            sender
                .transmit(payload, &self.transport, &mut flow_control_rx, &mut cancel_rx)
                .await
        })
        .await;

        match transmitted {
            Ok(Ok(frames)) => debug!(exchange = id, frames, "Request transmitted"),
            Ok(Err(e)) => {
                // No-op if the exchange already ended (e.g. superseded)
                self.state.lock().resolve(id, Err(e));
            }
            Err(_) => self.expire(id, config.timeout_ms),
        }

        let outcome = match tokio::time::timeout_at(deadline, &mut result_rx).await {
            Ok(received) => received,
            Err(_) => {
                self.expire(id, config.timeout_ms);
                result_rx.await
            }
        };
        let outcome = outcome
            .unwrap_or_else(|_| Err(IsoTpError::Cancelled("exchange dropped".to_string())));

        match &outcome {
            Ok(response) => info!(exchange = id, len = response.len(), "Exchange complete"),
            Err(e) => info!(exchange = id, error = %e, "Exchange failed"),
        }
        outcome
    }

    fn expire(&self, id: u64, timeout_ms: u64) {
        if self.state.lock().resolve(id, Err(IsoTpError::Timeout(timeout_ms))) {
            warn!(exchange = id, timeout_ms, "Exchange timed out");
        }
    }

    /// Replace the configuration used by subsequent exchanges
    ///
    /// An exchange already in flight keeps the configuration it started with;
    /// the listener switches to the new addresses once that exchange ends.
    pub fn configure(&self, config: SegmentConfig) -> Result<(), IsoTpError> {
        config.validate()?;
        let mut state = self.state.lock();
        if state.pending.is_none() {
            state.session = ReassemblySession::new(config.clone());
        }
        state.config = config;
        Ok(())
    }

    pub fn config(&self) -> SegmentConfig {
        self.state.lock().config.clone()
    }

    /// True while an exchange is waiting for its response
    pub fn is_busy(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    /// Stop the listener and cancel the pending exchange
    ///
    /// Later requests fail with [`IsoTpError::Connection`].
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state
            .lock()
            .resolve_pending(Err(IsoTpError::Cancelled("channel shut down".to_string())));
        if let Some(handle) = self.listener_handle.lock().take() {
            handle.abort();
        }
        info!("ISO-TP channel shut down");
    }

    /// Subscribe to responses and protocol trace events
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Start the background listener for inbound frames
    fn start_listener(&self) {
        let mut incoming_rx = self.transport.subscribe();
        let transport = self.transport.clone();
        let state = self.state.clone();
        let events = self.events.clone();
        let closed = self.closed.clone();

        let handle = tokio::spawn(async move {
            loop {
                match incoming_rx.recv().await {
                    Ok(frame) => {
                        let action = Self::handle_incoming_frame(&frame, &state, &events);
                        Self::complete_action(action, &transport, &state, &events).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Frame listener lagged, discarding transfer");
                        state.lock().session.abort();
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Transport frame channel closed");
                        closed.store(true, Ordering::SeqCst);
                        state.lock().resolve_pending(Err(IsoTpError::Connection(
                            "transport closed".to_string(),
                        )));
                        break;
                    }
                }
            }
        });

        *self.listener_handle.lock() = Some(handle);
    }

    fn handle_incoming_frame(
        frame: &TransportFrame,
        state: &Mutex<ExchangeState>,
        events: &broadcast::Sender<ChannelEvent>,
    ) -> ListenerAction {
        let mut state = state.lock();
        let config = state.session.config().clone();
        if frame.id != config.response_id {
            return ListenerAction::None;
        }

        let _ = events.send(ChannelEvent::Trace(ProtocolEvent::for_frame(frame)));

        let decoded = match codec::decode(&frame.data) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, data = %hex::encode_upper(&frame.data), "Invalid frame received");
                state.session.abort();
                state.resolve_pending(Err(e));
                return ListenerAction::None;
            }
        };

        if let IsoTpFrame::FlowControl(fc) = decoded {
            match &state.pending {
                Some(pending) => {
                    if pending.flow_control_tx.send(fc).is_err() {
                        debug!("Flow control after the request was transmitted");
                    }
                }
                None => debug!("Flow control with no request in flight"),
            }
            return ListenerAction::None;
        }

        match state.session.on_frame(decoded) {
            Ok(ReassemblyEvent::FlowControlRequired(fc)) => ListenerAction::SendFlowControl {
                id: config.request_id,
                data: codec::encode_flow_control(&fc, &config),
            },
            Ok(ReassemblyEvent::Complete(payload)) => {
                let solicited = state.resolve_pending(Ok(payload.clone()));
                if !solicited {
                    debug!(len = payload.len(), "Unsolicited response");
                }
                ListenerAction::Publish { payload, solicited }
            }
            Ok(ReassemblyEvent::Unexpected(reason)) => {
                warn!(%reason, "Unexpected frame");
                ListenerAction::None
            }
            Ok(ReassemblyEvent::InProgress | ReassemblyEvent::Ignored) => ListenerAction::None,
            Err(e) => {
                state.resolve_pending(Err(e));
                ListenerAction::None
            }
        }
    }

    async fn complete_action(
        action: ListenerAction,
        transport: &TracedTransport,
        state: &Mutex<ExchangeState>,
        events: &broadcast::Sender<ChannelEvent>,
    ) {
        match action {
            ListenerAction::None => {}
            ListenerAction::SendFlowControl { id, data } => {
                if let Err(e) = transport.send(&TransportFrame::tx(id, data)).await {
                    warn!(error = %e, "Failed to send flow control");
                    let mut state = state.lock();
                    state.session.abort();
                    state.resolve_pending(Err(e.into()));
                }
            }
            ListenerAction::Publish { payload, solicited } => {
                let _ = events.send(ChannelEvent::Response { payload, solicited });
            }
        }
    }
}

impl Drop for IsoTpChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.listener_handle.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transport::{MockCanBus, SimulatedEcu};
    use pretty_assertions::assert_eq;

    fn setup() -> (Arc<MockCanBus>, Arc<SimulatedEcu>, IsoTpChannel) {
        let config = SegmentConfig {
            timeout_ms: 300,
            ..SegmentConfig::default()
        };
        let bus = Arc::new(MockCanBus::new());
        let ecu = Arc::new(SimulatedEcu::new(config.clone()));
        ecu.clone().attach(&bus);
        let channel = IsoTpChannel::new(bus.clone(), config).unwrap();
        (bus, ecu, channel)
    }

    #[tokio::test]
    async fn test_single_frame_exchange() {
        let (bus, _ecu, channel) = setup();
        let response = channel.send_request(&[0x10, 0x03]).await.unwrap();
        assert_eq!(response, vec![0x50, 0x03, 0x00, 0x32, 0x01, 0xF4]);
        assert_eq!(
            bus.sent_to(0x7E0)[0].data,
            vec![0x02, 0x10, 0x03, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC]
        );
        assert!(!channel.is_busy());
    }

    #[tokio::test]
    async fn test_multi_frame_response_sends_flow_control() {
        let (bus, _ecu, channel) = setup();
        let response = channel.send_request(&[0x22, 0xF1, 0x91]).await.unwrap();
        assert_eq!(&response[3..], b"HW-0815");

        // Request SF followed by our flow control
        let sent = bus.sent_to(0x7E0);
        assert_eq!(sent.len(), 2);
        assert_eq!(&sent[1].data[..3], &[0x30, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn test_empty_and_oversized_requests_rejected() {
        let (_bus, _ecu, channel) = setup();
        assert!(matches!(
            channel.send_request(&[]).await,
            Err(IsoTpError::InvalidRequest(_))
        ));
        assert_eq!(
            channel.send_request(&vec![0u8; 4096]).await,
            Err(IsoTpError::PayloadTooLarge(4096))
        );
    }

    #[tokio::test]
    async fn test_configure_validates() {
        let (_bus, _ecu, channel) = setup();
        let bad = SegmentConfig {
            max_frame_size: 9,
            ..SegmentConfig::default()
        };
        assert!(channel.configure(bad).is_err());
        assert_eq!(channel.config().timeout_ms, 300);

        let good = SegmentConfig {
            timeout_ms: 50,
            ..SegmentConfig::default()
        };
        channel.configure(good).unwrap();
        assert_eq!(channel.config().timeout_ms, 50);
    }

    #[tokio::test]
    async fn test_trace_events_cover_both_directions() {
        let (_bus, _ecu, channel) = setup();
        let mut events = channel.subscribe();
        channel.send_request(&[0x3E, 0x00]).await.unwrap();

        let mut lines = Vec::new();
        let mut responses = Vec::new();
        while let Ok(Ok(event)) =
            tokio::time::timeout(Duration::from_millis(50), events.recv()).await
        {
            match event {
                ChannelEvent::Trace(trace) => lines.push(trace),
                ChannelEvent::Response { payload, solicited } => {
                    responses.push((payload, solicited))
                }
            }
        }

        assert_eq!(lines[0].direction, Direction::Tx);
        assert_eq!(lines[0].message, "SF: 3E00");
        assert_eq!(lines[1].direction, Direction::Rx);
        assert_eq!(lines[1].id, 0x7E8);
        assert_eq!(lines[1].message, "SF: 7E00");
        assert_eq!(responses, vec![(vec![0x7E, 0x00], true)]);
    }

    #[test]
    fn test_resolve_is_at_most_once() {
        let (result_tx, mut result_rx) = oneshot::channel();
        let (flow_control_tx, _fc_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut state = ExchangeState {
            config: SegmentConfig::default(),
            session: ReassemblySession::new(SegmentConfig::default()),
            pending: Some(PendingExchange {
                id: 7,
                result_tx,
                flow_control_tx,
                cancel_tx,
            }),
            next_id: 7,
        };

        assert!(!state.resolve(6, Ok(vec![1])));
        assert!(state.resolve(7, Err(IsoTpError::Timeout(10))));
        assert!(!state.resolve(7, Ok(vec![2])));
        assert_eq!(result_rx.try_recv().unwrap(), Err(IsoTpError::Timeout(10)));
        assert!(*cancel_rx.borrow());
    }

    #[test]
    fn test_protocol_event_display() {
        let frame = TransportFrame::rx(0x7E8, vec![0x30, 0x02, 0xF5]);
        let event = ProtocolEvent::for_frame(&frame);
        assert_eq!(event.message, "FC: Status=CTS, BS=2, ST=500us");
        assert!(event.to_string().ends_with("RX 7E8 FC: Status=CTS, BS=2, ST=500us"));

        let invalid = ProtocolEvent::for_frame(&TransportFrame::rx(0x7E8, vec![0xF0]));
        assert_eq!(invalid.message, "Invalid: F0");
    }
}
