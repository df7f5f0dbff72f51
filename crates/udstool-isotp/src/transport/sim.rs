//! Simulated ECU speaking ISO-TP on a [`MockCanBus`]
//!
//! The ECU watches the frames the tester transmits, reassembles requests with
//! the same [`ReassemblySession`] the tester uses, and answers through a
//! [`SegmentationSender`], so multi-frame traffic in both directions runs the
//! real protocol code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{FrameTransport, MockCanBus, TransportError, TransportFrame};
use crate::codec::{self, FlowControl, FlowStatus, IsoTpFrame, SeparationTime};
use crate::config::SegmentConfig;
use crate::error::IsoTpError;
use crate::reassembly::{ReassemblyEvent, ReassemblySession};
use crate::sender::SegmentationSender;

/// One request/response pair, both as hex strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEntry {
    pub request: String,
    /// Empty means the ECU stays silent for this request
    #[serde(default)]
    pub response: String,
}

/// Behaviour of the simulated ECU (the `[ecu]` table of the CLI config)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcuConfig {
    /// Delay before the ECU starts answering
    #[serde(default)]
    pub latency_ms: u64,
    /// Block size the ECU grants in its flow control
    #[serde(default)]
    pub block_size: u8,
    /// Raw STmin byte the ECU grants in its flow control
    #[serde(default)]
    pub st_min: u8,
    /// Never answer
    #[serde(default)]
    pub silent: bool,
    /// Extra responses, checked before the built-in table
    #[serde(default)]
    pub responses: Vec<ResponseEntry>,
}

impl EcuConfig {
    /// Decode the configured response pairs
    pub fn response_table(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, IsoTpError> {
        self.responses
            .iter()
            .map(|entry| Ok((parse_hex(&entry.request)?, parse_hex(&entry.response)?)))
            .collect()
    }
}

/// Parse a hex string, ignoring whitespace
pub fn parse_hex(text: &str) -> Result<Vec<u8>, IsoTpError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&compact)
        .map_err(|e| IsoTpError::InvalidConfig(format!("invalid hex '{}': {}", text, e)))
}

/// ECU peer answering from a request -> response table
pub struct SimulatedEcu {
    /// Link parameters from the ECU's point of view
    link: SegmentConfig,
    latency: Duration,
    responses: RwLock<Vec<(Vec<u8>, Vec<u8>)>>,
    silent: AtomicBool,
    flow_status: Mutex<FlowStatus>,
}

impl SimulatedEcu {
    /// ECU for a tester using `tester` as its channel configuration
    pub fn new(tester: SegmentConfig) -> Self {
        Self {
            link: tester.reversed(),
            latency: Duration::ZERO,
            responses: RwLock::new(Self::default_responses()),
            silent: AtomicBool::new(false),
            flow_status: Mutex::new(FlowStatus::ContinueToSend),
        }
    }

    pub fn from_config(tester: SegmentConfig, ecu: &EcuConfig) -> Result<Self, IsoTpError> {
        let mut sim = Self::new(SegmentConfig {
            block_size: ecu.block_size,
            st_min: ecu.st_min,
            ..tester
        });
        sim.latency = Duration::from_millis(ecu.latency_ms);
        sim.silent = AtomicBool::new(ecu.silent);

        let mut table = ecu.response_table()?;
        table.extend(sim.responses.get_mut().drain(..));
        *sim.responses.get_mut() = table;
        Ok(sim)
    }

    /// Add a response, taking precedence over existing entries
    pub fn add_response(&self, request: Vec<u8>, response: Vec<u8>) {
        self.responses.write().insert(0, (request, response));
    }

    /// Stop (or resume) answering requests
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Flow status sent in reply to the tester's First Frames
    pub fn set_flow_status(&self, status: FlowStatus) {
        *self.flow_status.lock() = status;
    }

    /// STmin granted in the ECU's flow control
    pub fn granted_st_min(&self) -> SeparationTime {
        SeparationTime::from_byte(self.link.st_min)
    }

    fn default_responses() -> Vec<(Vec<u8>, Vec<u8>)> {
        vec![
            // DiagnosticSessionControl default / extended, P2 50 ms, P2* 5 s
            (vec![0x10, 0x01], vec![0x50, 0x01, 0x00, 0x32, 0x01, 0xF4]),
            (vec![0x10, 0x03], vec![0x50, 0x03, 0x00, 0x32, 0x01, 0xF4]),
            // TesterPresent, and with suppressPosRspMsgIndicationBit set
            (vec![0x3E, 0x00], vec![0x7E, 0x00]),
            (vec![0x3E, 0x80], vec![]),
            // VIN, multi-frame on classic CAN
            (vec![0x22, 0xF1, 0x90], {
                let mut resp = vec![0x62, 0xF1, 0x90];
                resp.extend_from_slice(b"WDD2050461A123456");
                resp
            }),
            (vec![0x22, 0xF1, 0x91], {
                let mut resp = vec![0x62, 0xF1, 0x91];
                resp.extend_from_slice(b"HW-0815");
                resp
            }),
            (vec![0x22, 0xF1, 0x95], {
                let mut resp = vec![0x62, 0xF1, 0x95];
                resp.extend_from_slice(b"SW-2.4.1");
                resp
            }),
            // ReadDTCInformation by status mask: two DTCs
            (
                vec![0x19, 0x02],
                vec![
                    0x59, 0x02, 0xFF, 0x01, 0x23, 0x45, 0x09, 0xC0, 0x73, 0x00, 0x28,
                ],
            ),
            (vec![0x14, 0xFF, 0xFF, 0xFF], vec![0x54]),
            (
                vec![0x31, 0x01, 0xFF, 0x00],
                vec![0x71, 0x01, 0xFF, 0x00, 0x00],
            ),
            // SecurityAccess is locked down: conditionsNotCorrect
            (vec![0x27], vec![0x7F, 0x27, 0x22]),
        ]
    }

    /// Response for `request`; `None` means stay silent
    ///
    /// Exact matches win over prefix matches. Unknown services get a bare
    /// positive response (SID + 0x40).
    pub fn find_response(&self, request: &[u8]) -> Option<Vec<u8>> {
        let responses = self.responses.read();

        let matched = responses
            .iter()
            .find(|(req, _)| req == request)
            .or_else(|| responses.iter().find(|(req, _)| request.starts_with(req)))
            .map(|(_, resp)| resp.clone());

        let response = match matched {
            Some(resp) => resp,
            None => vec![request.first()?.wrapping_add(0x40)],
        };
        if response.is_empty() {
            None
        } else {
            Some(response)
        }
    }

    /// Start serving requests seen on `bus`
    ///
    /// The task keeps the bus alive and runs until the handle is aborted.
    pub fn attach(self: Arc<Self>, bus: &Arc<MockCanBus>) -> JoinHandle<()> {
        let mut monitor = bus.monitor();
        let port = EcuPort {
            bus: Arc::clone(bus),
        };
        tokio::spawn(async move { self.serve(&mut monitor, port).await })
    }

    async fn serve(&self, monitor: &mut broadcast::Receiver<TransportFrame>, port: EcuPort) {
        let mut session = ReassemblySession::new(self.link.clone());
        let mut flow_control_tx: Option<mpsc::UnboundedSender<FlowControl>> = None;
        let mut cancel_tx: Option<watch::Sender<bool>> = None;

        loop {
            let frame = match monitor.recv().await {
                Ok(frame) => frame,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Simulated ECU lagged behind the bus");
                    session.abort();
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if frame.id != self.link.response_id {
                continue;
            }

            let decoded = match codec::decode(&frame.data) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(error = %e, "Simulated ECU received an invalid frame");
                    session.abort();
                    continue;
                }
            };

            if let IsoTpFrame::FlowControl(fc) = decoded {
                if let Some(tx) = &flow_control_tx {
                    let _ = tx.send(fc);
                }
                continue;
            }

            match session.on_frame(decoded) {
                Ok(ReassemblyEvent::FlowControlRequired(fc)) => {
                    let status = *self.flow_status.lock();
                    if status != FlowStatus::ContinueToSend {
                        session.abort();
                    }
                    let fc = FlowControl {
                        status,
                        block_size: fc.block_size,
                        st_min: fc.st_min,
                    };
                    let data = codec::encode_flow_control(&fc, &self.link);
                    if let Err(e) = port
                        .send(&TransportFrame::tx(self.link.request_id, data))
                        .await
                    {
                        warn!(error = %e, "Simulated ECU failed to send flow control");
                    }
                }
                Ok(ReassemblyEvent::Complete(request)) => {
                    if self.silent.load(Ordering::SeqCst) {
                        debug!(request = %hex::encode_upper(&request), "Simulated ECU ignoring request");
                        continue;
                    }
                    let Some(response) = self.find_response(&request) else {
                        continue;
                    };

                    // A new answer replaces any transmission still running
                    let (fc_tx, fc_rx) = mpsc::unbounded_channel();
                    let (stop_tx, cancel_rx) = watch::channel(false);
                    if let Some(previous) = cancel_tx.replace(stop_tx) {
                        let _ = previous.send(true);
                    }
                    flow_control_tx = Some(fc_tx);
                    self.respond(port.clone(), response, fc_rx, cancel_rx);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Simulated ECU dropped a request"),
            }
        }
    }

    fn respond(
        &self,
        port: EcuPort,
        response: Vec<u8>,
        mut fc_rx: mpsc::UnboundedReceiver<FlowControl>,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        let sender = SegmentationSender::new(self.link.clone());
        let latency = self.latency;
        tokio::spawn(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            debug!(response = %hex::encode_upper(&response), "Simulated ECU answering");
            if let Err(e) = sender
                .transmit(&response, &port, &mut fc_rx, &mut cancel_rx)
                .await
            {
                warn!(error = %e, "Simulated ECU response aborted");
            }
        });
    }
}

/// Write side of the ECU: its frames arrive at the tester as bus traffic
#[derive(Clone)]
struct EcuPort {
    bus: Arc<MockCanBus>,
}

#[async_trait]
impl FrameTransport for EcuPort {
    async fn send(&self, frame: &TransportFrame) -> Result<(), TransportError> {
        if !self.bus.is_connected().await {
            return Err(TransportError::ConnectionClosed);
        }
        self.bus.inject_incoming(frame.id, frame.data.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportFrame> {
        self.bus.monitor()
    }

    async fn is_connected(&self) -> bool {
        self.bus.is_connected().await
    }
}

impl Default for SimulatedEcu {
    fn default() -> Self {
        Self::new(SegmentConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode_first, encode_single};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_find_response_exact_then_prefix() {
        let ecu = SimulatedEcu::default();
        assert_eq!(ecu.find_response(&[0x3E, 0x00]), Some(vec![0x7E, 0x00]));
        // Prefix match: extra status mask byte
        assert_eq!(
            ecu.find_response(&[0x19, 0x02, 0xFF]).map(|r| r[0]),
            Some(0x59)
        );
        assert_eq!(ecu.find_response(&[0x27, 0x01]), Some(vec![0x7F, 0x27, 0x22]));
    }

    #[test]
    fn test_find_response_fallback_and_silent_entries() {
        let ecu = SimulatedEcu::default();
        assert_eq!(ecu.find_response(&[0x85, 0x02]), Some(vec![0xC5]));
        assert_eq!(ecu.find_response(&[0x3E, 0x80]), None);
        assert_eq!(ecu.find_response(&[]), None);
    }

    #[test]
    fn test_added_response_takes_precedence() {
        let ecu = SimulatedEcu::default();
        ecu.add_response(vec![0x3E, 0x00], vec![0x7F, 0x3E, 0x13]);
        assert_eq!(
            ecu.find_response(&[0x3E, 0x00]),
            Some(vec![0x7F, 0x3E, 0x13])
        );
    }

    #[test]
    fn test_from_config_parses_hex_table() {
        let ecu_config: EcuConfig = toml::from_str(
            r#"
            latency_ms = 5
            block_size = 2
            st_min = 10

            [[responses]]
            request = "22 F1 8C"
            response = "62 F1 8C 31 32 33"
            "#,
        )
        .unwrap();
        let ecu = SimulatedEcu::from_config(SegmentConfig::default(), &ecu_config).unwrap();
        assert_eq!(
            ecu.find_response(&[0x22, 0xF1, 0x8C]),
            Some(vec![0x62, 0xF1, 0x8C, 0x31, 0x32, 0x33])
        );
        assert_eq!(ecu.granted_st_min().as_byte(), 10);
        assert_eq!(ecu.latency, Duration::from_millis(5));
    }

    #[test]
    fn test_from_config_rejects_bad_hex() {
        let ecu_config = EcuConfig {
            responses: vec![ResponseEntry {
                request: "2G".to_string(),
                response: String::new(),
            }],
            ..EcuConfig::default()
        };
        assert!(matches!(
            SimulatedEcu::from_config(SegmentConfig::default(), &ecu_config),
            Err(IsoTpError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_answers_single_frame_request() {
        let config = SegmentConfig::default();
        let bus = Arc::new(MockCanBus::new());
        let mut rx = bus.subscribe();
        let _ecu = Arc::new(SimulatedEcu::new(config.clone())).attach(&bus);

        bus.send(&TransportFrame::tx(
            0x7E0,
            encode_single(&[0x3E, 0x00], &config).unwrap(),
        ))
        .await
        .unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.id, 0x7E8);
        assert_eq!(
            decode(&frame.data).unwrap(),
            IsoTpFrame::Single {
                data: vec![0x7E, 0x00]
            }
        );
    }

    #[tokio::test]
    async fn test_grants_flow_control_for_first_frame() {
        let config = SegmentConfig::default();
        let bus = Arc::new(MockCanBus::new());
        let mut rx = bus.subscribe();
        let ecu = Arc::new(SimulatedEcu::from_config(
            config.clone(),
            &EcuConfig {
                block_size: 3,
                st_min: 0xF5,
                ..EcuConfig::default()
            },
        )
        .unwrap());
        let _task = ecu.attach(&bus);

        bus.send(&TransportFrame::tx(
            0x7E0,
            encode_first(&[0x2E; 20], &config).unwrap(),
        ))
        .await
        .unwrap();

        let frame = rx.recv().await.unwrap();
        match decode(&frame.data).unwrap() {
            IsoTpFrame::FlowControl(fc) => {
                assert_eq!(fc.status, FlowStatus::ContinueToSend);
                assert_eq!(fc.block_size, 3);
                assert_eq!(fc.st_min.duration(), Duration::from_micros(500));
            }
            other => panic!("Expected flow control, got {}", other),
        }
    }
}
