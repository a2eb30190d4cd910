use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::{sleep, timeout, timeout_at, Instant},
};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::{
    config::{DispatchConfig, SerialConfig},
    error::{GatewayError, Result},
    framing::{Frame, FrameAssembler, ReadStrategy, MAX_CHUNK, READ_STRATEGIES},
    protocol::Command,
};

/// Upper bound on reads spent discarding stale input before a send.
const MAX_DRAIN_READS: usize = 64;

pub trait DeviceStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> DeviceStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> io::Result<Box<dyn DeviceStream>>;

    fn describe(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct SerialConnector {
    config: SerialConfig,
}

impl SerialConnector {
    pub fn new(config: SerialConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for SerialConnector {
    async fn open(&self) -> io::Result<Box<dyn DeviceStream>> {
        let port = tokio_serial::new(self.config.port.as_str(), self.config.baudrate)
            .open_native_async()
            .map_err(|err| io::Error::other(err.to_string()))?;
        Ok(Box::new(port))
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.config.port, self.config.baudrate)
    }
}

/// Link health shared between the channel owner and lock-free observers.
#[derive(Debug, Default)]
pub struct LinkStatus {
    connected: AtomicBool,
    consecutive_errors: AtomicU32,
    total_errors: AtomicU64,
    last_success_ms: AtomicI64,
}

impl LinkStatus {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub fn record_success(&self, at: DateTime<Utc>) {
        self.last_success_ms
            .store(at.timestamp_millis(), Ordering::Release);
        self.consecutive_errors.store(0, Ordering::Release);
    }

    /// Returns the consecutive error count including this one.
    pub fn record_error(&self) -> u32 {
        self.total_errors.fetch_add(1, Ordering::AcqRel);
        self.consecutive_errors.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Acquire)
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors.load(Ordering::Acquire)
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        match self.last_success_ms.load(Ordering::Acquire) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }
}

enum ReadOutcome {
    Frame(Frame),
    Elapsed,
    Closed(String),
}

/// Owns the byte stream. Not shared: the dispatcher keeps it behind its lock.
pub struct Transport {
    connector: Arc<dyn Connector>,
    stream: Option<Box<dyn DeviceStream>>,
    config: DispatchConfig,
    strategies: Vec<ReadStrategy>,
    status: Arc<LinkStatus>,
}

impl Transport {
    pub fn new(connector: Arc<dyn Connector>, config: DispatchConfig, status: Arc<LinkStatus>) -> Self {
        Self {
            connector,
            stream: None,
            config,
            strategies: READ_STRATEGIES.to_vec(),
            status,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some() && self.status.is_connected()
    }

    pub fn endpoint(&self) -> String {
        self.connector.describe()
    }

    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            info!("closing link to {}", self.connector.describe());
        }
        self.status.set_connected(false);
    }

    /// Worst-case wall time of one `exchange`, used as the outer timeout.
    pub fn exchange_deadline(&self, command: &Command) -> Duration {
        let per_strategy =
            command.budget().strategy_timeout + Duration::from_millis(self.config.settle_delay_ms);
        per_strategy * self.strategies.len() as u32 + Duration::from_secs(1)
    }

    /// One open attempt confirmed by a telemetry probe. The probe frame is
    /// returned so the caller can seed its snapshot.
    pub async fn connect(&mut self) -> Result<Frame> {
        self.close();
        let endpoint = self.connector.describe();
        let stream = self
            .connector
            .open()
            .await
            .map_err(|err| GatewayError::ConnectionLost(format!("cannot open {endpoint}: {err}")))?;
        self.stream = Some(stream);

        let probe = Command::read_telemetry(&self.config);
        let deadline = self.exchange_deadline(&probe);
        let outcome = timeout(deadline, self.exchange(&probe))
            .await
            .unwrap_or_else(|_| {
                Err(GatewayError::FrameTimeout {
                    command: probe.kind(),
                    waited: deadline,
                })
            });
        match outcome {
            Ok(frame @ Frame::Telemetry(_)) => {
                self.status.set_connected(true);
                info!("link up on {endpoint}");
                Ok(frame)
            }
            Ok(Frame::Ack(ack)) => {
                self.close();
                Err(GatewayError::FrameInvalid(format!(
                    "probe answered with acknowledgement '{}'",
                    ack.message
                )))
            }
            Err(err) => {
                self.close();
                Err(err)
            }
        }
    }

    /// Bounded reconnect with doubling backoff.
    pub async fn reconnect(&mut self) -> Result<Frame> {
        let attempts = self.config.reconnect_attempts.max(1);
        let max_backoff = Duration::from_millis(self.config.reconnect_backoff_max_ms);
        let mut backoff = Duration::from_millis(self.config.reconnect_backoff_ms);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.connect().await {
                Ok(frame) => return Ok(frame),
                Err(err) => {
                    warn!(
                        "reconnect attempt {attempt}/{attempts} to {} failed: {err}",
                        self.connector.describe()
                    );
                    last_error = err.to_string();
                    if attempt < attempts {
                        sleep(backoff).await;
                        backoff = (backoff * 2).min(max_backoff);
                    }
                }
            }
        }

        Err(GatewayError::ConnectionLost(format!(
            "link down after {attempts} reconnect attempts: {last_error}"
        )))
    }

    /// Writes a newline-terminated command after discarding buffered input.
    pub async fn send(&mut self, command: &str) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(GatewayError::ConnectionLost("not connected".to_string()));
        };

        let outcome: io::Result<usize> = async {
            let discarded = drain_stale(stream).await?;
            stream.write_all(command.as_bytes()).await?;
            stream.write_all(b"\n").await?;
            stream.flush().await?;
            Ok(discarded)
        }
        .await;

        match outcome {
            Ok(discarded) => {
                if discarded > 0 {
                    debug!("discarded {discarded} stale bytes before {command}");
                }
                debug!("sent {command}");
                Ok(())
            }
            Err(err) => {
                self.close();
                Err(GatewayError::ConnectionLost(format!("write failed: {err}")))
            }
        }
    }

    /// Sends the command and runs the read strategies in order until one
    /// yields a complete frame. The command is re-sent before a strategy only
    /// if nothing at all has arrived yet.
    pub async fn exchange(&mut self, command: &Command) -> Result<Frame> {
        let budget = command.budget();
        let settle = Duration::from_millis(self.config.settle_delay_ms);
        let strategies = self.strategies.clone();
        let mut assembler = FrameAssembler::new(command.kind().expects());

        for (index, strategy) in strategies.iter().copied().enumerate() {
            if index == 0 || assembler.is_empty() {
                if index > 0 {
                    debug!("nothing received, re-issuing {} for {strategy}", command.kind());
                }
                self.send(command.wire()).await?;
                if !settle.is_zero() {
                    sleep(settle).await;
                }
            }

            if let Some(frame) = self
                .read_strategy(strategy, budget.strategy_timeout, &mut assembler)
                .await?
            {
                debug!(
                    "{} answered via {strategy} after {} bytes",
                    command.kind(),
                    assembler.received()
                );
                self.status.record_success(Utc::now());
                return Ok(frame);
            }
        }

        if assembler.rejected_objects() > 0 {
            return Err(GatewayError::FrameInvalid(format!(
                "{} balanced objects failed telemetry sniffing",
                assembler.rejected_objects()
            )));
        }
        if assembler.skipped_telemetry() > 0 {
            return Err(GatewayError::FrameInvalid(
                "telemetry received in place of an acknowledgement".to_string(),
            ));
        }
        Err(GatewayError::FrameTimeout {
            command: command.kind(),
            waited: budget.strategy_timeout * strategies.len() as u32,
        })
    }

    async fn read_strategy(
        &mut self,
        strategy: ReadStrategy,
        window: Duration,
        assembler: &mut FrameAssembler,
    ) -> Result<Option<Frame>> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(GatewayError::ConnectionLost("not connected".to_string()));
        };

        let deadline = Instant::now() + window;
        let mut sizer = strategy.sizer();
        let mut chunk = [0u8; MAX_CHUNK];
        let outcome = loop {
            let size = sizer.next_size();
            match timeout_at(deadline, stream.read(&mut chunk[..size])).await {
                Err(_) => break ReadOutcome::Elapsed,
                Ok(Ok(0)) => break ReadOutcome::Closed("device closed the stream".to_string()),
                Ok(Ok(read)) => {
                    sizer.record(read);
                    if let Some(frame) = assembler.push(&chunk[..read]) {
                        break ReadOutcome::Frame(frame);
                    }
                }
                Ok(Err(err)) => break ReadOutcome::Closed(format!("read failed: {err}")),
            }
        };

        match outcome {
            ReadOutcome::Frame(frame) => Ok(Some(frame)),
            ReadOutcome::Elapsed => {
                debug!("{strategy} elapsed with {} bytes buffered", assembler.received());
                Ok(None)
            }
            ReadOutcome::Closed(reason) => {
                self.close();
                Err(GatewayError::ConnectionLost(reason))
            }
        }
    }
}

async fn drain_stale(stream: &mut Box<dyn DeviceStream>) -> io::Result<usize> {
    let mut scratch = [0u8; MAX_CHUNK];
    let mut discarded = 0;
    for _ in 0..MAX_DRAIN_READS {
        match timeout(Duration::ZERO, stream.read(&mut scratch)).await {
            Ok(Ok(0)) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "device closed the stream",
                ))
            }
            Ok(Ok(read)) => discarded += read,
            Ok(Err(err)) => return Err(err),
            Err(_) => break,
        }
    }
    Ok(discarded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::CommandKind,
        telemetry::fixtures::{telemetry_json, telemetry_line},
        testing::{fast_dispatch_config, SimulatedConnector},
    };
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    fn transport(connector: Arc<SimulatedConnector>) -> Transport {
        Transport::new(connector, fast_dispatch_config(), Arc::new(LinkStatus::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn probe_confirms_connection_for_every_chunk_size() {
        let expected = match telemetry_json() {
            Value::Object(object) => Frame::Telemetry(object),
            _ => unreachable!(),
        };
        for chunk in [1, 16, 32, 256] {
            let connector = Arc::new(SimulatedConnector::responsive().with_chunk_size(chunk));
            let mut transport = transport(connector.clone());
            let frame = transport.connect().await.unwrap();
            assert_eq!(frame, expected, "chunk size {chunk}");
            assert!(transport.is_connected());
            assert_eq!(connector.commands(), vec!["CMD:GET_DATA".to_string()]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stale_input_is_discarded_before_send() {
        let connector = Arc::new(SimulatedConnector::responsive());
        let mut transport = transport(connector.clone());
        transport.connect().await.unwrap();

        connector.inject("OK:left over from an earlier command\n").await;

        let command = Command::toggle_load(30, &fast_dispatch_config());
        let frame = transport.exchange(&command).await.unwrap();
        match frame {
            Frame::Ack(ack) => assert_eq!(ack.message, "CMD:TOGGLE_LOAD:30"),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_times_out_after_reissuing_each_strategy() {
        let connector = Arc::new(SimulatedConnector::new(|_| None));
        let mut transport = transport(connector.clone());
        transport.stream = Some(connector.open().await.unwrap());
        transport.status.set_connected(true);

        let command = Command::cancel_override(&fast_dispatch_config());
        let err = transport.exchange(&command).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::FrameTimeout {
                command: CommandKind::CancelOverride,
                ..
            }
        ));
        assert_eq!(connector.commands().len(), READ_STRATEGIES.len());
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_only_answer_to_write_is_invalid() {
        let connector = Arc::new(SimulatedConnector::new(|_| Some(telemetry_line())));
        let mut transport = transport(connector.clone());
        transport.stream = Some(connector.open().await.unwrap());
        transport.status.set_connected(true);

        let command = Command::toggle_load(30, &fast_dispatch_config());
        let err = transport.exchange(&command).await.unwrap_err();
        assert!(matches!(err, GatewayError::FrameInvalid(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_retries_until_device_answers() {
        let connector = Arc::new(SimulatedConnector::responsive().failing_opens(2));
        let mut transport = transport(connector.clone());

        transport.reconnect().await.unwrap();
        assert!(transport.is_connected());
        assert_eq!(connector.opens(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_gives_up_after_bounded_attempts() {
        let connector = Arc::new(SimulatedConnector::responsive().failing_opens(10));
        let mut transport = transport(connector.clone());

        let err = transport.reconnect().await.unwrap_err();
        assert!(err.is_link_failure());
        assert!(!transport.is_connected());
        assert_eq!(
            connector.opens(),
            fast_dispatch_config().reconnect_attempts as usize
        );
    }

    #[tokio::test(start_paused = true)]
    async fn closed_stream_marks_link_down() {
        let connector = Arc::new(SimulatedConnector::responsive());
        let mut transport = transport(connector.clone());
        transport.connect().await.unwrap();

        connector.hang_up().await;

        let command = Command::read_telemetry(&fast_dispatch_config());
        let err = transport.exchange(&command).await.unwrap_err();
        assert!(err.is_link_failure());
        assert!(!transport.is_connected());
    }
}
