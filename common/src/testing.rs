//! In-memory stand-in for the charge controller, used by the unit tests.

use std::{
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf},
    sync::{mpsc, oneshot},
};

use crate::{
    config::DispatchConfig,
    protocol::CMD_GET_DATA,
    telemetry::fixtures::telemetry_line,
    transport::{Connector, DeviceStream},
};

type Responder = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

enum DeviceEvent {
    Inject(String, oneshot::Sender<()>),
    HangUp(oneshot::Sender<()>),
}

#[derive(Default)]
struct DeviceLog {
    opens: usize,
    commands: Vec<String>,
    events: Option<mpsc::UnboundedSender<DeviceEvent>>,
}

pub(crate) fn fast_dispatch_config() -> DispatchConfig {
    DispatchConfig {
        read_lock_timeout_ms: 50,
        write_lock_timeout_ms: 500,
        read_strategy_timeout_ms: 200,
        write_strategy_timeout_ms: 300,
        write_retries: 1,
        settle_delay_ms: 10,
        max_consecutive_errors: 3,
        reconnect_attempts: 3,
        reconnect_backoff_ms: 10,
        reconnect_backoff_max_ms: 40,
        link_check_interval_ms: 100,
    }
}

pub(crate) struct SimulatedConnector {
    respond: Responder,
    chunk_size: usize,
    response_delay: Duration,
    failing_opens: usize,
    log: Arc<Mutex<DeviceLog>>,
}

impl SimulatedConnector {
    pub(crate) fn new(respond: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            respond: Arc::new(respond),
            chunk_size: 32,
            response_delay: Duration::ZERO,
            failing_opens: 0,
            log: Arc::new(Mutex::new(DeviceLog::default())),
        }
    }

    /// Answers reads with telemetry and echoes every write back as `OK:`.
    pub(crate) fn responsive() -> Self {
        Self::new(|command| {
            if command == CMD_GET_DATA {
                Some(telemetry_line())
            } else {
                Some(format!("OK:{command}\n"))
            }
        })
    }

    pub(crate) fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub(crate) fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    pub(crate) fn failing_opens(mut self, count: usize) -> Self {
        self.failing_opens = count;
        self
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub(crate) fn opens(&self) -> usize {
        self.lock().opens
    }

    /// Writes unsolicited bytes on the live connection and waits until they
    /// are buffered on the host side.
    pub(crate) async fn inject(&self, text: &str) {
        let (done, wait) = oneshot::channel();
        if let Some(events) = self.lock().events.as_ref() {
            let _ = events.send(DeviceEvent::Inject(text.to_string(), done));
        }
        let _ = wait.await;
    }

    /// Drops the device end of the live connection.
    pub(crate) async fn hang_up(&self) {
        let (done, wait) = oneshot::channel();
        if let Some(events) = self.lock().events.take() {
            let _ = events.send(DeviceEvent::HangUp(done));
        }
        let _ = wait.await;
    }

    fn lock(&self) -> MutexGuard<'_, DeviceLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    async fn open(&self) -> io::Result<Box<dyn DeviceStream>> {
        let (host, device) = tokio::io::duplex(16 * 1024);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        {
            let mut log = self.lock();
            log.opens += 1;
            if log.opens <= self.failing_opens {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such port"));
            }
            log.events = Some(events_tx);
        }

        tokio::spawn(run_device(
            device,
            events_rx,
            self.respond.clone(),
            self.chunk_size,
            self.response_delay,
            self.log.clone(),
        ));
        Ok(Box::new(host))
    }

    fn describe(&self) -> String {
        "simulated".to_string()
    }
}

async fn write_chunked(writer: &mut WriteHalf<DuplexStream>, text: &str, chunk_size: usize) {
    for piece in text.as_bytes().chunks(chunk_size) {
        if writer.write_all(piece).await.is_err() {
            return;
        }
        tokio::task::yield_now().await;
    }
}

async fn run_device(
    device: DuplexStream,
    mut events: mpsc::UnboundedReceiver<DeviceEvent>,
    respond: Responder,
    chunk_size: usize,
    response_delay: Duration,
    log: Arc<Mutex<DeviceLog>>,
) {
    let (reader, mut writer) = tokio::io::split(device);
    let mut lines = BufReader::new(reader).lines();

    let hung_up = loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(DeviceEvent::Inject(text, done)) => {
                    let _ = writer.write_all(text.as_bytes()).await;
                    let _ = done.send(());
                }
                Some(DeviceEvent::HangUp(done)) => break Some(done),
                None => break None,
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let command = line.trim().to_string();
                    log.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .commands
                        .push(command.clone());
                    if let Some(response) = respond(&command) {
                        if !response_delay.is_zero() {
                            tokio::time::sleep(response_delay).await;
                        }
                        write_chunked(&mut writer, &response, chunk_size).await;
                    }
                }
                _ => break None,
            },
        }
    };

    drop(lines);
    drop(writer);
    if let Some(done) = hung_up {
        let _ = done.send(());
    }
}
