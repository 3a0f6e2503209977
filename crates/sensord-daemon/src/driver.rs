//! SEN0395 mmWave presence sensor driver.
//!
//! The sensor speaks a line protocol over its serial port. Commands are sent
//! as `<name> <args...>\r\n` and answered with an echo, optional message
//! lines and a final `Done` or `Error`. While scanning, the sensor emits a
//! presence frame `$JYBSS,<0|1>, , , *` about every second.
//!
//! A background task reads every line. Presence frames update the presence
//! state and, when reading is enabled, are handed to the presence handlers.
//! All other lines are queued as command replies.
//!
//! The port runs at 115200 baud, 8N1.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use sensord_types::{
    Command, CommandArg, CommandResponse, CommandResult, ConfigChainResponse, SensorId,
    SensorStatus,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, trace, warn};

use crate::config::SensorConfig;
use crate::error::SensorError;
use crate::forwarder::PresenceHandler;
use crate::sensor::{Sensor, SensorConnector};

/// Default wait for a command reply or a presence frame
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// A sensor is scanning when it produced a frame this recently
pub const SCANNING_WINDOW: Duration = Duration::from_secs(2);

pub const BAUD_RATE: u32 = 115_200;

const PRESENCE_FRAME_PREFIX: &str = "$JYBSS,";
const REPLY_DONE: &str = "Done";
const REPLY_ERROR: &str = "Error";

const SAVE_CFG: &str = "saveCfg";
const SAVE_CFG_ARGS: [&str; 4] = ["0x45670123", "0xCDEF89AB", "0x956128C6", "0xDF54AC89"];

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Parse a presence frame, `None` for any other line
#[must_use]
pub fn parse_presence_frame(line: &str) -> Option<bool> {
    let rest = line.trim().strip_prefix(PRESENCE_FRAME_PREFIX)?;
    match rest.split(',').next()?.trim() {
        "0" => Some(false),
        "1" => Some(true),
        _ => None,
    }
}

/// Build a command response from the reply lines of one exchange.
fn interpret_reply(command: &str, lines: Vec<String>) -> CommandResponse {
    if lines.is_empty() {
        return CommandResponse::missing();
    }

    let mut echo = None;
    let mut result = CommandResult::Unknown;
    let mut messages = Vec::new();

    for line in lines {
        match line.as_str() {
            REPLY_DONE => result = CommandResult::Done,
            REPLY_ERROR => result = CommandResult::Error,
            _ if echo.is_none() && line.contains(command) => echo = Some(line),
            _ => messages.push(line),
        }
    }

    if result == CommandResult::Done && messages.iter().any(|m| m.contains("already")) {
        result = CommandResult::NotApplicable;
    }

    let message = (!messages.is_empty()).then(|| messages.join("; "));
    CommandResponse::new(echo, result, message)
}

fn is_terminal(line: &str) -> bool {
    line == REPLY_DONE || line == REPLY_ERROR
}

struct SharedState {
    reading: AtomicBool,
    closed: AtomicBool,
    last_frame: Mutex<Option<Instant>>,
    replies: Mutex<VecDeque<String>>,
    reply_ready: Notify,
    presence: watch::Sender<Option<bool>>,
    handlers: Mutex<Vec<Arc<PresenceHandler>>>,
}

impl SharedState {
    fn new() -> Self {
        Self {
            reading: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            last_frame: Mutex::new(None),
            replies: Mutex::new(VecDeque::new()),
            reply_ready: Notify::new(),
            presence: watch::Sender::new(None),
            handlers: Mutex::new(Vec::new()),
        }
    }

    fn ingest(&self, sensor_id: &SensorId, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let Some(presence) = parse_presence_frame(line) else {
            trace!("[sensor_reply] sensor=[{}] line=[{}]", sensor_id, line);
            self.replies
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(line.to_string());
            self.reply_ready.notify_waiters();
            return;
        };

        *self.last_frame.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        self.presence.send_replace(Some(presence));

        if self.reading.load(Ordering::Acquire) {
            let handlers = self
                .handlers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for handler in handlers {
                handler.handle(presence);
            }
        }
    }

    fn drain_replies(&self) -> Vec<String> {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    fn is_scanning(&self) -> bool {
        self.last_frame
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|at| at.elapsed() <= SCANNING_WINDOW)
    }

    fn ensure_open(&self) -> Result<(), SensorError> {
        if self.closed.load(Ordering::Acquire) {
            Err(SensorError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Handle of one SEN0395 sensor
pub struct Sen0395 {
    sensor_id: SensorId,
    port: String,
    timeout: Duration,
    /// Held for the whole exchange, serializes commands
    writer: tokio::sync::Mutex<BoxedWriter>,
    state: Arc<SharedState>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Sen0395 {
    /// Wrap an open transport and spawn its reader task.
    pub fn open<T>(sensor_id: SensorId, port: impl Into<String>, io: T, timeout: Duration) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let state = Arc::new(SharedState::new());

        let reader = tokio::spawn(read_loop(
            sensor_id.clone(),
            BufReader::new(read_half),
            Arc::clone(&state),
        ));

        Arc::new(Self {
            sensor_id,
            port: port.into(),
            timeout,
            writer: tokio::sync::Mutex::new(Box::new(write_half)),
            state,
            reader: Mutex::new(Some(reader)),
        })
    }

    async fn exchange(&self, command: &str, args: &[String]) -> Result<CommandResponse, SensorError> {
        if let Some(arg) = args.iter().find(|a| a.contains(['\r', '\n'])) {
            return Err(SensorError::InvalidArgument(arg.clone()));
        }

        let mut writer = self.writer.lock().await;
        self.state.ensure_open()?;

        let stale = self.state.drain_replies();
        if !stale.is_empty() {
            debug!(
                "[stale_replies_dropped] sensor=[{}] count=[{}]",
                self.sensor_id,
                stale.len()
            );
        }

        let mut line = command.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        debug!("[sensor_command] sensor=[{}] command=[{}]", self.sensor_id, line);
        line.push_str("\r\n");

        let deadline = tokio::time::Instant::now() + self.timeout;

        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        match tokio::time::timeout_at(deadline, write).await {
            Ok(written) => written?,
            Err(_) => {
                warn!(
                    "[sensor_write_timeout] sensor=[{}] command=[{}]",
                    self.sensor_id, command
                );
                return Err(SensorError::WriteTimeout(self.timeout));
            }
        }

        let mut lines = Vec::new();

        loop {
            // Registered before draining so a reply pushed in between still wakes us
            let notified = self.state.reply_ready.notified();

            let batch = self.state.drain_replies();
            let finished = batch.iter().any(|l| is_terminal(l));
            lines.extend(batch);

            if finished || tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }
        drop(writer);

        Ok(interpret_reply(command, lines))
    }

    async fn run_command(&self, command: Command, args: &[CommandArg]) -> Result<CommandResponse, SensorError> {
        let args: Vec<String> = args.iter().map(ToString::to_string).collect();
        self.exchange(command.value(), &args).await
    }

    async fn run_config_chain(
        &self,
        command: Command,
        args: &[CommandArg],
    ) -> Result<ConfigChainResponse, SensorError> {
        let mut chain = ConfigChainResponse::default();

        let paused = if self.state.is_scanning() {
            let pause = self.run_command(Command::SensorStop, &[]).await?;
            let ok = pause.is_success();
            chain.pause_cmd = Some(pause);
            if !ok {
                return Ok(chain);
            }
            true
        } else {
            false
        };

        let cfg = self.run_command(command, args).await?;
        let cfg_ok = cfg.is_success();
        chain.cfg_cmd = Some(cfg);

        if cfg_ok {
            let save_args: Vec<String> = SAVE_CFG_ARGS.iter().map(ToString::to_string).collect();
            chain.save_cmd = Some(self.exchange(SAVE_CFG, &save_args).await?);
        }

        if paused {
            chain.resume_cmd = Some(self.run_command(Command::SensorStart, &[]).await?);
        }

        Ok(chain)
    }

    async fn next_presence(&self) -> Result<Option<bool>, SensorError> {
        self.state.ensure_open()?;

        // A fresh subscription has already seen the current value
        let mut presence = self.state.presence.subscribe();

        match tokio::time::timeout(self.timeout, presence.changed()).await {
            Ok(Ok(())) => Ok(*presence.borrow_and_update()),
            Ok(Err(_)) | Err(_) => Ok(None),
        }
    }

    async fn shutdown(&self) -> Result<(), SensorError> {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.state.reading.store(false, Ordering::Release);

        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }

        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        debug!("[sensor_closed] sensor=[{}]", self.sensor_id);
        Ok(())
    }
}

async fn read_loop<R>(sensor_id: SensorId, reader: BufReader<R>, state: Arc<SharedState>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => state.ingest(&sensor_id, &line),
            Ok(None) => {
                debug!("[sensor_stream_closed] sensor=[{}]", sensor_id);
                break;
            }
            Err(e) => {
                warn!("[sensor_read_failed] sensor=[{}] error=[{}]", sensor_id, e);
                break;
            }
        }
    }
}

impl Sensor for Sen0395 {
    fn sensor_id(&self) -> &SensorId {
        &self.sensor_id
    }

    fn send_command<'a>(
        &'a self,
        command: Command,
        args: &'a [CommandArg],
    ) -> BoxFuture<'a, Result<CommandResponse, SensorError>> {
        self.run_command(command, args).boxed()
    }

    fn configure<'a>(
        &'a self,
        command: Command,
        args: &'a [CommandArg],
    ) -> BoxFuture<'a, Result<ConfigChainResponse, SensorError>> {
        self.run_config_chain(command, args).boxed()
    }

    fn status(&self) -> SensorStatus {
        SensorStatus {
            sensor_id: self.sensor_id.clone(),
            port: self.port.clone(),
            timeout: Some(self.timeout.as_secs_f64()),
            is_reading: self.state.reading.load(Ordering::Acquire),
            is_scanning: self.state.is_scanning(),
        }
    }

    fn start_reading(&self) -> Result<(), SensorError> {
        self.state.ensure_open()?;
        self.state.reading.store(true, Ordering::Release);
        Ok(())
    }

    fn stop_reading(&self) -> Result<(), SensorError> {
        self.state.ensure_open()?;
        self.state.reading.store(false, Ordering::Release);
        Ok(())
    }

    fn clear_buffer(&self) -> Result<(), SensorError> {
        self.state.ensure_open()?;
        self.state.drain_replies();
        Ok(())
    }

    fn read_presence(&self) -> BoxFuture<'_, Result<Option<bool>, SensorError>> {
        self.next_presence().boxed()
    }

    fn start_scanning(&self) -> BoxFuture<'_, Result<CommandResponse, SensorError>> {
        self.run_command(Command::SensorStart, &[]).boxed()
    }

    fn add_presence_handler(&self, handler: Arc<PresenceHandler>) {
        self.state
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    fn close(&self) -> BoxFuture<'_, Result<(), SensorError>> {
        self.shutdown().boxed()
    }
}

/// Opens SEN0395 sensors on their serial ports
#[derive(Debug, Clone)]
pub struct Sen0395Connector {
    timeout: Duration,
}

impl Sen0395Connector {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for Sen0395Connector {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl SensorConnector for Sen0395Connector {
    fn connect<'a>(
        &'a self,
        config: &'a SensorConfig,
    ) -> BoxFuture<'a, Result<Arc<dyn Sensor>, SensorError>> {
        async move {
            let port = tokio_serial::new(config.port.as_str(), BAUD_RATE).open_native_async()?;
            debug!(
                "[serial_port_opened] port=[{}] baud=[{}]",
                config.port, BAUD_RATE
            );

            let sensor_id = SensorId::new(config.sensor_type, config.name.clone());
            let sensor: Arc<dyn Sensor> =
                Sen0395::open(sensor_id, config.port.clone(), port, self.timeout);
            Ok(sensor)
        }
        .boxed()
    }
}
