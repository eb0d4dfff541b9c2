//! Per-client SeedLink v3 session: command state machine and delivery.
//!
//! Each accepted socket gets two tasks. The command reader parses lines
//! and answers on the text channel; the delivery task drains the outbound
//! queue into data and INFO frames. Both share one buffered writer and
//! exit together when the session closes.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use seedlink_hub_protocol::frame::v3;
use seedlink_hub_protocol::{Command, MessageNumber, Response};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::ServerConfig;
use crate::cache::MessageCache;
use crate::manager::{ChannelDirectory, InfoResponder};
use crate::queue::RecordQueue;
use crate::record::{BinaryRecord, Scnl};
use crate::registry::ConnectionRegistry;
use crate::select::{Selection, normalize_args};
use crate::time::now_ms;

const MAX_LINE_LEN: usize = 1024;
const READ_ERROR_LIMIT: u32 = 10;
const READ_RETRY_DELAY: Duration = Duration::from_secs(1);
const WRITE_ERROR_LIMIT: u32 = 10;
const LINE_RETRY_DELAY: Duration = Duration::from_millis(250);
/// How long past the window end an idle session waits before sending END.
const END_GRACE_MS: i64 = 2000;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

type SharedWriter<W> = Arc<tokio::sync::Mutex<W>>;

/// Everything a session needs from the server, shared by all sessions.
pub(crate) struct SessionContext {
    pub config: ServerConfig,
    pub cache: MessageCache,
    pub directory: Arc<dyn ChannelDirectory>,
    pub info: Arc<dyn InfoResponder>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    Handshake,
    StationBound,
    Streaming,
    Terminated,
}

/// An item waiting for the delivery task.
#[derive(Clone, Debug)]
pub(crate) enum Outbound {
    Data(Arc<BinaryRecord>),
    Info(Arc<BinaryRecord>),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct BackfillRequest {
    from: Option<MessageNumber>,
    begin: Option<i64>,
    end: Option<i64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Window {
    begin: Option<i64>,
    end: Option<i64>,
}

struct SessionState {
    phase: Phase,
    /// `None` selects every channel.
    selection: Option<Selection>,
    watermark: Option<MessageNumber>,
    request: Option<BackfillRequest>,
    window: Window,
    /// Live arrivals held back while a replay is being queued.
    staging: Option<Vec<Arc<BinaryRecord>>>,
    channels: Option<HashSet<Scnl>>,
    queue_full_reported: bool,
}

/// Outcome of one command line.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Reply {
    Text(Response),
    Silent,
    Close,
}

enum Step {
    Write(Outbound, Vec<u8>),
    End,
    Idle(Option<i64>),
    Skip,
}

pub(crate) struct Session {
    id: u64,
    peer: SocketAddr,
    ctx: Arc<SessionContext>,
    state: Mutex<SessionState>,
    outbound: RecordQueue<Outbound>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
}

impl Session {
    pub fn new(id: u64, peer: SocketAddr, ctx: Arc<SessionContext>) -> Self {
        let (close_tx, _) = watch::channel(false);
        let outbound = RecordQueue::new(ctx.config.max_queue_size);
        Self {
            id,
            peer,
            ctx,
            state: Mutex::new(SessionState {
                phase: Phase::Handshake,
                selection: None,
                watermark: None,
                request: None,
                window: Window::default(),
                staging: None,
                channels: None,
                queue_full_reported: false,
            }),
            outbound,
            closed: AtomicBool::new(false),
            close_tx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().unwrap().phase
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.outbound.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the session. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // also runs while unwinding, so a poisoned lock is not fatal here
        self.state.lock().unwrap_or_else(PoisonError::into_inner).phase = Phase::Terminated;
        self.close_tx.send_replace(true);
        self.outbound.stop();
        debug!(session = self.id, "session closing");
    }

    /// Resolves once the session is closed.
    async fn closed(&self) {
        let mut rx = self.close_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Drive the connection until it closes, then deregister.
    pub async fn run(self: Arc<Self>, stream: TcpStream, registry: ConnectionRegistry) {
        let _slot = Deregister::new(self.clone(), registry);
        info!(session = self.id, peer = %self.peer, "client connected");
        let (read_half, write_half) = stream.into_split();
        let writer = Arc::new(tokio::sync::Mutex::new(BufWriter::new(write_half)));

        let delivery = {
            let session = self.clone();
            let writer = writer.clone();
            tokio::spawn(async move { session.deliver(&writer).await })
        };

        let mut lines = LineReader::new(read_half);
        self.read_commands(&mut lines, &writer).await;
        self.close();
        if let Err(e) = delivery.await {
            warn!(session = self.id, error = %e, "delivery task failed");
        }

        let mut w = writer.lock().await;
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, w.shutdown()).await;
        drop(w);
        info!(session = self.id, peer = %self.peer, "client disconnected");
    }

    // ---- command reader ----

    async fn read_commands<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
        &self,
        lines: &mut LineReader<R>,
        writer: &SharedWriter<W>,
    ) {
        let mut errors = 0u32;
        loop {
            let next = tokio::select! {
                next = lines.next_line() => next,
                _ = self.closed() => break,
            };
            match next {
                Ok(Some(line)) => {
                    errors = 0;
                    match self.handle_line(&line) {
                        Reply::Text(response) => {
                            if !self.send(writer, &response.to_bytes()).await {
                                break;
                            }
                        }
                        Reply::Silent => {}
                        Reply::Close => break,
                    }
                }
                Ok(None) => {
                    debug!(session = self.id, "connection closed by client");
                    break;
                }
                Err(e) => {
                    errors += 1;
                    if errors > READ_ERROR_LIMIT {
                        warn!(session = self.id, error = %e, errors, "too many read errors, closing");
                        break;
                    }
                    debug!(session = self.id, error = %e, errors, "read error");
                    tokio::select! {
                        _ = tokio::time::sleep(READ_RETRY_DELAY) => {}
                        _ = self.closed() => break,
                    }
                }
            }
        }
        self.close();
    }

    /// Parse and apply one command line.
    pub(crate) fn handle_line(&self, line: &str) -> Reply {
        let line = line.trim();
        if line.is_empty() {
            trace!(session = self.id, "empty command line");
            return Reply::Text(Response::Error);
        }
        match Command::parse(line) {
            Ok(command) => {
                debug!(session = self.id, command = command.name(), "received command");
                self.handle_command(command)
            }
            Err(e) => {
                debug!(session = self.id, error = %e, line, "invalid command");
                Reply::Text(Response::Error)
            }
        }
    }

    fn handle_command(&self, command: Command) -> Reply {
        let config = &self.ctx.config;
        match command {
            Command::Hello => {
                self.transmission_off();
                Reply::Text(Response::Hello {
                    software: config.software.clone(),
                    organization: config.organization.clone(),
                })
            }
            Command::Cat => Reply::Text(Response::Catalog {
                network: config.network.clone(),
                station: config.station.clone(),
            }),
            Command::Bye => {
                debug!(session = self.id, "client requested close");
                Reply::Close
            }
            Command::Station { station, network } => {
                let mut state = self.state.lock().unwrap();
                Self::stop_transmission(&mut state);
                let matched = station.eq_ignore_ascii_case(&config.station)
                    && network
                        .as_deref()
                        .is_none_or(|net| net.eq_ignore_ascii_case(&config.network));
                if matched {
                    state.phase = Phase::StationBound;
                    Reply::Text(Response::Ok)
                } else {
                    debug!(session = self.id, %station, ?network, "unknown station");
                    Reply::Text(Response::Error)
                }
            }
            Command::Select { patterns } => Reply::Text(self.select(patterns)),
            Command::Data { sequence, begin } => {
                if sequence.is_some() {
                    let mut state = self.state.lock().unwrap();
                    Self::stop_transmission(&mut state);
                    state.request = Some(BackfillRequest {
                        from: sequence,
                        begin,
                        end: None,
                    });
                }
                self.request_accepted()
            }
            Command::Time { begin, end } => {
                {
                    let mut state = self.state.lock().unwrap();
                    Self::stop_transmission(&mut state);
                    state.request = Some(BackfillRequest {
                        from: None,
                        begin: Some(begin),
                        end,
                    });
                }
                self.request_accepted()
            }
            Command::End => {
                if self.phase() == Phase::Streaming {
                    debug!(session = self.id, "END ignored during transmission");
                } else {
                    self.transmission_on();
                }
                Reply::Silent
            }
            Command::Info { level } => match self.ctx.info.info_record(level.as_deref()) {
                Some(record) => {
                    let _state = self.state.lock().unwrap();
                    self.outbound.push(Outbound::Info(Arc::new(record)));
                    Reply::Silent
                }
                None => {
                    debug!(session = self.id, ?level, "unsupported INFO level");
                    Reply::Text(Response::Error)
                }
            },
            Command::Fetch => Reply::Text(Response::NotImplemented {
                command: "FETCH".to_owned(),
            }),
        }
    }

    /// Follow-up to a successfully parsed DATA or TIME.
    fn request_accepted(&self) -> Reply {
        match self.phase() {
            Phase::Streaming => {
                debug!(session = self.id, "request ignored during transmission");
                Reply::Silent
            }
            Phase::StationBound => Reply::Text(Response::Ok),
            Phase::Handshake => {
                self.transmission_on();
                Reply::Silent
            }
            Phase::Terminated => Reply::Silent,
        }
    }

    fn select(&self, args: Vec<String>) -> Response {
        self.transmission_off();
        if args.is_empty() {
            self.state.lock().unwrap().selection = None;
            debug!(session = self.id, "selection cleared");
            return Response::Ok;
        }

        let added = match normalize_args(&args) {
            Ok(added) => added,
            Err(e) => {
                debug!(session = self.id, error = %e, "SELECT rejected");
                return Response::Error;
            }
        };

        let mut state = self.state.lock().unwrap();
        if state.channels.is_none() {
            let available = self.ctx.directory.channels();
            if available.is_empty() {
                debug!(session = self.id, "SELECT with no channels available");
                return Response::Error;
            }
            state.channels = Some(available);
        }
        if added.is_empty() {
            return Response::Ok;
        }

        let mut patterns = state
            .selection
            .as_ref()
            .map(|s| s.patterns().to_vec())
            .unwrap_or_default();
        patterns.extend(added);

        let built = Selection::build(patterns, state.channels.as_ref().unwrap_or(&HashSet::new()));
        match built {
            Ok(selection) => {
                debug!(session = self.id, channels = selection.len(), "selection updated");
                state.selection = Some(selection);
                Response::Ok
            }
            Err(e) => {
                debug!(session = self.id, error = %e, "SELECT rejected");
                Response::Error
            }
        }
    }

    // ---- transmission ----

    fn transmission_off(&self) {
        Self::stop_transmission(&mut self.state.lock().unwrap());
    }

    fn stop_transmission(state: &mut SessionState) {
        if state.phase == Phase::Streaming {
            state.phase = Phase::Handshake;
            state.window = Window::default();
        }
    }

    /// Start delivery: replay any pending request, then go live.
    fn transmission_on(&self) {
        if let Some((request, continue_live)) = self.begin_replay() {
            let replay = self.ctx.cache.query(request.from, request.begin, request.end);
            self.finish_replay(request, replay, continue_live);
        }
    }

    /// Take the pending request and start staging live arrivals. Returns
    /// `None` when there was nothing to replay and live streaming has
    /// already begun.
    fn begin_replay(&self) -> Option<(BackfillRequest, bool)> {
        let mut state = self.state.lock().unwrap();
        let Some(request) = state.request.take() else {
            state.phase = Phase::Streaming;
            state.window = Window::default();
            debug!(session = self.id, "live transmission started");
            return None;
        };
        let continue_live = request.end.is_none_or(|end| end > now_ms());
        if continue_live {
            state.staging = Some(Vec::new());
        }
        Some((request, continue_live))
    }

    /// Queue the replay and any staged arrivals, then set the window.
    ///
    /// The window is only set here, together with the queued records, so
    /// the delivery task never sees a past window end with nothing queued.
    fn finish_replay(
        &self,
        request: BackfillRequest,
        replay: Vec<Arc<BinaryRecord>>,
        continue_live: bool,
    ) {
        let mut state = self.state.lock().unwrap();
        if state.phase == Phase::Terminated {
            return;
        }
        debug!(session = self.id, records = replay.len(), continue_live, "replaying cached records");
        self.outbound.clear();
        state.window = Window {
            begin: request.begin,
            end: request.end,
        };
        state.watermark = None;
        for record in replay {
            self.accept(&mut state, record);
        }

        let staged = state.staging.take().unwrap_or_default();
        if continue_live {
            if !staged.is_empty() {
                debug!(session = self.id, records = staged.len(), "adding records received during replay");
            }
            for record in staged {
                self.accept(&mut state, record);
            }
            state.phase = Phase::Streaming;
        } else {
            state.phase = Phase::Handshake;
        }
        drop(state);
        self.outbound.notify();
    }

    /// Offer a freshly published record.
    pub fn offer(&self, record: &Arc<BinaryRecord>) {
        let mut state = self.state.lock().unwrap();
        if state.phase == Phase::Streaming {
            self.accept(&mut state, record.clone());
        } else if let Some(staged) = state.staging.as_mut() {
            staged.push(record.clone());
        }
    }

    /// Watermark and selection filter. Returns whether the record was queued.
    fn accept(&self, state: &mut SessionState, record: Arc<BinaryRecord>) -> bool {
        let number = record.message_number;
        if let Some(last) = state.watermark {
            if number == last {
                trace!(session = self.id, %number, "duplicate message number dropped");
                return false;
            }
            if number < last {
                if !MessageNumber::is_rollover(last, number) {
                    trace!(session = self.id, %number, %last, "stale message number dropped");
                    return false;
                }
                debug!(session = self.id, %number, %last, "message number rollover");
            }
        }
        if state
            .selection
            .as_ref()
            .is_some_and(|selection| !selection.contains(&record.scnl))
        {
            return false;
        }

        state.watermark = Some(number);
        if self.outbound.push(Outbound::Data(record)) {
            state.queue_full_reported = false;
        } else if state.queue_full_reported {
            debug!(session = self.id, limit = self.ctx.config.max_queue_size, "outbound queue full, oldest record dropped");
        } else {
            warn!(session = self.id, limit = self.ctx.config.max_queue_size, "outbound queue full, dropping oldest records");
            state.queue_full_reported = true;
        }
        true
    }

    // ---- delivery ----

    async fn deliver<W: AsyncWrite + Unpin>(&self, writer: &SharedWriter<W>) {
        let mut errors = 0u32;
        while !self.is_closed() {
            match self.next_step() {
                Step::Skip => {}
                Step::Idle(end) => {
                    let wait = end.map(|end| {
                        Duration::from_millis((end + END_GRACE_MS - now_ms()).max(0) as u64)
                    });
                    tokio::select! {
                        _ = self.outbound.wait_for_item(wait) => {}
                        _ = self.closed() => break,
                    }
                }
                Step::End => {
                    debug!(session = self.id, "transmission window complete");
                    if !self.send(writer, &Response::End.to_bytes()).await {
                        break;
                    }
                }
                Step::Write(item, frame) => match self.write(writer, &frame).await {
                    Ok(()) => {
                        errors = 0;
                        trace!(session = self.id, "frame sent");
                    }
                    Err(e) => {
                        errors += 1;
                        if errors > WRITE_ERROR_LIMIT {
                            warn!(session = self.id, error = %e, errors, "too many write errors, closing");
                            self.close();
                            break;
                        }
                        warn!(session = self.id, error = %e, errors, "frame write failed");
                        self.outbound.push_front(item);
                        self.retry_pause().await;
                    }
                },
            }
        }
    }

    /// Decide what the delivery task does next, under the session lock.
    fn next_step(&self) -> Step {
        let mut state = self.state.lock().unwrap();
        let Some(item) = self.outbound.pop() else {
            let end = state.window.end;
            return match end {
                Some(end) if now_ms() >= end + END_GRACE_MS => {
                    Self::end_transmission(&mut state, &self.outbound);
                    Step::End
                }
                end => Step::Idle(end),
            };
        };

        let frame = match &item {
            Outbound::Data(record) => {
                if state.window.end.is_some_and(|end| record.start_time > end) {
                    debug!(session = self.id, start_time = record.start_time, "record after window end");
                    Self::end_transmission(&mut state, &self.outbound);
                    return Step::End;
                }
                if state.window.begin.is_some_and(|begin| record.start_time < begin) {
                    return Step::Skip;
                }
                v3::write(record.message_number, &record.payload)
            }
            Outbound::Info(record) => v3::write_info(true, &record.payload),
        };
        match frame {
            Ok(frame) => Step::Write(item, frame),
            Err(e) => {
                warn!(session = self.id, error = %e, "record cannot be framed, skipped");
                Step::Skip
            }
        }
    }

    fn end_transmission(state: &mut SessionState, outbound: &RecordQueue<Outbound>) {
        Self::stop_transmission(state);
        state.window = Window::default();
        state.staging = None;
        outbound.clear();
    }

    async fn retry_pause(&self) {
        let delay = self.ctx.config.message_retry_delay;
        tokio::select! {
            _ = async {
                if delay.is_zero() {
                    self.outbound.wait_for_push().await;
                } else {
                    tokio::time::sleep(delay).await;
                }
            } => {}
            _ = self.closed() => {}
        }
    }

    // ---- socket writes ----

    async fn write<W: AsyncWrite + Unpin>(
        &self,
        writer: &SharedWriter<W>,
        bytes: &[u8],
    ) -> io::Result<()> {
        let mut w = writer.lock().await;
        tokio::select! {
            result = async {
                w.write_all(bytes).await?;
                w.flush().await
            } => result,
            _ = self.closed() => Err(io::Error::new(io::ErrorKind::NotConnected, "session closed")),
        }
    }

    /// Write a text reply, retrying a bounded number of times.
    async fn send<W: AsyncWrite + Unpin>(&self, writer: &SharedWriter<W>, bytes: &[u8]) -> bool {
        let mut errors = 0u32;
        while !self.is_closed() {
            match self.write(writer, bytes).await {
                Ok(()) => return true,
                Err(e) => {
                    errors += 1;
                    if errors > WRITE_ERROR_LIMIT {
                        warn!(session = self.id, error = %e, errors, "too many write errors, closing");
                        self.close();
                        return false;
                    }
                    warn!(session = self.id, error = %e, errors, "reply write failed");
                    tokio::select! {
                        _ = tokio::time::sleep(LINE_RETRY_DELAY) => {}
                        _ = self.closed() => return false,
                    }
                }
            }
        }
        false
    }
}

/// Closes its session and frees the registry slot when dropped, so a
/// session task that ends by panicking still releases its connection.
struct Deregister {
    session: Arc<Session>,
    registry: ConnectionRegistry,
}

impl Deregister {
    fn new(session: Arc<Session>, registry: ConnectionRegistry) -> Self {
        Self { session, registry }
    }
}

impl Drop for Deregister {
    fn drop(&mut self) {
        self.session.close();
        self.registry.remove(self.session.id);
    }
}

/// Splits input on `\r`, `\n` or `\r\n`, capping line length.
struct LineReader<R> {
    inner: BufReader<R>,
    skip_lf: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            skip_lf: false,
        }
    }

    /// Next line without its terminator; `None` at end of input.
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        let mut buf = Vec::new();
        loop {
            let byte = match self.inner.read_u8().await {
                Ok(byte) => byte,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok((!buf.is_empty()).then(|| String::from_utf8_lossy(&buf).into_owned()));
                }
                Err(e) => return Err(e),
            };
            if std::mem::take(&mut self.skip_lf) && byte == b'\n' {
                continue;
            }
            match byte {
                b'\r' => {
                    self.skip_lf = true;
                    return Ok(Some(String::from_utf8_lossy(&buf).into_owned()));
                }
                b'\n' => return Ok(Some(String::from_utf8_lossy(&buf).into_owned())),
                // excess is discarded
                _ if buf.len() < MAX_LINE_LEN => buf.push(byte),
                _ => {}
            }
        }
    }
}
