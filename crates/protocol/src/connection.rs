use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::time::timeout;
use tokio_util::codec::{Encoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::buffer::BufferPool;
use crate::codec::FrameCodec;
use crate::envelope::{Envelope, unix_nanos};
use crate::error::{ProtocolError, ProtocolResult};
use crate::flow::{FlowConfig, FlowController};
use crate::handshake::{
    HandshakeRequest, HandshakeResponse, HandshakeStatus, features, negotiate,
};
use crate::limits::{
    CURRENT_VERSION, DEFAULT_TIMEOUT, FLOW_CHUNK, HEARTBEAT_INTERVAL, MAX_MESSAGE_AGE,
    MAX_MESSAGE_SIZE, MAX_MISSED_HEARTBEATS, MAX_RETRIES, RETRY_DELAY, TRACKER_CAPACITY,
};
use crate::payload::Payload;
use crate::queue::{QueueConfig, SendQueue};
use crate::tracker::SequenceTracker;

/// Consecutive integrity violations (checksum, version, stale, duplicate)
/// tolerated before the connection is torn down.
const MAX_INTEGRITY_STRIKES: u32 = 8;

/// Capacity of the channel carrying decoded inbound payloads.
const INBOUND_CHANNEL: usize = 1024;

/// Callback invoked when a panic is captured inside the I/O driver.
pub type PanicHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Lifecycle of a [`Connection`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Never connected.
    Disconnected = 0,
    /// Dial or handshake in progress.
    Connecting = 1,
    /// Link established.
    Connected = 2,
    /// Recoverable failure; redial in progress.
    Reconnecting = 3,
    /// Terminal.
    Closed = 4,
}

impl ConnectionState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            4 => Self::Closed,
            _ => Self::Disconnected,
        }
    }
}

/// Tunables for one connection.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Wire version to speak and require.
    pub version: u16,
    /// Features to request in the handshake.
    pub features: u32,
    /// Opaque authentication data for the handshake.
    pub auth_data: Bytes,
    /// Interval between heartbeats when negotiated.
    pub heartbeat_interval: Duration,
    /// Missed heartbeats tolerated before declaring the link dead.
    pub max_missed_heartbeats: u32,
    /// Reconnect attempts for recoverable failures.
    pub max_retries: u32,
    /// Delay between reconnect attempts.
    pub retry_delay: Duration,
    /// Deadline for dialing.
    pub dial_timeout: Duration,
    /// Deadline for a single frame write.
    pub write_timeout: Duration,
    /// Deadline for the handshake exchange.
    pub handshake_timeout: Duration,
    /// Largest frame body accepted or produced.
    pub max_message_size: usize,
    /// Send-queue behaviour.
    pub queue: QueueConfig,
    /// Flow-control budgets.
    pub flow: FlowConfig,
    /// Sequence-tracker window.
    pub tracker_capacity: usize,
    /// Oldest inbound timestamp accepted.
    pub max_message_age: Duration,
    /// Invoked with the panic message when an I/O driver panics.
    pub on_panic: Option<PanicHook>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            features: features::HEARTBEAT | features::RECONNECT,
            auth_data: Bytes::new(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            max_missed_heartbeats: MAX_MISSED_HEARTBEATS,
            max_retries: MAX_RETRIES,
            retry_delay: RETRY_DELAY,
            dial_timeout: DEFAULT_TIMEOUT,
            write_timeout: DEFAULT_TIMEOUT,
            handshake_timeout: DEFAULT_TIMEOUT,
            max_message_size: MAX_MESSAGE_SIZE,
            queue: QueueConfig::default(),
            flow: FlowConfig::default(),
            tracker_capacity: TRACKER_CAPACITY,
            max_message_age: MAX_MESSAGE_AGE,
            on_panic: None,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("version", &self.version)
            .field("features", &self.features)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("max_retries", &self.max_retries)
            .field("max_message_size", &self.max_message_size)
            .finish_non_exhaustive()
    }
}

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    heartbeats_sent: AtomicU64,
    heartbeats_received: AtomicU64,
    duplicates_dropped: AtomicU64,
    reordered: AtomicU64,
    checksum_failures: AtomicU64,
    stale_dropped: AtomicU64,
    reconnects: AtomicU64,
}

macro_rules! stat_getter {
    ($(#[$doc:meta] $name:ident),+ $(,)?) => {
        $(
            #[$doc]
            #[must_use]
            pub fn $name(&self) -> u64 {
                self.$name.load(Ordering::Relaxed)
            }
        )+
    };
}

impl ConnectionStats {
    stat_getter!(
        /// Application messages written to the wire.
        messages_sent,
        /// Application messages delivered to the receiver.
        messages_received,
        /// Heartbeats emitted.
        heartbeats_sent,
        /// Heartbeats observed.
        heartbeats_received,
        /// Inbound messages dropped as duplicates.
        duplicates_dropped,
        /// Inbound messages delivered out of order.
        reordered,
        /// Inbound messages dropped on checksum mismatch.
        checksum_failures,
        /// Inbound messages dropped as stale.
        stale_dropped,
        /// Successful reconnects performed.
        reconnects,
    );

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

type Reader = FramedRead<OwnedReadHalf, FrameCodec>;
type Writer = OwnedWriteHalf;

struct Shared {
    config: ConnectionConfig,
    state: AtomicU8,
    outbound: SendQueue<Bytes>,
    // Dropped by the driver on shutdown so `recv` observes the close.
    inbound_tx: StdMutex<Option<mpsc::Sender<Payload>>>,
    cancel: CancellationToken,
    stats: Arc<ConnectionStats>,
    flow: FlowController,
    buffers: BufferPool,
    sequence: AtomicU64,
    tracker: StdMutex<SequenceTracker>,
    last_rx: StdMutex<Instant>,
    negotiated: AtomicU32,
    strikes: AtomicU32,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn note_rx(&self) {
        *self.last_rx.lock().expect("last_rx lock poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_rx
            .lock()
            .expect("last_rx lock poisoned")
            .elapsed()
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers an integrity violation; errors once the strike budget is
    /// spent.
    fn strike(&self, violation: &ProtocolError) -> ProtocolResult<()> {
        let strikes = self.strikes.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(%violation, strikes, "dropped message with integrity violation");
        if strikes >= MAX_INTEGRITY_STRIKES {
            Err(ProtocolError::Connection(format!(
                "{strikes} integrity violations, closing: {violation}"
            )))
        } else {
            Ok(())
        }
    }

    fn clear_strikes(&self) {
        self.strikes.store(0, Ordering::Release);
    }

    fn inbound_sender(&self) -> Option<mpsc::Sender<Payload>> {
        self.inbound_tx
            .lock()
            .expect("inbound lock poisoned")
            .clone()
    }

    fn drop_inbound_sender(&self) {
        self.inbound_tx
            .lock()
            .expect("inbound lock poisoned")
            .take();
    }

    fn heartbeat_negotiated(&self) -> bool {
        self.negotiated.load(Ordering::Acquire) & features::HEARTBEAT != 0
    }

    fn reconnect_negotiated(&self) -> bool {
        self.negotiated.load(Ordering::Acquire) & features::RECONNECT != 0
    }
}

/// One framed, flow-controlled link to a peer.
///
/// Producers enqueue payloads with [`send`](Self::send); one internal
/// writer task drains the queue, so frames never interleave. Inbound
/// frames pass checksum, version, age and duplicate checks before being
/// surfaced through [`recv`](Self::recv). Heartbeats and reconnects run
/// inside the driver when negotiated.
pub struct Connection {
    peer_addr: SocketAddr,
    shared: Arc<Shared>,
    inbound_rx: AsyncMutex<mpsc::Receiver<Payload>>,
}

impl Connection {
    /// Dials `addr` and performs the initiator side of the handshake.
    pub async fn connect(addr: SocketAddr, config: ConnectionConfig) -> ProtocolResult<Self> {
        let (shared, inbound_rx) = Shared::build(config);
        shared.set_state(ConnectionState::Connecting);

        let io = dial_and_handshake(addr, &shared).await.inspect_err(|_| {
            shared.set_state(ConnectionState::Closed);
        })?;
        shared.set_state(ConnectionState::Connected);

        let connection = Self {
            peer_addr: addr,
            shared: Arc::clone(&shared),
            inbound_rx: AsyncMutex::new(inbound_rx),
        };
        tokio::spawn(drive(shared, io, Some(addr)));
        Ok(connection)
    }

    /// Adopts an accepted stream and performs the responder side of the
    /// handshake.
    pub async fn accept(stream: TcpStream, config: ConnectionConfig) -> ProtocolResult<Self> {
        let peer_addr = stream
            .peer_addr()
            .map_err(|e| ProtocolError::Connection(format!("no peer address: {e}")))?;
        let (shared, inbound_rx) = Shared::build(config);
        shared.set_state(ConnectionState::Connecting);

        let io = respond_handshake(stream, &shared).await.inspect_err(|_| {
            shared.set_state(ConnectionState::Closed);
        })?;
        shared.set_state(ConnectionState::Connected);

        let connection = Self {
            peer_addr,
            shared: Arc::clone(&shared),
            inbound_rx: AsyncMutex::new(inbound_rx),
        };
        // Accepted links never redial: the initiator owns reconnection.
        tokio::spawn(drive(shared, io, None));
        Ok(connection)
    }

    /// Address of the remote peer.
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Feature bitmap agreed during the handshake.
    #[must_use]
    pub fn negotiated_features(&self) -> u32 {
        self.shared.negotiated.load(Ordering::Acquire)
    }

    /// Live counters for this connection.
    #[must_use]
    pub fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.shared.stats)
    }

    /// Whether the send queue is asking producers to back off.
    #[must_use]
    pub fn is_backpressured(&self) -> bool {
        self.shared.outbound.is_backpressured()
    }

    /// Enqueues an application payload for transmission.
    pub async fn send(&self, payload: &Payload) -> ProtocolResult<()> {
        match self.state() {
            ConnectionState::Connected
            | ConnectionState::Connecting
            | ConnectionState::Reconnecting => {}
            state => {
                return Err(ProtocolError::Connection(format!(
                    "cannot send in state {state:?}"
                )));
            }
        }

        let encoded = payload.encode()?;
        let framed_len = encoded.len() + crate::limits::ENVELOPE_OVERHEAD;
        if framed_len > self.shared.config.max_message_size {
            return Err(ProtocolError::Size {
                actual: framed_len,
                limit: self.shared.config.max_message_size,
            });
        }
        self.shared.outbound.push(encoded).await
    }

    /// Receives the next inbound application payload.
    pub async fn recv(&self) -> ProtocolResult<Payload> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await.ok_or_else(|| {
            ProtocolError::Connection("connection closed".into())
        })
    }

    /// Receives with a deadline.
    pub async fn recv_timeout(&self, limit: Duration) -> ProtocolResult<Payload> {
        timeout(limit, self.recv())
            .await
            .map_err(|_| ProtocolError::Timeout { operation: "recv" })?
    }

    /// Tears the connection down. Idempotent.
    pub fn close(&self) {
        self.shared.cancel.cancel();
        self.shared.outbound.close();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn build(config: ConnectionConfig) -> (Arc<Self>, mpsc::Receiver<Payload>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL);
        let shared = Arc::new(Self {
            outbound: SendQueue::new(config.queue),
            inbound_tx: StdMutex::new(Some(inbound_tx)),
            cancel: CancellationToken::new(),
            stats: Arc::new(ConnectionStats::default()),
            flow: FlowController::new(config.flow),
            buffers: BufferPool::default(),
            sequence: AtomicU64::new(0),
            tracker: StdMutex::new(SequenceTracker::with_limits(
                config.tracker_capacity,
                config.max_message_age,
            )),
            last_rx: StdMutex::new(Instant::now()),
            negotiated: AtomicU32::new(0),
            strikes: AtomicU32::new(0),
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            config,
        });
        (shared, inbound_rx)
    }
}

fn frame_pair(stream: TcpStream, max_frame: usize) -> (Reader, Writer) {
    let (read_half, write_half) = stream.into_split();
    (
        FramedRead::new(read_half, FrameCodec::new(max_frame)),
        write_half,
    )
}

/// Encodes one envelope and writes it in flow-control sized chunks.
///
/// Budget is acquired and released per chunk, so a frame larger than the
/// flow window still makes progress: at most one chunk is in flight at a
/// time against the window, while the rate bucket spreads the chunks over
/// the configured bytes-per-second. The scratch buffer comes from (and
/// returns to) the pool when one is supplied.
async fn write_frame(
    writer: &mut Writer,
    envelope: Envelope,
    flow: Option<&FlowController>,
    buffers: Option<&BufferPool>,
    write_timeout: Duration,
    max_frame: usize,
) -> ProtocolResult<()> {
    let mut codec = FrameCodec::new(max_frame);
    let mut buf = buffers.map_or_else(BytesMut::new, BufferPool::get);
    codec.encode(envelope, &mut buf)?;

    let mut offset = 0;
    while offset < buf.len() {
        let take = (buf.len() - offset).min(FLOW_CHUNK);
        if let Some(flow) = flow {
            flow.acquire(take as u64).await?;
        }
        let written = timeout(write_timeout, writer.write_all(&buf[offset..offset + take])).await;
        if let Some(flow) = flow {
            flow.release(take as u64);
        }
        match written {
            Ok(Ok(())) => offset += take,
            Ok(Err(err)) => return Err(ProtocolError::Write(err)),
            Err(_) => return Err(ProtocolError::Timeout { operation: "write" }),
        }
    }

    let flushed = match timeout(write_timeout, writer.flush()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(ProtocolError::Write(err)),
        Err(_) => Err(ProtocolError::Timeout { operation: "flush" }),
    };
    if let Some(buffers) = buffers {
        buffers.put(buf);
    }
    flushed
}

async fn dial_and_handshake(addr: SocketAddr, shared: &Arc<Shared>) -> ProtocolResult<(Reader, Writer)> {
    let config = &shared.config;
    let stream = timeout(config.dial_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ProtocolError::Timeout { operation: "dial" })?
        .map_err(|e| ProtocolError::Connection(format!("dial {addr}: {e}")))?;
    let (mut reader, mut writer) = frame_pair(stream, config.max_message_size);

    let request = Payload::HandshakeRequest(HandshakeRequest {
        version: config.version,
        timestamp: unix_nanos(),
        features: config.features,
        auth_data: config.auth_data.clone(),
    });
    let envelope = Envelope::new(shared.next_sequence(), request.encode()?);
    write_frame(
        &mut writer,
        envelope,
        None,
        None,
        config.handshake_timeout,
        config.max_message_size,
    )
    .await?;

    let reply = timeout(config.handshake_timeout, reader.next())
        .await
        .map_err(|_| ProtocolError::Timeout { operation: "handshake read" })?
        .ok_or_else(|| ProtocolError::Handshake("peer closed during handshake".into()))??;
    reply.verify_checksum()?;

    let Payload::HandshakeResponse(response) = Payload::decode(reply.payload)? else {
        return Err(ProtocolError::Handshake(
            "expected a handshake response".into(),
        ));
    };
    match response.status {
        HandshakeStatus::Ok => {
            shared
                .negotiated
                .store(response.features, Ordering::Release);
            debug!(peer = %addr, features = response.features, "handshake complete");
            Ok((reader, writer))
        }
        HandshakeStatus::VersionMismatch => Err(ProtocolError::Version {
            received: response.version,
            supported: config.version,
        }),
        HandshakeStatus::Rejected => Err(ProtocolError::Handshake(response.message)),
    }
}

async fn respond_handshake(stream: TcpStream, shared: &Arc<Shared>) -> ProtocolResult<(Reader, Writer)> {
    let config = &shared.config;
    let (mut reader, mut writer) = frame_pair(stream, config.max_message_size);

    let first = timeout(config.handshake_timeout, reader.next())
        .await
        .map_err(|_| ProtocolError::Timeout { operation: "handshake read" })?
        .ok_or_else(|| ProtocolError::Handshake("peer closed during handshake".into()))??;
    first.verify_checksum()?;

    let Payload::HandshakeRequest(request) = Payload::decode(first.payload)? else {
        return Err(ProtocolError::Handshake(
            "first message was not a handshake request".into(),
        ));
    };

    if request.version != config.version {
        let refusal = Payload::HandshakeResponse(HandshakeResponse {
            status: HandshakeStatus::VersionMismatch,
            version: config.version,
            features: 0,
            message: format!("version {} not supported", request.version),
        });
        let envelope = Envelope::new(shared.next_sequence(), refusal.encode()?);
        let _ = write_frame(
            &mut writer,
            envelope,
            None,
            None,
            config.handshake_timeout,
            config.max_message_size,
        )
        .await;
        return Err(ProtocolError::Version {
            received: request.version,
            supported: config.version,
        });
    }

    let agreed = negotiate(config.features, request.features);
    let accept = Payload::HandshakeResponse(HandshakeResponse {
        status: HandshakeStatus::Ok,
        version: config.version,
        features: agreed,
        message: String::new(),
    });
    let envelope = Envelope::new(shared.next_sequence(), accept.encode()?);
    write_frame(
        &mut writer,
        envelope,
        None,
        None,
        config.handshake_timeout,
        config.max_message_size,
    )
    .await?;

    shared.negotiated.store(agreed, Ordering::Release);
    Ok((reader, writer))
}

/// Supervises the I/O of one connection, reconnecting when allowed.
async fn drive(shared: Arc<Shared>, first: (Reader, Writer), redial: Option<SocketAddr>) {
    let mut io = Some(first);
    let mut attempts: u32 = 0;

    loop {
        let Some(parts) = io.take() else { break };
        shared.note_rx();

        let outcome = run_io_guarded(Arc::clone(&shared), parts).await;
        let failure = match outcome {
            Ok(()) => break,
            Err(err) => err,
        };

        let restartable = failure.is_recoverable() || matches!(failure, ProtocolError::Panic(_));
        let may_reconnect = redial.is_some()
            && shared.reconnect_negotiated()
            && restartable
            && !shared.cancel.is_cancelled();
        if !may_reconnect {
            debug!(error = %failure, "connection driver stopping");
            break;
        }

        shared.set_state(ConnectionState::Reconnecting);
        let addr = redial.expect("checked above");
        while attempts < shared.config.max_retries {
            attempts += 1;
            tokio::time::sleep(shared.config.retry_delay).await;
            if shared.cancel.is_cancelled() {
                break;
            }
            match dial_and_handshake(addr, &shared).await {
                Ok(parts) => {
                    ConnectionStats::bump(&shared.stats.reconnects);
                    shared.set_state(ConnectionState::Connected);
                    io = Some(parts);
                    break;
                }
                Err(err) => {
                    warn!(attempt = attempts, error = %err, "reconnect attempt failed");
                }
            }
        }
        if io.is_none() {
            error!(
                attempts,
                "{}",
                ProtocolError::Reconnect { attempts }
            );
            break;
        }
    }

    shared.set_state(ConnectionState::Closed);
    shared.outbound.close();
    // Ends `recv` on the handle side; the framed halves died with the io
    // task.
    shared.drop_inbound_sender();
}

/// Runs the reader/writer/heartbeat trio inside a panic guard.
async fn run_io_guarded(shared: Arc<Shared>, parts: (Reader, Writer)) -> ProtocolResult<()> {
    let guarded = tokio::spawn(run_io(Arc::clone(&shared), parts));
    match guarded.await {
        Ok(result) => result,
        Err(join_error) if join_error.is_panic() => {
            let panic_payload = join_error.into_panic();
            let message = panic_payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| panic_payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "opaque panic payload".to_owned());
            error!(panic = %message, "captured panic in connection io");
            if let Some(hook) = &shared.config.on_panic {
                hook(&message);
            }
            Err(ProtocolError::Panic(message))
        }
        Err(_) => Err(ProtocolError::Connection("io task aborted".into())),
    }
}

async fn run_io(shared: Arc<Shared>, (reader, writer): (Reader, Writer)) -> ProtocolResult<()> {
    let cancel = shared.cancel.clone();
    tokio::select! {
        () = cancel.cancelled() => Ok(()),
        result = write_loop(Arc::clone(&shared), writer) => result,
        result = read_loop(Arc::clone(&shared), reader) => result,
        result = heartbeat_loop(Arc::clone(&shared)) => result,
    }
}

async fn write_loop(shared: Arc<Shared>, mut writer: Writer) -> ProtocolResult<()> {
    while let Some(encoded) = shared.outbound.pop().await {
        let is_heartbeat = encoded.is_empty();
        let envelope = Envelope::new(shared.next_sequence(), encoded);
        let total = envelope.encoded_len();

        write_frame(
            &mut writer,
            envelope,
            Some(&shared.flow),
            Some(&shared.buffers),
            shared.config.write_timeout,
            shared.config.max_message_size,
        )
        .await?;

        if is_heartbeat {
            ConnectionStats::bump(&shared.stats.heartbeats_sent);
        } else {
            ConnectionStats::bump(&shared.stats.messages_sent);
        }
        trace!(bytes = total, heartbeat = is_heartbeat, "frame written");
    }
    Ok(())
}

async fn read_loop(shared: Arc<Shared>, mut reader: Reader) -> ProtocolResult<()> {
    loop {
        let Some(frame) = reader.next().await else {
            return Err(ProtocolError::Connection("peer closed the stream".into()));
        };
        // Length and structural violations are fatal; the stream position
        // cannot be trusted afterwards.
        let envelope = frame?;
        shared.note_rx();

        if let Err(violation) = envelope.verify_checksum() {
            ConnectionStats::bump(&shared.stats.checksum_failures);
            shared.strike(&violation)?;
            continue;
        }

        if envelope.version != shared.config.version {
            let violation = ProtocolError::Version {
                received: envelope.version,
                supported: shared.config.version,
            };
            shared.strike(&violation)?;
            continue;
        }

        let outcome = {
            let mut tracker = shared.tracker.lock().expect("tracker lock poisoned");
            tracker.observe(envelope.sequence, envelope.timestamp, unix_nanos())
        };
        match outcome {
            crate::tracker::TrackOutcome::Duplicate => {
                ConnectionStats::bump(&shared.stats.duplicates_dropped);
                shared.strike(&ProtocolError::Sequence {
                    sequence: envelope.sequence,
                })?;
                continue;
            }
            crate::tracker::TrackOutcome::Stale => {
                ConnectionStats::bump(&shared.stats.stale_dropped);
                let age_secs =
                    (unix_nanos().saturating_sub(envelope.timestamp) / 1_000_000_000).max(0);
                shared.strike(&ProtocolError::MessageAge {
                    age_secs: age_secs as u64,
                    limit_secs: shared.config.max_message_age.as_secs(),
                })?;
                continue;
            }
            crate::tracker::TrackOutcome::Reordered => {
                ConnectionStats::bump(&shared.stats.reordered);
            }
            crate::tracker::TrackOutcome::Accepted => {}
        }
        shared.clear_strikes();

        if envelope.is_heartbeat() {
            ConnectionStats::bump(&shared.stats.heartbeats_received);
            trace!("heartbeat received");
            continue;
        }

        match Payload::decode(envelope.payload) {
            Ok(payload) => {
                ConnectionStats::bump(&shared.stats.messages_received);
                let Some(tx) = shared.inbound_sender() else {
                    return Ok(());
                };
                if tx.send(payload).await.is_err() {
                    // Receiver handle dropped; nothing left to deliver to.
                    return Ok(());
                }
            }
            Err(violation) => {
                shared.strike(&violation)?;
            }
        }
    }
}

async fn heartbeat_loop(shared: Arc<Shared>) -> ProtocolResult<()> {
    if !shared.heartbeat_negotiated() {
        // Nothing to do; park until another branch of the select exits.
        std::future::pending::<()>().await;
        unreachable!("pending future never resolves");
    }

    let interval = shared.config.heartbeat_interval;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // first tick is immediate

    loop {
        ticker.tick().await;

        let idle = shared.idle_for();
        let missed = (idle.as_millis() / interval.as_millis().max(1)) as u32;
        if missed >= shared.config.max_missed_heartbeats {
            return Err(ProtocolError::Heartbeat { missed });
        }

        // An empty payload is the heartbeat message.
        shared.outbound.push(Bytes::new()).await?;
    }
}
