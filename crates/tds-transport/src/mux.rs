//! Virtual socket multiplexer.
//!
//! Many logical streams share one physical connection. At any instant at
//! most one stream owns the reply channel (the *response owner*) and at most
//! one stream is in the middle of sending a multi-packet request (the
//! *current sender*). Packets a stream may not put on the wire yet are queued
//! on its output spill queue; reply packets read on behalf of another stream
//! are queued on that stream's input spill queue.
//!
//! Lock layout:
//!
//! - `io` (async): the read half, the virtual socket table and every spill
//!   queue. Held across network reads, which serializes readers.
//! - `writer` (async): the write half. Taken briefly for each write so a
//!   CANCEL can go out while another task is blocked reading.
//! - `control` (sync): ownership token, cancel state and stream registry.
//!   Never held across an `.await`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use encoding_rs::Encoding;
use parking_lot::{Mutex as SyncMutex, RwLock};
use tds_protocol::done::{self, DONE_TOKEN, DoneStatus};
use tds_protocol::packet::{PacketHeader, PacketStatus, PacketType, STRAY_CANCEL_ACK_LENGTH};
use tds_protocol::version::{ServerType, TdsVersion};
use tds_protocol::ProtocolError;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, MutexGuard, Notify, watch};

use crate::cancel::CancelController;
use crate::config::{MuxConfig, validate_packet_size};
use crate::error::{Error, Result};
use crate::framed::{PacketReader, PacketWriter};
use crate::packet_codec::Packet;
use crate::request::RequestStream;
use crate::response::ResponseStream;
use crate::spill::{SpillBudget, SpillQueue};
use crate::timer::TimerGuard;

/// Identifier of a logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u32);

impl StreamId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// The raw id.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of multiplexer counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxStats {
    /// Physical packets written, CANCEL packets included.
    pub packets_sent: u64,
    /// Physical packets read from the network.
    pub packets_received: u64,
    /// Registered streams.
    pub open_streams: usize,
    /// Stream currently owning the reply channel.
    pub response_owner: Option<StreamId>,
    /// Bytes held in memory spill queues (shared budget).
    pub memory_usage: usize,
    /// Peak of `memory_usage`.
    pub peak_memory_usage: usize,
}

/// Shared by the request and response facades of one stream. The stream is
/// released once the last facade is dropped or closed.
pub(crate) struct Registration {
    id: StreamId,
    controller: Arc<CancelController>,
    released: AtomicBool,
    release_queue: Arc<SyncMutex<Vec<StreamId>>>,
    sender_released: Arc<Notify>,
}

impl Registration {
    pub(crate) fn id(&self) -> StreamId {
        self.id
    }

    pub(crate) fn controller(&self) -> &Arc<CancelController> {
        &self.controller
    }

    /// Mark the stream as explicitly released. Returns `false` if it already
    /// was.
    pub(crate) fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            self.release_queue.lock().push(self.id);
            // A stream parked behind this one must run the release itself.
            self.sender_released.notify_waiters();
        }
    }
}

struct VirtualSocket {
    input: SpillQueue,
    output: SpillQueue,
    /// Discard the current reply instead of queueing it.
    flush_input: bool,
    /// The queued request has its final packet.
    complete: bool,
    /// Type of the last request packet, used to terminate a request.
    packet_type: PacketType,
    packets_sent: u64,
    packets_received: u64,
}

impl VirtualSocket {
    fn new(budget: &Arc<SpillBudget>, buffer_dir: Option<PathBuf>) -> Self {
        Self {
            input: SpillQueue::new(Arc::clone(budget), buffer_dir.clone()),
            output: SpillQueue::new(Arc::clone(budget), buffer_dir),
            flush_input: false,
            complete: false,
            packet_type: PacketType::Query,
            packets_sent: 0,
            packets_received: 0,
        }
    }
}

struct IoState<T> {
    reader: PacketReader<ReadHalf<T>>,
    sockets: HashMap<StreamId, VirtualSocket>,
    packet_count: u64,
}

struct StreamEntry {
    controller: Arc<CancelController>,
    registration: Weak<Registration>,
    query_timeout: Option<Duration>,
}

/// Rolling window over the last bytes of a reply, used to find the DONE
/// token that acknowledges a cancel.
#[derive(Debug)]
struct DoneTail {
    buf: [u8; 13],
    size: usize,
    filled: usize,
}

impl Default for DoneTail {
    fn default() -> Self {
        Self {
            buf: [0; 13],
            size: 9,
            filled: 0,
        }
    }
}

impl DoneTail {
    fn reset(&mut self, size: usize) {
        self.size = size.min(self.buf.len());
        self.filled = 0;
    }

    fn push(&mut self, payload: &[u8]) {
        let size = self.size;
        let frag = payload.len().min(size);
        self.buf.copy_within(frag..size, 0);
        self.buf[size - frag..size].copy_from_slice(&payload[payload.len() - frag..]);
        self.filled = (self.filled + frag).min(size);
    }

    fn is_full(&self) -> bool {
        self.filled >= self.size
    }

    fn bytes(&self) -> &[u8] {
        &self.buf[..self.size]
    }
}

#[derive(Default)]
struct Control {
    response_owner: Option<StreamId>,
    current_sender: Option<StreamId>,
    cancel_pending: bool,
    /// The last packet read ended a reply.
    response_complete: bool,
    done_tail: DoneTail,
    streams: HashMap<StreamId, StreamEntry>,
}

impl Control {
    fn is_stray_cancel_ack(&self, packet: &Packet) -> bool {
        if !self.response_complete
            || self.cancel_pending
            || !packet.is_last()
            || packet.len() != STRAY_CANCEL_ACK_LENGTH
        {
            return false;
        }
        let payload = packet.payload();
        payload[0] == DONE_TOKEN && payload[1] & DoneStatus::CANCELED.bits() as u8 != 0
    }

    /// Keep reading past the end of a reply until the cancel acknowledgement
    /// has been seen.
    fn track_cancel_ack(&mut self, packet: &mut Packet) -> std::result::Result<(), ProtocolError> {
        self.done_tail.push(packet.payload());
        if !self.done_tail.is_full() {
            packet.set_last(false);
        }
        if packet.is_last() {
            if done::tail_is_cancel_ack(self.done_tail.bytes())? {
                tracing::debug!("cancel acknowledged");
                self.cancel_pending = false;
            } else {
                packet.set_last(false);
            }
        }
        Ok(())
    }
}

struct Shared<T> {
    io: Mutex<IoState<T>>,
    writer: Mutex<PacketWriter<WriteHalf<T>>>,
    control: SyncMutex<Control>,
    settings: RwLock<MuxConfig>,
    budget: Arc<SpillBudget>,
    sender_released: Arc<Notify>,
    closed: watch::Sender<bool>,
    release_queue: Arc<SyncMutex<Vec<StreamId>>>,
    next_id: AtomicU32,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
}

/// Handle to a physical connection shared by many logical streams.
///
/// Cloning is cheap; all clones drive the same connection.
pub struct Multiplexer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Multiplexer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Multiplexer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let control = self.shared.control.lock();
        f.debug_struct("Multiplexer")
            .field("response_owner", &control.response_owner)
            .field("current_sender", &control.current_sender)
            .field("open_streams", &control.streams.len())
            .field("closed", &*self.shared.closed.borrow())
            .finish_non_exhaustive()
    }
}

impl<T> Multiplexer<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Wrap a connected stream, accounting spill memory against the
    /// process-wide budget.
    ///
    /// The process-wide budget keeps the spill limits of the first transport
    /// created this way; later `config.spill` limits are ignored.
    pub fn new(stream: T, config: MuxConfig) -> Result<Self> {
        Self::with_budget(stream, config, SpillBudget::global())
    }

    /// Wrap a connected stream with an explicit spill budget.
    pub fn with_budget(stream: T, config: MuxConfig, budget: Arc<SpillBudget>) -> Result<Self> {
        config.validate()?;
        budget.configure(&config.spill);

        let (read_half, write_half) = tokio::io::split(stream);
        let (closed, _) = watch::channel(false);

        Ok(Self {
            shared: Arc::new(Shared {
                io: Mutex::new(IoState {
                    reader: PacketReader::new(read_half),
                    sockets: HashMap::new(),
                    packet_count: 0,
                }),
                writer: Mutex::new(PacketWriter::new(write_half)),
                control: SyncMutex::new(Control::default()),
                settings: RwLock::new(config),
                budget,
                sender_released: Arc::new(Notify::new()),
                closed,
                release_queue: Arc::new(SyncMutex::new(Vec::new())),
                next_id: AtomicU32::new(1),
                packets_sent: AtomicU64::new(0),
                packets_received: AtomicU64::new(0),
            }),
        })
    }

    /// Register a new logical stream and return its request facade.
    pub async fn request_stream(&self) -> Result<RequestStream<T>> {
        let mut io = self.lock_io().await?;
        let id = StreamId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let buffer_dir = self.shared.settings.read().spill.buffer_dir.clone();
        io.sockets
            .insert(id, VirtualSocket::new(&self.shared.budget, buffer_dir));
        drop(io);

        let controller = Arc::new(CancelController::new());
        let registration = Arc::new(Registration {
            id,
            controller: Arc::clone(&controller),
            released: AtomicBool::new(false),
            release_queue: Arc::clone(&self.shared.release_queue),
            sender_released: Arc::clone(&self.shared.sender_released),
        });
        self.shared.control.lock().streams.insert(
            id,
            StreamEntry {
                controller,
                registration: Arc::downgrade(&registration),
                query_timeout: None,
            },
        );

        tracing::debug!(stream = %id, "opened stream");
        Ok(RequestStream::new(self.clone(), registration))
    }

    /// Response facade for a registered stream.
    pub fn response_stream(&self, id: StreamId) -> Result<ResponseStream<T>> {
        self.ensure_open()?;
        let registration = self
            .shared
            .control
            .lock()
            .streams
            .get(&id)
            .and_then(|entry| entry.registration.upgrade())
            .ok_or(Error::UnknownStream(id))?;
        Ok(ResponseStream::new(self.clone(), registration))
    }

    /// Send one physical packet for a stream.
    ///
    /// The packet goes on the wire immediately unless another stream owns
    /// the reply channel or is mid-request, in which case it is queued and
    /// written when this stream next reads.
    pub async fn send_packet(&self, id: StreamId, packet: Packet) -> Result<()> {
        let mut io = self.lock_io().await?;
        let (owner, sender) = {
            let control = self.shared.control.lock();
            (control.response_owner, control.current_sender)
        };

        let socket = io.sockets.get_mut(&id).ok_or(Error::UnknownStream(id))?;
        let last = packet.is_last();
        if let Some(packet_type) = packet.packet_type() {
            socket.packet_type = packet_type;
        }

        if !socket.input.is_empty() {
            tracing::warn!(
                stream = %id,
                packets = socket.input.len(),
                "discarding unread reply data"
            );
            socket.input.clear();
        }

        if owner == Some(id) {
            tracing::warn!(stream = %id, "new request before the previous reply was read");
            socket.flush_input = true;
        }

        if owner.is_some() || sender.is_some_and(|s| s != id) {
            socket.output.push(packet).await?;
            socket.complete = last;
            tracing::trace!(
                stream = %id,
                queued = socket.output.len(),
                on_disk = socket.output.is_on_disk(),
                last,
                "queued request packet"
            );
            return Ok(());
        }

        self.write_output(&mut io, id, Some(packet)).await?;
        self.finish_send(id, last);
        Ok(())
    }

    /// Next reply packet for a stream.
    ///
    /// Serves queued packets first. Otherwise drains any reply still owned
    /// by another stream, writes this stream's queued request and reads from
    /// the network.
    pub async fn get_net_packet(&self, id: StreamId) -> Result<Packet> {
        loop {
            let mut io = self.lock_io().await?;

            let socket = io.sockets.get_mut(&id).ok_or(Error::UnknownStream(id))?;
            if let Some(packet) = socket.input.pop().await? {
                socket.packets_received += 1;
                return Ok(packet);
            }
            let flush_input = socket.flush_input;

            let owner = self.shared.control.lock().response_owner;
            if let Some(owner) = owner.filter(|&owner| owner != id || flush_input) {
                let drained = self.drain_reply(&mut io, owner).await;
                self.check_fatal(drained)?;
            }

            let socket = io.sockets.get_mut(&id).ok_or(Error::UnknownStream(id))?;
            if !socket.output.is_empty() {
                if !socket.complete {
                    return Err(Error::RequestIncomplete(id));
                }

                let sender = self.shared.control.lock().current_sender;
                if sender.is_some_and(|s| s != id) {
                    let released = self.shared.sender_released.notified();
                    tokio::pin!(released);
                    released.as_mut().enable();
                    drop(io);
                    if !self.shared.release_queue.lock().is_empty() {
                        continue;
                    }

                    tracing::trace!(stream = %id, "waiting for current sender");
                    tokio::select! {
                        () = released => continue,
                        () = self.closed() => return Err(Error::ConnectionClosed),
                    }
                }

                self.write_output(&mut io, id, None).await?;
                self.finish_send(id, true);
            } else if self.shared.control.lock().response_owner != Some(id) {
                return Err(Error::NoRequest { stream: id });
            }

            return self.read_own_packet(&mut io, id).await;
        }
    }

    /// Ask the server to cancel the request of `id`.
    ///
    /// Only sends a CANCEL packet when `id` owns the reply channel, no stream
    /// is mid-request and no other cancel is pending. Returns whether a
    /// packet was sent; the acknowledgement is consumed by whoever reads the
    /// reply.
    pub async fn cancel(&self, id: StreamId) -> Result<bool> {
        if !self.is_connected() {
            return Ok(false);
        }
        let (tds7, tail_size) = {
            let settings = self.shared.settings.read();
            (
                settings.tds_version.header_flag(),
                settings.tds_version.done_token_length(),
            )
        };

        let controller = {
            let mut control = self.shared.control.lock();
            if control.response_owner != Some(id)
                || control.current_sender.is_some()
                || control.cancel_pending
            {
                return Ok(false);
            }
            let Some(controller) = control.streams.get(&id).map(|e| Arc::clone(&e.controller))
            else {
                return Ok(false);
            };
            if !controller.request_cancel() {
                return Ok(false);
            }
            control.cancel_pending = true;
            control.done_tail.reset(tail_size);
            controller
        };

        if let Err(e) = self.write_direct(Packet::cancel(tds7)).await {
            controller.revoke_cancel();
            self.shared.control.lock().cancel_pending = false;
            return Err(e);
        }

        tracing::debug!(stream = %id, "sent cancel");
        Ok(true)
    }

    /// Release a stream now.
    ///
    /// A stream released mid-request is terminated with an empty final
    /// packet and its reply is discarded.
    pub async fn close_stream(&self, id: StreamId) -> Result<()> {
        if !self.is_connected() {
            self.shared.control.lock().streams.remove(&id);
            return Ok(());
        }
        let mut io = self.lock_io().await?;
        self.release(&mut io, id).await
    }

    /// Set the query timeout of a stream. `None` waits forever.
    pub fn set_query_timeout(&self, id: StreamId, timeout: Option<Duration>) -> Result<()> {
        let mut control = self.shared.control.lock();
        let entry = control
            .streams
            .get_mut(&id)
            .ok_or(Error::UnknownStream(id))?;
        entry.query_timeout = timeout;
        Ok(())
    }

    /// Force-close the transport once `delay` elapses, unless the guard is
    /// dropped first. Used for login timeouts.
    pub fn arm_close_timer(&self, delay: Duration) -> TimerGuard {
        let shared = Arc::downgrade(&self.shared);
        TimerGuard::spawn(delay, async move {
            if let Some(shared) = shared.upgrade() {
                tracing::debug!("close timer expired");
                (Multiplexer { shared }).force_close();
            }
        })
    }

    /// Cancel the request of `id` once `delay` elapses, unless the guard is
    /// dropped first.
    pub fn arm_cancel_timer(&self, id: StreamId, delay: Duration) -> TimerGuard {
        let shared = Arc::downgrade(&self.shared);
        TimerGuard::spawn(delay, async move {
            if let Some(shared) = shared.upgrade() {
                tracing::debug!(stream = %id, "cancel timer expired");
                if let Err(e) = (Multiplexer { shared }).cancel(id).await {
                    tracing::debug!(stream = %id, error = %e, "timed cancel failed");
                }
            }
        })
    }

    /// Close the transport, delete spill files and shut down the write half.
    pub async fn close(&self) {
        self.force_close();

        let mut io = self.shared.io.lock().await;
        io.sockets.clear();
        drop(io);

        {
            let mut control = self.shared.control.lock();
            control.streams.clear();
            control.response_owner = None;
            control.current_sender = None;
        }

        tracing::debug!(
            peak_memory = self.shared.budget.peak_memory_usage(),
            "transport closed"
        );

        if let Err(e) = self.shared.writer.lock().await.shutdown().await {
            tracing::debug!(error = %e, "shutdown of write half failed");
        }
    }

    async fn lock_io(&self) -> Result<MutexGuard<'_, IoState<T>>> {
        self.ensure_open()?;
        let mut io = self.shared.io.lock().await;
        self.ensure_open()?;

        let released = std::mem::take(&mut *self.shared.release_queue.lock());
        for id in released {
            self.release(&mut io, id).await?;
        }
        Ok(io)
    }

    async fn release(&self, io: &mut IoState<T>, id: StreamId) -> Result<()> {
        let Some(socket) = io.sockets.remove(&id) else {
            return Ok(());
        };
        let was_sender = {
            let mut control = self.shared.control.lock();
            control.streams.remove(&id);
            control.current_sender == Some(id)
        };

        if was_sender {
            tracing::warn!(stream = %id, "stream released mid-request, terminating request");
            let tds7 = self.tds_version().header_flag();
            let header = PacketHeader::new(socket.packet_type, PacketStatus::END_OF_MESSAGE, 0)
                .with_tds7(tds7);
            self.write_direct(Packet::new(header, &[])).await?;
            {
                let mut control = self.shared.control.lock();
                control.current_sender = None;
                control.response_owner = Some(id);
            }
            self.shared.sender_released.notify_waiters();
        }

        tracing::debug!(
            stream = %id,
            sent = socket.packets_sent,
            received = socket.packets_received,
            "released stream"
        );
        Ok(())
    }

    /// Write the stream's queued packets, then `extra`, and flush.
    async fn write_output(
        &self,
        io: &mut IoState<T>,
        id: StreamId,
        extra: Option<Packet>,
    ) -> Result<()> {
        let socket = io.sockets.get_mut(&id).ok_or(Error::UnknownStream(id))?;
        let sent = &self.shared.packets_sent;
        let mut writer = self.shared.writer.lock().await;

        let result = tokio::select! {
            result = async {
                while let Some(packet) = socket.output.pop().await? {
                    trace_packet(id, "sent", &packet);
                    writer.write_packet(packet).await?;
                    socket.packets_sent += 1;
                    sent.fetch_add(1, Ordering::Relaxed);
                }
                if let Some(packet) = extra {
                    trace_packet(id, "sent", &packet);
                    writer.write_packet(packet).await?;
                    socket.packets_sent += 1;
                    sent.fetch_add(1, Ordering::Relaxed);
                }
                writer.flush().await
            } => result,
            () = self.closed() => Err(Error::ConnectionClosed),
        };
        drop(writer);

        socket.complete = false;
        self.check_fatal(result)
    }

    async fn write_direct(&self, packet: Packet) -> Result<()> {
        let mut writer = self.shared.writer.lock().await;
        let result = tokio::select! {
            result = async {
                writer.write_packet(packet).await?;
                writer.flush().await
            } => result,
            () = self.closed() => Err(Error::ConnectionClosed),
        };
        drop(writer);

        if result.is_ok() {
            self.shared.packets_sent.fetch_add(1, Ordering::Relaxed);
        }
        self.check_fatal(result)
    }

    fn finish_send(&self, id: StreamId, last: bool) {
        let mut control = self.shared.control.lock();
        if last {
            control.current_sender = None;
            control.response_owner = Some(id);
            if let Some(entry) = control.streams.get(&id) {
                entry.controller.mark_awaiting_response();
            }
            drop(control);
            self.shared.sender_released.notify_waiters();
            tracing::debug!(stream = %id, "stream owns the response");
        } else {
            control.current_sender = Some(id);
        }
    }

    /// Read the rest of `owner`'s reply, queueing it for `owner` unless its
    /// input is being flushed or it has been released.
    async fn drain_reply(&self, io: &mut IoState<T>, owner: StreamId) -> Result<()> {
        tracing::debug!(stream = %owner, "draining reply");
        loop {
            let packet = self.read_packet(io).await?;
            let last = packet.is_last();
            match io.sockets.get_mut(&owner) {
                Some(socket) if !socket.flush_input => socket.input.push(packet).await?,
                _ => trace_packet(owner, "discarded", &packet),
            }
            if last {
                break;
            }
        }
        if let Some(socket) = io.sockets.get_mut(&owner) {
            socket.flush_input = false;
        }
        Ok(())
    }

    async fn read_own_packet(&self, io: &mut IoState<T>, id: StreamId) -> Result<Packet> {
        let timeout = self
            .shared
            .control
            .lock()
            .streams
            .get(&id)
            .and_then(|entry| entry.query_timeout);

        let packet = match timeout {
            None => self.read_packet(io).await?,
            Some(limit) => {
                let outcome = tokio::time::timeout(limit, self.read_packet(io)).await;
                match outcome {
                    Ok(result) => result?,
                    Err(_) => return self.abandon_reply(io, id).await,
                }
            }
        };

        if let Some(socket) = io.sockets.get_mut(&id) {
            socket.packets_received += 1;
        }
        Ok(packet)
    }

    /// Cancel the reply of `id`, discard it up to the acknowledgement and
    /// report a timeout.
    async fn abandon_reply(&self, io: &mut IoState<T>, id: StreamId) -> Result<Packet> {
        tracing::debug!(stream = %id, "query timed out, canceling");
        // A cancel sent earlier is acknowledged by the same reply.
        let canceled = self.cancel(id).await? || self.shared.control.lock().cancel_pending;

        loop {
            let packet = self.read_packet(io).await?;
            trace_packet(id, "discarded", &packet);
            if packet.is_last() {
                break;
            }
        }

        let acknowledged = canceled && !self.shared.control.lock().cancel_pending;
        if let Some(controller) = self.controller(id) {
            controller.finish_response(acknowledged, false);
        }
        Err(Error::Timeout)
    }

    async fn read_packet(&self, io: &mut IoState<T>) -> Result<Packet> {
        let result = self.read_packet_inner(io).await;
        self.check_fatal(result)
    }

    async fn read_packet_inner(&self, io: &mut IoState<T>) -> Result<Packet> {
        let (socket_timeout, server_type) = {
            let settings = self.shared.settings.read();
            (settings.socket_timeout, settings.server_type)
        };

        loop {
            let mut packet = tokio::select! {
                result = read_with_timeout(&mut io.reader, socket_timeout) => result?,
                () = self.closed() => return Err(Error::ConnectionClosed),
            };
            io.packet_count += 1;
            self.shared.packets_received.fetch_add(1, Ordering::Relaxed);

            // SQL Server 2000 before SP3 leaves the last flag off the NTLM
            // challenge.
            if io.packet_count == 1
                && server_type == ServerType::SqlServer
                && packet.payload().get(3..10) == Some(&b"NTLMSSP"[..])
            {
                packet.set_last(true);
            }

            if self.accept_packet(&mut packet)? {
                return Ok(packet);
            }
        }
    }

    /// Update ownership and cancel state for a packet just read. Returns
    /// `false` if the packet is a stray cancel acknowledgement to drop.
    fn accept_packet(&self, packet: &mut Packet) -> Result<bool> {
        let mut control = self.shared.control.lock();
        if control.is_stray_cancel_ack(packet) {
            tracing::debug!("discarding stray cancel acknowledgement");
            return Ok(false);
        }
        if control.cancel_pending {
            control.track_cancel_ack(packet)?;
        }

        control.response_complete = packet.is_last();
        if packet.is_last() {
            control.response_owner = None;
        }
        tracing::trace!(
            packet_type = packet.type_byte(),
            length = packet.len(),
            last = packet.is_last(),
            "received packet"
        );
        Ok(true)
    }

    fn check_fatal<R>(&self, result: Result<R>) -> Result<R> {
        if let Err(e) = &result {
            if e.is_fatal() {
                tracing::debug!(error = %e, "fatal transport error");
                self.force_close();
            }
        }
        result
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::ConnectionClosed)
        }
    }
}

impl<T> Multiplexer<T> {
    /// Abort every pending read and write with [`Error::ConnectionClosed`].
    ///
    /// Affects all streams sharing the transport.
    pub fn force_close(&self) {
        if !self.shared.closed.send_replace(true) {
            tracing::debug!("transport force-closed");
        }
    }

    /// Whether the transport is still usable.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !*self.shared.closed.borrow()
    }

    fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shared.closed.subscribe();
        async move {
            let _ = rx.wait_for(|closed| *closed).await;
        }
    }

    /// Fail physical reads that stall longer than `timeout`.
    pub fn set_socket_timeout(&self, timeout: Option<Duration>) {
        self.shared.settings.write().socket_timeout = timeout;
    }

    /// Set the packet size used by request streams created from now on.
    pub fn set_packet_size(&self, size: usize) -> Result<()> {
        validate_packet_size(size)?;
        let mut settings = self.shared.settings.write();
        settings.packet_size = size;
        settings.max_packet_size = settings.max_packet_size.max(size);
        Ok(())
    }

    /// Set the negotiated protocol version.
    pub fn set_tds_version(&self, version: TdsVersion) {
        self.shared.settings.write().tds_version = version;
    }

    /// Set the codepage used for strings on pre-7.0 protocol versions.
    pub fn set_charset(&self, charset: &'static Encoding) {
        self.shared.settings.write().charset = charset;
    }

    /// Negotiated protocol version.
    #[must_use]
    pub fn tds_version(&self) -> TdsVersion {
        self.shared.settings.read().tds_version
    }

    /// Server family.
    #[must_use]
    pub fn server_type(&self) -> ServerType {
        self.shared.settings.read().server_type
    }

    /// Codepage for pre-7.0 strings.
    #[must_use]
    pub fn charset(&self) -> &'static Encoding {
        self.shared.settings.read().charset
    }

    pub(crate) fn packet_sizes(&self) -> (usize, usize) {
        let settings = self.shared.settings.read();
        (settings.packet_size, settings.max_packet_size)
    }

    pub(crate) fn max_precision(&self) -> u8 {
        self.shared.settings.read().max_precision
    }

    /// Cancel controller of a registered stream.
    #[must_use]
    pub fn controller(&self, id: StreamId) -> Option<Arc<CancelController>> {
        self.shared
            .control
            .lock()
            .streams
            .get(&id)
            .map(|entry| Arc::clone(&entry.controller))
    }

    /// Stream currently owning the reply channel.
    #[must_use]
    pub fn response_owner(&self) -> Option<StreamId> {
        self.shared.control.lock().response_owner
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> MuxStats {
        let (open_streams, response_owner) = {
            let control = self.shared.control.lock();
            (control.streams.len(), control.response_owner)
        };
        MuxStats {
            packets_sent: self.shared.packets_sent.load(Ordering::Relaxed),
            packets_received: self.shared.packets_received.load(Ordering::Relaxed),
            open_streams,
            response_owner,
            memory_usage: self.shared.budget.memory_usage(),
            peak_memory_usage: self.shared.budget.peak_memory_usage(),
        }
    }
}

async fn read_with_timeout<R>(
    reader: &mut PacketReader<R>,
    timeout: Option<Duration>,
) -> Result<Packet>
where
    R: AsyncRead + Unpin,
{
    match timeout {
        None => reader.read_packet().await,
        Some(limit) => tokio::time::timeout(limit, reader.read_packet())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "socket read timed out"))?,
    }
}

fn trace_packet(id: StreamId, action: &'static str, packet: &Packet) {
    tracing::trace!(
        stream = %id,
        packet_type = packet.type_byte(),
        length = packet.len(),
        last = packet.is_last(),
        "{action} packet"
    );
}
