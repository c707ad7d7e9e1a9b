//! Memory-then-disk packet queues.
//!
//! Packets that cannot be handed to their stream yet are kept in an
//! in-memory FIFO. Once the process-wide memory budget is exhausted and a
//! queue already holds `min_memory_packets` packets, the queue moves to a
//! temporary file and stays there until drained.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::BytesMut;
use once_cell::sync::Lazy;
use tds_protocol::packet::{MAX_FRAME_LENGTH, PACKET_HEADER_SIZE, PacketHeader};
use tds_protocol::ProtocolError;
use tempfile::NamedTempFile;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::config::SpillConfig;
use crate::error::Result;
use crate::packet_codec::Packet;

static GLOBAL_BUDGET: Lazy<Arc<SpillBudget>> = Lazy::new(|| {
    let budget = SpillBudget::new(&SpillConfig::default());
    budget.limits_fixed.store(false, Ordering::Relaxed);
    Arc::new(budget)
});

/// Memory accounting shared by every spill queue that uses it.
///
/// The usage counters are advisory; they only decide when to spill.
///
/// Limits are fixed once: a budget built with [`SpillBudget::new`] keeps the
/// limits it was built with, and the process-wide budget takes the limits of
/// the first transport that uses it.
#[derive(Debug)]
pub struct SpillBudget {
    usage: AtomicUsize,
    peak: AtomicUsize,
    disk_disabled: AtomicBool,
    memory_budget: AtomicUsize,
    min_memory_packets: AtomicUsize,
    limits_fixed: AtomicBool,
}

impl SpillBudget {
    /// Create an isolated budget.
    #[must_use]
    pub fn new(config: &SpillConfig) -> Self {
        Self {
            usage: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            disk_disabled: AtomicBool::new(false),
            memory_budget: AtomicUsize::new(config.memory_budget),
            min_memory_packets: AtomicUsize::new(config.min_memory_packets),
            limits_fixed: AtomicBool::new(true),
        }
    }

    /// The process-wide budget shared by all transports.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL_BUDGET)
    }

    /// Apply the limits of a configuration unless limits are already
    /// fixed. Returns whether they were applied.
    pub fn configure(&self, config: &SpillConfig) -> bool {
        if self.limits_fixed.swap(true, Ordering::AcqRel) {
            let unchanged = self.memory_budget.load(Ordering::Relaxed) == config.memory_budget
                && self.min_memory_packets.load(Ordering::Relaxed) == config.min_memory_packets;
            if !unchanged {
                tracing::debug!(
                    memory_budget = config.memory_budget,
                    min_memory_packets = config.min_memory_packets,
                    "spill limits already fixed, ignoring"
                );
            }
            return false;
        }
        self.memory_budget
            .store(config.memory_budget, Ordering::Relaxed);
        self.min_memory_packets
            .store(config.min_memory_packets, Ordering::Relaxed);
        true
    }

    /// Bytes currently held in memory queues.
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        self.usage.load(Ordering::Relaxed)
    }

    /// Highest memory usage observed.
    #[must_use]
    pub fn peak_memory_usage(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Whether disk spilling has been disabled after a permission failure.
    #[must_use]
    pub fn is_disk_disabled(&self) -> bool {
        self.disk_disabled.load(Ordering::Relaxed)
    }

    fn disable_disk(&self) {
        self.disk_disabled.store(true, Ordering::Relaxed);
    }

    fn should_spill(&self, len: usize, queued: usize) -> bool {
        self.memory_usage() + len > self.memory_budget.load(Ordering::Relaxed)
            && queued >= self.min_memory_packets.load(Ordering::Relaxed)
            && !self.is_disk_disabled()
    }

    fn acquire(&self, len: usize) {
        let usage = self.usage.fetch_add(len, Ordering::Relaxed) + len;
        self.peak.fetch_max(usage, Ordering::Relaxed);
    }

    fn release(&self, len: usize) {
        let _ = self
            .usage
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |usage| {
                Some(usage.saturating_sub(len))
            });
    }
}

/// Append-only temporary file with a separate read cursor.
struct DiskQueue {
    handle: File,
    // Deleted when dropped.
    _file: NamedTempFile,
    read_pos: u64,
    write_pos: u64,
    count: usize,
}

impl DiskQueue {
    fn create(dir: Option<&Path>) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("tds").suffix(".tmp");
        let file = match dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        let handle = File::from_std(file.reopen()?);

        tracing::debug!(path = %file.path().display(), "created spill file");

        Ok(Self {
            handle,
            _file: file,
            read_pos: 0,
            write_pos: 0,
            count: 0,
        })
    }

    async fn append(&mut self, packet: &Packet) -> io::Result<()> {
        self.handle.seek(SeekFrom::Start(self.write_pos)).await?;
        self.handle.write_all(packet.as_bytes()).await?;
        self.handle.flush().await?;
        self.write_pos += packet.len() as u64;
        self.count += 1;
        Ok(())
    }

    async fn pop(&mut self) -> Result<Packet> {
        self.handle.seek(SeekFrom::Start(self.read_pos)).await?;

        let mut header = [0u8; PACKET_HEADER_SIZE];
        self.handle.read_exact(&mut header).await?;
        let length = PacketHeader::peek_length(&header).unwrap_or_default();
        if !(PACKET_HEADER_SIZE..=MAX_FRAME_LENGTH).contains(&length) {
            return Err(ProtocolError::InvalidLength(length).into());
        }

        let mut frame = BytesMut::zeroed(length);
        frame[..PACKET_HEADER_SIZE].copy_from_slice(&header);
        self.handle
            .read_exact(&mut frame[PACKET_HEADER_SIZE..])
            .await?;

        self.read_pos += length as u64;
        self.count -= 1;
        Packet::from_frame(frame)
    }
}

/// FIFO packet queue that overflows to disk.
pub(crate) struct SpillQueue {
    memory: std::collections::VecDeque<Packet>,
    disk: Option<DiskQueue>,
    budget: Arc<SpillBudget>,
    buffer_dir: Option<PathBuf>,
}

impl SpillQueue {
    pub(crate) fn new(budget: Arc<SpillBudget>, buffer_dir: Option<PathBuf>) -> Self {
        Self {
            memory: std::collections::VecDeque::new(),
            disk: None,
            budget,
            buffer_dir,
        }
    }

    /// Number of queued packets.
    pub(crate) fn len(&self) -> usize {
        self.memory.len() + self.disk.as_ref().map_or(0, |d| d.count)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue currently lives on disk.
    pub(crate) fn is_on_disk(&self) -> bool {
        self.disk.is_some()
    }

    /// Append a packet.
    ///
    /// Failing to create a spill file keeps the packet in memory; a
    /// permission failure disables disk spilling for every queue sharing the
    /// budget. Write errors on an existing spill file are returned.
    pub(crate) async fn push(&mut self, packet: Packet) -> Result<()> {
        if self.disk.is_none() && self.budget.should_spill(packet.len(), self.memory.len()) {
            self.spill_to_disk().await;
        }

        match &mut self.disk {
            Some(disk) => disk.append(&packet).await?,
            None => {
                self.budget.acquire(packet.len());
                self.memory.push_back(packet);
            }
        }
        Ok(())
    }

    async fn spill_to_disk(&mut self) {
        let mut disk = match DiskQueue::create(self.buffer_dir.as_deref()) {
            Ok(disk) => disk,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                tracing::warn!(error = %e, "spill file not permitted, disk cache disabled");
                self.budget.disable_disk();
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to create spill file, keeping packet in memory");
                return;
            }
        };

        for packet in &self.memory {
            if let Err(e) = disk.append(packet).await {
                tracing::warn!(error = %e, "failed to migrate packets to spill file");
                return;
            }
        }

        let migrated: usize = self.memory.drain(..).map(|p| p.len()).sum();
        self.budget.release(migrated);
        tracing::debug!(
            packets = disk.count,
            bytes = migrated,
            "spilled queue to disk"
        );
        self.disk = Some(disk);
    }

    /// Remove the oldest packet.
    ///
    /// The spill file is deleted once its last packet has been read.
    pub(crate) async fn pop(&mut self) -> Result<Option<Packet>> {
        if let Some(disk) = &mut self.disk {
            let packet = disk.pop().await?;
            if disk.count == 0 {
                self.disk = None;
                tracing::debug!("spill file drained");
            }
            return Ok(Some(packet));
        }

        Ok(self.memory.pop_front().inspect(|p| self.budget.release(p.len())))
    }

    /// Discard everything queued.
    pub(crate) fn clear(&mut self) {
        let bytes: usize = self.memory.drain(..).map(|p| p.len()).sum();
        self.budget.release(bytes);
        self.disk = None;
    }
}

impl Drop for SpillQueue {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for SpillQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpillQueue")
            .field("memory", &self.memory.len())
            .field("on_disk", &self.disk.as_ref().map_or(0, |d| d.count))
            .finish_non_exhaustive()
    }
}
