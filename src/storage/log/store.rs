use std::{
    io,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{self, Semaphore, mpsc},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{StorageError, report},
    message::{HardState, LogEntry, LogManagerMeta},
    traits::StorageResult,
    types::LogPosition,
};

use super::{
    entry::{EntryPosition, LogBuffer, OffsetIndex},
    manager::recover,
    meta::{MetaFile, PersistedMeta},
    segment::{LogSegment, RECORD_HEADER_SIZE, SegmentName, decode_records},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogStoreOptions {
    /// Directory holding `meta` and the segment files of one group
    pub dir: PathBuf,
    /// Capacity in bytes of each half of the write buffer
    pub buffer_capacity: usize,
    /// Open segment size in bytes that triggers a seal (default: 64MB)
    pub max_segment_size: u64,
    /// Maximum entries returned by one `get_logs` call
    pub max_fetch: usize,
    /// Entry positions kept in memory; older ones are read from sealed index files
    pub max_in_memory_offsets: usize,
    pub max_sealed_segments: usize,
    /// Maximum distance between the oldest retained index and the commit index
    pub max_retained_gap: u64,
    pub flush_interval_ms: u64,
    pub retention_interval_ms: u64,
    /// Bounded wait for the flush worker on close
    pub shutdown_wait_ms: u64,
    // max number of concurrent blocking segment reads
    pub max_io_threads: usize,
}

impl Default for LogStoreOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/raft/log"),
            buffer_capacity: 16 * 1024 * 1024,
            max_segment_size: 64 * 1024 * 1024, // 64MB
            max_fetch: 1000,
            max_in_memory_offsets: 100_000,
            max_sealed_segments: 128,
            max_retained_gap: 1_000_000,
            flush_interval_ms: 1000,
            retention_interval_ms: 60_000,
            shutdown_wait_ms: 5000,
            max_io_threads: 4,
        }
    }
}

impl LogStoreOptions {
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub enum FlushSignal {
    Drain,
    Shutdown,
}

/// The live half of the double buffer and the write position in the open segment.
#[derive(Debug)]
pub(crate) struct WriteState {
    pub(crate) active: LogBuffer,
    pub(crate) segment_start: u64,
    /// Data-file size of the open segment including buffered records
    pub(crate) segment_size: u64,
}

#[derive(Debug, Default)]
pub(crate) struct SegmentSet {
    pub(crate) sealed: Vec<LogSegment>,
    pub(crate) open: Option<LogSegment>,
}

impl SegmentSet {
    pub(crate) fn find(&self, index: u64) -> Option<&LogSegment> {
        if let Some(open) = self.open.as_ref().filter(|s| s.contains(index)) {
            return Some(open);
        }
        let pos = self
            .sealed
            .partition_point(|s| s.next_index() <= index);
        self.sealed.get(pos).filter(|s| s.contains(index))
    }

    pub(crate) fn names(&self) -> Vec<SegmentName> {
        self.sealed
            .iter()
            .chain(self.open.iter())
            .map(|s| s.name)
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct LogState {
    pub(crate) meta: LogManagerMeta,
    pub(crate) hard_state: HardState,
    pub(crate) first_index: u64,
    /// Last entry written to a segment file
    pub(crate) durable: LogPosition,
    pub(crate) min_version: u64,
    pub(crate) max_version: u64,
}

impl LogState {
    /// Meta as written to disk: never claims a commit beyond what the segments hold.
    pub(crate) fn to_persisted(&self) -> PersistedMeta {
        let mut log = self.meta;
        log.last_log_index = self.durable.index;
        log.last_log_term = self.durable.term;
        if log.commit_log_index > self.durable.index {
            log.commit_log_index = self.durable.index;
            log.commit_log_term = self.durable.term;
        }
        log.max_have_applied_commit_index =
            log.max_have_applied_commit_index.min(log.commit_log_index);
        PersistedMeta {
            log,
            hard_state: self.hard_state.clone(),
            min_version: self.min_version,
            max_version: self.max_version,
        }
    }
}

pub struct LogStoreInner {
    pub(crate) options: LogStoreOptions,
    pub(crate) meta_file: MetaFile,
    // lock order: write -> flushing -> segments -> offsets -> state
    pub(crate) write: sync::Mutex<WriteState>,
    pub(crate) flushing: sync::Mutex<LogBuffer>,
    pub(crate) segments: RwLock<SegmentSet>,
    pub(crate) offsets: RwLock<OffsetIndex>,
    pub(crate) state: RwLock<LogState>,
    pub(crate) meta_lock: Mutex<()>,
    pub(crate) io_semaphore: Arc<Semaphore>,
    pub(crate) flush_tx: mpsc::UnboundedSender<FlushSignal>,
    pub(crate) closed: AtomicBool,
}

#[derive(Default)]
struct Workers {
    flush: Option<JoinHandle<()>>,
    retention: Option<JoinHandle<()>>,
}

/// Segmented, crash-recoverable log of one replication group.
#[derive(Clone)]
pub struct LogStore {
    pub(crate) inner: Arc<LogStoreInner>,
    workers: Arc<Mutex<Workers>>,
}

fn join_error(e: tokio::task::JoinError) -> StorageError {
    StorageError::Io(io::Error::other(e))
}

impl LogStore {
    /// Recovers the directory and returns the store along with the receiver that should be
    /// passed to the `start` method.
    pub fn new(
        options: LogStoreOptions,
    ) -> StorageResult<(Self, mpsc::UnboundedReceiver<FlushSignal>)> {
        let meta_file = MetaFile::new(&options.dir);
        let recovered = recover(&options, &meta_file)?;
        let next_index = recovered.state.meta.last_log_index + 1;
        let (segment_start, segment_size) = match &recovered.segments.open {
            Some(open) => (open.start_index(), open.data_len),
            None => (next_index, 0),
        };
        info!(
            "Opened log store at {:?}: entries [{}, {}], commit {}, {} segments",
            options.dir,
            recovered.state.first_index,
            recovered.state.meta.last_log_index,
            recovered.state.meta.commit_log_index,
            recovered.segments.sealed.len() + usize::from(recovered.segments.open.is_some())
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let inner = LogStoreInner {
            io_semaphore: Arc::new(Semaphore::new(options.max_io_threads.max(1))),
            options,
            meta_file,
            write: sync::Mutex::new(WriteState {
                active: LogBuffer::new(segment_start, next_index),
                segment_start,
                segment_size,
            }),
            flushing: sync::Mutex::new(LogBuffer::new(segment_start, next_index)),
            segments: RwLock::new(recovered.segments),
            offsets: RwLock::new(recovered.offsets),
            state: RwLock::new(recovered.state),
            meta_lock: Mutex::new(()),
            flush_tx: tx,
            closed: AtomicBool::new(false),
        };
        let store = Self {
            inner: Arc::new(inner),
            workers: Arc::new(Mutex::new(Workers::default())),
        };
        Ok((store, rx))
    }

    /// Spawns the flush worker and the retention task. Must run inside a tokio runtime.
    pub fn start(&self, rx: mpsc::UnboundedReceiver<FlushSignal>) {
        let flush = tokio::spawn(run_flush_worker(self.inner.clone(), rx));
        let retention = tokio::spawn(run_retention(self.inner.clone()));
        let mut workers = self.workers.lock();
        workers.flush = Some(flush);
        workers.retention = Some(retention);
    }

    pub fn open(options: LogStoreOptions) -> StorageResult<Self> {
        let (store, rx) = Self::new(options)?;
        store.start(rx);
        Ok(store)
    }

    pub fn options(&self) -> &LogStoreOptions {
        &self.inner.options
    }

    /// Buffers `entries`, which must continue the log, and raises the applied watermark.
    pub async fn append(
        &self,
        entries: &[LogEntry],
        applied_index_watermark: u64,
    ) -> StorageResult<()> {
        self.inner.append(entries, applied_index_watermark).await
    }

    pub async fn flush(&self, forced: bool) -> StorageResult<()> {
        self.inner.flush(forced).await
    }

    /// Entries in `[start, end]`, truncated to `max_fetch` entries and to the last index.
    pub async fn get_logs(&self, start: u64, end: u64) -> StorageResult<Vec<LogEntry>> {
        self.inner.get_logs(start, end).await
    }

    pub async fn get_entry(&self, index: u64) -> StorageResult<LogEntry> {
        self.inner
            .get_logs(index, index)
            .await?
            .pop()
            .ok_or(StorageError::LogNotFound(index))
    }

    pub async fn term_at(&self, index: u64) -> StorageResult<u64> {
        self.inner.term_at(index).await
    }

    /// Removes every entry after `index`. Committed entries cannot be removed.
    pub async fn truncate_after(&self, index: u64) -> StorageResult<()> {
        self.inner.truncate_after(index).await
    }

    /// Drops the whole log; the next entry appended must be `next_index`.
    pub async fn reset(&self, next_index: u64, last_term: u64) -> StorageResult<()> {
        self.inner.reset(next_index, last_term).await
    }

    /// Deletes sealed segments that end at or before `upto`.
    pub async fn compact(&self, upto: u64) -> StorageResult<usize> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.compact(upto))
            .await
            .map_err(join_error)?
    }

    pub async fn check_delete_persist_raft_log(&self) -> StorageResult<usize> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.check_delete_persist_raft_log())
            .await
            .map_err(join_error)?
    }

    pub fn first_index(&self) -> u64 {
        self.inner.state.read().first_index
    }

    pub fn last_position(&self) -> LogPosition {
        let state = self.inner.state.read();
        LogPosition::new(state.meta.last_log_index, state.meta.last_log_term)
    }

    pub fn last_log_index(&self) -> u64 {
        self.inner.state.read().meta.last_log_index
    }

    pub fn commit_index(&self) -> u64 {
        self.inner.state.read().meta.commit_log_index
    }

    pub fn applied_index(&self) -> u64 {
        self.inner.state.read().meta.max_have_applied_commit_index
    }

    pub fn meta(&self) -> LogManagerMeta {
        self.inner.state.read().meta
    }

    pub fn hard_state(&self) -> HardState {
        self.inner.state.read().hard_state.clone()
    }

    /// Records `hard_state` in memory and returns whether it changed. Nothing reaches the disk
    /// before [`Self::persist_hard_state`] or the next forced flush.
    pub fn stage_hard_state(&self, hard_state: HardState) -> bool {
        let mut state = self.inner.state.write();
        if state.hard_state == hard_state {
            return false;
        }
        state.hard_state = hard_state;
        true
    }

    /// Writes the latest staged hard state to the meta file on the blocking pool.
    pub async fn persist_hard_state(&self) -> StorageResult<()> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.persist_hard_state())
            .await
            .map_err(join_error)?
    }

    pub async fn save_hard_state(&self, hard_state: HardState) -> StorageResult<()> {
        if self.stage_hard_state(hard_state) {
            self.persist_hard_state().await?;
        }
        Ok(())
    }

    /// Advances the commit index to `min(index, last_log_index)`. Returns whether it moved.
    pub async fn commit_to(&self, index: u64) -> StorageResult<bool> {
        let (target, commit) = {
            let state = self.inner.state.read();
            (
                index.min(state.meta.last_log_index),
                state.meta.commit_log_index,
            )
        };
        if target <= commit {
            return Ok(false);
        }
        let term = self.inner.term_at(target).await?;
        let mut state = self.inner.state.write();
        if target > state.meta.commit_log_index {
            state.meta.commit_log_index = target;
            state.meta.commit_log_term = term;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn set_applied(&self, index: u64) {
        let mut state = self.inner.state.write();
        let index = index.min(state.meta.commit_log_index);
        if index > state.meta.max_have_applied_commit_index {
            state.meta.max_have_applied_commit_index = index;
        }
    }

    pub fn segment_names(&self) -> Vec<SegmentName> {
        self.inner.segments.read().names()
    }

    pub fn in_memory_offsets(&self) -> usize {
        self.inner.offsets.read().len()
    }

    /// Flushes and syncs everything, then stops the background workers.
    pub async fn close(&self) -> StorageResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.inner.flush(true).await;
        let _ = self.inner.flush_tx.send(FlushSignal::Shutdown);

        let workers = std::mem::take(&mut *self.workers.lock());
        let wait = Duration::from_millis(self.inner.options.shutdown_wait_ms);
        if let Some(flush) = workers.flush {
            if tokio::time::timeout(wait, flush).await.is_err() {
                warn!("Flush worker of {:?} did not stop within {:?}", self.inner.options.dir, wait);
            }
        }
        if let Some(retention) = workers.retention {
            retention.abort();
        }
        info!("Closed log store at {:?}", self.inner.options.dir);
        result
    }
}

impl LogStoreInner {
    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    pub(crate) fn name(&self) -> String {
        self.options.dir.display().to_string()
    }

    pub(crate) async fn append(
        self: &Arc<Self>,
        entries: &[LogEntry],
        applied_index_watermark: u64,
    ) -> StorageResult<()> {
        self.ensure_open()?;
        let capacity = self.options.buffer_capacity;
        let mut write = self.write.lock().await;
        for entry in entries {
            let expected = self.state.read().meta.last_log_index + 1;
            if entry.curr_log_index != expected {
                return Err(StorageError::Consistency(format!(
                    "append of index {} but the next index is {}",
                    entry.curr_log_index, expected
                )));
            }

            let payload = entry.serialize();
            let record_len = RECORD_HEADER_SIZE as usize + payload.len();
            if record_len > capacity {
                error!(
                    "Log entry {} needs {} bytes but the write buffer of {:?} holds {}",
                    entry.curr_log_index, record_len, self.options.dir, capacity
                );
                return Err(StorageError::BufferCapacityExceeded {
                    size: record_len,
                    capacity,
                });
            }
            if write.active.data.len() + record_len > capacity {
                self.swap_buffers(&mut write, false).await?;
            }

            let offset = write.segment_size;
            let segment_start = write.segment_start;
            write.active.push(offset, &payload, entry.curr_log_term);
            write.segment_size += record_len as u64;
            self.offsets.write().push(
                entry.curr_log_index,
                EntryPosition {
                    segment_start,
                    offset,
                },
            );
            {
                let mut state = self.state.write();
                state.meta.last_log_index = entry.curr_log_index;
                state.meta.last_log_term = entry.curr_log_term;
            }

            if write.segment_size > self.options.max_segment_size {
                // the entry is in the log already, the next append retries the seal
                if let Err(e) = self.swap_buffers(&mut write, true).await {
                    warn!(
                        "Failed to seal log segment of {:?} after entry {}: {}",
                        self.options.dir, entry.curr_log_index, e
                    );
                }
            }
        }

        let mut state = self.state.write();
        let watermark = applied_index_watermark.min(state.meta.commit_log_index);
        if watermark > state.meta.max_have_applied_commit_index {
            state.meta.max_have_applied_commit_index = watermark;
        }
        Ok(())
    }

    /// Hands the live buffer to the flush worker and continues in the other half.
    async fn swap_buffers(self: &Arc<Self>, write: &mut WriteState, seal: bool) -> StorageResult<()> {
        let mut flushing = self.flushing.lock().await;
        if !flushing.is_empty() {
            // the worker has not picked up the previous half yet
            self.drain(&mut flushing).await?;
        }
        let next_index = write.active.next_index();
        write.active.seal = seal;
        std::mem::swap(&mut write.active, &mut *flushing);
        if seal {
            write.segment_start = next_index;
            write.segment_size = 0;
        }
        write.active.reset(write.segment_start, next_index);
        drop(flushing);

        if self.flush_tx.send(FlushSignal::Drain).is_err() {
            debug!("Flush worker of {:?} is gone, buffer waits for the next flush", self.options.dir);
        }
        Ok(())
    }

    /// Writes `buffer` to disk. On failure the buffer keeps its content for a retry.
    pub(crate) async fn drain(self: &Arc<Self>, buffer: &mut LogBuffer) -> StorageResult<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let job = std::mem::take(buffer);
        let inner = self.clone();
        let (job, result) = tokio::task::spawn_blocking(move || {
            let result = inner.write_buffer(&job);
            (job, result)
        })
        .await
        .map_err(join_error)?;
        *buffer = job;
        match result {
            Ok(()) => {
                buffer.clear();
                Ok(())
            }
            Err(e) => {
                error!(
                    "Failed to flush entries [{}, {}) of {:?}: {}",
                    buffer.first_index,
                    buffer.next_index(),
                    self.options.dir,
                    e
                );
                Err(e)
            }
        }
    }

    fn write_buffer(&self, buffer: &LogBuffer) -> StorageResult<()> {
        let missing = self.segments.read().open.is_none();
        if missing {
            self.create_open_segment(buffer.segment_start)?;
        }
        let segment = self
            .segments
            .read()
            .open
            .clone()
            .ok_or_else(|| StorageError::Consistency("no open segment".to_string()))?;
        if segment.start_index() != buffer.segment_start {
            return Err(StorageError::Consistency(format!(
                "buffer belongs to segment {} but the open segment starts at {}",
                buffer.segment_start,
                segment.start_index()
            )));
        }

        // a retry after a failed seal finds the records already written
        if segment.next_index() != buffer.next_index() {
            if segment.next_index() != buffer.first_index {
                return Err(StorageError::Consistency(format!(
                    "buffer starts at {} but the open segment ends before {}",
                    buffer.first_index,
                    segment.next_index()
                )));
            }
            segment.write_tail(&buffer.data, &buffer.offsets)?;
            let mut segments = self.segments.write();
            if let Some(open) = segments.open.as_mut() {
                open.data_len += buffer.data.len() as u64;
                open.entry_count += buffer.entries;
            }
        }

        if let Some(last) = buffer.last_index() {
            self.state.write().durable = LogPosition::new(last, buffer.last_term);
        }
        if buffer.seal {
            self.seal_open_segment()?;
        }
        Ok(())
    }

    fn create_open_segment(&self, start_index: u64) -> StorageResult<()> {
        let version = {
            let mut state = self.state.write();
            state.max_version += 1;
            state.max_version
        };
        // the version window must cover the file before it exists
        self.persist_meta()?;
        let segment = LogSegment::create(&self.options.dir, SegmentName::open(start_index, version))?;
        info!(
            "Created log segment {} in {:?}",
            segment.name.data_file_name(),
            self.options.dir
        );
        self.segments.write().open = Some(segment);
        Ok(())
    }

    fn seal_open_segment(&self) -> StorageResult<()> {
        let Some(segment) = self.segments.read().open.clone() else {
            return Ok(());
        };
        if segment.entry_count == 0 {
            return Ok(());
        }
        segment.sync()?;

        let mut segments = self.segments.write();
        let Some(mut open) = segments.open.take() else {
            return Ok(());
        };
        let sealed = open.name.sealed(open.next_index() - 1);
        if let Err(e) = open.rename(&self.options.dir, sealed) {
            error!(
                "Failed to seal log segment {}: {}",
                open.name.data_file_name(),
                e
            );
            segments.open = Some(open);
            return Err(e);
        }
        info!("Sealed log segment {}", open.name.data_file_name());
        segments.sealed.push(open);
        Ok(())
    }

    pub(crate) fn persist_meta(&self) -> StorageResult<()> {
        let _guard = self.meta_lock.lock();
        let persisted = self.state.read().to_persisted();
        self.meta_file.persist(&persisted)
    }

    // every write takes the newest state under meta_lock, so the last write always wins
    fn persist_hard_state(&self) -> StorageResult<()> {
        let _guard = self.meta_lock.lock();
        if self.closed.load(Ordering::SeqCst) {
            // close writes the final meta, a reopened store may own the file by now
            return Ok(());
        }
        let persisted = self.state.read().to_persisted();
        self.meta_file.persist(&persisted)
    }

    pub(crate) async fn flush(self: &Arc<Self>, forced: bool) -> StorageResult<()> {
        let mut write = self.write.lock().await;
        self.flush_locked(&mut write, forced).await
    }

    pub(crate) async fn flush_locked(
        self: &Arc<Self>,
        write: &mut WriteState,
        forced: bool,
    ) -> StorageResult<()> {
        let mut flushing = self.flushing.lock().await;
        // the older half first
        self.drain(&mut flushing).await?;
        if !write.active.is_empty() {
            let next_index = write.active.next_index();
            std::mem::swap(&mut write.active, &mut *flushing);
            write.active.reset(write.segment_start, next_index);
            self.drain(&mut flushing).await?;
        }
        drop(flushing);

        if forced {
            let inner = self.clone();
            tokio::task::spawn_blocking(move || -> StorageResult<()> {
                let open = inner.segments.read().open.clone();
                if let Some(open) = open {
                    open.sync()?;
                }
                inner.persist_meta()
            })
            .await
            .map_err(join_error)??;
        }
        Ok(())
    }

    pub(crate) async fn get_logs(
        self: &Arc<Self>,
        start: u64,
        end: u64,
    ) -> StorageResult<Vec<LogEntry>> {
        let (first, last, durable) = {
            let state = self.state.read();
            (
                state.first_index,
                state.meta.last_log_index,
                state.durable.index,
            )
        };
        if start > end || start > last {
            return Ok(Vec::new());
        }
        if start < first {
            return Err(StorageError::Compacted(first));
        }
        let max_fetch = self.options.max_fetch.max(1) as u64;
        let end = end.min(last).min(start.saturating_add(max_fetch - 1));
        if end > durable {
            self.flush(false).await?;
        }

        let permit = self
            .io_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StorageError::Closed)?;
        let inner = self.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            inner.read_range(start, end)
        })
        .await
        .map_err(join_error)?
    }

    fn read_range(&self, start: u64, end: u64) -> StorageResult<Vec<LogEntry>> {
        let mut entries = Vec::with_capacity((end - start + 1) as usize);
        let mut next = start;
        while next <= end {
            let segment = self
                .segments
                .read()
                .find(next)
                .cloned()
                .ok_or(StorageError::LogNotFound(next))?;
            let segment_last = segment.next_index() - 1;
            let upto = end.min(segment_last);
            let from = self.offset_of(&segment, next)?;
            let to = if upto == segment_last {
                segment.data_len
            } else {
                self.offset_of(&segment, upto + 1)?
            };
            let buf = segment.read_bytes(from, to.saturating_sub(from))?;
            entries.extend(decode_records(&buf, next, upto - next + 1)?);
            next = upto + 1;
        }
        Ok(entries)
    }

    fn offset_of(&self, segment: &LogSegment, index: u64) -> StorageResult<u64> {
        let cached = self.offsets.read().get(index);
        match cached {
            Some(pos) if pos.segment_start == segment.start_index() => Ok(pos.offset),
            _ => segment.read_offset(index),
        }
    }

    pub(crate) async fn term_at(self: &Arc<Self>, index: u64) -> StorageResult<u64> {
        let first = {
            let state = self.state.read();
            if index == 0 {
                return Ok(0);
            }
            if index == state.meta.last_log_index {
                return Ok(state.meta.last_log_term);
            }
            if index == state.meta.commit_log_index {
                return Ok(state.meta.commit_log_term);
            }
            if index > state.meta.last_log_index {
                return Err(StorageError::LogNotFound(index));
            }
            state.first_index
        };
        if index + 1 == first {
            // only the first retained entry remembers its predecessor
            let entry = self
                .get_logs(first, first)
                .await?
                .pop()
                .ok_or(StorageError::LogNotFound(first))?;
            return Ok(entry.previous_log_term);
        }
        self.get_logs(index, index)
            .await?
            .pop()
            .map(|e| e.curr_log_term)
            .ok_or(StorageError::LogNotFound(index))
    }

    pub(crate) async fn truncate_after(self: &Arc<Self>, index: u64) -> StorageResult<()> {
        let mut write = self.write.lock().await;
        let (first, last, commit) = {
            let state = self.state.read();
            (
                state.first_index,
                state.meta.last_log_index,
                state.meta.commit_log_index,
            )
        };
        if index >= last {
            return Ok(());
        }
        if index < commit {
            return Err(StorageError::Consistency(format!(
                "cannot truncate after {} below commit index {}",
                index, commit
            )));
        }
        if index + 1 < first {
            return Err(StorageError::Compacted(first));
        }

        self.flush_locked(&mut write, false).await?;
        let term = self.term_at(index).await?;
        let inner = self.clone();
        let (segment_start, segment_size) =
            tokio::task::spawn_blocking(move || inner.truncate_segments(index))
                .await
                .map_err(join_error)??;

        write.segment_start = segment_start;
        write.segment_size = segment_size;
        write.active.reset(segment_start, index + 1);
        self.offsets.write().truncate_suffix(index);
        {
            let mut state = self.state.write();
            state.meta.last_log_index = index;
            state.meta.last_log_term = term;
            state.durable = LogPosition::new(index, term);
        }
        info!(
            "Truncated log of {:?} after index {} (term {}), {} entries dropped",
            self.options.dir,
            index,
            term,
            last - index
        );
        self.persist_meta()
    }

    /// Cuts the segment files after `index`; returns the new open segment start and size.
    fn truncate_segments(&self, index: u64) -> StorageResult<(u64, u64)> {
        let dir = &self.options.dir;
        let mut segments = self.segments.write();
        let mut removed = Vec::new();
        if segments
            .open
            .as_ref()
            .is_some_and(|s| s.start_index() > index)
        {
            removed.extend(segments.open.take().map(|s| s.name));
        }
        while segments
            .sealed
            .last()
            .is_some_and(|s| s.start_index() > index)
        {
            removed.extend(segments.sealed.pop().map(|s| s.name));
        }
        if segments.open.is_none() {
            if let Some(mut last) = segments.sealed.pop() {
                // the sealed segment holding the new tail becomes writable again
                let reopened = last.name.reopened();
                if let Err(e) = last.rename(dir, reopened) {
                    segments.sealed.push(last);
                    return Err(e);
                }
                segments.open = Some(last);
            }
        }
        let position = match segments.open.as_mut() {
            Some(open) => {
                open.truncate(index + 1 - open.start_index())?;
                (open.start_index(), open.data_len)
            }
            None => (index + 1, 0),
        };
        drop(segments);

        let mut clean = true;
        for name in &removed {
            clean &= self.remove_segment(name);
        }
        if !clean {
            self.sweep_directory(&removed)?;
        }
        Ok(position)
    }

    pub(crate) async fn reset(self: &Arc<Self>, next_index: u64, last_term: u64) -> StorageResult<()> {
        let next_index = next_index.max(1);
        let mut write = self.write.lock().await;
        let mut flushing = self.flushing.lock().await;
        flushing.clear();

        let inner = self.clone();
        tokio::task::spawn_blocking(move || inner.remove_all_segments())
            .await
            .map_err(join_error)??;

        write.segment_start = next_index;
        write.segment_size = 0;
        write.active.reset(next_index, next_index);
        flushing.reset(next_index, next_index);
        self.offsets.write().reset(next_index);
        {
            let mut state = self.state.write();
            let last = next_index - 1;
            state.first_index = next_index;
            state.meta.last_log_index = last;
            state.meta.last_log_term = last_term;
            if state.meta.commit_log_index != last {
                state.meta.commit_log_index = last;
                state.meta.commit_log_term = last_term;
            }
            state.meta.max_have_applied_commit_index =
                state.meta.max_have_applied_commit_index.min(last);
            state.durable = LogPosition::new(last, last_term);
        }
        drop(flushing);
        info!(
            "Reset log of {:?} to start at index {} after term {}",
            self.options.dir, next_index, last_term
        );
        self.persist_meta()
    }

    fn remove_all_segments(&self) -> StorageResult<()> {
        let names = {
            let mut segments = self.segments.write();
            let mut names: Vec<SegmentName> = segments.sealed.drain(..).map(|s| s.name).collect();
            names.extend(segments.open.take().map(|s| s.name));
            names
        };
        {
            let mut state = self.state.write();
            state.min_version = state.max_version + 1;
        }
        // leftovers of a failed removal now fall outside the version window
        self.persist_meta()?;
        let mut clean = true;
        for name in &names {
            clean &= self.remove_segment(name);
        }
        if !clean {
            self.sweep_directory(&names)?;
        }
        Ok(())
    }
}

async fn run_flush_worker(
    inner: Arc<LogStoreInner>,
    mut rx: mpsc::UnboundedReceiver<FlushSignal>,
) {
    let name = inner.name();
    let period = Duration::from_millis(inner.options.flush_interval_ms.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            signal = rx.recv() => match signal {
                Some(FlushSignal::Drain) => {
                    let mut flushing = inner.flushing.lock().await;
                    report(inner.drain(&mut flushing).await, &name, "drain_write_buffer", None);
                }
                Some(FlushSignal::Shutdown) | None => break,
            },
            _ = ticker.tick() => {
                // skip the periodic flush while an appender holds the buffer
                if let Ok(mut write) = inner.write.try_lock() {
                    report(inner.flush_locked(&mut write, false).await, &name, "periodic_flush", None);
                }
            }
        }
    }
    debug!("Flush worker of {} stopped", name);
}

async fn run_retention(inner: Arc<LogStoreInner>) {
    let name = inner.name();
    let period = Duration::from_millis(inner.options.retention_interval_ms.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let task = inner.clone();
        match tokio::task::spawn_blocking(move || task.check_delete_persist_raft_log()).await {
            Ok(result) => {
                if let Some(deleted) = report(result, &name, "check_delete_persist_raft_log", None) {
                    if deleted > 0 {
                        debug!("Retention removed {} segments of {}", deleted, name);
                    }
                }
            }
            Err(e) => warn!("Retention task of {} failed: {}", name, e),
        }
    }
}
