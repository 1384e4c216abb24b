//! Segment recovery and retention for the log store.
//!
//! Recovery rebuilds a consistent segment chain from whatever a crash left behind:
//! - a data/idx pair split across the open and the sealed name is renamed to the sealed name
//! - an idx file without data is deleted, a data file without idx gets its idx rebuilt
//! - segments outside the persisted version window or after a gap are discarded
//! - the open tail is cut after its last complete record
//!
//! Retention deletes the oldest sealed segments once they are applied and the directory holds
//! too many of them or too old an index.

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::Path,
};

use tracing::{debug, info, warn};

use crate::{error::StorageError, traits::StorageResult, types::LogPosition};

use super::{
    entry::{EntryPosition, OffsetIndex},
    meta::MetaFile,
    segment::{LogSegment, SegmentFileKind, SegmentName},
    store::{LogState, LogStoreInner, LogStoreOptions, SegmentSet},
};

pub(crate) struct RecoveredLog {
    pub(crate) segments: SegmentSet,
    pub(crate) offsets: OffsetIndex,
    pub(crate) state: LogState,
}

pub(crate) fn recover(options: &LogStoreOptions, meta_file: &MetaFile) -> StorageResult<RecoveredLog> {
    let dir = options.dir.as_path();
    fs::create_dir_all(dir)?;
    let persisted = meta_file.recover()?;
    let mut min_version = persisted.min_version;
    let mut max_version = persisted.max_version;

    let mut names = discover_segments(dir)?;
    names.sort_by_key(|n| (n.start_index, n.version));

    let mut discarded = Vec::new();
    let mut chain: Vec<LogSegment> = Vec::new();
    let mut broken = false;
    let mut max_seen = max_version;
    for name in names {
        max_seen = max_seen.max(name.version);
        if broken || name.version < min_version || name.version > max_version {
            warn!(
                "Discarding log segment {} (version window [{}, {}])",
                name.data_file_name(),
                min_version,
                max_version
            );
            discarded.push(name);
            continue;
        }

        let mut segment = LogSegment::open(dir, name)?;
        if name.is_open() {
            segment.repair()?;
        } else if name.end_index < name.start_index
            || segment.entry_count != name.end_index - name.start_index + 1
        {
            let kept = segment.repair()?;
            if kept > 0 {
                let renamed = name.sealed(name.start_index + kept - 1);
                warn!(
                    "Sealed log segment {} is damaged, keeping it as {}",
                    name.data_file_name(),
                    renamed.data_file_name()
                );
                segment.rename(dir, renamed)?;
            }
            // the entries after the damage are gone, nothing later can follow
            broken = true;
        }

        if segment.entry_count == 0 {
            debug!("Discarding empty log segment {}", segment.name.data_file_name());
            discarded.push(segment.name);
            continue;
        }
        if let Some(prev) = chain.last() {
            if segment.start_index() != prev.next_index() {
                warn!(
                    "Log segment {} does not follow index {}, discarding the rest",
                    segment.name.data_file_name(),
                    prev.next_index() - 1
                );
                discarded.push(segment.name);
                broken = true;
                continue;
            }
        }
        chain.push(segment);
    }

    // only the tail may stay open
    let tail = chain.len().saturating_sub(1);
    for segment in chain.iter_mut().take(tail) {
        if segment.name.is_open() {
            let sealed = segment.name.sealed(segment.next_index() - 1);
            segment.rename(dir, sealed)?;
        }
    }

    let mut log = persisted.log;
    let commit = log.commit_log_index;
    let behind_commit = match (chain.first(), chain.last()) {
        (Some(first), Some(last)) => {
            last.next_index() - 1 < commit || first.start_index() > commit + 1
        }
        _ => false,
    };
    if behind_commit {
        warn!(
            "Log segments in {:?} do not cover commit index {}, resuming after it",
            dir, commit
        );
        discarded.extend(chain.drain(..).map(|s| s.name));
    }
    if behind_commit || chain.is_empty() {
        min_version = max_seen + 1;
    }
    max_version = max_seen;

    let (first_index, last) = match (chain.first(), chain.last()) {
        (Some(first), Some(last)) => {
            let index = last.next_index() - 1;
            let term = last.read_entry(index)?.curr_log_term;
            (first.start_index(), LogPosition::new(index, term))
        }
        _ => (
            commit + 1,
            LogPosition::new(commit, log.commit_log_term),
        ),
    };
    log.last_log_index = last.index;
    log.last_log_term = last.term;
    log.max_have_applied_commit_index = log.max_have_applied_commit_index.min(commit);

    let offsets = load_offsets(&chain, last.index, options.max_in_memory_offsets)?;

    for name in &discarded {
        remove_pair(dir, name);
    }

    let mut segments = SegmentSet::default();
    if chain.last().is_some_and(|s| s.name.is_open()) {
        segments.open = chain.pop();
    }
    segments.sealed = chain;

    let state = LogState {
        meta: log,
        hard_state: persisted.hard_state,
        first_index,
        durable: last,
        min_version,
        max_version,
    };
    meta_file.persist(&state.to_persisted())?;
    info!(
        "Recovered log in {:?}: first {}, last {} (term {}), commit {}, versions [{}, {}]",
        dir, first_index, last.index, last.term, commit, min_version, max_version
    );

    Ok(RecoveredLog {
        segments,
        offsets,
        state,
    })
}

/// Lists the segment pairs on disk, repairing pairs broken by a crash.
fn discover_segments(dir: &Path) -> StorageResult<Vec<SegmentName>> {
    let mut data = Vec::new();
    let mut indexes: HashMap<(u64, u64), SegmentName> = HashMap::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        match SegmentName::parse(file_name) {
            Some((name, SegmentFileKind::Data)) => data.push(name),
            Some((name, SegmentFileKind::Index)) => {
                indexes.insert((name.start_index, name.version), name);
            }
            None => {}
        }
    }

    let mut names = Vec::with_capacity(data.len());
    for name in data {
        match indexes.remove(&(name.start_index, name.version)) {
            Some(index) if index == name => names.push(name),
            Some(index) => {
                // a seal renames data first, then idx
                let target = if name.is_open() { index } else { name };
                warn!(
                    "Log segment pair {} / {} is split, renaming to {}",
                    name.data_file_name(),
                    index.index_file_name(),
                    target.data_file_name()
                );
                if name != target {
                    fs::rename(
                        dir.join(name.data_file_name()),
                        dir.join(target.data_file_name()),
                    )?;
                }
                if index != target {
                    fs::rename(
                        dir.join(index.index_file_name()),
                        dir.join(target.index_file_name()),
                    )?;
                }
                names.push(target);
            }
            None => {
                warn!("Log segment {} lost its index, rebuilding", name.data_file_name());
                LogSegment::rebuild_index(dir, name)?;
                names.push(name);
            }
        }
    }
    for orphan in indexes.into_values() {
        warn!("Removing orphan index file {}", orphan.index_file_name());
        fs::remove_file(dir.join(orphan.index_file_name()))?;
    }
    Ok(names)
}

fn load_offsets(chain: &[LogSegment], last_index: u64, window: usize) -> StorageResult<OffsetIndex> {
    let mut remaining = window;
    let mut chunks = Vec::new();
    for segment in chain.iter().rev() {
        if remaining == 0 {
            break;
        }
        let offsets = segment.read_offsets()?;
        let take = offsets.len().min(remaining);
        let skip = offsets.len() - take;
        chunks.push((segment.start_index(), skip, offsets));
        remaining -= take;
    }

    let mut index = OffsetIndex::new(last_index + 1);
    for (segment_start, skip, offsets) in chunks.into_iter().rev() {
        for (i, offset) in offsets.into_iter().enumerate().skip(skip) {
            index.push(
                segment_start + i as u64,
                EntryPosition {
                    segment_start,
                    offset,
                },
            );
        }
    }
    Ok(index)
}

fn remove_pair(dir: &Path, name: &SegmentName) -> bool {
    let (data, index) = LogSegment::remove_files(dir, name);
    let mut removed = true;
    for result in [data, index] {
        if let Err(e) = result {
            warn!("Failed to remove log segment {}: {}", name.data_file_name(), e);
            removed = false;
        }
    }
    removed
}

impl LogStoreInner {
    /// Deletes the oldest sealed segments while the log holds too many of them or reaches too
    /// far behind the commit index. Segments holding unapplied entries are never deleted.
    pub(crate) fn check_delete_persist_raft_log(&self) -> StorageResult<usize> {
        self.offsets
            .write()
            .trim_to(self.options.max_in_memory_offsets);

        let mut deleted = 0;
        loop {
            let (count, oldest) = {
                let segments = self.segments.read();
                match segments.sealed.first() {
                    Some(s) => (segments.sealed.len(), s.name),
                    None => break,
                }
            };
            let (commit, applied) = {
                let state = self.state.read();
                (
                    state.meta.commit_log_index,
                    state.meta.max_have_applied_commit_index,
                )
            };
            let over_count = count > self.options.max_sealed_segments;
            let over_gap = commit.saturating_sub(oldest.start_index) > self.options.max_retained_gap;
            if !over_count && !over_gap {
                break;
            }
            if oldest.end_index > applied {
                debug!(
                    "Keeping log segment {}: applied index {} is behind its end",
                    oldest.data_file_name(),
                    applied
                );
                break;
            }
            self.delete_oldest_segment()?;
            deleted += 1;
        }
        if deleted > 0 {
            info!("Removed {} old log segments from {:?}", deleted, self.options.dir);
        }
        Ok(deleted)
    }

    /// Deletes sealed segments ending at or before `upto`, bounded by the applied index.
    pub(crate) fn compact(&self, upto: u64) -> StorageResult<usize> {
        let bound = upto.min(self.state.read().meta.max_have_applied_commit_index);
        let mut deleted = 0;
        while self
            .segments
            .read()
            .sealed
            .first()
            .is_some_and(|s| s.name.end_index <= bound)
        {
            self.delete_oldest_segment()?;
            deleted += 1;
        }
        Ok(deleted)
    }

    fn delete_oldest_segment(&self) -> StorageResult<()> {
        let segment = {
            let mut segments = self.segments.write();
            if segments.sealed.is_empty() {
                return Ok(());
            }
            segments.sealed.remove(0)
        };
        let next_first = segment.next_index();
        let remaining_min = {
            let segments = self.segments.read();
            segments
                .sealed
                .iter()
                .chain(segments.open.iter())
                .map(|s| s.name.version)
                .min()
        };
        {
            let mut state = self.state.write();
            let min = remaining_min.unwrap_or(segment.name.version + 1);
            state.min_version = state.min_version.max(min);
            state.first_index = next_first;
        }
        // the meta must stop covering the files before they go
        if let Err(e) = self.persist_meta() {
            self.segments.write().sealed.insert(0, segment);
            return Err(e);
        }
        self.offsets.write().truncate_prefix(next_first);
        debug!("Deleting log segment {}", segment.name.data_file_name());
        if !self.remove_segment(&segment.name) {
            self.sweep_directory(&[segment.name])?;
        }
        Ok(())
    }

    pub(crate) fn remove_segment(&self, name: &SegmentName) -> bool {
        remove_pair(&self.options.dir, name)
    }

    /// Removes segment files that are outside the version window or named in `stale`.
    pub(crate) fn sweep_directory(&self, stale: &[SegmentName]) -> StorageResult<()> {
        let (min_version, max_version) = {
            let state = self.state.read();
            (state.min_version, state.max_version)
        };
        let stale: HashSet<SegmentName> = stale.iter().copied().collect();
        let mut failed = 0;
        for entry in fs::read_dir(&self.options.dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some((name, _)) = file_name.to_str().and_then(SegmentName::parse) else {
                continue;
            };
            let outside = name.version < min_version || name.version > max_version;
            if outside || stale.contains(&name) {
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!("Sweep failed to remove {:?}: {}", entry.path(), e);
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            return Err(StorageError::Consistency(format!(
                "{} stale segment files left in {:?}",
                failed, self.options.dir
            )));
        }
        Ok(())
    }
}
