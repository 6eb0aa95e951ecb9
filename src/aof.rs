//! Append-only log.
//!
//! Mutating commands are enqueued as verbatim RESP frames and drained by
//! a single writer thread that aggregates them into vectored writes.
//! Three durability modes are supported: no syncing, interval fdatasync,
//! and sync-before-reply. A background rewrite compacts the log from a
//! keyspace snapshot plus an incremental buffer, then swaps files
//! atomically under a writer pause barrier.

use crate::config::{AofMode, AofOptions};
use crate::error::{KvError, Result};
use crate::resp::{self, RespParser, RespValue};
use crate::store::{KeyValueStore, format_score, now_ms};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, IoSlice, Write};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Upper bound on items per aggregated write.
const MAX_BATCH_ITEMS: usize = 64;

#[derive(Debug)]
struct AofItem {
    data: Vec<u8>,
    seq: i64,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<AofItem>,
    pending_bytes: usize,
    seq_gen: i64,
    last_synced_seq: i64,
}

#[derive(Default)]
struct PauseState {
    requested: bool,
    paused: bool,
}

/// The append-only logger. One writer thread owns the file descriptor
/// for its lifetime; `append_*` may be called from any thread.
pub struct AofLogger {
    opts: AofOptions,
    state: Mutex<QueueState>,
    queue_cv: Condvar,
    commit_cv: Condvar,
    file: Mutex<Option<File>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    stop: AtomicBool,
    rewriting: AtomicBool,
    incr_cmds: Mutex<Vec<Vec<u8>>>,
    pause: Mutex<PauseState>,
    pause_cv: Condvar,
}

impl AofLogger {
    pub fn new(opts: AofOptions) -> Self {
        Self {
            opts,
            state: Mutex::new(QueueState::default()),
            queue_cv: Condvar::new(),
            commit_cv: Condvar::new(),
            file: Mutex::new(None),
            writer: Mutex::new(None),
            stop: AtomicBool::new(false),
            rewriting: AtomicBool::new(false),
            incr_cmds: Mutex::new(Vec::new()),
            pause: Mutex::new(PauseState::default()),
            pause_cv: Condvar::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.opts.enabled
    }

    pub fn mode(&self) -> AofMode {
        self.opts.mode
    }

    pub fn path(&self) -> std::path::PathBuf {
        self.opts.path()
    }

    /// Open the log file and spawn the writer thread. A disabled logger
    /// initializes to a no-op.
    pub fn init(this: &Arc<Self>) -> Result<()> {
        if !this.opts.enabled {
            return Ok(());
        }
        fs::create_dir_all(&this.opts.dir)
            .map_err(|e| KvError::Aof(format!("mkdir {} failed: {e}", this.opts.dir.display())))?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(this.opts.path())
            .map_err(|e| {
                KvError::Aof(format!("open {} failed: {e}", this.opts.path().display()))
            })?;
        preallocate(&file, this.opts.prealloc_bytes);
        *this.file.lock() = Some(file);

        let logger = Arc::clone(this);
        let handle = thread::Builder::new()
            .name("aof-writer".to_string())
            .spawn(move || logger.writer_loop())?;
        *this.writer.lock() = Some(handle);
        log::info!(
            "append log open at {} (mode {})",
            this.opts.path().display(),
            this.opts.mode.as_config_str()
        );
        Ok(())
    }

    /// Stop the writer: it drains the remaining queue, syncs, and exits.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.queue_cv.notify_all();
        self.commit_cv.notify_all();
        self.pause_cv.notify_all();
        let handle = self.writer.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        *self.file.lock() = None;
    }

    /// Enqueue a frame exactly as captured from the client. Returns the
    /// assigned sequence number (0 when the log is disabled).
    pub fn append_raw(&self, raw: &[u8]) -> i64 {
        if !self.opts.enabled || raw.is_empty() {
            return 0;
        }
        self.push(raw.to_vec())
    }

    /// Fallback path when the raw bytes are not available: serialize the
    /// parts as a RESP array and enqueue that.
    pub fn append_command<T: AsRef<[u8]>>(&self, parts: &[T]) -> i64 {
        if !self.opts.enabled || parts.is_empty() {
            return 0;
        }
        self.push(resp::array_of_bulks(parts))
    }

    fn push(&self, data: Vec<u8>) -> i64 {
        let mirror = if self.rewriting.load(Ordering::Acquire) {
            Some(data.clone())
        } else {
            None
        };
        let seq;
        {
            let mut state = self.state.lock();
            state.pending_bytes += data.len();
            state.seq_gen += 1;
            seq = state.seq_gen;
            state.queue.push_back(AofItem { data, seq });
        }
        if let Some(copy) = mirror {
            self.incr_cmds.lock().push(copy);
        }
        self.queue_cv.notify_one();
        seq
    }

    /// Block until the given sequence number has been fdatasync'd. Only
    /// meaningful in `always` mode; other modes return immediately.
    pub fn wait_durable(&self, seq: i64) {
        if !self.opts.enabled || self.opts.mode != AofMode::Always || seq == 0 {
            return;
        }
        let mut state = self.state.lock();
        while state.last_synced_seq < seq && !self.stop.load(Ordering::SeqCst) {
            self.commit_cv.wait(&mut state);
        }
    }

    /// Replay the log into the store. A missing file is fine; a truncated
    /// final frame is treated as end-of-file; anything else malformed is
    /// a startup error. Unknown commands are skipped for forward
    /// compatibility.
    pub fn load(&self, store: &KeyValueStore) -> Result<()> {
        if !self.opts.enabled {
            return Ok(());
        }
        let data = match fs::read(self.opts.path()) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(KvError::Aof(format!("read log failed: {e}"))),
        };
        let mut parser = RespParser::new();
        parser.append(&data);
        let mut replayed = 0usize;
        loop {
            let Some(frame) = parser.try_parse_one() else {
                break; // end of file or truncated tail
            };
            let RespValue::Array(items) = frame else {
                if frame.is_error() {
                    return Err(KvError::Aof("malformed frame in append log".to_string()));
                }
                continue;
            };
            let Some(parts) = bulk_parts(&items) else {
                continue;
            };
            apply_replay(store, &parts);
            replayed += 1;
        }
        if parser.buffered() > 0 {
            log::warn!(
                "append log has a truncated tail of {} bytes; ignoring it",
                parser.buffered()
            );
        }
        log::info!("replayed {replayed} commands from {}", self.opts.path().display());
        Ok(())
    }

    /// Start a background rewrite. Fails when the log is disabled or a
    /// rewrite is already running.
    pub fn bg_rewrite(this: &Arc<Self>, store: &Arc<KeyValueStore>) -> Result<()> {
        if !this.opts.enabled {
            return Err(KvError::Aof("aof disabled".to_string()));
        }
        if this
            .rewriting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(KvError::Aof("rewrite already running".to_string()));
        }
        let logger = Arc::clone(this);
        let store = Arc::clone(store);
        thread::Builder::new()
            .name("aof-rewrite".to_string())
            .spawn(move || logger.rewriter_loop(&store))?;
        Ok(())
    }

    pub fn is_rewriting(&self) -> bool {
        self.rewriting.load(Ordering::Acquire)
    }

    // ---- writer thread ----

    fn writer_loop(self: Arc<Self>) {
        let batch_bytes = self.opts.batch_bytes.max(1);
        let batch_wait = Duration::from_micros(self.opts.batch_wait_us.max(1));
        let sync_interval = Duration::from_millis(self.opts.sync_interval_ms.max(1));
        let mut last_sync = Instant::now();
        let mut local: Vec<AofItem> = Vec::with_capacity(MAX_BATCH_ITEMS);

        while !self.stop.load(Ordering::SeqCst) {
            self.pause_point();
            if self.stop.load(Ordering::SeqCst) {
                break;
            }

            local.clear();
            let mut bytes = 0usize;
            {
                let mut state = self.state.lock();
                if state.queue.is_empty() {
                    let _ = self.queue_cv.wait_for(&mut state, batch_wait);
                }
                while local.len() < MAX_BATCH_ITEMS && bytes < batch_bytes {
                    match state.queue.pop_front() {
                        Some(item) => {
                            bytes += item.data.len();
                            local.push(item);
                        }
                        None => break,
                    }
                }
                state.pending_bytes = state.pending_bytes.saturating_sub(bytes);
            }

            if local.is_empty() {
                if self.opts.mode == AofMode::EverySecond && last_sync.elapsed() >= sync_interval {
                    self.sync_file();
                    last_sync = Instant::now();
                }
                continue;
            }

            if !self.write_batch(&local) {
                // Put the batch back at the head, in order, and back off;
                // it stays pending until a later write and sync succeed.
                let mut state = self.state.lock();
                let restored: usize = local.iter().map(|i| i.data.len()).sum();
                state.pending_bytes += restored;
                for item in local.drain(..).rev() {
                    state.queue.push_front(item);
                }
                drop(state);
                thread::sleep(Duration::from_millis(1));
                continue;
            }

            match self.opts.mode {
                AofMode::Always => {
                    self.sync_file();
                    let max_seq = local.iter().map(|i| i.seq).max().unwrap_or(0);
                    {
                        let mut state = self.state.lock();
                        state.last_synced_seq = state.last_synced_seq.max(max_seq);
                    }
                    self.commit_cv.notify_all();
                }
                AofMode::EverySecond => {
                    if last_sync.elapsed() >= sync_interval {
                        self.sync_file();
                        last_sync = Instant::now();
                    }
                }
                AofMode::No => {}
            }
        }

        // Drain whatever is still queued, then do a final sync.
        loop {
            let mut rest: Vec<AofItem> = Vec::with_capacity(MAX_BATCH_ITEMS);
            {
                let mut state = self.state.lock();
                while rest.len() < MAX_BATCH_ITEMS {
                    match state.queue.pop_front() {
                        Some(item) => rest.push(item),
                        None => break,
                    }
                }
            }
            if rest.is_empty() {
                break;
            }
            if !self.write_batch(&rest) {
                log::error!("failed to flush append log during shutdown");
                break;
            }
        }
        self.sync_file();
        self.commit_cv.notify_all();
    }

    /// Park while a rewrite swap is in progress.
    fn pause_point(&self) {
        let mut pause = self.pause.lock();
        if !pause.requested {
            return;
        }
        pause.paused = true;
        self.pause_cv.notify_all();
        while pause.requested && !self.stop.load(Ordering::SeqCst) {
            self.pause_cv.wait(&mut pause);
        }
        pause.paused = false;
    }

    /// Vectored write of the whole batch, advancing across short writes
    /// and retrying on EINTR. Returns false on a persistent error.
    fn write_batch(&self, items: &[AofItem]) -> bool {
        let guard = self.file.lock();
        let Some(file) = guard.as_ref() else {
            return true;
        };
        let mut file_ref: &File = file;
        let mut idx = 0usize;
        let mut offset = 0usize;
        while idx < items.len() {
            let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(items.len() - idx);
            slices.push(IoSlice::new(&items[idx].data[offset..]));
            for item in &items[idx + 1..] {
                slices.push(IoSlice::new(&item.data));
            }
            match file_ref.write_vectored(&slices) {
                Ok(0) => return false,
                Ok(mut written) => {
                    while written > 0 && idx < items.len() {
                        let avail = items[idx].data.len() - offset;
                        if written < avail {
                            offset += written;
                            written = 0;
                        } else {
                            written -= avail;
                            idx += 1;
                            offset = 0;
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    log::warn!("append log write failed: {e}");
                    return false;
                }
            }
        }
        true
    }

    fn sync_file(&self) {
        let guard = self.file.lock();
        if let Some(file) = guard.as_ref()
            && let Err(e) = file.sync_data()
        {
            log::warn!("append log fdatasync failed: {e}");
        }
    }

    // ---- rewrite thread ----

    fn rewriter_loop(&self, store: &KeyValueStore) {
        if let Err(e) = self.rewrite(store) {
            log::error!("append log rewrite failed: {e}");
            let _ = fs::remove_file(self.opts.rewrite_tmp_path());
            // Make sure the writer is not left parked.
            {
                let mut pause = self.pause.lock();
                pause.requested = false;
            }
            self.pause_cv.notify_all();
            self.rewriting.store(false, Ordering::Release);
        }
    }

    fn rewrite(&self, store: &KeyValueStore) -> Result<()> {
        let tmp_path = self.opts.rewrite_tmp_path();
        let tmp = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)?;
        let mut out = BufWriter::new(tmp);
        log::info!("append log rewrite started");

        // Snapshot phase: emit the minimal command stream reproducing the
        // current state. Live appends continue and are mirrored into the
        // incremental buffer because the rewriting flag is already set.
        let now = now_ms();
        for (key, record) in store.snapshot() {
            out.write_all(&resp::array_of_bulks([
                Bytes::from_static(b"SET"),
                key.clone(),
                record.value,
            ]))?;
            write_expire(&mut out, &key, record.expire_at_ms, now)?;
        }
        for (key, record) in store.snapshot_hash() {
            for (field, value) in &record.fields {
                out.write_all(&resp::array_of_bulks([
                    Bytes::from_static(b"HSET"),
                    key.clone(),
                    field.clone(),
                    value.clone(),
                ]))?;
            }
            write_expire(&mut out, &key, record.expire_at_ms, now)?;
        }
        for flat in store.snapshot_zset() {
            for (score, member) in &flat.items {
                out.write_all(&resp::array_of_bulks([
                    Bytes::from_static(b"ZADD"),
                    flat.key.clone(),
                    Bytes::from(format_score(*score).into_bytes()),
                    member.clone(),
                ]))?;
            }
            write_expire(&mut out, &flat.key, flat.expire_at_ms, now)?;
        }

        // Swap phase: park the writer, flush the incremental buffer, make
        // the temp file durable, and rename it over the log.
        {
            let mut pause = self.pause.lock();
            pause.requested = true;
            self.queue_cv.notify_all();
            while !pause.paused {
                self.pause_cv.wait(&mut pause);
            }
        }
        let swap = (|| -> Result<()> {
            {
                let mut incr = self.incr_cmds.lock();
                for cmd in incr.iter() {
                    out.write_all(cmd)?;
                }
                incr.clear();
            }
            out.flush()?;
            out.get_ref().sync_data()?;
            {
                let mut file = self.file.lock();
                *file = None; // close the old descriptor
                let renamed = fs::rename(&tmp_path, self.opts.path());
                // reopen the final path either way so appends keep a target
                match OpenOptions::new().create(true).append(true).open(self.opts.path()) {
                    Ok(reopened) => *file = Some(reopened),
                    Err(e) => log::error!("reopen append log after rewrite failed: {e}"),
                }
                renamed?;
            }
            if let Ok(dir) = File::open(&self.opts.dir)
                && let Err(e) = dir.sync_all()
            {
                log::warn!("directory fsync after rewrite failed: {e}");
            }
            Ok(())
        })();

        // Resume: clear the incremental buffer before dropping the
        // rewriting flag so nothing mirrored during the swap lingers,
        // then release the writer.
        self.incr_cmds.lock().clear();
        self.rewriting.store(false, Ordering::Release);
        {
            let mut pause = self.pause.lock();
            pause.requested = false;
        }
        self.pause_cv.notify_all();
        swap?;
        log::info!("append log rewrite complete");
        Ok(())
    }
}

fn write_expire<W: Write>(out: &mut W, key: &Bytes, expire_at_ms: i64, now: i64) -> Result<()> {
    if expire_at_ms <= 0 {
        return Ok(());
    }
    let ttl_seconds = ((expire_at_ms - now) / 1000).max(1);
    out.write_all(&resp::array_of_bulks([
        Bytes::from_static(b"EXPIRE"),
        key.clone(),
        Bytes::from(ttl_seconds.to_string().into_bytes()),
    ]))?;
    Ok(())
}

/// Best-effort block preallocation that leaves the file size untouched.
fn preallocate(file: &File, bytes: u64) {
    if bytes == 0 {
        return;
    }
    #[cfg(target_os = "linux")]
    {
        let _ = unsafe {
            libc::fallocate(
                file.as_raw_fd(),
                libc::FALLOC_FL_KEEP_SIZE,
                0,
                bytes as libc::off_t,
            )
        };
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (file, bytes);
    }
}

fn bulk_parts(items: &[RespValue]) -> Option<Vec<Bytes>> {
    items.iter().map(|v| v.as_text_bytes()).collect()
}

/// Apply one replayed command. Only the restore subset is recognized;
/// everything else is skipped.
fn apply_replay(store: &KeyValueStore, parts: &[Bytes]) {
    let Some(name) = parts.first() else {
        return;
    };
    let cmd = String::from_utf8_lossy(name).to_ascii_uppercase();
    match cmd.as_str() {
        "SET" if parts.len() >= 3 => {
            // EX/PX are honored relative to replay time so a timed key
            // does not come back immortal
            let mut ttl_ms = None;
            let mut i = 3;
            while i + 1 < parts.len() {
                let opt = String::from_utf8_lossy(&parts[i]).to_ascii_uppercase();
                let value = std::str::from_utf8(&parts[i + 1])
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok());
                match (opt.as_str(), value) {
                    ("EX", Some(seconds)) => ttl_ms = Some(seconds * 1000),
                    ("PX", Some(ms)) => ttl_ms = Some(ms),
                    _ => {}
                }
                i += 2;
            }
            store.set(parts[1].clone(), parts[2].clone(), ttl_ms);
        }
        "DEL" if parts.len() >= 2 => {
            store.del(&parts[1..]);
        }
        "EXPIRE" if parts.len() == 3 => {
            match std::str::from_utf8(&parts[2]).ok().and_then(|s| s.parse::<i64>().ok()) {
                Some(seconds) => {
                    store.expire(&parts[1], seconds);
                }
                None => log::warn!("skipping EXPIRE with a non-integer ttl during replay"),
            }
        }
        "HSET" if parts.len() == 4 => {
            store.hset(parts[1].clone(), parts[2].clone(), parts[3].clone());
        }
        "HDEL" if parts.len() >= 3 => {
            store.hdel(&parts[1], &parts[2..]);
        }
        "ZADD" if parts.len() == 4 => {
            match std::str::from_utf8(&parts[2]).ok().and_then(|s| s.parse::<f64>().ok()) {
                Some(score) => {
                    store.zadd(parts[1].clone(), score, parts[3].clone());
                }
                None => log::warn!("skipping ZADD with a non-float score during replay"),
            }
        }
        "ZREM" if parts.len() >= 3 => {
            store.zrem(&parts[1], &parts[2..]);
        }
        "FLUSHALL" => store.clear(),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(dir: &TempDir, mode: AofMode) -> AofOptions {
        AofOptions {
            enabled: true,
            mode,
            dir: dir.path().to_path_buf(),
            filename: "test.aof".to_string(),
            prealloc_bytes: 0,
            ..AofOptions::default()
        }
    }

    fn frame(parts: &[&str]) -> Vec<u8> {
        resp::array_of_bulks(parts)
    }

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let logger = Arc::new(AofLogger::new(options(&dir, AofMode::Always)));
        AofLogger::init(&logger).unwrap();

        let seq = logger.append_raw(&frame(&["SET", "a", "1"]));
        logger.wait_durable(seq);
        let seq = logger.append_command(&["SET", "b", "2"]);
        logger.wait_durable(seq);
        let seq = logger.append_raw(&frame(&["DEL", "a"]));
        logger.wait_durable(seq);
        logger.shutdown();

        let store = KeyValueStore::with_seed(1);
        let logger = Arc::new(AofLogger::new(options(&dir, AofMode::Always)));
        logger.load(&store).unwrap();
        assert!(store.get(b"a").is_none());
        assert_eq!(store.get(b"b").unwrap().as_ref(), b"2");
    }

    #[test]
    fn test_replay_order_matches_append_order() {
        let dir = TempDir::new().unwrap();
        let logger = Arc::new(AofLogger::new(options(&dir, AofMode::Always)));
        AofLogger::init(&logger).unwrap();
        let mut last = 0;
        for i in 0..200 {
            let seq = logger.append_raw(&frame(&["SET", "k", &i.to_string()]));
            assert!(seq > last, "sequence numbers must be monotonic");
            last = seq;
        }
        logger.wait_durable(last);
        logger.shutdown();

        let store = KeyValueStore::with_seed(1);
        let logger = AofLogger::new(options(&dir, AofMode::Always));
        logger.load(&store).unwrap();
        assert_eq!(store.get(b"k").unwrap().as_ref(), b"199");
    }

    #[test]
    fn test_truncated_tail_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let logger = Arc::new(AofLogger::new(options(&dir, AofMode::Always)));
        AofLogger::init(&logger).unwrap();
        let seq = logger.append_raw(&frame(&["SET", "a", "1"]));
        logger.wait_durable(seq);
        logger.shutdown();

        // chop a partial frame onto the end of the file
        let path = dir.path().join("test.aof");
        let mut data = fs::read(&path).unwrap();
        data.extend_from_slice(b"*3\r\n$3\r\nSET\r\n$1\r\nb");
        fs::write(&path, &data).unwrap();

        let store = KeyValueStore::with_seed(1);
        let logger = AofLogger::new(options(&dir, AofMode::Always));
        Arc::new(logger).load(&store).unwrap();
        assert_eq!(store.get(b"a").unwrap().as_ref(), b"1");
        assert!(store.get(b"b").is_none());
    }

    #[test]
    fn test_malformed_frame_is_a_startup_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.aof");
        fs::write(&path, b"garbage that is not resp\r\n").unwrap();

        let store = KeyValueStore::with_seed(1);
        let logger = Arc::new(AofLogger::new(options(&dir, AofMode::Always)));
        assert!(logger.load(&store).is_err());
    }

    #[test]
    fn test_unknown_commands_are_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.aof");
        let mut data = frame(&["SET", "a", "1"]);
        data.extend_from_slice(&frame(&["WIBBLE", "x"]));
        data.extend_from_slice(&frame(&["SET", "b", "2"]));
        fs::write(&path, &data).unwrap();

        let store = KeyValueStore::with_seed(1);
        let logger = Arc::new(AofLogger::new(options(&dir, AofMode::Always)));
        logger.load(&store).unwrap();
        assert_eq!(store.get(b"a").unwrap().as_ref(), b"1");
        assert_eq!(store.get(b"b").unwrap().as_ref(), b"2");
    }

    #[test]
    fn test_disabled_logger_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let mut opts = options(&dir, AofMode::Always);
        opts.enabled = false;
        let logger = Arc::new(AofLogger::new(opts));
        AofLogger::init(&logger).unwrap();
        assert_eq!(logger.append_raw(b"*1\r\n$4\r\nPING\r\n"), 0);
        logger.wait_durable(0);
        logger.shutdown();
        assert!(!dir.path().join("test.aof").exists());
    }

    #[test]
    fn test_rewrite_compacts_and_preserves_state() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(KeyValueStore::with_seed(1));
        let logger = Arc::new(AofLogger::new(options(&dir, AofMode::Always)));
        AofLogger::init(&logger).unwrap();

        // churn one key so the log holds stale entries
        let mut last = 0;
        for i in 0..500 {
            store.set(Bytes::from_static(b"hot"), Bytes::from(i.to_string()), None);
            last = logger.append_raw(&frame(&["SET", "hot", &i.to_string()]));
        }
        store.hset(Bytes::from_static(b"h"), Bytes::from_static(b"f"), Bytes::from_static(b"v"));
        last = logger.append_raw(&frame(&["HSET", "h", "f", "v"]));
        store.zadd(Bytes::from_static(b"z"), 1.5, Bytes::from_static(b"m"));
        last = logger.append_raw(&frame(&["ZADD", "z", "1.5", "m"]));
        logger.wait_durable(last);

        let before = fs::metadata(dir.path().join("test.aof")).unwrap().len();
        AofLogger::bg_rewrite(&logger, &store).unwrap();
        while logger.is_rewriting() {
            thread::sleep(Duration::from_millis(5));
        }

        // appends keep flowing after the swap
        store.set(Bytes::from_static(b"post"), Bytes::from_static(b"1"), None);
        let seq = logger.append_raw(&frame(&["SET", "post", "1"]));
        logger.wait_durable(seq);
        logger.shutdown();

        let after = fs::metadata(dir.path().join("test.aof")).unwrap().len();
        assert!(after < before, "rewrite should shrink the log ({before} -> {after})");

        let reloaded = KeyValueStore::with_seed(2);
        let logger = Arc::new(AofLogger::new(options(&dir, AofMode::Always)));
        logger.load(&reloaded).unwrap();
        assert_eq!(reloaded.get(b"hot").unwrap().as_ref(), b"499");
        assert_eq!(reloaded.get(b"post").unwrap().as_ref(), b"1");
        assert_eq!(reloaded.hget(b"h", b"f").unwrap().as_ref(), b"v");
        assert_eq!(reloaded.zscore(b"z", b"m"), Some(1.5));
    }

    #[test]
    fn test_rewrite_keeps_concurrent_appends() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(KeyValueStore::with_seed(3));
        let logger = Arc::new(AofLogger::new(options(&dir, AofMode::Always)));
        AofLogger::init(&logger).unwrap();

        for i in 0..100 {
            let key = format!("seed{i}");
            store.set(Bytes::from(key.clone()), Bytes::from_static(b"x"), None);
            logger.append_raw(&frame(&["SET", &key, "x"]));
        }
        AofLogger::bg_rewrite(&logger, &store).unwrap();

        // race appends against the rewrite
        let mut last = 0;
        for i in 0..200 {
            let key = format!("live{i}");
            store.set(Bytes::from(key.clone()), Bytes::from_static(b"y"), None);
            last = logger.append_raw(&frame(&["SET", &key, "y"]));
        }
        logger.wait_durable(last);
        while logger.is_rewriting() {
            thread::sleep(Duration::from_millis(5));
        }
        logger.shutdown();

        let reloaded = KeyValueStore::with_seed(4);
        let logger = Arc::new(AofLogger::new(options(&dir, AofMode::Always)));
        logger.load(&reloaded).unwrap();
        for i in 0..100 {
            assert!(reloaded.get(format!("seed{i}").as_bytes()).is_some(), "seed{i} lost");
        }
        for i in 0..200 {
            assert!(reloaded.get(format!("live{i}").as_bytes()).is_some(), "live{i} lost");
        }
    }
}
