//! The engine: keyspace, durability, and replication state behind one
//! value shared by the connection handlers and background threads.
//!
//! Mutating commands take the write gate for the span of store mutation,
//! log enqueue, and replication propagate, so the on-disk order and the
//! stream order always match the order the keyspace applied the writes.
//! Durability waits (`always` mode) happen after the gate is released so
//! concurrent writers can group-commit.

use crate::aof::AofLogger;
use crate::backlog::ReplBacklog;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::rdb::Rdb;
use crate::resp;
use crate::store::KeyValueStore;
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use std::fs;
use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

struct ReplicaSink {
    stream: TcpStream,
    peer: String,
}

pub struct Engine {
    config: ServerConfig,
    pub store: Arc<KeyValueStore>,
    pub aof: Arc<AofLogger>,
    pub rdb: Rdb,
    backlog: Mutex<ReplBacklog>,
    replicas: Mutex<Vec<ReplicaSink>>,
    write_gate: Mutex<()>,
    stop: AtomicBool,
}

impl Engine {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            store: Arc::new(KeyValueStore::new()),
            aof: Arc::new(AofLogger::new(config.aof.clone())),
            rdb: Rdb::new(config.rdb.clone()),
            backlog: Mutex::new(ReplBacklog::new()),
            replicas: Mutex::new(Vec::new()),
            write_gate: Mutex::new(()),
            stop: AtomicBool::new(false),
            config,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Load persisted state and start the log writer. Errors here are
    /// startup failures; the process should exit with status 1.
    pub fn boot(&self) -> Result<()> {
        self.rdb.load(&self.store)?;
        AofLogger::init(&self.aof)?;
        self.aof.load(&self.store)?;
        Ok(())
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Drain and sync the log, then drop replica connections.
    pub fn shutdown(&self) {
        self.request_stop();
        self.aof.shutdown();
        self.replicas.lock().clear();
        log::info!("engine shut down");
    }

    /// Serializes mutating dispatch; hold the returned guard across the
    /// store mutation, log enqueue, and propagate.
    pub fn write_gate(&self) -> MutexGuard<'_, ()> {
        self.write_gate.lock()
    }

    /// Current replication stream tail.
    pub fn repl_offset(&self) -> i64 {
        self.backlog.lock().tail_offset()
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.lock().len()
    }

    /// Attach a replica connection to the broadcast fan-out.
    pub fn register_replica(&self, stream: TcpStream) {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        log::info!("replica attached: {peer}");
        self.replicas.lock().push(ReplicaSink { stream, peer });
    }

    /// Frame a mutating command for the replication stream, append it to
    /// the backlog, and write it to every attached replica in the same
    /// order.
    pub fn propagate(&self, parts: &[Bytes]) {
        if parts.is_empty() {
            return;
        }
        let cmd = resp::array_of_bulks(parts);
        let mut backlog = self.backlog.lock();
        let tail = backlog.tail_offset();
        // The header announces the tail after this command lands, which
        // includes the header itself; iterate in case the digit count
        // shifts the total.
        let mut target = tail + cmd.len() as i64;
        let header = loop {
            let header = format!("+OFFSET {target}\r\n");
            let total = tail + header.len() as i64 + cmd.len() as i64;
            if total == target {
                break header;
            }
            target = total;
        };
        backlog.append(header.as_bytes());
        backlog.append(&cmd);

        let mut replicas = self.replicas.lock();
        replicas.retain_mut(|sink| {
            let ok = sink
                .stream
                .write_all(header.as_bytes())
                .and_then(|_| sink.stream.write_all(&cmd))
                .is_ok();
            if !ok {
                log::info!("replica detached: {}", sink.peer);
            }
            ok
        });
    }

    /// Partial-resync lookup: stream bytes from `offset`, if the backlog
    /// still covers it, along with the current tail.
    pub fn psync_slice(&self, offset: i64) -> Option<(i64, Vec<u8>)> {
        let backlog = self.backlog.lock();
        let slice = backlog.slice_from(offset)?;
        Some((backlog.tail_offset(), slice))
    }

    /// Produce a fresh snapshot and return its bytes (full resync path).
    /// Snapshotting is forced on even when periodic snapshots are
    /// disabled in the config.
    pub fn sync_snapshot_bytes(&self) -> Result<Vec<u8>> {
        let mut opts = self.config.rdb.clone();
        opts.enabled = true;
        let rdb = Rdb::new(opts);
        rdb.save(&self.store)?;
        Ok(fs::read(rdb.path())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn test_propagate_advances_offset_by_framed_bytes() {
        let engine = Engine::new(ServerConfig::default());
        assert_eq!(engine.repl_offset(), 0);
        let parts = vec![b("SET"), b("k"), b("v")];
        let cmd_len = resp::array_of_bulks(&parts).len() as i64;
        engine.propagate(&parts);
        let tail = engine.repl_offset();
        let header_len = format!("+OFFSET {tail}\r\n").len() as i64;
        assert_eq!(tail, header_len + cmd_len);
    }

    #[test]
    fn test_psync_slice_covers_appended_stream() {
        let engine = Engine::new(ServerConfig::default());
        engine.propagate(&[b("SET"), b("a"), b("1")]);
        let mid = engine.repl_offset();
        engine.propagate(&[b("SET"), b("b"), b("2")]);
        let (tail, slice) = engine.psync_slice(mid).unwrap();
        assert_eq!(tail, engine.repl_offset());
        // the slice is exactly the second framed command
        let expected_cmd = resp::array_of_bulks([b("SET"), b("b"), b("2")]);
        assert!(slice.ends_with(&expected_cmd));
        assert!(slice.starts_with(b"+OFFSET "));

        // an evicted offset is a miss
        assert!(engine.psync_slice(-1).is_none());
        assert!(engine.psync_slice(tail + 1).is_none());
    }

    #[test]
    fn test_header_announces_final_tail() {
        let engine = Engine::new(ServerConfig::default());
        engine.propagate(&[b("SET"), b("k"), b("v")]);
        let (_, stream) = engine.psync_slice(0).unwrap();
        // parse the header back and compare with the real tail
        let text = String::from_utf8_lossy(&stream);
        let line = text.lines().next().unwrap();
        let announced: i64 = line.trim_start_matches("+OFFSET ").trim().parse().unwrap();
        assert_eq!(announced, engine.repl_offset());
    }
}
