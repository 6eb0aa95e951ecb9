//! Replica ingress.
//!
//! When configured as a replica, a background thread connects to the
//! primary, performs the SYNC/PSYNC handshake, loads the initial bulk
//! snapshot through the RDB loader, then applies the command tail
//! directly against the keyspace — bypassing the append-only log. The
//! last seen `+OFFSET` header is remembered so a reconnect can request a
//! partial resync.

use crate::engine::Engine;
use crate::rdb::Rdb;
use crate::resp::{self, RespParser, RespValue};
use bytes::Bytes;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const RECONNECT_DELAY: Duration = Duration::from_millis(500);

pub struct ReplicaClient {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReplicaClient {
    /// Spawn the ingress thread; a no-op when replica mode is disabled.
    pub fn start(engine: &Arc<Engine>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        if !engine.config().replica.enabled {
            return Self {
                running,
                handle: None,
            };
        }
        let engine = Arc::clone(engine);
        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("replica-ingress".to_string())
            .spawn(move || ingress_loop(&engine, &flag))
            .ok();
        Self {
            running,
            handle,
        }
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReplicaClient {
    fn drop(&mut self) {
        self.stop();
    }
}

fn ingress_loop(engine: &Arc<Engine>, running: &AtomicBool) {
    let host = engine.config().replica.primary_host.clone();
    let port = engine.config().replica.primary_port;
    let mut last_offset: i64 = 0;

    while running.load(Ordering::SeqCst) && !engine.is_stopped() {
        let stream = match TcpStream::connect((host.as_str(), port)) {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("primary {host}:{port} unreachable: {e}");
                thread::sleep(RECONNECT_DELAY);
                continue;
            }
        };
        if let Err(e) = session(engine, running, stream, &mut last_offset) {
            log::warn!("replication session ended: {e}");
        }
        thread::sleep(RECONNECT_DELAY);
    }
}

fn session(
    engine: &Arc<Engine>,
    running: &AtomicBool,
    mut stream: TcpStream,
    last_offset: &mut i64,
) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_millis(500)))?;
    let request = if *last_offset > 0 {
        resp::array_of_bulks(["PSYNC".to_string(), last_offset.to_string()])
    } else {
        resp::array_of_bulks(["SYNC"])
    };
    stream.write_all(&request)?;
    log::info!(
        "connected to primary {}:{} (from offset {last_offset})",
        engine.config().replica.primary_host,
        engine.config().replica.primary_port
    );

    let mut parser = RespParser::new();
    let mut buf = [0u8; 8192];
    while running.load(Ordering::SeqCst) && !engine.is_stopped() {
        let n = match stream.read(&mut buf) {
            Ok(0) => return Ok(()), // primary closed
            Ok(n) => n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        parser.append(&buf[..n]);
        while let Some(value) = parser.try_parse_one() {
            match value {
                RespValue::Bulk(snapshot) => load_snapshot(engine, &snapshot),
                RespValue::Array(items) => {
                    let parts: Vec<Bytes> =
                        items.iter().filter_map(|v| v.as_text_bytes()).collect();
                    apply_stream_command(engine, &parts);
                }
                RespValue::Simple(line) => {
                    if let Some(rest) = line.strip_prefix("OFFSET ")
                        && let Ok(offset) = rest.trim().parse::<i64>()
                    {
                        *last_offset = offset;
                    }
                }
                RespValue::Error(e) => {
                    log::warn!("primary replied with an error: {e}");
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// Feed the initial bulk through the snapshot loader by way of the local
/// RDB file.
fn load_snapshot(engine: &Arc<Engine>, content: &[u8]) {
    let mut opts = engine.config().rdb.clone();
    opts.enabled = true;
    let rdb = Rdb::new(opts);
    let write = std::fs::create_dir_all(rdb.path().parent().unwrap_or(std::path::Path::new(".")))
        .and_then(|_| std::fs::write(rdb.path(), content));
    if let Err(e) = write {
        log::error!("writing replica snapshot failed: {e}");
        return;
    }
    if let Err(e) = rdb.load(&engine.store) {
        log::error!("loading replica snapshot failed: {e}");
        return;
    }
    log::info!("replica snapshot loaded ({} bytes)", content.len());
}

/// Apply one replicated mutation to the keyspace. The append-only log is
/// deliberately bypassed; durability on a replica comes from its own
/// snapshots.
fn apply_stream_command(engine: &Arc<Engine>, parts: &[Bytes]) {
    let Some(name) = parts.first() else {
        return;
    };
    let store = &engine.store;
    let cmd = String::from_utf8_lossy(name).to_ascii_uppercase();
    match cmd.as_str() {
        "SET" if parts.len() >= 3 => {
            let mut ttl_ms = None;
            let mut i = 3;
            while i + 1 < parts.len() {
                let opt = String::from_utf8_lossy(&parts[i]).to_ascii_uppercase();
                match (opt.as_str(), parse_i64(&parts[i + 1])) {
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
            if let Some(seconds) = parse_i64(&parts[2]) {
                store.expire(&parts[1], seconds);
            }
        }
        "HSET" if parts.len() == 4 => {
            store.hset(parts[1].clone(), parts[2].clone(), parts[3].clone());
        }
        "HDEL" if parts.len() >= 3 => {
            store.hdel(&parts[1], &parts[2..]);
        }
        "ZADD" if parts.len() == 4 => {
            if let Some(score) = parse_f64(&parts[2]) {
                store.zadd(parts[1].clone(), score, parts[3].clone());
            }
        }
        "ZREM" if parts.len() >= 3 => {
            store.zrem(&parts[1], &parts[2..]);
        }
        "FLUSHALL" => store.clear(),
        _ => log::debug!("ignoring replicated command {cmd}"),
    }
}

fn parse_i64(bytes: &Bytes) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

fn parse_f64(bytes: &Bytes) -> Option<f64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}
