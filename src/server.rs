//! TCP front-end.
//!
//! A non-blocking accept loop hands each connection to its own handler
//! thread; handlers parse RESP frames, capture the verbatim bytes of
//! each one, and dispatch. SYNC/PSYNC are intercepted before dispatch
//! because they turn the connection into a replica stream. A ticker
//! thread drives the active expiration sampler every 200 ms.

use crate::commands;
use crate::engine::Engine;
use crate::error::Result;
use crate::resp::{self, RespParser, RespValue};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How often the expiration sampler runs.
const EXPIRE_TICK: Duration = Duration::from_millis(200);
/// Samples per tick.
const EXPIRE_SCAN_STEPS: usize = 64;

/// Bind the listener. Failures here are startup failures.
pub fn bind(engine: &Engine) -> Result<TcpListener> {
    let addr = engine.config().listen_addr();
    let listener = TcpListener::bind(&addr)?;
    listener.set_nonblocking(true)?;
    log::info!("listening on {addr}");
    Ok(listener)
}

/// Accept connections until the engine is asked to stop.
pub fn serve(listener: TcpListener, engine: Arc<Engine>) {
    {
        let engine = Arc::clone(&engine);
        thread::Builder::new()
            .name("expire-tick".to_string())
            .spawn(move || expiration_ticker(engine))
            .ok();
    }
    while !engine.is_stopped() {
        match listener.accept() {
            Ok((stream, peer)) => {
                log::debug!("connection from {peer}");
                let engine = Arc::clone(&engine);
                thread::Builder::new()
                    .name("conn".to_string())
                    .spawn(move || {
                        if let Err(e) = handle_connection(&engine, stream) {
                            log::debug!("connection {peer} closed: {e}");
                        }
                    })
                    .ok();
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                log::warn!("accept failed: {e}");
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn expiration_ticker(engine: Arc<Engine>) {
    while !engine.is_stopped() {
        thread::sleep(EXPIRE_TICK);
        let removed = engine.store.expire_scan_step(EXPIRE_SCAN_STEPS);
        if removed > 0 {
            log::debug!("active expiration removed {removed} keys");
        }
    }
}

fn handle_connection(engine: &Engine, mut stream: TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(Duration::from_millis(500)))?;
    let mut parser = RespParser::new();
    let mut buf = [0u8; 4096];

    loop {
        if engine.is_stopped() {
            return Ok(());
        }
        let n = match stream.read(&mut buf) {
            Ok(0) => return Ok(()), // peer closed
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

        while let Some((frame, raw)) = parser.try_parse_one_with_raw() {
            if frame.is_error() {
                // malformed input: flush the error and close
                stream.write_all(&resp::error("ERR protocol error"))?;
                return Ok(());
            }
            // SYNC/PSYNC change the connection's role; the reader stays
            // alive so the replica can retry the handshake later
            match command_name(&frame).as_deref() {
                Some("SYNC") => {
                    handle_sync(engine, &mut stream)?;
                    continue;
                }
                Some("PSYNC") => {
                    if handle_psync(engine, &frame, &mut stream)? {
                        continue;
                    }
                    // requested offset fell out of the backlog: full resync
                    handle_sync(engine, &mut stream)?;
                    continue;
                }
                _ => {}
            }
            let reply = commands::dispatch(engine, &frame, &raw);
            stream.write_all(&reply)?;
        }
    }
}

fn command_name(frame: &RespValue) -> Option<String> {
    let RespValue::Array(items) = frame else {
        return None;
    };
    let name = items.first()?.as_text_bytes()?;
    Some(String::from_utf8_lossy(&name).to_ascii_uppercase())
}

/// Full resync: fresh snapshot as a RESP bulk, then the current stream
/// offset. The connection is registered for the mutation broadcast.
///
/// Holds the write gate so no mutation can land between the snapshot
/// and the registration; every command is either in the snapshot or
/// streamed afterwards.
fn handle_sync(engine: &Engine, stream: &mut TcpStream) -> std::io::Result<()> {
    let _gate = engine.write_gate();
    match engine.sync_snapshot_bytes() {
        Ok(content) => {
            stream.write_all(&resp::bulk(&content))?;
            let header = format!("+OFFSET {}\r\n", engine.repl_offset());
            stream.write_all(header.as_bytes())?;
            engine.register_replica(stream.try_clone()?);
            Ok(())
        }
        Err(e) => {
            log::warn!("sync snapshot failed: {e}");
            stream.write_all(&resp::error("ERR sync save failed"))
        }
    }
}

/// Partial resync. Returns false when the caller should fall back to a
/// full resync.
fn handle_psync(
    engine: &Engine,
    frame: &RespValue,
    stream: &mut TcpStream,
) -> std::io::Result<bool> {
    let RespValue::Array(items) = frame else {
        return Ok(false);
    };
    let wanted = items
        .get(1)
        .and_then(|v| v.as_bulk())
        .and_then(|b| std::str::from_utf8(b).ok())
        .and_then(|s| s.parse::<i64>().ok());
    let Some(wanted) = wanted else {
        return Ok(false);
    };
    // gate out mutations so nothing lands between the slice and the
    // registration below
    let _gate = engine.write_gate();
    let Some((tail, slice)) = engine.psync_slice(wanted) else {
        return Ok(false);
    };
    let header = format!("+OFFSET {tail}\r\n");
    stream.write_all(header.as_bytes())?;
    stream.write_all(&slice)?;
    engine.register_replica(stream.try_clone()?);
    log::info!("partial resync from offset {wanted} ({} bytes)", slice.len());
    Ok(true)
}
