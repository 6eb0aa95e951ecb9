//! Command dispatch.
//!
//! Maps an uppercased command name to its handler. Handlers receive the
//! engine, the decoded frame, and the verbatim frame bytes; mutating
//! handlers apply the store change, enqueue the raw bytes for the
//! append-only log, and propagate to replicas under the engine's write
//! gate, then wait for durability (always mode) after releasing it.

use crate::engine::Engine;
use crate::resp::{self, RespValue};
use crate::store::format_score;
use bytes::Bytes;

/// Dispatch one decoded request frame, returning the serialized reply.
pub fn dispatch(engine: &Engine, frame: &RespValue, raw: &[u8]) -> Vec<u8> {
    let RespValue::Array(items) = frame else {
        return resp::error("ERR protocol error");
    };
    if items.is_empty() {
        return resp::error("ERR protocol error");
    }
    let Some(name) = items[0].as_text_bytes() else {
        return resp::error("ERR wrong type");
    };
    let cmd = String::from_utf8_lossy(&name).to_ascii_uppercase();

    match cmd.as_str() {
        "PING" => ping(items),
        "ECHO" => echo(items),
        "SET" => set(engine, items, raw),
        "GET" => get(engine, items),
        "KEYS" => keys(engine, items),
        "FLUSHALL" => flushall(engine, items, raw),
        "DEL" => del(engine, items, raw),
        "EXISTS" => exists(engine, items),
        "EXPIRE" => expire(engine, items, raw),
        "TTL" => ttl(engine, items),
        "HSET" => hset(engine, items, raw),
        "HGET" => hget(engine, items),
        "HDEL" => hdel(engine, items, raw),
        "HEXISTS" => hexists(engine, items),
        "HGETALL" => hgetall(engine, items),
        "HLEN" => hlen(engine, items),
        "ZADD" => zadd(engine, items, raw),
        "ZREM" => zrem(engine, items, raw),
        "ZRANGE" => zrange(engine, items),
        "ZSCORE" => zscore(engine, items),
        "BGSAVE" | "SAVE" => bgsave(engine, items),
        "BGREWRITEAOF" => bgrewriteaof(engine, items),
        "CONFIG" => config(engine, items),
        "INFO" => info(engine, items),
        _ => resp::error("ERR unknown command"),
    }
}

/// True when the command mutates the keyspace (used by callers that need
/// to know without dispatching).
pub fn is_mutating(name: &str) -> bool {
    matches!(
        name,
        "SET" | "DEL" | "EXPIRE" | "FLUSHALL" | "HSET" | "HDEL" | "ZADD" | "ZREM"
    )
}

fn wrong_args(name: &str) -> Vec<u8> {
    resp::error(&format!("ERR wrong number of arguments for '{name}'"))
}

fn syntax_error() -> Vec<u8> {
    resp::error("ERR syntax")
}

fn not_an_integer() -> Vec<u8> {
    resp::error("ERR value is not an integer or out of range")
}

fn arg(items: &[RespValue], idx: usize) -> Option<&Bytes> {
    items.get(idx).and_then(|v| v.as_bulk())
}

fn parse_i64(bytes: &Bytes) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

fn parse_f64(bytes: &Bytes) -> Option<f64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Collect every element's payload for the log/replication stream.
fn to_parts(items: &[RespValue]) -> Vec<Bytes> {
    items.iter().filter_map(|v| v.as_text_bytes()).collect()
}

/// Log the raw frame (or its re-serialized fallback) and broadcast.
/// Returns the log sequence number to wait on after the gate drops.
fn persist_and_propagate(engine: &Engine, raw: &[u8], parts: Vec<Bytes>) -> i64 {
    let seq = if raw.is_empty() {
        engine.aof.append_command(&parts)
    } else {
        engine.aof.append_raw(raw)
    };
    engine.propagate(&parts);
    seq
}

fn ping(items: &[RespValue]) -> Vec<u8> {
    match items.len() {
        1 => resp::simple_string("PONG"),
        2 => match arg(items, 1) {
            Some(msg) => resp::bulk(msg),
            None => wrong_args("PING"),
        },
        _ => wrong_args("PING"),
    }
}

fn echo(items: &[RespValue]) -> Vec<u8> {
    if items.len() != 2 {
        return wrong_args("ECHO");
    }
    match arg(items, 1) {
        Some(msg) => resp::bulk(msg),
        None => wrong_args("ECHO"),
    }
}

fn set(engine: &Engine, items: &[RespValue], raw: &[u8]) -> Vec<u8> {
    if items.len() < 3 {
        return wrong_args("SET");
    }
    let (Some(key), Some(value)) = (arg(items, 1), arg(items, 2)) else {
        return syntax_error();
    };
    let mut ttl_ms: Option<i64> = None;
    let mut i = 3;
    while i < items.len() {
        let Some(opt) = arg(items, i) else {
            return syntax_error();
        };
        let opt = String::from_utf8_lossy(opt).to_ascii_uppercase();
        match opt.as_str() {
            "EX" => {
                let Some(value) = arg(items, i + 1) else {
                    return syntax_error();
                };
                let Some(seconds) = parse_i64(value) else {
                    return not_an_integer();
                };
                if seconds < 0 {
                    return resp::error("ERR invalid expire time in SET");
                }
                ttl_ms = Some(seconds * 1000);
                i += 2;
            }
            "PX" => {
                let Some(value) = arg(items, i + 1) else {
                    return syntax_error();
                };
                let Some(ms) = parse_i64(value) else {
                    return not_an_integer();
                };
                if ms < 0 {
                    return resp::error("ERR invalid expire time in SET");
                }
                ttl_ms = Some(ms);
                i += 2;
            }
            _ => return syntax_error(),
        }
    }

    let seq;
    {
        let _gate = engine.write_gate();
        engine.store.set(key.clone(), value.clone(), ttl_ms);
        seq = persist_and_propagate(engine, raw, to_parts(items));
    }
    engine.aof.wait_durable(seq);
    resp::simple_string("OK")
}

fn get(engine: &Engine, items: &[RespValue]) -> Vec<u8> {
    if items.len() != 2 {
        return wrong_args("GET");
    }
    let Some(key) = arg(items, 1) else {
        return syntax_error();
    };
    match engine.store.get(key) {
        Some(value) => resp::bulk(&value),
        None => resp::null_bulk(),
    }
}

fn keys(engine: &Engine, items: &[RespValue]) -> Vec<u8> {
    let pattern = match items.len() {
        1 => Bytes::from_static(b"*"),
        2 => match items[1].as_text_bytes() {
            Some(p) => p,
            None => return syntax_error(),
        },
        _ => return wrong_args("KEYS"),
    };
    // only '*' is supported; anything else yields an empty array
    let keys = if pattern.as_ref() == b"*" {
        engine.store.list_keys()
    } else {
        Vec::new()
    };
    let mut out = resp::array_header(keys.len());
    for key in &keys {
        out.extend_from_slice(&resp::bulk(key));
    }
    out
}

fn flushall(engine: &Engine, items: &[RespValue], raw: &[u8]) -> Vec<u8> {
    if items.len() != 1 {
        return wrong_args("FLUSHALL");
    }
    let seq;
    {
        let _gate = engine.write_gate();
        engine.store.clear();
        seq = persist_and_propagate(engine, raw, vec![Bytes::from_static(b"FLUSHALL")]);
    }
    engine.aof.wait_durable(seq);
    resp::simple_string("OK")
}

fn del(engine: &Engine, items: &[RespValue], raw: &[u8]) -> Vec<u8> {
    if items.len() < 2 {
        return wrong_args("DEL");
    }
    let mut keys = Vec::with_capacity(items.len() - 1);
    for item in &items[1..] {
        match item.as_bulk() {
            Some(key) => keys.push(key.clone()),
            None => return syntax_error(),
        }
    }
    let mut seq = 0;
    let removed;
    {
        let _gate = engine.write_gate();
        removed = engine.store.del(&keys);
        if removed > 0 {
            seq = persist_and_propagate(engine, raw, to_parts(items));
        }
    }
    engine.aof.wait_durable(seq);
    resp::integer(removed as i64)
}

fn exists(engine: &Engine, items: &[RespValue]) -> Vec<u8> {
    if items.len() != 2 {
        return wrong_args("EXISTS");
    }
    let Some(key) = arg(items, 1) else {
        return syntax_error();
    };
    resp::integer(engine.store.exists(key) as i64)
}

fn expire(engine: &Engine, items: &[RespValue], raw: &[u8]) -> Vec<u8> {
    if items.len() != 3 {
        return wrong_args("EXPIRE");
    }
    let (Some(key), Some(seconds)) = (arg(items, 1), arg(items, 2)) else {
        return syntax_error();
    };
    let Some(seconds) = parse_i64(seconds) else {
        return not_an_integer();
    };
    let mut seq = 0;
    let applied;
    {
        let _gate = engine.write_gate();
        applied = engine.store.expire(key, seconds);
        if applied {
            seq = persist_and_propagate(engine, raw, to_parts(items));
        }
    }
    engine.aof.wait_durable(seq);
    resp::integer(applied as i64)
}

fn ttl(engine: &Engine, items: &[RespValue]) -> Vec<u8> {
    if items.len() != 2 {
        return wrong_args("TTL");
    }
    let Some(key) = arg(items, 1) else {
        return syntax_error();
    };
    resp::integer(engine.store.ttl(key))
}

fn hset(engine: &Engine, items: &[RespValue], raw: &[u8]) -> Vec<u8> {
    if items.len() != 4 {
        return wrong_args("HSET");
    }
    let (Some(key), Some(field), Some(value)) = (arg(items, 1), arg(items, 2), arg(items, 3))
    else {
        return syntax_error();
    };
    let seq;
    let created;
    {
        let _gate = engine.write_gate();
        created = engine.store.hset(key.clone(), field.clone(), value.clone());
        seq = persist_and_propagate(engine, raw, to_parts(items));
    }
    engine.aof.wait_durable(seq);
    resp::integer(created)
}

fn hget(engine: &Engine, items: &[RespValue]) -> Vec<u8> {
    if items.len() != 3 {
        return wrong_args("HGET");
    }
    let (Some(key), Some(field)) = (arg(items, 1), arg(items, 2)) else {
        return syntax_error();
    };
    match engine.store.hget(key, field) {
        Some(value) => resp::bulk(&value),
        None => resp::null_bulk(),
    }
}

fn hdel(engine: &Engine, items: &[RespValue], raw: &[u8]) -> Vec<u8> {
    if items.len() < 3 {
        return wrong_args("HDEL");
    }
    let Some(key) = arg(items, 1) else {
        return syntax_error();
    };
    let mut fields = Vec::with_capacity(items.len() - 2);
    for item in &items[2..] {
        match item.as_bulk() {
            Some(field) => fields.push(field.clone()),
            None => return syntax_error(),
        }
    }
    let mut seq = 0;
    let removed;
    {
        let _gate = engine.write_gate();
        removed = engine.store.hdel(key, &fields);
        if removed > 0 {
            seq = persist_and_propagate(engine, raw, to_parts(items));
        }
    }
    engine.aof.wait_durable(seq);
    resp::integer(removed as i64)
}

fn hexists(engine: &Engine, items: &[RespValue]) -> Vec<u8> {
    if items.len() != 3 {
        return wrong_args("HEXISTS");
    }
    let (Some(key), Some(field)) = (arg(items, 1), arg(items, 2)) else {
        return syntax_error();
    };
    resp::integer(engine.store.hexists(key, field) as i64)
}

fn hgetall(engine: &Engine, items: &[RespValue]) -> Vec<u8> {
    if items.len() != 2 {
        return wrong_args("HGETALL");
    }
    let Some(key) = arg(items, 1) else {
        return syntax_error();
    };
    let flat = engine.store.hgetall_flat(key);
    let mut out = resp::array_header(flat.len());
    for entry in &flat {
        out.extend_from_slice(&resp::bulk(entry));
    }
    out
}

fn hlen(engine: &Engine, items: &[RespValue]) -> Vec<u8> {
    if items.len() != 2 {
        return wrong_args("HLEN");
    }
    let Some(key) = arg(items, 1) else {
        return syntax_error();
    };
    resp::integer(engine.store.hlen(key) as i64)
}

fn zadd(engine: &Engine, items: &[RespValue], raw: &[u8]) -> Vec<u8> {
    if items.len() != 4 {
        return wrong_args("ZADD");
    }
    let (Some(key), Some(score), Some(member)) = (arg(items, 1), arg(items, 2), arg(items, 3))
    else {
        return syntax_error();
    };
    let Some(score) = parse_f64(score) else {
        return resp::error("ERR value is not a valid float");
    };
    let seq;
    let added;
    {
        let _gate = engine.write_gate();
        added = engine.store.zadd(key.clone(), score, member.clone());
        seq = persist_and_propagate(engine, raw, to_parts(items));
    }
    engine.aof.wait_durable(seq);
    resp::integer(added)
}

fn zrem(engine: &Engine, items: &[RespValue], raw: &[u8]) -> Vec<u8> {
    if items.len() < 3 {
        return wrong_args("ZREM");
    }
    let Some(key) = arg(items, 1) else {
        return syntax_error();
    };
    let mut members = Vec::with_capacity(items.len() - 2);
    for item in &items[2..] {
        match item.as_bulk() {
            Some(member) => members.push(member.clone()),
            None => return syntax_error(),
        }
    }
    let mut seq = 0;
    let removed;
    {
        let _gate = engine.write_gate();
        removed = engine.store.zrem(key, &members);
        if removed > 0 {
            seq = persist_and_propagate(engine, raw, to_parts(items));
        }
    }
    engine.aof.wait_durable(seq);
    resp::integer(removed as i64)
}

fn zrange(engine: &Engine, items: &[RespValue]) -> Vec<u8> {
    if items.len() != 4 {
        return wrong_args("ZRANGE");
    }
    let (Some(key), Some(start), Some(stop)) = (arg(items, 1), arg(items, 2), arg(items, 3))
    else {
        return syntax_error();
    };
    let (Some(start), Some(stop)) = (parse_i64(start), parse_i64(stop)) else {
        return not_an_integer();
    };
    let members = engine.store.zrange(key, start, stop);
    let mut out = resp::array_header(members.len());
    for member in &members {
        out.extend_from_slice(&resp::bulk(member));
    }
    out
}

fn zscore(engine: &Engine, items: &[RespValue]) -> Vec<u8> {
    if items.len() != 3 {
        return wrong_args("ZSCORE");
    }
    let (Some(key), Some(member)) = (arg(items, 1), arg(items, 2)) else {
        return syntax_error();
    };
    match engine.store.zscore(key, member) {
        Some(score) => resp::bulk(format_score(score).as_bytes()),
        None => resp::null_bulk(),
    }
}

fn bgsave(engine: &Engine, items: &[RespValue]) -> Vec<u8> {
    if items.len() != 1 {
        return wrong_args("BGSAVE");
    }
    match engine.rdb.save(&engine.store) {
        Ok(()) => resp::simple_string("OK"),
        Err(e) => resp::error(&format!("ERR rdb save failed: {e}")),
    }
}

fn bgrewriteaof(engine: &Engine, items: &[RespValue]) -> Vec<u8> {
    if items.len() != 1 {
        return wrong_args("BGREWRITEAOF");
    }
    if !engine.aof.is_enabled() {
        return resp::error("ERR AOF disabled");
    }
    match crate::aof::AofLogger::bg_rewrite(&engine.aof, &engine.store) {
        Ok(()) => resp::simple_string("OK"),
        Err(crate::error::KvError::Aof(msg)) => resp::error(&format!("ERR {msg}")),
        Err(e) => resp::error(&format!("ERR {e}")),
    }
}

fn config(engine: &Engine, items: &[RespValue]) -> Vec<u8> {
    if items.len() < 2 {
        return wrong_args("CONFIG");
    }
    let Some(sub) = items[1].as_text_bytes() else {
        return syntax_error();
    };
    let sub = String::from_utf8_lossy(&sub).to_ascii_uppercase();
    match sub.as_str() {
        "GET" => {
            let pattern = match items.len() {
                2 => Bytes::from_static(b"*"),
                3 => match items[2].as_text_bytes() {
                    Some(p) => p,
                    None => return wrong_args("CONFIG GET"),
                },
                _ => return wrong_args("CONFIG GET"),
            };
            let cfg = engine.config();
            let pairs: Vec<(&str, String)> = vec![
                (
                    "appendonly",
                    if cfg.aof.enabled { "yes" } else { "no" }.to_string(),
                ),
                ("appendfsync", cfg.aof.mode.as_config_str().to_string()),
                ("dir", cfg.rdb.dir.display().to_string()),
                ("dbfilename", cfg.rdb.filename.clone()),
                ("save", String::new()),
                ("timeout", "0".to_string()),
                ("databases", "16".to_string()),
                ("maxmemory", "0".to_string()),
            ];
            let mut body = Vec::new();
            let mut elems = 0;
            for (name, value) in &pairs {
                if pattern.as_ref() == b"*" || pattern.as_ref() == name.as_bytes() {
                    body.extend_from_slice(&resp::bulk(name.as_bytes()));
                    body.extend_from_slice(&resp::bulk(value.as_bytes()));
                    elems += 2;
                }
            }
            let mut out = resp::array_header(elems);
            out.extend_from_slice(&body);
            out
        }
        "RESETSTAT" => {
            if items.len() != 2 {
                return wrong_args("CONFIG RESETSTAT");
            }
            resp::simple_string("OK")
        }
        _ => resp::error("ERR unsupported CONFIG subcommand"),
    }
}

// INFO [section] — the section argument is accepted and ignored
fn info(engine: &Engine, _items: &[RespValue]) -> Vec<u8> {
    let cfg = engine.config();
    let role = if cfg.replica.enabled { "replica" } else { "master" };
    let mut body = String::with_capacity(512);
    body.push_str("# Server\r\n");
    body.push_str(&format!("minikv_version:{}\r\n", crate::VERSION));
    body.push_str(&format!("role:{role}\r\n"));
    body.push_str("# Persistence\r\n");
    body.push_str(&format!(
        "aof_enabled:{}\r\n",
        if cfg.aof.enabled { 1 } else { 0 }
    ));
    body.push_str(&format!(
        "aof_rewrite_in_progress:{}\r\n",
        if engine.aof.is_rewriting() { 1 } else { 0 }
    ));
    body.push_str("rdb_bgsave_in_progress:0\r\n");
    body.push_str("# Replication\r\n");
    body.push_str(&format!("connected_slaves:{}\r\n", engine.replica_count()));
    body.push_str(&format!("master_repl_offset:{}\r\n", engine.repl_offset()));
    resp::bulk(body.as_bytes())
}
