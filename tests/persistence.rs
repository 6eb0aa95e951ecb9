//! Durability tests: append-log replay across restart, rewrite under
//! concurrent load, and snapshot round-trips.

use bytes::Bytes;
use minikv::resp::{self, RespParser};
use minikv::{AofMode, Engine, ServerConfig, commands};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn config_with_aof(dir: &Path, mode: AofMode) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.aof.enabled = true;
    config.aof.mode = mode;
    config.aof.dir = dir.to_path_buf();
    config.aof.prealloc_bytes = 0;
    config.rdb.dir = dir.to_path_buf();
    config
}

/// Dispatch a command the way the connection loop would: decoded frame
/// plus verbatim bytes.
fn run(engine: &Engine, parts: &[String]) -> Vec<u8> {
    let encoded = resp::array_of_bulks(parts);
    let mut parser = RespParser::new();
    parser.append(&encoded);
    let (frame, raw) = parser.try_parse_one_with_raw().unwrap();
    commands::dispatch(engine, &frame, &raw)
}

fn run_str(engine: &Engine, parts: &[&str]) -> Vec<u8> {
    let parts: Vec<String> = parts.iter().map(|s| s.to_string()).collect();
    run(engine, &parts)
}

fn string_state(engine: &Engine) -> BTreeMap<Bytes, Bytes> {
    engine
        .store
        .snapshot()
        .into_iter()
        .map(|(k, r)| (k, r.value))
        .collect()
}

fn hash_state(engine: &Engine) -> BTreeMap<Bytes, BTreeMap<Bytes, Bytes>> {
    engine
        .store
        .snapshot_hash()
        .into_iter()
        .map(|(k, r)| (k, r.fields.into_iter().collect()))
        .collect()
}

#[test]
fn test_always_mode_replay_after_unclean_stop() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::new(config_with_aof(dir.path(), AofMode::Always));
    engine.boot().unwrap();

    assert_eq!(run_str(&engine, &["SET", "a", "1"]), b"+OK\r\n".to_vec());
    assert_eq!(
        run_str(&engine, &["SET", "b", "2", "PX", "100"]),
        b"+OK\r\n".to_vec()
    );
    // No shutdown: in always mode the replies above were only sent after
    // fdatasync, so the log already holds both commands.
    drop(engine);

    let engine = Engine::new(config_with_aof(dir.path(), AofMode::Always));
    engine.boot().unwrap();
    assert_eq!(run_str(&engine, &["GET", "a"]), b"$1\r\n1\r\n".to_vec());
    thread::sleep(Duration::from_millis(150));
    assert_eq!(run_str(&engine, &["GET", "b"]), b"$-1\r\n".to_vec());
    engine.shutdown();
}

#[test]
fn test_replay_covers_all_mutation_kinds() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::new(config_with_aof(dir.path(), AofMode::Always));
    engine.boot().unwrap();

    run_str(&engine, &["SET", "s", "v"]);
    run_str(&engine, &["SET", "gone", "x"]);
    run_str(&engine, &["DEL", "gone"]);
    run_str(&engine, &["HSET", "h", "f", "hv"]);
    run_str(&engine, &["ZADD", "z", "1.5", "m"]);
    run_str(&engine, &["ZADD", "z", "2.5", "n"]);
    run_str(&engine, &["ZREM", "z", "n"]);
    engine.shutdown();

    let engine = Engine::new(config_with_aof(dir.path(), AofMode::Always));
    engine.boot().unwrap();
    assert_eq!(run_str(&engine, &["GET", "s"]), b"$1\r\nv\r\n".to_vec());
    assert_eq!(run_str(&engine, &["GET", "gone"]), b"$-1\r\n".to_vec());
    assert_eq!(run_str(&engine, &["HGET", "h", "f"]), b"$2\r\nhv\r\n".to_vec());
    assert_eq!(
        run_str(&engine, &["ZSCORE", "z", "m"]),
        b"$8\r\n1.500000\r\n".to_vec()
    );
    assert_eq!(run_str(&engine, &["ZSCORE", "z", "n"]), b"$-1\r\n".to_vec());
    engine.shutdown();
}

#[test]
fn test_rewrite_under_concurrent_load() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::new(config_with_aof(dir.path(), AofMode::Always));
    engine.boot().unwrap();

    // seed the keyspace so the rewrite has real work to do
    for i in 0..1000 {
        run(&engine, &["SET".to_string(), format!("seed{i}"), format!("v{i}")]);
    }

    assert_eq!(run_str(&engine, &["BGREWRITEAOF"]), b"+OK\r\n".to_vec());

    // hammer the engine from several threads while the rewrite runs
    let mut handles = Vec::new();
    for t in 0..4 {
        let engine = Arc::clone(&engine);
        handles.push(thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_millis(800);
            let mut i = 0;
            while Instant::now() < deadline {
                run(
                    &engine,
                    &["SET".to_string(), format!("live{t}-{i}"), format!("x{i}")],
                );
                run(
                    &engine,
                    &[
                        "HSET".to_string(),
                        format!("h{t}"),
                        format!("f{i}"),
                        "1".to_string(),
                    ],
                );
                if i % 3 == 0 {
                    run(&engine, &["DEL".to_string(), format!("seed{}", i % 1000)]);
                }
                i += 1;
            }
            i
        }));
    }
    for handle in handles {
        assert!(handle.join().unwrap() > 0);
    }
    while engine.aof.is_rewriting() {
        thread::sleep(Duration::from_millis(10));
    }

    let strings_before = string_state(&engine);
    let hashes_before = hash_state(&engine);
    engine.shutdown();

    let engine = Engine::new(config_with_aof(dir.path(), AofMode::Always));
    engine.boot().unwrap();
    assert_eq!(string_state(&engine), strings_before);
    assert_eq!(hash_state(&engine), hashes_before);
    engine.shutdown();
}

#[test]
fn test_bgsave_round_trip() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::new(config_with_aof(dir.path(), AofMode::EverySecond));
    engine.boot().unwrap();

    run_str(&engine, &["SET", "k", "v"]);
    run_str(&engine, &["HSET", "h", "f", "hv"]);
    run_str(&engine, &["ZADD", "z", "3.25", "m"]);
    assert_eq!(run_str(&engine, &["BGSAVE"]), b"+OK\r\n".to_vec());
    let strings_before = string_state(&engine);
    engine.shutdown();

    // boot from the snapshot alone: fresh dir for the (empty) log
    let fresh_log = TempDir::new().unwrap();
    let mut config = config_with_aof(fresh_log.path(), AofMode::EverySecond);
    config.rdb.dir = dir.path().to_path_buf();
    let engine = Engine::new(config);
    engine.boot().unwrap();
    assert_eq!(string_state(&engine), strings_before);
    assert_eq!(run_str(&engine, &["HGET", "h", "f"]), b"$2\r\nhv\r\n".to_vec());
    assert_eq!(
        run_str(&engine, &["ZSCORE", "z", "m"]),
        b"$8\r\n3.250000\r\n".to_vec()
    );
    engine.shutdown();
}

#[test]
fn test_everysec_mode_survives_clean_shutdown() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::new(config_with_aof(dir.path(), AofMode::EverySecond));
    engine.boot().unwrap();
    for i in 0..100 {
        run(&engine, &["SET".to_string(), format!("k{i}"), "v".to_string()]);
    }
    // shutdown drains the queue and syncs before returning
    engine.shutdown();

    let engine = Engine::new(config_with_aof(dir.path(), AofMode::EverySecond));
    engine.boot().unwrap();
    for i in 0..100 {
        assert_eq!(
            run(&engine, &["GET".to_string(), format!("k{i}")]),
            b"$1\r\nv\r\n".to_vec()
        );
    }
    engine.shutdown();
}
