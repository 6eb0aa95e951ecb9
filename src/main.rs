//! minikv server binary.

use minikv::replica::ReplicaClient;
use minikv::{Engine, ServerConfig, server};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

static SHOULD_STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signum: libc::c_int) {
    SHOULD_STOP.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as usize);
        libc::signal(libc::SIGTERM, handle_signal as usize);
    }
}

fn print_usage(argv0: &str) {
    println!("minikv usage:\n  {argv0} [--port <port>] [--bind <ip>] [--config <file>]");
}

fn parse_args() -> Option<ServerConfig> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ServerConfig::default();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                i += 1;
                match args[i].parse() {
                    Ok(port) => config.port = port,
                    Err(_) => {
                        eprintln!("invalid port: {}", args[i]);
                        return None;
                    }
                }
            }
            "--bind" if i + 1 < args.len() => {
                i += 1;
                config.bind_address = args[i].clone();
            }
            "--config" if i + 1 < args.len() => {
                i += 1;
                let path = &args[i];
                let contents = match std::fs::read_to_string(path) {
                    Ok(contents) => contents,
                    Err(e) => {
                        eprintln!("cannot read config file {path}: {e}");
                        return None;
                    }
                };
                let parsed = if path.ends_with(".json") {
                    ServerConfig::from_json(&contents)
                } else {
                    ServerConfig::from_toml(&contents)
                };
                match parsed {
                    Ok(parsed) => config = parsed,
                    Err(e) => {
                        eprintln!("{e}");
                        return None;
                    }
                }
            }
            "-h" | "--help" => {
                print_usage(&args[0]);
                return None;
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage(&args[0]);
                return None;
            }
        }
        i += 1;
    }
    Some(config)
}

fn main() -> ExitCode {
    env_logger::init();
    let Some(config) = parse_args() else {
        return ExitCode::FAILURE;
    };
    if let Err(e) = config.validate() {
        log::error!("{e}");
        return ExitCode::FAILURE;
    }
    install_signal_handlers();

    let engine = Engine::new(config);
    if let Err(e) = engine.boot() {
        log::error!("startup failed: {e}");
        return ExitCode::FAILURE;
    }
    let listener = match server::bind(&engine) {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("bind failed: {e}");
            engine.shutdown();
            return ExitCode::FAILURE;
        }
    };

    let mut replica = ReplicaClient::start(&engine);
    let serve_handle = {
        let engine = engine.clone();
        thread::spawn(move || server::serve(listener, engine))
    };

    while !SHOULD_STOP.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }
    log::info!("shutting down");
    engine.request_stop();
    replica.stop();
    let _ = serve_handle.join();
    engine.shutdown();
    ExitCode::SUCCESS
}
