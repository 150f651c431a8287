// Copyright 2020 Joyent, Inc.

use std::env;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::prelude::*;
use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Value};
use slog::{debug, error, info, o, Drain, Logger};
use tokio::net::TcpListener;

use dubbo_bench::protocol::Invocation;
use dubbo_bench::server;

#[derive(Serialize, Deserialize)]
struct DatePayload {
    timestamp: i64,
    iso8601: DateTime<Utc>,
}

impl DatePayload {
    fn new() -> DatePayload {
        let now = Utc::now();
        DatePayload {
            timestamp: now.timestamp_millis(),
            iso8601: now,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct BenchPayload {
    echo: Value,
    delay: Option<u64>,
}

fn date_handler(_inv: &Invocation, log: &Logger) -> Result<Value, String> {
    debug!(log, "handling date function request");
    serde_json::to_value(DatePayload::new())
        .map_err(|_| String::from("Failed to encode date payload"))
}

fn echo_handler(inv: &Invocation, log: &Logger) -> Result<Value, String> {
    debug!(log, "handling echo function request");
    match inv.args.len() {
        1 => Ok(inv.args[0].clone()),
        _ => Ok(Value::Array(inv.args.clone())),
    }
}

fn bench_handler(inv: &Invocation, log: &Logger) -> Result<Value, String> {
    debug!(log, "handling bench function request");
    let payload: BenchPayload = match inv.args.first() {
        Some(arg) => serde_json::from_value(arg.clone())
            .map_err(|_| String::from("Failed to parse argument as bench payload"))?,
        None => return Err(String::from("Expected a single bench payload argument")),
    };
    if let Some(delay) = payload.delay {
        // keep the runtime's other connections moving while this one waits
        tokio::task::block_in_place(|| std::thread::sleep(Duration::from_millis(delay)));
    }
    Ok(json!({ "value": payload.echo }))
}

fn msg_handler(inv: &Invocation, log: &Logger) -> Result<Value, String> {
    match inv.method.as_str() {
        "date" => date_handler(inv, log),
        "echo" | "$echo" => echo_handler(inv, log),
        "bench" => bench_handler(inv, log),
        _ => Err(format!("Unsupported function: {}", inv.method)),
    }
}

#[tokio::main]
async fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let addr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:20880".to_string());
    let addr = match addr.parse::<SocketAddr>() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("error parsing address: {}", e);
            std::process::exit(1)
        }
    };

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("failed to bind {}: {}", addr, e);
            std::process::exit(1)
        }
    };
    info!(root_log, "listening for dubbo requests"; "address" => addr);

    loop {
        match listener.accept().await {
            Ok((socket, _)) => {
                let process_log = root_log.clone();
                tokio::spawn(async move {
                    server::make_task(socket, msg_handler, Some(&process_log)).await;
                });
            }
            Err(e) => error!(root_log, "failed to accept socket"; "err" => %e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn delayed_bench_call_leaves_the_runtime_free() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker_ticks = Arc::clone(&ticks);
        let ticker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                ticker_ticks.fetch_add(1, Ordering::SeqCst);
            }
        });

        let call = tokio::spawn(async {
            let log = Logger::root(slog::Discard, o!());
            let inv = Invocation::new(
                "com.example.Bench",
                "bench",
                vec![json!({"echo": 5, "delay": 300})],
            );
            msg_handler(&inv, &log)
        });
        let result = call.await.unwrap();
        let seen = ticks.load(Ordering::SeqCst);
        ticker.abort();

        assert_eq!(result, Ok(json!({"value": 5})));
        assert!(seen >= 5, "only {} ticks while the call slept", seen);
    }
}
