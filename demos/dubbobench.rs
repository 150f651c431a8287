// Copyright 2020 Joyent, Inc.

use std::fs;
use std::process;
use std::sync::Mutex;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use serde_json::Value;
use slog::{info, o, Drain, Level, LevelFilter, Logger};

use dubbo_bench::client;
use dubbo_bench::config::{defaults, ClientConfig};
use dubbo_bench::event_loop::EventLoop;
use dubbo_bench::protocol::{Invocation, Response};

static APP: &str = "dubbobench";

pub fn parse_opts<'a>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Pipelined load generator for a Dubbo RPC provider")
        .version(crate_version!())
        .arg(
            Arg::with_name("config")
                .help("JSON file with the full client configuration")
                .long("config")
                .short("c")
                .takes_value(true)
                .conflicts_with_all(&["service", "method"]),
        )
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for remote provider")
                .long("host")
                .short("h")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port for remote provider (Default: 20880)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("service")
                .help("Fully qualified name of the remote service")
                .long("service")
                .short("s")
                .takes_value(true)
                .required_unless("config"),
        )
        .arg(
            Arg::with_name("method")
                .help("Name of remote RPC method call")
                .long("method")
                .short("m")
                .takes_value(true)
                .required_unless("config"),
        )
        .arg(
            Arg::with_name("args")
                .help("JSON array of arguments for every call (Default: [])")
                .long("args")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("depth")
                .help("Requests kept in flight (Default: 1)")
                .long("depth")
                .short("d")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("total")
                .help("Responses to collect before stopping (Default: 1)")
                .long("total")
                .short("n")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .help("Log every connection event")
                .long("verbose")
                .short("v"),
        )
        .get_matches()
}

fn config_from(matches: &ArgMatches) -> Result<ClientConfig, String> {
    if let Some(path) = matches.value_of("config") {
        let raw = fs::read_to_string(path).map_err(|e| format!("{}: {}", path, e))?;
        return ClientConfig::from_json_str(&raw).map_err(|e| e.to_string());
    }

    let args = match matches.value_of("args") {
        Some(raw) => match serde_json::from_str(raw).map_err(|e| e.to_string())? {
            Value::Array(args) => args,
            other => vec![other],
        },
        None => vec![],
    };
    let inv = Invocation::new(
        matches.value_of("service").unwrap_or_default(),
        matches.value_of("method").unwrap_or_default(),
        args,
    );
    let mut config = ClientConfig::new(
        matches.value_of("host").unwrap_or(defaults::HOST),
        value_t!(matches, "port", u16).unwrap_or(defaults::PORT),
        inv,
    );
    config.pipeline_depth =
        value_t!(matches, "depth", usize).unwrap_or(defaults::PIPELINE_DEPTH);
    config.total_requests =
        value_t!(matches, "total", usize).unwrap_or(defaults::TOTAL_REQUESTS);
    Ok(config)
}

fn main() {
    let matches = parse_opts(APP.to_string());
    let level = if matches.is_present("verbose") {
        Level::Debug
    } else {
        Level::Info
    };
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let root_log = Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(decorator).build(),
            level,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    );

    let config = config_from(&matches).unwrap_or_else(|e| {
        eprintln!("Invalid configuration: {}", e);
        process::exit(1)
    });

    let mut first_error: Option<String> = None;
    let handler = |r: &Response| {
        if first_error.is_none() {
            if let Err(description) = r.result() {
                first_error = Some(String::from(description));
            }
        }
    };

    let mut event_loop = EventLoop::new().unwrap_or_else(|e| {
        eprintln!("Failed to create event loop: {}", e);
        process::exit(1)
    });
    let mut bench = client::run_async(&mut event_loop, &config, handler, Some(&root_log))
        .unwrap_or_else(|e| {
            eprintln!("Failed to start run: {}", e);
            process::exit(1)
        });
    if let Err(e) = event_loop.run(&mut bench) {
        eprintln!("Event loop failed: {}", e);
        process::exit(1)
    }
    let outcome = bench.take_outcome();
    drop(bench);

    match outcome {
        Some(Ok(report)) => {
            if let Some(description) = first_error {
                info!(root_log, "provider reported errors"; "first" => description);
            }
            info!(root_log, "throughput"; "responses_per_sec" => report.throughput());
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{}", json),
                Err(e) => eprintln!("Failed to serialize report: {}", e),
            }
        }
        Some(Err(e)) => {
            eprintln!("Run failed: {}", e);
            process::exit(1)
        }
        None => {
            eprintln!("Run did not finish");
            process::exit(1)
        }
    }
}
