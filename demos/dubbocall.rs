// Copyright 2020 Joyent, Inc.

use std::process;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use serde_json::Value;

use dubbo_bench::client;
use dubbo_bench::config::{defaults, ClientConfig};
use dubbo_bench::protocol::Invocation;

static APP: &str = "dubbocall";

pub fn parse_opts<'a>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for making a single Dubbo RPC method call")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for remote provider")
                .long("host")
                .short("h")
                .takes_value(true)
                .required(false),
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
                .required(true),
        )
        .arg(
            Arg::with_name("method")
                .help("Name of remote RPC method call")
                .long("method")
                .short("m")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("args")
                .help("JSON array of arguments for the method call")
                .long("args")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("timeout")
                .help("Send and receive timeout in milliseconds (Default: 3000)")
                .long("timeout")
                .short("t")
                .takes_value(true),
        )
        .get_matches()
}

fn main() {
    let matches = parse_opts(APP.to_string());
    let host = matches.value_of("host").unwrap_or(defaults::HOST);
    let port = value_t!(matches, "port", u16).unwrap_or(defaults::PORT);
    let timeout_ms = value_t!(matches, "timeout", u64).unwrap_or(defaults::TIMEOUT_MS);
    let service = matches.value_of("service").unwrap_or_default();
    let method = matches.value_of("method").unwrap_or_default();
    let args = match value_t!(matches, "args", Value).unwrap_or_else(|e| e.exit()) {
        Value::Array(args) => args,
        other => vec![other],
    };

    let mut config = ClientConfig::new(host, port, Invocation::new(service, method, args));
    config.timeout_ms = timeout_ms;

    match client::invoke_sync(&config, None) {
        Ok(response) => match response.result() {
            Ok(value) => println!("{}", value),
            Err(description) => {
                eprintln!("Error: {}", description);
                process::exit(2)
            }
        },
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1)
        }
    }
}
