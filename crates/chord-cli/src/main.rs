// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chord_core::{NodeConfig, NodeHandle, RingSnapshot, RingSpace};

#[derive(Parser, Debug)]
#[command(name = "chord", about = "Chord distributed hash table node")]
struct Cli {
    /// IP address to bind to and advertise to other nodes
    #[arg(short = 'a', long = "addr")]
    addr: String,

    /// Port to bind to and listen on
    #[arg(short = 'p', long = "port", value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// IP address of an existing ring member to join (with --jp)
    #[arg(long = "ja", requires = "join_port", value_name = "ADDR")]
    join_addr: Option<String>,

    /// Port of an existing ring member to join (with --ja)
    #[arg(long = "jp", requires = "join_addr", value_name = "PORT",
          value_parser = clap::value_parser!(u16).range(1..))]
    join_port: Option<u16>,

    /// Milliseconds between stabilize rounds
    #[arg(long = "ts", value_name = "MS",
          value_parser = clap::value_parser!(u64).range(1..=60_000))]
    stabilize_ms: u64,

    /// Milliseconds between fix-fingers rounds
    #[arg(long = "tff", value_name = "MS",
          value_parser = clap::value_parser!(u64).range(1..=60_000))]
    fix_fingers_ms: u64,

    /// Milliseconds between predecessor checks
    #[arg(long = "tcp", value_name = "MS",
          value_parser = clap::value_parser!(u64).range(1..=60_000))]
    check_predecessor_ms: u64,

    /// Successor-list length
    #[arg(short = 'r', long = "successors", value_name = "N",
          value_parser = clap::value_parser!(u8).range(1..=32))]
    successors: u8,

    /// 40-hex-character identifier digest, overriding the endpoint hash
    #[arg(short = 'i', long = "id", value_name = "HEX40")]
    id: Option<String>,

    /// Ring exponent m; identifiers live in [0, 2^m)
    #[arg(short = 'm', long = "ring-bits", value_name = "BITS", default_value_t = 64,
          value_parser = clap::value_parser!(u8).range(1..=64))]
    ring_bits: u8,
}

fn parse_id_digest(hex40: &str) -> anyhow::Result<[u8; 20]> {
    if hex40.len() != 40 || !hex40.chars().all(|c| c.is_ascii_hexdigit()) {
        anyhow::bail!("identifier must be exactly 40 hex characters");
    }
    let bytes = hex::decode(hex40).context("decode identifier")?;
    let mut digest = [0u8; 20];
    digest.copy_from_slice(&bytes);
    Ok(digest)
}

fn node_config(cli: &Cli) -> anyhow::Result<NodeConfig> {
    let id_digest = cli.id.as_deref().map(parse_id_digest).transpose()?;
    Ok(NodeConfig {
        bind_ip: cli.addr.clone(),
        port: cli.port,
        ring_bits: cli.ring_bits,
        successor_count: usize::from(cli.successors),
        stabilize_interval: Duration::from_millis(cli.stabilize_ms),
        fix_fingers_interval: Duration::from_millis(cli.fix_fingers_ms),
        check_predecessor_interval: Duration::from_millis(cli.check_predecessor_ms),
        join: cli.join_addr.clone().zip(cli.join_port),
        id_digest,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // usage problems exit 1, not clap's default 2
            let _ = err.print();
            return ExitCode::from(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = node_config(&cli)?;
    let node = NodeHandle::start(config)
        .await
        .context("start chord node")?;
    info!(node = %node.addr(), "node running; commands: lookup <file>, storefile <file>, printstate, exit");

    let user_exit = repl(&node).await;
    node.shutdown();
    if user_exit {
        Ok(())
    } else {
        anyhow::bail!("node shut down after losing contact with the ring")
    }
}

/// Read shell commands until `exit` (returns true) or until the node
/// cancels itself (returns false).  EOF on stdin parks until cancellation.
async fn repl(node: &NodeHandle) -> bool {
    let cancel = node.cancel_token();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    _ => {
                        cancel.cancelled().await;
                        return false;
                    }
                };
                if !dispatch_command(node, line.trim()).await {
                    return true;
                }
            }
        }
    }
}

/// Returns false when the shell should terminate the node.
async fn dispatch_command(node: &NodeHandle, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    match parts.next() {
        None => {}
        Some("exit") => return false,
        Some("printstate") => print!("{}", render_state(&node.snapshot().await)),
        Some("lookup") => match parts.next() {
            Some(filename) => lookup(node, filename).await,
            None => println!("usage: lookup <filename>"),
        },
        Some("storefile") => match parts.next() {
            Some(filename) => storefile(node, filename).await,
            None => println!("usage: storefile <filename>"),
        },
        Some(other) => {
            println!("unknown command '{other}'; commands: lookup <file>, storefile <file>, printstate, exit");
        }
    }
    true
}

async fn lookup(node: &NodeHandle, filename: &str) {
    match node.fetch_file(filename).await {
        Ok((holder, id, bytes)) => {
            println!("file '{filename}' (id {id}) is held by {holder}");
            println!("{}", String::from_utf8_lossy(&bytes));
        }
        Err(err) => println!("lookup failed: {err}"),
    }
}

async fn storefile(node: &NodeHandle, filename: &str) {
    let bytes = match tokio::fs::read(filename).await {
        Ok(bytes) => bytes,
        Err(err) => {
            println!("cannot read '{filename}': {err}");
            return;
        }
    };
    match node.publish_file(filename, bytes).await {
        Ok((holder, id)) => println!("stored '{filename}' (id {id}) at {holder}"),
        Err(err) => println!("storefile failed: {err}"),
    }
}

fn render_state(snapshot: &RingSnapshot) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let _ = writeln!(out, "node {}", snapshot.addr);
    let _ = writeln!(out, "successors:");
    for (index, succ) in snapshot.successors.iter().enumerate() {
        let _ = writeln!(out, "  [{index}] {succ}");
    }
    let _ = writeln!(out, "predecessor: {}", snapshot.predecessor);
    let _ = writeln!(out, "finger table:");
    if let Ok(space) = RingSpace::new(snapshot.ring_bits) {
        for (index, finger) in snapshot.fingers.iter().enumerate() {
            let finger_index = index as u8 + 1;
            let target = space.finger_target(snapshot.addr.id, finger_index);
            let _ = writeln!(out, "  [{finger_index}] (target {target}) {finger}");
        }
    }
    let _ = writeln!(out, "files:");
    for (id, name) in &snapshot.files {
        let _ = writeln!(out, "  {id} {name}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec![
            "chord", "-a", "127.0.0.1", "-p", "4000", "--ts", "500", "--tff", "300", "--tcp",
            "500", "-r", "4",
        ]
    }

    #[test]
    fn create_mode_parses_without_join_flags() {
        let cli = Cli::try_parse_from(base_args()).expect("parse");
        let config = node_config(&cli).expect("config");
        assert!(config.join.is_none());
        assert_eq!(config.successor_count, 4);
        assert_eq!(config.stabilize_interval, Duration::from_millis(500));
    }

    #[test]
    fn join_flags_must_come_together() {
        let mut args = base_args();
        args.extend(["--ja", "10.0.0.1"]);
        assert!(Cli::try_parse_from(args).is_err());

        let mut args = base_args();
        args.extend(["--jp", "4001"]);
        assert!(Cli::try_parse_from(args).is_err());

        let mut args = base_args();
        args.extend(["--ja", "10.0.0.1", "--jp", "4001"]);
        let cli = Cli::try_parse_from(args).expect("parse");
        let config = node_config(&cli).expect("config");
        assert_eq!(config.join, Some(("10.0.0.1".into(), 4001)));
    }

    #[test]
    fn interval_bounds_are_enforced() {
        let mut args = vec![
            "chord", "-a", "127.0.0.1", "-p", "4000", "--ts", "0", "--tff", "300", "--tcp",
            "500", "-r", "4",
        ];
        assert!(Cli::try_parse_from(args.clone()).is_err());
        args[6] = "60001";
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn identifier_override_must_be_40_hex_chars() {
        assert!(parse_id_digest("abc").is_err());
        assert!(parse_id_digest(&"g".repeat(40)).is_err());

        let digest = parse_id_digest(&"0f".repeat(20)).expect("valid digest");
        assert_eq!(digest, [0x0f; 20]);
    }

    #[test]
    fn missing_required_flag_is_a_usage_error() {
        assert!(Cli::try_parse_from(["chord", "-a", "127.0.0.1"]).is_err());
    }
}
