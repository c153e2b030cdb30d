//! roster-ctl — command-line interface for the Roster daemon.

mod cmd;

use anyhow::{Context, Result};

const DEFAULT_PORT: u16 = 9101;

fn print_usage() {
    println!("Usage: roster-ctl [--port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  status                   Daemon identity, transport and state");
    println!("  peers                    Live peers and their addresses");
    println!("  find <name> <protocol>   Address of a peer offering <protocol>");
    println!("  help                     Show this message");
    println!();
    println!("Protocols: tcp, http, https, mqtt, mqtt-tls, mqtt-ws");
    println!("Default port: {}", DEFAULT_PORT);
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Parse --port option
    let mut port = DEFAULT_PORT;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--port" {
            i += 1;
            port = args
                .get(i)
                .context("--port requires a value")?
                .parse()
                .context("--port must be a number")?;
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | [] => cmd::status::cmd_status(port).await,
        ["peers"] => cmd::status::cmd_peers(port).await,
        ["find", name, protocol] => cmd::find::cmd_find(port, name, protocol).await,
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
