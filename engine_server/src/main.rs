//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p engine_server -- [--config server.json] [--ip 0.0.0.0] [--port 27015]
//!                                 [--maxclients 32] [--tick-hz 64] [--map c1a0]
//!
//! Command line flags override values from the config file.
//!
//! Console commands:
//!   status              - Show server status
//!   kick <userid> [why] - Drop a client
//!   map <mapname>       - Change map
//!   quit                - Drop every client and exit

use std::{
    env,
    io::{BufRead, Write},
    sync::Arc,
};

use anyhow::Context;
use engine_server::TransportServer;
use engine_shared::{
    binary_data::{register_engine_types, BinaryDataSetBuilder},
    config::EngineConfig,
    snapshot::ObjectTable,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// String lists every map starts with.
const DEFAULT_LISTS: [&str; 2] = ["ModelPrecache", "SoundPrecache"];

struct Args {
    cfg: EngineConfig,
    map: String,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = env::args().collect();

    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) => {
            let path = args.get(i + 1).context("--config needs a path")?;
            let text = std::fs::read_to_string(path).with_context(|| format!("read config {path}"))?;
            EngineConfig::from_json_str(&text).with_context(|| format!("parse config {path}"))?
        }
        None => EngineConfig::default(),
    };
    let mut map = "c1a0".to_string();

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--config", Some(_)) => {}
            ("--ip", Some(v)) => cfg.ip = v.clone(),
            ("--port", Some(v)) => cfg.hostport = v.parse().context("parse --port")?,
            ("--maxclients", Some(v)) => cfg.max_clients = v.parse().context("parse --maxclients")?,
            ("--tick-hz", Some(v)) => cfg.tick_hz = v.parse().context("parse --tick-hz")?,
            ("--map", Some(v)) => map = v.clone(),
            _ => {
                i += 1;
                continue;
            }
        }
        i += 2;
    }
    Ok(Args { cfg, map })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let Args { cfg, map } = parse_args()?;

    let mut builder = BinaryDataSetBuilder::new();
    register_engine_types(&mut builder).context("register engine types")?;
    let descriptors = Arc::new(builder.build());

    info!(
        ip = %cfg.ip,
        port = cfg.port(),
        max_clients = cfg.max_clients,
        tick_hz = cfg.tick_hz,
        descriptors = descriptors.len(),
        "Starting server"
    );

    let tick_interval = cfg.tick_interval();
    let mut server = TransportServer::bind(cfg, descriptors)
        .await
        .context("create server")?;
    server.start_map(&map, |lists| {
        for name in DEFAULT_LISTS {
            lists.create_list(name)?;
        }
        Ok(())
    })?;
    let local = server.local_addr()?;
    info!(%local, map = %map, "Server listening");

    // Set up console input channel.
    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    server.set_console_input(console_rx);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Server ready. Type 'status' for info, 'kick <userid>', 'map <mapname>', 'quit' to exit.");
    println!();

    // Objects come from the game simulation; the bare server replicates none.
    let objects = ObjectTable::new();
    let mut next_tick = tokio::time::Instant::now();

    while !server.quit_requested() {
        if let Err(e) = server.step(std::time::Instant::now(), &objects) {
            warn!(tick = server.tick(), error = %e, "Tick failed");
        }

        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }
    info!(ticks = server.tick(), "Server stopped");
    Ok(())
}
