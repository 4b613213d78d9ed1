//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p engine_client -- [--addr 127.0.0.1:27015] [--name Player] [--config client.json]
//!
//! The client connects, negotiates descriptors, spawns and prints what the
//! server replicates.
//!
//! Console commands:
//!   status     - Show client status
//!   disconnect - Leave the server and exit
//!   quit       - Same as disconnect

use std::{
    env,
    io::{BufRead, Write},
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use anyhow::Context;
use engine_client::{ClientEvent, ClientState, GameClient};
use engine_shared::{
    binary_data::{register_engine_types, BinaryDataSetBuilder},
    config::EngineConfig,
};
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> anyhow::Result<(EngineConfig, Option<SocketAddr>)> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = EngineConfig::default();
    let mut addr = None;
    let mut i = 1;
    while i < args.len() {
        match (args[i].as_str(), args.get(i + 1)) {
            ("--config", Some(path)) => {
                let text = std::fs::read_to_string(path).with_context(|| format!("read config {path}"))?;
                cfg = EngineConfig::from_json_str(&text).with_context(|| format!("parse config {path}"))?;
            }
            ("--addr", Some(v)) => addr = Some(v.parse().context("parse --addr")?),
            ("--name", Some(v)) => cfg.player_name = v.clone(),
            _ => {
                i += 1;
                continue;
            }
        }
        i += 2;
    }
    Ok((cfg, addr))
}

fn status(client: &GameClient) -> Vec<String> {
    let mut out = vec![
        format!("State: {:?}", client.state()),
        format!("User id: {:?}", client.user_id()),
    ];
    if let Some(map) = client.map_name() {
        out.push(format!("Map: {map}"));
    }
    out.push(format!(
        "Frame: {} ({} objects)",
        client.latest_frame(),
        client.objects().len()
    ));
    out
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let (cfg, addr) = parse_args()?;
    let server = match addr {
        Some(a) => a,
        None => SocketAddr::new([127, 0, 0, 1].into(), cfg.port()),
    };

    let mut builder = BinaryDataSetBuilder::new();
    register_engine_types(&mut builder).context("register engine types")?;
    let descriptors = Arc::new(builder.build());

    let mut client = GameClient::connect(server, &cfg.player_name, descriptors)
        .await
        .context("connect")?;

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

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

    let tick_interval = cfg.tick_interval();

    loop {
        while let Ok(line) = console_rx.try_recv() {
            match line.as_str() {
                "status" => status(&client).iter().for_each(|l| println!("{l}")),
                "disconnect" | "quit" => {
                    client.disconnect("Disconnect by user", Instant::now())?;
                }
                other => println!("Unknown command '{other}'"),
            }
        }

        client.poll(Instant::now())?;

        for event in client.take_events() {
            match event {
                ClientEvent::Snapshot { frame, .. } if frame % 64 != 0 => {}
                ClientEvent::Snapshot { frame, baseline } => {
                    info!(frame, ?baseline, objects = client.objects().len(), "Snapshot")
                }
                other => info!(event = ?other, "Server event"),
            }
        }

        if client.state() == ClientState::Connected {
            client.spawn()?;
        }
        if client.state() == ClientState::Disconnected {
            println!("Disconnected from server.");
            break;
        }

        tokio::time::sleep(tick_interval).await;
    }

    Ok(())
}
