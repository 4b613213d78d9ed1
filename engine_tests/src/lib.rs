//! Shared fixtures for the integration tests.
//!
//! A [`Rig`] runs a server on an ephemeral localhost UDP port and any number
//! of clients on the same task, stepping them in turn.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use engine_client::GameClient;
use engine_server::{server::bind_ephemeral, TransportServer};
use engine_shared::{
    binary_data::{register_engine_types, BinaryDataDescriptorSet, BinaryDataSetBuilder},
    config::EngineConfig,
    snapshot::ObjectTable,
};

/// Installs a test-friendly subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

/// The descriptor set both ends agree on.
pub fn engine_descriptors() -> anyhow::Result<Arc<BinaryDataDescriptorSet>> {
    let mut builder = BinaryDataSetBuilder::new();
    register_engine_types(&mut builder)?;
    Ok(Arc::new(builder.build()))
}

pub struct Rig {
    pub server: TransportServer,
    pub objects: ObjectTable,
    pub clients: Vec<GameClient>,
    pub cfg: EngineConfig,
}

impl Rig {
    /// Binds a server and starts `c1a0` with an empty `ModelPrecache` list.
    pub async fn start(cfg: EngineConfig) -> anyhow::Result<Self> {
        let (mut server, cfg) = bind_ephemeral(cfg, engine_descriptors()?).await?;
        server.start_map("c1a0", |lists| lists.create_list("ModelPrecache").map(|_| ()))?;
        Ok(Self {
            server,
            objects: ObjectTable::new(),
            clients: Vec::new(),
            cfg,
        })
    }

    /// Connects a client with the engine descriptors; returns its index.
    pub async fn add_client(&mut self, name: &str) -> anyhow::Result<usize> {
        let addr = self.server.local_addr()?;
        self.add_client_with(name, engine_descriptors()?, addr).await
    }

    pub async fn add_client_with(
        &mut self,
        name: &str,
        descriptors: Arc<BinaryDataDescriptorSet>,
        addr: std::net::SocketAddr,
    ) -> anyhow::Result<usize> {
        let client = GameClient::connect(addr, name, descriptors).await?;
        self.clients.push(client);
        Ok(self.clients.len() - 1)
    }

    /// One server step, then one poll of every client.
    pub fn tick(&mut self) -> anyhow::Result<()> {
        let now = Instant::now();
        self.server.step(now, &self.objects)?;
        for client in &mut self.clients {
            client.poll(now)?;
        }
        Ok(())
    }

    /// Ticks every couple of milliseconds until `done` holds or `timeout`
    /// passes. Returns whether `done` held.
    pub async fn run_until<F>(&mut self, timeout: Duration, mut done: F) -> anyhow::Result<bool>
    where
        F: FnMut(&mut Rig) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            self.tick()?;
            if done(self) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}
