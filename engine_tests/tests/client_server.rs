//! Full socket-based integration tests for client ↔ server communication.

use std::time::{Duration, Instant};

use engine_client::{ClientEvent, ClientState};
use engine_server::sessions::ConnectionState;
use engine_shared::{
    binary_data::{BinaryDataSetBuilder, DescriptorId, FieldKind, FieldValue},
    config::EngineConfig,
    snapshot::{ObjectId, ObjectState},
};
use engine_tests::{init_tracing, Rig};

const WAIT: Duration = Duration::from_secs(5);

fn entity(health: i32) -> ObjectState {
    ObjectState::new(
        DescriptorId(0),
        vec![
            FieldValue::Vec3([64.0, 0.0, 16.0]),
            FieldValue::Vec3([0.0; 3]),
            FieldValue::UInt32(0),
            FieldValue::Int32(health),
            FieldValue::UInt32(0),
            FieldValue::Bool(true),
        ],
    )
}

/// Connects and spawns client `i`.
async fn join(rig: &mut Rig, name: &str) -> anyhow::Result<usize> {
    let i = rig.add_client(name).await?;
    let connected = rig
        .run_until(WAIT, |r| r.clients[i].state() == ClientState::Connected)
        .await?;
    assert!(connected, "client never connected: {:?}", rig.clients[i].events());
    rig.clients[i].spawn()?;
    let spawned = rig
        .run_until(WAIT, |r| r.clients[i].state() == ClientState::Spawned)
        .await?;
    assert!(spawned, "client never spawned");
    Ok(i)
}

/// Full integration: connect, negotiate, replicate lists and objects, kick.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_server_full_session() -> anyhow::Result<()> {
    init_tracing();
    let mut rig = Rig::start(EngineConfig::default()).await?;
    let c = join(&mut rig, "alice").await?;
    assert_eq!(rig.clients[c].user_id(), Some(1));
    assert_eq!(rig.clients[c].map_name(), Some("c1a0"));

    let list = rig.server.string_lists().find("ModelPrecache").expect("list");
    let index = rig.server.string_lists_mut().append(list, "models/player.mdl")?;
    assert_eq!(index, 0);

    rig.objects.insert(ObjectId(1), entity(100));
    let replicated = rig
        .run_until(WAIT, |r| {
            r.clients[c]
                .objects()
                .get(&ObjectId(1))
                .is_some_and(|o| o.fields[3] == FieldValue::Int32(100))
        })
        .await?;
    assert!(replicated, "object never reached the client");
    assert_eq!(
        rig.clients[c].string_list("ModelPrecache"),
        Some(&["models/player.mdl".to_string()][..])
    );

    rig.clients[c].take_events();
    rig.objects.insert(ObjectId(1), entity(80));
    let updated = rig
        .run_until(WAIT, |r| {
            r.clients[c]
                .objects()
                .get(&ObjectId(1))
                .is_some_and(|o| o.fields[3] == FieldValue::Int32(80))
        })
        .await?;
    assert!(updated, "health change never reached the client");
    // Once frames are acknowledged the server sends deltas.
    let got_delta = rig
        .run_until(WAIT, |r| {
            r.clients[c]
                .events()
                .iter()
                .any(|e| matches!(e, ClientEvent::Snapshot { baseline: Some(_), .. }))
        })
        .await?;
    assert!(got_delta, "no delta snapshot received");

    let out = rig.server.exec_console("kick 1 bye")?;
    assert_eq!(out, vec!["Kicked alice (bye)".to_string()]);
    let told = rig
        .run_until(WAIT, |r| r.clients[c].state() == ClientState::Disconnected)
        .await?;
    assert!(told);
    assert!(rig.clients[c]
        .events()
        .contains(&ClientEvent::Disconnected { reason: "bye".into() }));
    assert!(rig.server.sessions().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_server_rejects_extra_client() -> anyhow::Result<()> {
    init_tracing();
    let cfg = EngineConfig {
        max_clients: 1,
        ..Default::default()
    };
    let mut rig = Rig::start(cfg).await?;
    join(&mut rig, "first").await?;

    let second = rig.add_client("second").await?;
    let rejected = rig
        .run_until(WAIT, |r| r.clients[second].state() == ClientState::Disconnected)
        .await?;
    assert!(rejected);
    assert!(matches!(
        rig.clients[second].events(),
        [ClientEvent::Rejected { .. }]
    ));
    assert_eq!(rig.server.sessions().len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_joiner_receives_full_string_list() -> anyhow::Result<()> {
    init_tracing();
    let mut rig = Rig::start(EngineConfig::default()).await?;
    let list = rig.server.string_lists().find("ModelPrecache").expect("list");
    for v in ["v1", "v2", "v3"] {
        rig.server.string_lists_mut().append(list, v)?;
    }
    rig.tick()?;

    let c = join(&mut rig, "late").await?;
    assert_eq!(
        rig.clients[c].string_list("ModelPrecache"),
        Some(&["v1".to_string(), "v2".to_string(), "v3".to_string()][..])
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mismatched_descriptors_are_refused_with_reason() -> anyhow::Result<()> {
    init_tracing();
    let mut rig = Rig::start(EngineConfig::default()).await?;

    let mut builder = BinaryDataSetBuilder::new();
    builder.register("EntityState", &[("origin", FieldKind::Vec3)])?;
    let addr = rig.server.local_addr()?;
    let c = rig
        .add_client_with("modded", std::sync::Arc::new(builder.build()), addr)
        .await?;

    let dropped = rig
        .run_until(WAIT, |r| r.clients[c].state() == ClientState::Disconnected)
        .await?;
    assert!(dropped);
    let reason = rig.clients[c].events().iter().find_map(|e| match e {
        ClientEvent::Disconnected { reason } => Some(reason.clone()),
        _ => None,
    });
    assert!(reason.is_some_and(|r| r.starts_with("descriptor mismatch")));
    assert!(rig.server.sessions().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_disconnect_frees_the_slot() -> anyhow::Result<()> {
    init_tracing();
    let mut rig = Rig::start(EngineConfig::default()).await?;
    let c = join(&mut rig, "leaver").await?;
    assert_eq!(
        rig.server.client_by_user_id(1).map(|s| s.state),
        Some(ConnectionState::Spawned)
    );

    rig.clients[c].disconnect("bye", Instant::now())?;
    let gone = rig.run_until(WAIT, |r| r.server.sessions().is_empty()).await?;
    assert!(gone);

    // User ids are never reused.
    let again = join(&mut rig, "returner").await?;
    assert_eq!(rig.clients[again].user_id(), Some(2));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn map_change_reaches_connected_clients() -> anyhow::Result<()> {
    init_tracing();
    let mut rig = Rig::start(EngineConfig::default()).await?;
    let list = rig.server.string_lists().find("ModelPrecache").expect("list");
    rig.server.string_lists_mut().append(list, "models/old.mdl")?;
    let c = join(&mut rig, "alice").await?;
    assert_eq!(rig.clients[c].string_list("ModelPrecache").map(<[_]>::len), Some(1));

    rig.server.exec_console("map c1a1")?;
    let changed = rig
        .run_until(WAIT, |r| r.clients[c].map_name() == Some("c1a1"))
        .await?;
    assert!(changed);
    rig.run_until(WAIT, |r| r.clients[c].string_list("ModelPrecache").is_some())
        .await?;
    assert_eq!(
        rig.clients[c].string_list("ModelPrecache"),
        Some(&[][..])
    );
    Ok(())
}
