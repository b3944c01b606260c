//! Runs a 1:1 call between two simulated participants on the in-process
//! store and prints the resulting history.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use huddle::calling::types::RoomKind;
use huddle::calling::{
    start_direct_call, CallContext, CallEvent, CallRole, DirectCall, DirectCallSession, IncomingCallDetector,
    IncomingEvent, MediaKind, ProcessedCalls, RoomId, UserId,
};
use huddle::logging::init_logging;
use huddle::testing::{MemoryStore, MockMediaBackend};
use huddle::CallConfig;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging("huddle=info");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = CallConfig::load(config_path.as_deref()).context("Failed to load call configuration")?;
    info!("Starting huddle demo, ring timeout {:?}", config.ring_timeout());

    let store = MemoryStore::new();
    let room = RoomId::from("demo-room");
    store.create_room(&room, RoomKind::Direct, &["alice", "bob"], None);

    let alice = UserId::from("alice");
    let bob = UserId::from("bob");
    let context = |owner: &str| {
        CallContext::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(MockMediaBackend::new(owner).with_auto_connect()),
            config.clone(),
        )
    };

    let detector = IncomingCallDetector::new(bob.clone(), ProcessedCalls::new(config.processed_call_capacity));
    let (mut incoming, _detector_task) = detector.spawn(&store).await?;

    let call_id = start_direct_call(&store, &room, &alice, "Alice", MediaKind::Video).await?;
    let mut caller = DirectCallSession::new(
        context("alice"),
        DirectCall {
            call_id: call_id.clone(),
            room_id: room.clone(),
            local_user: alice.clone(),
            remote_user: bob.clone(),
            role: CallRole::Caller,
            media: MediaKind::Video,
        },
    )
    .spawn();

    let call = loop {
        match incoming.recv().await.context("Incoming call watcher stopped")? {
            IncomingEvent::Ringing(call) => break call,
            IncomingEvent::Cancelled { .. } => continue,
        }
    };
    info!("{} is calling {}", call.caller_name, bob);
    let callee = DirectCallSession::new(context("bob"), call.answer_as(&bob)).spawn();

    while let Some(event) = caller.next_event().await {
        info!("alice: {:?}", event);
        if matches!(event, CallEvent::Connected { .. }) {
            break;
        }
    }

    tokio::time::sleep(Duration::from_secs(2)).await;
    caller.hangup();

    let mut caller_summary = caller.wait().await?;
    let mut callee_summary = callee.wait().await?;
    caller_summary.flush().await;
    callee_summary.flush().await;
    info!("alice ended with {:?}, bob ended with {:?}", caller_summary.reason, callee_summary.reason);

    for entry in store.history() {
        println!("[{}] {}: {}", entry.room_id, entry.author, entry.text);
    }
    Ok(())
}
