#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chatify_rust::calls::loopback::{
    LoopbackDevices, LoopbackPeerFactory, LoopbackPeerHandle, RecordingSink,
};
use chatify_rust::calls::{
    CallManager, CallManagerConfig, CallSession, DeviceLock, InMemoryRelay, PeerConfig,
    SessionDeps,
};
use chatify_rust::phase::NegotiationPhase;
use chatify_rust::types::UserId;
use tokio::sync::broadcast;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One user with their own fake hardware.
pub struct Party {
    pub devices: LoopbackDevices,
    pub sink: Arc<RecordingSink>,
    pub transports: LoopbackPeerFactory,
}

impl Party {
    pub fn new() -> Self {
        Self {
            devices: LoopbackDevices::new(),
            sink: Arc::new(RecordingSink::new()),
            transports: LoopbackPeerFactory::new(),
        }
    }

    /// Dependencies for a session started without a manager.
    pub fn deps(&self, relay: &InMemoryRelay) -> SessionDeps {
        SessionDeps {
            relay: Arc::new(relay.clone()),
            devices: Arc::new(self.devices.clone()),
            sink: self.sink.clone(),
            transports: Arc::new(self.transports.clone()),
            peer_config: PeerConfig::default(),
            device_lock: DeviceLock::new(),
            ring_timeout: None,
        }
    }

    pub fn manager(
        &self,
        id: &str,
        relay: &InMemoryRelay,
        config: CallManagerConfig,
    ) -> Arc<CallManager> {
        CallManager::new(
            UserId::new(id),
            config,
            Arc::new(relay.clone()),
            Arc::new(self.devices.clone()),
            self.sink.clone(),
            Arc::new(self.transports.clone()),
        )
    }

    pub fn peer(&self) -> LoopbackPeerHandle {
        self.transports.last_peer().expect("no peer created yet")
    }
}

pub async fn wait_phase(session: &CallSession, phase: NegotiationPhase) {
    let mut rx = session.watch();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.phase == phase))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {phase:?}, at {:?}", session.phase()))
        .expect("session dropped its snapshot channel");
}

pub async fn next_event<E: Clone>(rx: &mut broadcast::Receiver<E>) -> E {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event source closed")
}

/// Give spawned tasks a moment to drain their queues.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub fn kinds(relay: &InMemoryRelay) -> Vec<String> {
    relay.published().into_iter().map(|row| row.kind).collect()
}
