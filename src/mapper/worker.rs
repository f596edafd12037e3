//! Mapper worker thread and the estimator-side handle.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::graph::{Feature, FeatureAdj, Group, GroupAdj};

use super::messages::MapperMsg;
use super::store::MapStore;

/// Timeout for receiving hand-offs. Allows periodic shutdown checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Estimator-side sender. Hand-offs never block.
#[derive(Clone)]
pub struct MapperHandle {
    sender: Sender<MapperMsg>,
}

impl MapperHandle {
    pub fn new(sender: Sender<MapperMsg>) -> Self {
        Self { sender }
    }

    /// Returns false if the hand-off was dropped.
    pub fn hand_off_feature(&self, feature: Feature, adjacency: FeatureAdj) -> bool {
        self.send(MapperMsg::Feature { feature, adjacency })
    }

    pub fn hand_off_group(&self, group: Group, adjacency: GroupAdj) -> bool {
        self.send(MapperMsg::Group { group, adjacency })
    }

    fn send(&self, msg: MapperMsg) -> bool {
        match self.sender.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("[Mapper] queue full, dropping hand-off");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("[Mapper] worker gone, dropping hand-off");
                false
            }
        }
    }
}

/// Owner of the mapper thread.
pub struct MapperWorker {
    store: Arc<MapStore>,
    handle: Option<JoinHandle<()>>,
}

/// Spawn the mapper thread with a queue of `capacity` hand-offs.
pub fn spawn_mapper(capacity: usize) -> (MapperHandle, MapperWorker) {
    let (sender, receiver) = bounded::<MapperMsg>(capacity);
    let store = MapStore::new();
    let shared = Arc::clone(&store);
    let handle = thread::spawn(move || run(receiver, shared));
    (
        MapperHandle::new(sender),
        MapperWorker {
            store,
            handle: Some(handle),
        },
    )
}

/// Main thread loop: file hand-offs until shutdown or disconnection.
fn run(receiver: Receiver<MapperMsg>, store: Arc<MapStore>) {
    loop {
        if store.is_shutdown_requested() {
            // Drain what was already queued.
            while let Ok(msg) = receiver.try_recv() {
                apply(&store, msg);
            }
            break;
        }
        match receiver.recv_timeout(RECV_TIMEOUT) {
            Ok(msg) => apply(&store, msg),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!(
        "[Mapper] exiting with {} features, {} groups",
        store.num_features(),
        store.num_groups()
    );
}

fn apply(store: &MapStore, msg: MapperMsg) {
    match msg {
        MapperMsg::Feature { feature, adjacency } => {
            debug!("[Mapper] feature {} with {} groups", feature.id, adjacency.len());
            store.add_feature(feature, &adjacency);
        }
        MapperMsg::Group { group, adjacency } => {
            debug!("[Mapper] group {} with {} features", group.id, adjacency.len());
            store.add_group(group, &adjacency);
        }
    }
}

impl MapperWorker {
    pub fn store(&self) -> &Arc<MapStore> {
        &self.store
    }

    /// Signal the thread to drain its queue and wait for it.
    pub fn shutdown(&mut self) {
        self.store.request_shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("[Mapper] worker thread panicked");
            }
        }
    }
}

impl Drop for MapperWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
