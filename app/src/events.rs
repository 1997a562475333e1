//! State-change notifications.
//!
//! Every published change to engine, progress, load or inventory state goes
//! out on one broadcast bus. Per-module event types live next to the code
//! that emits them and convert into [`CoreEvent`].

use derive_more::From;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::checkpoints::events::{
    CheckpointInventoryChanged, LoadedCheckpointChanged, ModelLoadingStateChanged,
};
use crate::engine::events::{ConsoleOutput, EngineStateChanged, GenerationProgressChanged};

const EVENT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, From)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum CoreEvent {
    EngineStateChanged(EngineStateChanged),
    GenerationProgressChanged(GenerationProgressChanged),
    ModelLoadingStateChanged(ModelLoadingStateChanged),
    CheckpointInventoryChanged(CheckpointInventoryChanged),
    LoadedCheckpointChanged(LoadedCheckpointChanged),
    ConsoleOutput(ConsoleOutput),
}

#[derive(Debug, thiserror::Error)]
#[error("no subscribers are listening for core events")]
pub struct NoSubscribers;

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: CoreEvent) -> Result<(), NoSubscribers> {
        self.sender.send(event).map(|_| ()).map_err(|_| NoSubscribers)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Anything that can be published on the bus.
pub trait Event: Sized {
    fn emit(self, bus: &EventBus) -> Result<(), NoSubscribers>;
}

impl<T> Event for T
where
    T: Into<CoreEvent>,
{
    fn emit(self, bus: &EventBus) -> Result<(), NoSubscribers> {
        bus.publish(self.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineState;

    #[test]
    fn test_emit_without_subscribers_is_reported() {
        let bus = EventBus::new();
        assert!(EngineStateChanged::from(&EngineState::Idle).emit(&bus).is_err());
    }

    #[test]
    fn test_event_serialization_shape() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        EngineStateChanged::from(&EngineState::Terminated { abnormal: true })
            .emit(&bus)
            .unwrap();

        let event = rx.try_recv().unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "engineStateChanged");
        assert_eq!(json["payload"]["state"], "terminated");
        assert_eq!(json["payload"]["abnormal"], true);
    }
}
