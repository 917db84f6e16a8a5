use async_broadcast::{InactiveReceiver, Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::core::errors::FailureKind;

/// Progress notifications published while a run executes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    PlanPersisted {
        run: String,
        task_count: usize,
    },
    UnitStarted {
        unit: String,
        attempt: u32,
    },
    UnitSkipped {
        unit: String,
    },
    UnitCommitted {
        unit: String,
    },
    UnitRetrying {
        unit: String,
        attempt: u32,
        delay_ms: u64,
    },
    UnitFailed {
        unit: String,
        kind: FailureKind,
        cause: String,
    },
    ConsumerFinished {
        run: String,
        records: usize,
    },
}

/// Broadcast channel for [`RunEvent`]s
///
/// Publishing never waits: with no subscriber the event is dropped, and a full
/// channel discards its oldest entry.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: Sender<RunEvent>,
    // keeps the channel open while nobody listens
    _inactive: InactiveReceiver<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (mut sender, receiver) = async_broadcast::broadcast(capacity.max(1));
        sender.set_overflow(true);
        sender.set_await_active(false);
        Self {
            sender,
            _inactive: receiver.deactivate(),
        }
    }

    pub fn subscribe(&self) -> Receiver<RunEvent> {
        self.sender.new_receiver()
    }

    pub fn publish(&self, event: RunEvent) {
        let _ = self.sender.try_broadcast(event);
    }
}
