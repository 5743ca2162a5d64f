//! Observer interface towards the UI.
//!
//! The core pushes notifications through this seam and never depends on any
//! GUI toolkit. Emission is fire-and-forget: sinks must not block, and a
//! misbehaving sink can slow notifications down but never a state
//! transition, because events are always delivered after the table locks
//! are released.

use ethereum_types::H256;
use parking_lot::RwLock;
use std::sync::Arc;

/// Compact description of a pending order, enough for list views.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PendingOrderDescr {
    pub id: H256,
    pub source_currency: String,
    pub source_amount: u64,
    pub dest_currency: String,
    pub dest_amount: u64,
    pub created_at: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum UiEvent {
    PendingTransactionReceived(PendingOrderDescr),
    TransactionStateChanged { id: H256, state_code: u32 },
    TransactionCancelled { id: H256, state_code: u32, reason_code: u32 },
    OrderExpired { id: H256 },
    AddressBookEntryReceived { currency: String, name: String, address: Vec<u8> },
    LogMessage(String),
}

pub trait UiConnector: Send + Sync {
    fn on_event(&self, event: &UiEvent);
}

/// Fans events out to the attached sinks.
#[derive(Default)]
pub struct UiBroadcaster {
    sinks: RwLock<Vec<Arc<dyn UiConnector>>>,
}

impl UiBroadcaster {
    pub fn new() -> UiBroadcaster { UiBroadcaster::default() }

    pub fn attach(&self, sink: Arc<dyn UiConnector>) { self.sinks.write().push(sink); }

    pub fn notify(&self, events: &[UiEvent]) {
        if events.is_empty() {
            return;
        }
        let sinks = self.sinks.read().clone();
        for sink in &sinks {
            for event in events {
                sink.on_event(event);
            }
        }
    }
}

#[cfg(test)]
pub mod for_tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records every event it sees; used by the scenario tests.
    #[derive(Default)]
    pub struct RecordingUi {
        pub events: Mutex<Vec<UiEvent>>,
    }

    impl UiConnector for RecordingUi {
        fn on_event(&self, event: &UiEvent) { self.events.lock().push(event.clone()); }
    }

    impl RecordingUi {
        pub fn drain(&self) -> Vec<UiEvent> { self.events.lock().drain(..).collect() }
    }
}
