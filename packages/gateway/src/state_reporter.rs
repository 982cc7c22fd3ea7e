use std::sync::{Arc, Mutex};

use crawlserver_types::{Situation, State, StateEvent};
use tokio::sync::broadcast;

/// Aggregates lifecycle events into an externally observable stream,
/// deduplicating consecutive events that carry the same coarse `state`
/// (never the same `situation` — two `operating` events in a row with
/// different situations are still collapsed to avoid flapping).
#[derive(Clone)]
pub struct StateReporter {
    last_state: Arc<Mutex<Option<State>>>,
    sender: broadcast::Sender<StateEvent>,
}

impl StateReporter {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            last_state: Arc::new(Mutex::new(None)),
            sender,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.sender.subscribe()
    }

    #[tracing::instrument(level = "debug", skip(self, description))]
    pub fn emit(&self, state: State, situation: Situation, description: impl Into<String>) {
        let description = description.into();
        let mut last = self.last_state.lock().unwrap();
        if *last == Some(state) {
            return;
        }
        *last = Some(state);
        let event = StateEvent::new(state, situation, description);
        tracing::info!(?event.state, ?event.situation, "{}", event.description);
        let _ = self.sender.send(event);
    }

    pub fn current_state(&self) -> Option<State> {
        *self.last_state.lock().unwrap()
    }
}

impl Default for StateReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedups_on_state_not_situation() {
        let reporter = StateReporter::new();
        let mut events = reporter.subscribe();

        reporter.emit(State::Operating, Situation::ServerStarted, "started");
        reporter.emit(State::Operating, Situation::HtmlRendered, "rendered /a");
        reporter.emit(State::Failing, Situation::WasmMissing, "missing");

        let first = events.try_recv().unwrap();
        assert_eq!(first.situation, Situation::ServerStarted);
        let second = events.try_recv().unwrap();
        assert_eq!(second.situation, Situation::WasmMissing);
        assert!(events.try_recv().is_err());
    }
}
