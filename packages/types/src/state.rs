use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse lifecycle state. The State Reporter deduplicates consecutive
/// events on this field alone, never on `situation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Operating,
    Failing,
    Stopping,
    Stopped,
}

/// Closed set of situations a state transition can be attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Situation {
    ServerStarted,
    StoppedChildProcess,
    WasmMissing,
    DisasterlyCrashed,
    RespawnedAfterDisaster,
    HtmlRendered,
    HtmlNotRendered,
    RequestFailed,
    FulfilledStopCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEvent {
    pub state: State,
    pub situation: Situation,
    pub description: String,
    pub at: DateTime<Utc>,
}

impl StateEvent {
    pub fn new(state: State, situation: Situation, description: impl Into<String>) -> Self {
        Self {
            state,
            situation,
            description: description.into(),
            at: Utc::now(),
        }
    }
}
