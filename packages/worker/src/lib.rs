pub mod engine;

pub use engine::{EngineError, RenderOutcome, WorkerEngine};
