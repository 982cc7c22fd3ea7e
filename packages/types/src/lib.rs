pub mod cache;
pub mod job;
pub mod state;

pub use cache::CacheEntry;
pub use job::{RenderJob, RenderResult};
pub use state::{Situation, State, StateEvent};
