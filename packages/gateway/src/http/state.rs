use std::sync::Arc;

use crate::context::AppContext;
use crate::coordinator::RequestCoordinator;

/// Shared state handed to every axum handler.
#[derive(Clone)]
pub struct HttpState {
    pub coordinator: Arc<RequestCoordinator>,
    pub ctx: AppContext,
}
