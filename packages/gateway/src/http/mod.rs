pub mod handlers;
pub mod server;
pub mod state;

pub use server::{bind, router, serve_on};
pub use state::HttpState;
