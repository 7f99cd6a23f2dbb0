// HTTP surface: commit trigger, session reads and backend status.

pub mod handlers;
pub mod server;
pub mod state;

pub use server::start_web_server;
pub use state::AppState;
