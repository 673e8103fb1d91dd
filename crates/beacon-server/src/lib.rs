pub mod rest;
pub mod state;

pub use rest::router;
pub use state::AppState;
