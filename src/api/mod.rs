pub mod routes;
pub mod stream;

pub use routes::{create_router, AppState};
