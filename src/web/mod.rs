pub mod admin;
pub mod auth;
pub mod error;
pub mod models;
pub mod responses;
pub mod router;
pub mod sessions;
pub mod state;

pub use error::ApiError;
pub use responses::ApiMessage;
pub use sessions::{SESSION_COOKIE, SESSION_TTL_DAYS, SessionStore, SessionUser};
pub use state::AppState;
