//! Identity minting for visitors and sessions. The visitor id is persisted
//! across sessions by the host (durable local storage); the session id is
//! ephemeral.

use uuid::Uuid;

/// Mints a new durable visitor id.
pub fn generate_visitor_id() -> String {
    format!("vis_{}", Uuid::new_v4().simple())
}

/// Mints a new ephemeral session id.
pub fn generate_session_id() -> String {
    format!("ses_{}", Uuid::new_v4().simple())
}
