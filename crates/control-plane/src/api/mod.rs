// HTTP API routes
//
// Each submodule handles one resource with its own AppState.

pub mod common;
pub mod graduations;
pub mod health;

pub use common::{ErrorResponse, ListResponse};
