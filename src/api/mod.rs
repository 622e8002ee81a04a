// =============================================================================
// Read-only REST surface for the dashboard
// =============================================================================

pub mod rest;

pub use rest::{router, ApiState};
