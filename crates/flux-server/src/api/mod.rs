//! REST + SSE route modules (spec.md §6.1), one per resource family,
//! matching the teacher's `control-plane::api::*` convention of a
//! module-local `routes()` constructor merged into the top-level
//! router in `main`.

pub mod health;
pub mod secrets;
pub mod workers;
pub mod workflows;
