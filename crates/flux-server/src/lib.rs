//! The flux-server binary's modules, exposed as a library so
//! integration tests under `tests/` can exercise the HTTP handlers and
//! dispatch logic directly against an `AppState<InMemoryRepository>`
//! without going through a bound TCP listener — the same bin+lib split
//! the teacher's `everruns-control-plane` crate uses for its own
//! `tests/integration_test.rs`.

pub mod api;
pub mod dispatcher;
pub mod error;
pub mod hub;
pub mod registry;
pub mod state;
