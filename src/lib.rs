//! Umbrella crate for the verifier-events workspace.
//!
//! The components live in `crates/` (wire schema, event core, notifiers)
//! and `services/` (the gateway binary).  This crate only hosts the
//! cross-service integration suites under `tests/integration/`.
