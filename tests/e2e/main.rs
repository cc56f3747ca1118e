//! End-to-end tests for lntest-harness.
//!
//! Everything except `process_backend` runs against the simulated backend
//! and needs no external binaries.
//!
//! ```text
//! harness            shared setup helpers
//! lifecycle          start, sequencing, names, teardown, scoped cleanup
//! connectivity       peer mesh
//! channels           funding, channel opens, hub brokering
//! routing            invoices and route queries
//! process_backend    real bitcoind + lnd (ignored by default)
//! ```

mod channels;
mod connectivity;
mod harness;
mod lifecycle;
mod process_backend;
mod routing;
