// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP data rendezvous relay
//!
//! A sender POSTs (or PUTs) a byte stream to a path; receivers GET the same
//! path and get exactly those bytes, streamed through the server without
//! being stored. Paths are one-shot channels coordinated by a per-path
//! rendezvous slot; the server holds no durable state.

mod opts;
mod pump;
mod registry;
pub mod response;
pub mod router;
mod server;
pub mod signal;
mod slot;
pub mod version;

pub use opts::Opts;
pub use registry::Registry;
pub use response::GenericResponse;
pub use server::{run, Server};
