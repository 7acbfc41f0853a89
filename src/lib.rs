//! # DergiPark Gate
//!
//! Session acquisition, caching and paced fetching for a journal index that
//! sits behind an anti-bot challenge.
//!
//! ## Architecture
//!
//! 1. **Solving**: a [`pool::SlotPool`] of browser contexts and a
//!    [`solver::ChallengeSolver`] strategy chain turn the challenge into a
//!    cookie [`models::Session`]
//! 2. **Session caching**: [`session::SessionCache`] hands one session to
//!    every caller, mirrors it to disk and re-acquires it under single-flight
//! 3. **Fetching**: [`fetch::Orchestrator`] runs paced, bounded batches and
//!    recovers once from an upstream rejection
//! 4. **Results**: [`service::Gateway`] caches search result sets and
//!    converted artifacts ([`convert::ArtifactConverter`])

pub mod automation;
pub mod cache;
pub mod cli;
pub mod config;
pub mod convert;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod mirror;
pub mod models;
pub mod pool;
pub mod retry;
pub mod scrapers;
pub mod service;
pub mod session;
pub mod solver;
pub mod upstream;
pub mod utils;

#[cfg(test)]
mod testing;
