//! Site rules for the gated journal index.
//!
//! Each site module is a set of pure functions: URL builders, the result
//! fingerprint and HTML parsers. The service layer feeds them pages fetched
//! through the orchestrator.
//!
//! | Site | Module | Notes |
//! |------|--------|-------|
//! | DergiPark | [`dergipark`] | Turnstile-gated search; article metadata in `citation_*` meta tags |

pub mod dergipark;
