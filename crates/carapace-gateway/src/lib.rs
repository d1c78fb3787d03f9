//! The supervisor binary's library half. Split from `main.rs` so the crate's
//! own integration tests (and, previously, `main.rs` itself) can reach the
//! router pipeline and its supporting modules without a second crate.
//!
//! Mirrors the teacher's `sa_gateway` split: `main.rs` stays a thin CLI
//! dispatch table, everything that does work lives under modules here.

pub mod cancel;
pub mod cli;
pub mod confirmation;
pub mod intrinsics;
pub mod rate_limit;
pub mod router;
pub mod sanitizer;
pub mod supervisor;
