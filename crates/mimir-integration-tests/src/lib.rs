//! Integration test crate for the Mimir protocol stack.
//!
//! This crate has no library code — it only contains integration tests
//! that exercise end-to-end protocol flows across multiple workspace
//! crates (Section 8 "Testable properties", scenarios S1-S6).
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p mimir-integration-tests
//! ```
