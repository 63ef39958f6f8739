//! Performance benchmarks for the permission cache and authorizer
//!
//! ```bash
//! cargo bench --features=benchmarks
//! ```
//!
//! Results land in `target/criterion/`. Targets:
//! - cached authorization (fresh hit): well under 10µs
//! - 100 concurrent misses on one key: a single authority call
//! - hit latency flat as the cache grows to 100k entries

pub mod authorization;
