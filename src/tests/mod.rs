//! Cross-module tests
//!
//! Gateway scenarios that exercise the authorizer, permission cache,
//! authority client and storage backends together.

pub mod support;
