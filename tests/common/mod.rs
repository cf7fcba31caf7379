//! Shared fixtures for the integration tests. Not every test target uses
//! every builder.
#![allow(dead_code)]

mod fixtures;
pub use fixtures::*;
