//! Integration tests entry point
//!
//! Includes the modules under integration/ so they build as one test binary.

mod integration;
