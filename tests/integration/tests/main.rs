//! End-to-End Integration Tests
//!
//! These tests run the complete engine against an in-memory directory.

mod common;
mod directory;
mod lockout;
mod reload;
mod scripts;
