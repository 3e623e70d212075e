//! Integration tests for CATio acceptance testing.
//!
//! These tests verify behavior across the wire:
//! - Discovery of devices, slaves and their identities
//! - Symbol handles and process image reads and writes
//! - Notification streams reduced to change sets

mod common;
mod discovery_test;
mod notification_test;
mod symbol_test;
