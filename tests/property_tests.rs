//! Property-Based Tests Entry Point
//!
//! Uses proptest to verify the ordering and round-trip properties that must
//! hold for all inputs: event ID composition, encoded-form sortability, and
//! partition assignment.

mod property;
