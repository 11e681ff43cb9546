//! Counter demo server for tether.
//!
//! Accepts TCP connections into a [`tether::Hub`] and answers every
//! [`tether_types::CounterMessage`] with the next count.

pub mod server;

pub use server::{handle_counter_requests, run};
