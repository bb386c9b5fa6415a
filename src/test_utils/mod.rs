//! Test utilities for `vospi-scope`
//!
//! Provides synthetic VoSPI packet generation for exercising synchronization,
//! frame assembly and the stream controller without a sensor on the bus.

pub mod packet_generator;

pub use packet_generator::*;
