//! Pure domain layer for the messaging core.
//!
//! No I/O and no async: shared type aliases, the error type, channel/status
//! enums, OTP code generation and keyed hashing, the WhatsApp session state
//! machine, and sliding-window arithmetic. Everything here is unit-testable
//! without a database, a Redis server, or a browser process.

pub mod error;
pub mod otp;
pub mod service;
pub mod session_fsm;
pub mod types;
pub mod window;
