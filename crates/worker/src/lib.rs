//! Worker process internals: the in-process job queue, job payloads and
//! handlers, and OTP message templates.

pub mod jobs;
pub mod queue;
pub mod templates;
