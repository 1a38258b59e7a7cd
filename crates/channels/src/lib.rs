//! Delivery-channel lifecycle management.
//!
//! Owns the two long-lived external connections (WhatsApp web session via
//! a browser sidecar, SMTP transporter), the durable per-channel config
//! that records whether each should be running, the in-process registry
//! that exposes live handles to delivery code, and the self-healing sweep
//! that reconciles the two.

pub mod bridge;
pub mod config;
pub mod control;
pub mod email;
pub mod qr;
pub mod registry;
pub mod sweep;
pub mod whatsapp;

pub use config::{ChannelConfig, ConfigError, ConfigStore, MemoryConfigStore, PgConfigStore};
pub use control::{ChannelSnapshot, ControllerConfig, ServiceController};
pub use registry::{ChannelStatusEvent, ServiceRegistry};
