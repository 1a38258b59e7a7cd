//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async CRUD methods
//! that accept `&PgPool` as the first argument.

pub mod otp_verification_repo;
pub mod service_config_repo;

pub use otp_verification_repo::OtpVerificationRepo;
pub use service_config_repo::ServiceConfigRepo;
