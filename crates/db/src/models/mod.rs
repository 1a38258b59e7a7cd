pub mod otp_verification;
pub mod service_config;
