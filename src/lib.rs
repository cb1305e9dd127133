pub mod archive;
pub mod batch;
pub mod certificate;
pub mod configuration;
pub mod dispatch;
pub mod domain;
pub mod email_message;
pub mod error;
pub mod telemetry;
