//! Core types shared by the shadowlink bridge crates.
//!
//! - Command and response envelopes exchanged with remote callers
//! - The reported shadow document and desired-delta extraction
//! - Topic layout and MQTT wildcard matching
//! - Bridge configuration loading

pub mod config;
pub mod envelope;
pub mod error;
pub mod shadow;
pub mod topics;

pub use config::{BridgeConfig, DeviceKind, DeviceSpec, ReconnectConfig, TlsFiles, TlsSettings};
pub use envelope::{CommandEnvelope, ResponseEnvelope, StateMap, salvage_request_id};
pub use error::{Error, Result};
pub use shadow::{DesiredDelta, DevicePatch, ReportedState, ShadowDocument, parse_desired_delta};
pub use topics::{CommandTopic, TopicLayout, topic_matches};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
