//! Gateway protocol definitions
//!
//! Defines the WebSocket protocol including op codes, message formats, and close codes.

mod close_codes;
mod messages;
mod opcodes;
mod payloads;

pub use close_codes::{CloseCode, CloseKind};
pub use messages::GatewayMessage;
pub use opcodes::OpCode;
pub use payloads::{
    HelloPayload, IdentifyPayload, IdentifyProperties, PresenceUpdatePayload, ReadyPayload,
    ResumePayload, VoiceStateUpdatePayload,
};

/// Gateway API version appended to the connection URL
pub const API_VERSION: u8 = 10;

/// Append the version and encoding query to a gateway URL
#[must_use]
pub fn connection_url(base: &str) -> String {
    let base = base.trim_end_matches('/');
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}v={API_VERSION}&encoding=json")
}
