//! REST operations, client and parent-side proxy

mod client;
mod error;
mod operation;
mod proxy;

pub use client::{gateway_bot, HttpRestClient, RestClient};
pub use error::RestError;
pub use operation::{GatewayBotInfo, RestOperation, SessionStartLimit};
pub use proxy::RestProxy;
