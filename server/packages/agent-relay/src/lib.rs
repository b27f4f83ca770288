//! Relays autonomous agent invocations to HTTP clients as Server-Sent Events.

pub mod backend;
pub mod cli;
pub mod driver;
pub mod resolver;
pub mod router;
pub mod sse;
