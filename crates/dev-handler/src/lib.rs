//! Lowcar device handler
//!
//! Discovers lowcar boards on USB, performs the Ping / SubscriptionResponse
//! handshake, and relays parameter traffic between each board and the shared
//! parameter store.
//!
//! - [`usb`]: port abstraction, framed transfers and the discovery poller
//! - [`relay`]: per-device supervisor, sender and receiver threads
//! - [`config`]: TOML configuration

pub mod config;
pub mod relay;
pub mod usb;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;
