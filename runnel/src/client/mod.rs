//! Generic client implementation.
//!
//! This module contains the low level components to build a client: a codec
//! agnostic call dispatcher ([`Rpc`]), the channel it runs over, and the
//! [`Driver`] that runs the send and receive flows of streaming calls.
//!
//! Typed stubs for a service are usually built on top of these and are nicer
//! to use by hand.

mod channel;
pub mod driver;
mod rpc;

use std::time::Duration;

pub use self::channel::{Channel, Endpoint};
pub use self::driver::{CompletionLatch, Driver, FlowSummary};
pub use self::rpc::Rpc;

/// Per-call settings.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    timeout: Option<Duration>,
}
