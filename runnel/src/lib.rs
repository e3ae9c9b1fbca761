//! A streaming RPC core built on [`tokio`].
//!
//! `runnel` implements the execution model of four call shapes over one
//! stream per call:
//!
//! - **Unary**: one request, one response.
//! - **Server-streaming**: one request, any number of responses.
//! - **Client-streaming**: any number of requests, one response.
//! - **Bidirectional streaming**: both directions open at once, each closed
//!   independently.
//!
//! # Structure
//!
//! Each direction of a stream has its own `Open -> HalfClosed -> Closed`
//! lifecycle, driven through a [`stream::Sender`] and a [`stream::Streaming`].
//! The [`client`] module opens calls ([`client::Rpc`]) and drives the send and
//! receive flows of streaming calls ([`client::Driver`]). The [`server`]
//! module dispatches accepted calls to handlers, one task per call.
//!
//! Calls run over a [`transport::Transport`]: either the in-process
//! [`transport::inmemory`] pair or a multiplexed TCP connection
//! ([`transport::tcp`]). Messages are turned into bytes by a [`codec::Codec`],
//! [`codec::ProstCodec`] for protobuf.
//!
//! Every failure surfaces as a [`Status`] whose [`Code`] says what went wrong.

#![warn(missing_debug_implementations, missing_docs, rust_2018_idioms)]

pub mod client;
pub mod codec;
pub mod pipe;
pub mod server;
pub mod stream;
pub mod transport;

mod status;

pub use async_trait::async_trait;
pub use status::{Code, Status};
