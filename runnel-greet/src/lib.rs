//! The greet service on top of [`runnel`].
//!
//! `greet.GreetService` has one method per call shape, plus `FindMaximum`, a
//! second bidirectional method reporting the running maximum of a stream of
//! numbers. [`server::GreetService`] implements it and
//! [`client::GreeterClient`] calls it.

#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod client;
pub mod pb;
pub mod server;
