#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod alerts;
pub mod bus;
pub mod config;
pub mod events;
pub mod gateway;
pub mod geo;
pub mod processors;
pub mod registry;
pub mod utils;
