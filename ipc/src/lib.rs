#![no_std]

//! Bounded message passing between kernel tasks.

pub mod channel;

pub use channel::{Channel, ReceiveError, SendError};
