//! Daemon frontend for bitchat.
//!
//! - [`ipc`]: the newline-delimited control socket (server side for
//!   `bitchatd`, one-shot client for `bitchatctl`).
//! - [`cli`]: the `bitchatctl` argument surface and its mapping onto control
//!   lines.

pub mod cli;
pub mod ipc;
