//! Client-side control and input planes for GameStream-compatible hosts.
//!
//! The control plane carries lifecycle signalling (start handshake, IDR
//! requests, reference frame invalidation, loss statistics, termination)
//! over a TCP request/reply socket on Gen3/4 hosts or a reliable-UDP channel
//! from Gen5 on. The input plane queues keyboard, mouse and controller
//! events and multiplexes them onto the same channel, encrypting them
//! itself on host generations that do not encrypt the control stream.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod config;
pub mod control;
pub mod enet;
pub mod envelope;
pub mod health;
pub mod input;
pub mod proto;
pub mod queue;
pub mod session;
pub mod shared;
pub mod sync;
pub mod transport;
pub mod wire;
