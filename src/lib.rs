//! Cloud print push-notification bridge.
//!
//! The [`xmpp`] module holds the persistent push-channel client; [`daemon`]
//! drives the job loop around it.

pub mod auth;
pub mod config;
pub mod daemon;
pub mod error;
pub mod xmpp;

pub use error::{ErrorKind, XmppError};
