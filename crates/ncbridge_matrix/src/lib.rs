#![forbid(unsafe_code)]

//! Homeserver plumbing: the appservice client, the transaction listener and
//! the Synapse admin media cleaner.

pub mod admin;
pub mod appservice;
pub mod client;

pub use admin::SynapseAdminCleaner;
pub use appservice::{AppserviceState, IntakeShutdown, SEEN_TRANSACTION_WINDOW, serve_appservice};
pub use client::AppserviceClient;
