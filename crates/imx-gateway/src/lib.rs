//! imx-gateway: HTTP endpoints for inbound webhooks
//!
//! Receives GitHub and blog webhooks, verifies their signatures over the raw
//! body, normalizes them into notifications and hands them to the dispatcher.

pub mod protocol;
pub mod server;
pub mod signature;

pub use server::{BlogHook, GatewayServer, GithubHook, WebhookError};
