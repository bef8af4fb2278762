//! Forward-proxy gateway (spec C7): terminates HTTP, brokers absolute-form
//! requests through the Pool, and serves an admin JSON API for everything
//! else. See [`server::Gateway`] for the accept loop.

pub mod admin;
pub mod auth;
pub mod headers;
pub mod server;

pub use server::Gateway;
