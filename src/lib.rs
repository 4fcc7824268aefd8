//! Timestamp event service: a Postgres store fronted by a coherent read cache,
//! with committed mutations propagated to other cache writers over a channel.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod events;
pub mod infra;
