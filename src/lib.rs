//! denbox — provisions and supervises ephemeral sandboxes (Docker
//! containers or lightweight VMs) backing interactive coding sessions,
//! and keeps persisted session state consistent with live infrastructure
//! across restarts.

pub mod cli;
pub mod config;
pub mod image;
pub mod jobs;
pub mod logging;
pub mod provider;
pub mod reconcile;
pub mod session;
pub mod web;
