pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod hub;
pub mod identity;
pub mod orchestrator;
pub mod platform;
pub mod provisioner;
pub mod router;
pub mod server;
pub mod workspace;
