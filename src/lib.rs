//! Stackgate - a host-routing reverse proxy for containerized app stacks
//!
//! This library lets a single host run multiple independently-deployed
//! compose-based application stacks behind one public endpoint:
//! - Routes HTTP traffic by Host header either to the control-plane API or
//!   to the backing container of the addressed stack
//! - Deploys and stops stacks through the container runtime's compose CLI
//! - Tracks asynchronous image downloads per stack
//! - Reconciles runtime status, download progress and the last requested
//!   action into one coherent state per stack
//! - Hands off authenticated sessions across subdomains via one-time secrets

pub mod api;
pub mod auth;
pub mod config;
pub mod download;
pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod proxy;
pub mod runtime;
pub mod stack_config;
