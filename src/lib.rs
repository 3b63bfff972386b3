pub mod attempt;
pub mod camouflage;
pub mod config;
pub mod dns;
pub mod dns_resolver;
pub mod forward;
pub mod local_service;
pub mod logging;
pub mod stats;
pub mod sweep;
pub mod transport;
