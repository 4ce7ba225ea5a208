//! The `courier` process: configuration loading, lifecycle control and the
//! command line front end over [`courier_dispatch`]

pub mod cli;
pub mod config;
pub mod controller;

pub use config::{ConfigError, CourierConfig};
pub use controller::Controller;
