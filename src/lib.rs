pub mod aggregator;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod record;
pub mod registry;
pub mod store;
pub mod validator;
pub mod writer;
