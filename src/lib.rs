pub mod cli;
pub mod config;
pub mod daemon;
pub mod domains;
pub mod logging;
pub mod ui;
