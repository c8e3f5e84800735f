//! Configuration, logging and worker placement helpers

pub mod config;
pub mod cpu;
pub mod logging;
