#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod billing;
pub mod config;
pub mod gateway;
pub mod projects;
pub mod store;
