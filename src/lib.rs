pub mod cli;
#[cfg(unix)]
pub mod client;
pub mod config;
pub mod conntable;
#[cfg(unix)]
pub mod daemon;
pub mod handle;
pub mod lifecycle;
pub mod log;
pub mod paths;
pub mod pid;
pub mod protocol;
pub mod registry;
pub mod scanner;
pub mod services;
pub mod stats;
pub mod sys;
pub mod template;
