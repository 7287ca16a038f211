pub mod commands;
pub mod connection;
pub mod device;
pub mod fields;
pub mod mqtt;
pub mod output;
pub mod protocol;
pub mod session;
