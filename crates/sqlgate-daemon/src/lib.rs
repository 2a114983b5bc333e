//! HTTP front end for the SQL safety gate.

pub mod models;
pub mod server;
pub mod telemetry;
