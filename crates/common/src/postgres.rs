mod config;
mod connection;
mod sensor_reading_repository;

pub use config::*;
pub use connection::*;
pub use sensor_reading_repository::*;
