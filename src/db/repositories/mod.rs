pub mod dump;
pub mod gps;
pub mod keystore;
pub mod predictions;
pub mod readings;
