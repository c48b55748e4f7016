pub mod config;
pub mod errors;
pub mod general;
pub mod macros;
pub mod mat_serde;
