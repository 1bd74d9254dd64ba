pub mod codec;
pub mod duplicate;
pub mod error;
pub mod models;
pub mod reassembly;
pub mod settings;
