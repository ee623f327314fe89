pub mod context;
pub mod error;
pub mod handler;
pub mod issuer;
pub mod meter;
pub mod router;
pub mod serve;

pub type Result<T, E = error::Error> = std::result::Result<T, E>;
