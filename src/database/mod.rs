pub mod connection;
pub mod operations;

pub use connection::connect_with_retry;
pub use operations::Persister;
