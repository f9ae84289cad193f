pub mod decoder;
pub mod filter;
pub mod scanner;
pub mod session;

pub use filter::AddressFilter;
pub use scanner::{open_source, Backend};
pub use session::{ScanError, ScanOutcome, ScanSession, ScanState};
