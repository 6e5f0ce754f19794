pub mod errors;
pub mod structs;

pub use errors::ProbeError;
pub use structs::{Destination, Headers, Message, ReceivedMessage};

pub type Result<T> = std::result::Result<T, ProbeError>;
