pub mod transport;
pub mod wire;

pub use transport::{InProcessSocket, RequestSocket, TransportError, UnixRequestSocket};
pub use wire::{WireMessage, ENVELOPE_IDENTITY_FIELDS};
