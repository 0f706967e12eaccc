//! Socket io.
mod socket;

pub use socket::Socket;
