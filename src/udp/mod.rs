//! UDP transport: the datagram channel and the server's acceptor loop.

pub mod server;
pub mod socket;

pub use server::Server;
pub use socket::DatagramChannel;
