//! TCP transport for Stages C and D.

pub mod server;
pub mod stream;

pub use server::StageListener;
pub use stream::StreamChannel;
