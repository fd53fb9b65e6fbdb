//! Duplex stream wrappers
//!
//! Each wrapper decorates one half of a connection and composes with the
//! others; the stacking order is decided by the proxy server.

pub mod cipher;
pub mod ctx;
pub mod middle;
pub mod traffic;

pub use cipher::{CipherReader, CipherWriter};
pub use ctx::{cancelled_error, is_cancelled_error, CtxReader, CtxWriter};
pub use middle::{MiddleReader, MiddleWriter};
pub use traffic::{TrafficReader, TrafficWriter};
