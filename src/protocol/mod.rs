//! MTProto transport-level definitions

pub mod constants;
pub mod conn_opts;
pub mod frame;
pub mod obfuscated2;

pub use conn_opts::{AckHacks, ConnectionOpts, ProtocolFamily};
pub use constants::*;
pub use obfuscated2::{extract_frame, parse_client_frame, Obfuscated2};
