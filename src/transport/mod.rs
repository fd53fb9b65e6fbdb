//! Socket utilities

use socket2::SockRef;
use tokio::net::TcpStream;

use crate::config::{BUFFER_READ_SIZE, BUFFER_WRITE_SIZE};
use crate::error::Result;

/// Apply the proxy's socket options: keepalive governs post-handshake
/// liveness, buffers are sized to one pump read.
pub fn configure_socket(stream: &TcpStream) -> Result<()> {
    let sock = SockRef::from(stream);
    sock.set_keepalive(true)?;
    sock.set_recv_buffer_size(BUFFER_READ_SIZE)?;
    sock.set_send_buffer_size(BUFFER_WRITE_SIZE)?;
    stream.set_nodelay(true)?;
    Ok(())
}
