//! Listening socket setup.

use std::net::TcpListener;

use sessmux_core::{Result, ServerConfig};
use socket2::{Domain, Protocol, Socket, Type};

/// Bind and listen on `config.listen_addr()` with `SO_REUSEADDR` and the
/// configured backlog. The returned listener is blocking; engines switch
/// it to non-blocking if they need to.
pub fn bind(config: &ServerConfig) -> Result<TcpListener> {
    let addr = config.listen_addr();
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config.backlog)?;
    Ok(socket.into())
}
