use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, trace};

/// A bound, non-blocking passive socket.
pub(crate) struct Listener {
    listener: StdTcpListener,
    addr: SocketAddr,
}

impl Listener {
    /// Binds `addr` ("host:port" or "ip:port") with SO_REUSEADDR and, where
    /// supported, SO_REUSEPORT.
    pub(crate) fn bind(addr: &str, backlog: u32) -> crate::Result<Listener> {
        let addr = addr
            .to_socket_addrs()
            .map_err(crate::Error::new_listen)?
            .next()
            .ok_or_else(|| {
                crate::Error::new_listen(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "listen address resolved to nothing",
                ))
            })?;
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(crate::Error::new_listen)?;
        socket
            .set_reuse_address(true)
            .map_err(crate::Error::new_listen)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket
            .set_reuse_port(true)
            .map_err(crate::Error::new_listen)?;
        socket
            .set_nonblocking(true)
            .map_err(crate::Error::new_listen)?;
        socket
            .bind(&addr.into())
            .map_err(crate::Error::new_listen)?;
        socket
            .listen(backlog as i32)
            .map_err(crate::Error::new_listen)?;

        let listener: StdTcpListener = socket.into();
        let addr = listener.local_addr().map_err(crate::Error::new_listen)?;
        debug!("listening on {}", addr);
        Ok(Listener { listener, addr })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// Drains the accept queue, up to `max` sockets per readiness tick.
    ///
    /// Accept errors other than WouldBlock are logged and the loop carries
    /// on; they must never take the server down.
    pub(crate) fn poll_accept(&self, max: usize) -> Vec<(TcpStream, SocketAddr)> {
        let mut accepted = Vec::new();
        for _ in 0..max {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        error!("accepted socket from {} unusable: {}", peer, e);
                        continue;
                    }
                    trace!("accepted connection from {}", peer);
                    accepted.push((stream, peer));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("accept error: {}", e);
                    continue;
                }
            }
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_on_os_assigned_port() {
        let listener = Listener::bind("127.0.0.1:0", 16).unwrap();
        assert_ne!(listener.local_addr().port(), 0);
    }

    #[test]
    fn poll_accept_on_quiet_listener_is_empty() {
        let listener = Listener::bind("127.0.0.1:0", 16).unwrap();
        assert!(listener.poll_accept(16).is_empty());
    }

    #[test]
    fn poll_accept_drains_pending_connections() {
        let listener = Listener::bind("127.0.0.1:0", 16).unwrap();
        let addr = listener.local_addr();
        let _a = TcpStream::connect(addr).unwrap();
        let _b = TcpStream::connect(addr).unwrap();
        // Give the kernel a moment to finish both handshakes.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(listener.poll_accept(16).len(), 2);
    }

    #[test]
    fn bad_address_is_a_listen_error() {
        assert!(Listener::bind("definitely not an address", 16).is_err());
    }
}
