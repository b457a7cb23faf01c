use std::net::SocketAddr;

use crate::socket::IfId;

fn bind_to_interface(socket: &socket2::Socket, interface: &IfId) -> std::io::Result<()> {
    match interface {
        IfId::Name(_name) => {
            #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
            return socket.bind_device(Some(_name.as_bytes()));

            // This should be rejected during options validation.
            #[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
            Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "binding to a named device is not supported on this platform",
            ))
        }
        IfId::Index(_index) => {
            #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
            {
                let index = std::num::NonZeroU32::new(*_index);
                if socket.local_addr()?.is_ipv6() {
                    socket.bind_device_by_index_v6(index)
                } else {
                    socket.bind_device_by_index_v4(index)
                }
            }

            #[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
            Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "binding to a device index is not supported on this platform",
            ))
        }
    }
}

/// Create an unconnected nonblocking UDP socket suitable for `peer`,
/// optionally bound to an outbound interface.
pub fn new_udp_socket(
    peer: &SocketAddr,
    outbound_interface: Option<&IfId>,
) -> std::io::Result<tokio::net::UdpSocket> {
    let domain = if peer.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    let bind_addr: SocketAddr = if peer.is_ipv6() {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    };
    socket.bind(&bind_addr.into())?;
    if let Some(interface) = outbound_interface {
        bind_to_interface(&socket, interface)?;
    }
    tokio::net::UdpSocket::from_std(socket.into())
}

/// Create an unconnected TCP socket suitable for `peer`, optionally bound to
/// an outbound interface.
pub fn new_tcp_socket(
    peer: &SocketAddr,
    outbound_interface: Option<&IfId>,
) -> std::io::Result<tokio::net::TcpSocket> {
    let domain = if peer.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    if let Some(interface) = outbound_interface {
        bind_to_interface(&socket, interface)?;
    }
    Ok(tokio::net::TcpSocket::from_std_stream(socket.into()))
}

/// Create a `std` UDP socket for the QUIC endpoint, optionally bound to an
/// outbound interface. quinn wraps it with its own tokio runtime adapter.
pub fn new_quic_udp_socket(
    peer: &SocketAddr,
    outbound_interface: Option<&IfId>,
) -> std::io::Result<std::net::UdpSocket> {
    let domain = if peer.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    let bind_addr: SocketAddr = if peer.is_ipv6() {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    };
    socket.bind(&bind_addr.into())?;
    if let Some(interface) = outbound_interface {
        bind_to_interface(&socket, interface)?;
    }
    Ok(socket.into())
}
