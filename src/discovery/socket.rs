use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use tokio::net::UdpSocket;

pub const WS_DISCOVERY_PORT: u16 = 3702;
pub const MULTICAST_V4: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const MULTICAST_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x000c);

pub fn multicast_v4_target(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(MULTICAST_V4, port))
}

pub fn multicast_v6_target(port: u16) -> SocketAddr {
    SocketAddr::V6(SocketAddrV6::new(MULTICAST_V6, port, 0, 0))
}

/// UDP socket bound to `port` on all addresses and joined to the IPv4
/// WS-Discovery group through `interface`
pub fn bind_multicast_v4(port: u16, interface: Ipv4Addr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).into())?;
    socket.join_multicast_v4(&MULTICAST_V4, &interface)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_multicast_loop_v4(true)?;
    if !interface.is_unspecified() {
        socket.set_multicast_if_v4(&interface)?;
    }
    socket.set_nonblocking(true)?;

    UdpSocket::from_std(socket.into())
}

/// IPv6 counterpart on [ff02::c]
pub fn bind_multicast_v6(port: u16, interface_index: u32) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(true)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0)).into())?;
    socket.join_multicast_v6(&MULTICAST_V6, interface_index)?;
    socket.set_multicast_hops_v6(1)?;
    socket.set_nonblocking(true)?;

    UdpSocket::from_std(socket.into())
}
