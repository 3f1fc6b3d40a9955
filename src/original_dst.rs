//! Recovers a transparently-redirected client connection's original
//! destination via the netfilter `SO_ORIGINAL_DST` socket option.
//!
//! Grounded directly on `get_original_dst` in the teacher's `cursor-proxy`
//! `main.rs`, which already implements exactly this kernel query for its
//! own transparent-proxy mode; the original `puttle_proxy.cpp::setup_proxy`
//! performs the identical `getsockopt(..., SOL_IP, SO_ORIGINAL_DST, ...)`
//! call against a `sockaddr_in`, confirming the IPv4-only contract.

use std::net::{Ipv4Addr, SocketAddrV4};

use tokio::net::TcpStream;

use crate::error::ProxyError;

#[cfg(target_os = "linux")]
pub fn get_original_dst(stream: &TcpStream) -> Result<SocketAddrV4, ProxyError> {
    use std::os::unix::io::AsRawFd;

    // Linux doesn't expose a named constant for this in `libc`; it is
    // `SO_ORIGINAL_DST` from `<linux/netfilter_ipv4.h>`.
    const SO_ORIGINAL_DST: libc::c_int = 80;

    let fd = stream.as_raw_fd();
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len: libc::socklen_t = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };

    if ret != 0 {
        return Err(ProxyError::OriginalDst(std::io::Error::last_os_error()));
    }

    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);

    Ok(SocketAddrV4::new(ip, port))
}

#[cfg(not(target_os = "linux"))]
pub fn get_original_dst(_stream: &TcpStream) -> Result<SocketAddrV4, ProxyError> {
    Err(ProxyError::OriginalDst(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "SO_ORIGINAL_DST is only available on Linux",
    )))
}
