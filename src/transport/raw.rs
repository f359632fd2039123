//! AF_PACKET raw socket link (Linux)
//!
//! One unbound `SOCK_RAW` socket transmits complete frames, one `SOCK_DGRAM`
//! socket bound to the device address and protocol tag receives them with
//! the link header stripped by the kernel.

use super::{InboundFrame, Link, MacAddress, PROTOCOL_TAG};
use crate::{LinkError, Result};
use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use tracing::{debug, info, trace};

/// Raw Ethernet link to the accelerator.
pub struct RawLink {
    send_fd: OwnedFd,
    recv_fd: OwnedFd,
    send_addr: libc::sockaddr_ll,
    interface: String,
    local: MacAddress,
    peer: MacAddress,
}

impl RawLink {
    /// Open the send and receive paths on `interface`.
    ///
    /// When `local` is `None` the interface's own hardware address is used.
    /// Fails with [`LinkError::Privilege`] unless the process may open raw
    /// sockets.
    pub fn open(interface: &str, local: Option<MacAddress>, peer: MacAddress) -> Result<Self> {
        check_privileges()?;

        let ifname = CString::new(interface)
            .map_err(|_| LinkError::Interface { name: interface.to_string(), source: None })?;
        let ifindex = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
        if ifindex == 0 {
            return Err(LinkError::Interface {
                name: interface.to_string(),
                source: Some(std::io::Error::last_os_error()),
            });
        }

        let local = match local {
            Some(mac) => mac,
            None => interface_address(interface)?,
        };

        // Transmitter: raw frames, protocol "all", not bound
        let send_fd = open_socket(libc::SOCK_RAW, "transmit socket")?;
        let mut send_addr = empty_sockaddr_ll();
        send_addr.sll_ifindex = ifindex as i32;
        send_addr.sll_protocol = (libc::ETH_P_ALL as u16).to_be();

        // Receiver: bound to device address and protocol tag
        let recv_fd = open_socket(libc::SOCK_DGRAM, "receive socket")?;
        let mut recv_addr = empty_sockaddr_ll();
        recv_addr.sll_ifindex = ifindex as i32;
        recv_addr.sll_protocol = PROTOCOL_TAG.to_be();
        recv_addr.sll_halen = 6;
        recv_addr.sll_addr[..6].copy_from_slice(&peer.octets());

        let bound = unsafe {
            libc::bind(
                recv_fd.as_raw_fd(),
                &recv_addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if bound == -1 {
            return Err(LinkError::socket("bind receive socket", std::io::Error::last_os_error()));
        }

        info!(interface, ifindex, %local, %peer, "Raw link opened");

        Ok(Self { send_fd, recv_fd, send_addr, interface: interface.to_string(), local, peer })
    }

    /// Host hardware address.
    pub fn local(&self) -> MacAddress {
        self.local
    }

    /// Device hardware address.
    pub fn peer(&self) -> MacAddress {
        self.peer
    }

    /// Interface name.
    pub fn interface(&self) -> &str {
        &self.interface
    }
}

impl Link for RawLink {
    fn send(&self, frame: &[u8]) -> Result<()> {
        let sent = unsafe {
            libc::sendto(
                self.send_fd.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                libc::MSG_DONTWAIT,
                &self.send_addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };

        if sent <= 0 {
            let seq = frame.get(super::SEQ_OFFSET).copied().unwrap_or(0);
            return Err(LinkError::Send { seq, source: std::io::Error::last_os_error() });
        }

        trace!(len = frame.len(), "Frame sent");
        Ok(())
    }

    fn receive(&self, max_len: usize) -> Result<InboundFrame> {
        let mut buf = vec![0u8; max_len];
        let received = unsafe {
            libc::recvfrom(
                self.recv_fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };

        if received < 0 {
            return Err(LinkError::Receive { source: std::io::Error::last_os_error() });
        }

        buf.truncate(received as usize);
        trace!(len = buf.len(), opcode = buf.first().copied().unwrap_or(0), "Frame received");
        Ok(InboundFrame::new(buf))
    }
}

fn check_privileges() -> Result<()> {
    // Real or effective root
    let (uid, euid) = unsafe { (libc::getuid(), libc::geteuid()) };
    if uid != 0 && euid != 0 {
        return Err(LinkError::Privilege { operation: "Opening raw sockets".to_string() });
    }
    Ok(())
}

fn open_socket(kind: libc::c_int, what: &str) -> Result<OwnedFd> {
    let fd = unsafe { libc::socket(libc::AF_PACKET, kind, (libc::ETH_P_ALL as u16).to_be() as i32) };
    if fd == -1 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            return Err(LinkError::Privilege { operation: format!("Opening {}", what) });
        }
        return Err(LinkError::socket(format!("open {}", what), err));
    }
    // SAFETY: fd was just returned by socket() and is owned by nobody else
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn empty_sockaddr_ll() -> libc::sockaddr_ll {
    // SAFETY: sockaddr_ll is plain old data, all-zero is a valid value
    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr
}

/// Read the hardware address of `interface` from sysfs.
fn interface_address(interface: &str) -> Result<MacAddress> {
    let path = Path::new("/sys/class/net").join(interface).join("address");
    let text = std::fs::read_to_string(&path).map_err(|e| LinkError::file_error(&path, e))?;
    let mac = text.parse()?;
    debug!(interface, %mac, "Read local hardware address");
    Ok(mac)
}
