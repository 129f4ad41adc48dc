//! TUN device plumbing: open, name, and configure the tunnel interface.
//!
//! The device is opened non-blocking and driven through the tokio reactor
//! with [`AsyncFd`]; closing the fd on drop tears the interface down, so a
//! restart always starts from a clean slate. Address, MTU, link state, and
//! the overlay route go through `ip(8)`, which behaves identically across
//! distros.

use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::process::Command;

use anyhow::{bail, Context, Result};
use ipnet::Ipv4Net;
use tokio::io::unix::AsyncFd;
use tracing::info;

const IFNAMSIZ: usize = libc::IFNAMSIZ;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

#[repr(C)]
struct IfReqFlags {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 24 - std::mem::size_of::<libc::c_short>()],
}

fn write_ifname(dst: &mut [libc::c_char; IFNAMSIZ], name: &str) -> io::Result<()> {
    let bytes = name.as_bytes();
    if bytes.len() >= IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("interface name too long: {name}"),
        ));
    }
    for (i, &b) in bytes.iter().enumerate() {
        dst[i] = b as libc::c_char;
    }
    Ok(())
}

fn ifname_from_c(src: &[libc::c_char; IFNAMSIZ]) -> String {
    src.iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8 as char)
        .collect()
}

/// An open L3 tunnel device.
pub struct TunDevice {
    fd: AsyncFd<OwnedFd>,
    name: String,
}

impl TunDevice {
    /// Open `/dev/net/tun` and attach an interface named after
    /// `name_template` (a `%d` in the template is filled in by the kernel
    /// with the first free index).
    pub fn open(name_template: &str) -> Result<Self> {
        let fd = unsafe {
            libc::open(
                c"/dev/net/tun".as_ptr(),
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error()).context("opening /dev/net/tun");
        }
        // Owned from here on: closed on any early return below.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut ifr = IfReqFlags {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0; 24 - std::mem::size_of::<libc::c_short>()],
        };
        write_ifname(&mut ifr.ifr_name, name_template)?;

        let ret = unsafe { libc::ioctl(owned.as_raw_fd(), TUNSETIFF as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error()).context("TUNSETIFF");
        }

        let name = ifname_from_c(&ifr.ifr_name);
        info!(name = %name, "opened tun device");

        let fd = AsyncFd::new(owned).context("registering tun fd with the reactor")?;
        Ok(Self { fd, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read one packet. Resolves once a packet is available; transient
    /// errors surface to the caller, which logs and keeps going.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            let result = guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(
                        inner.get_ref().as_raw_fd(),
                        buf.as_mut_ptr().cast(),
                        buf.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(io_result) => return io_result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Write one packet.
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.writable().await?;
            let result = guard.try_io(|inner| {
                let n = unsafe {
                    libc::write(
                        inner.get_ref().as_raw_fd(),
                        buf.as_ptr().cast(),
                        buf.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(io_result) => return io_result,
                Err(_would_block) => continue,
            }
        }
    }
}

fn run_ip_cmd(args: &[&str]) -> Result<()> {
    let out = Command::new("ip")
        .args(args)
        .output()
        .with_context(|| format!("spawning `ip {}`", args.join(" ")))?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        bail!(
            "`ip {}` failed: {}",
            args.join(" "),
            if stderr.is_empty() { "unknown error" } else { &stderr }
        );
    }
    Ok(())
}

/// Assign the tunnel address, set the MTU, bring the link up, and route
/// the overlay-wide network at the device.
///
/// `address` is the host subnet's network address carried with the
/// overlay-wide prefix length, so the kernel knows the whole overlay is
/// on-link here. The route is added explicitly because the container
/// runtime may have installed a competing one; "already exists" is not a
/// failure.
pub fn configure_iface(name: &str, address: Ipv4Addr, overlay: Ipv4Net, mtu: usize) -> Result<()> {
    let cidr = format!("{address}/{}", overlay.prefix_len());
    run_ip_cmd(&["addr", "add", &cidr, "dev", name])
        .with_context(|| format!("assigning {cidr} to {name}"))?;

    let mtu_str = mtu.to_string();
    run_ip_cmd(&["link", "set", "dev", name, "mtu", &mtu_str])
        .with_context(|| format!("setting mtu {mtu} on {name}"))?;

    run_ip_cmd(&["link", "set", "dev", name, "up"])
        .with_context(|| format!("bringing {name} up"))?;

    let overlay_cidr = overlay.trunc().to_string();
    if let Err(err) = run_ip_cmd(&["route", "add", &overlay_cidr, "dev", name]) {
        if err.to_string().contains("File exists") {
            info!(route = %overlay_cidr, dev = name, "overlay route already present");
        } else {
            return Err(err).with_context(|| format!("adding route {overlay_cidr} via {name}"));
        }
    }

    info!(dev = name, addr = %cidr, route = %overlay_cidr, mtu, "configured tun interface");
    Ok(())
}
