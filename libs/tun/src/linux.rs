use std::ffi::CStr;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::{Context as _, Result};
use futures::SinkExt as _;
use ip_packet::{IpPacket, MAX_IP_SIZE};
use libc::{IFF_NO_PI, IFF_TUN, O_RDWR, S_IFCHR, makedev, mknod, open};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

const DEVICE_PATH: &CStr = c"/dev/net/tun";
/// Device numbers of the TUN clone device (misc major, tun minor), needed
/// when `/dev/net/tun` has to be created by hand.
const DEVICE_NUMBERS: (u32, u32) = (10, 200);

const QUEUE_SIZE: usize = 4096;

/// The Linux TUN adapter.
///
/// Device I/O is blocking, so each direction gets a dedicated thread; both
/// are bridged to async land through bounded channels.
#[derive(Debug)]
pub struct TunDevice {
    name: String,
    outbound_tx: PollSender<IpPacket>,
    inbound_rx: mpsc::Receiver<IpPacket>,
    dns_servers: Vec<IpAddr>,
}

impl TunDevice {
    pub fn open(name: &str) -> Result<Self> {
        let fd = Arc::new(open_device(name)?);

        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_SIZE);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<IpPacket>(QUEUE_SIZE);

        std::thread::Builder::new()
            .name("TUN send".to_owned())
            .spawn({
                let fd = fd.clone();

                move || {
                    while let Some(packet) = outbound_rx.blocking_recv() {
                        if let Err(e) = write_packet(fd.as_raw_fd(), &packet) {
                            tracing::warn!("Failed to send to TUN device: {e}");
                            break;
                        }
                    }
                }
            })
            .map_err(io::Error::other)?;
        std::thread::Builder::new()
            .name("TUN recv".to_owned())
            .spawn({
                let fd = fd.clone();

                move || {
                    loop {
                        let packet = match read_packet(fd.as_raw_fd()) {
                            Ok(packet) => packet,
                            Err(e) => {
                                tracing::warn!("Failed to recv from TUN device: {e}");
                                break;
                            }
                        };

                        let Some(packet) = packet else {
                            continue; // Malformed packet, skip.
                        };

                        if inbound_tx.blocking_send(packet).is_err() {
                            break; // Device is gone.
                        }
                    }
                }
            })
            .map_err(io::Error::other)?;

        Ok(Self {
            name: name.to_owned(),
            outbound_tx: PollSender::new(outbound_tx),
            inbound_rx,
            dns_servers: Vec::new(),
        })
    }

    /// Records the DNS servers the system should use while we are active.
    ///
    /// We resolve in-band by intercepting port 53 on the device, so this is
    /// intentionally not propagated to the OS resolver configuration.
    pub fn set_system_dns(&mut self, servers: Vec<IpAddr>) {
        tracing::debug!(?servers, "Relying on in-band DNS interception");

        self.dns_servers = servers;
    }

    pub fn clear_system_dns(&mut self) {
        self.dns_servers.clear();
    }
}

impl super::Tun for TunDevice {
    fn poll_send_ready(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        self.outbound_tx
            .poll_ready_unpin(cx)
            .map_err(io::Error::other)
    }

    fn send(&mut self, packet: IpPacket) -> io::Result<()> {
        self.outbound_tx
            .start_send_unpin(packet)
            .map_err(io::Error::other)?;

        Ok(())
    }

    fn poll_recv_many(
        &mut self,
        cx: &mut Context,
        buf: &mut Vec<IpPacket>,
        max: usize,
    ) -> Poll<usize> {
        self.inbound_rx.poll_recv_many(cx, buf, max)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Opens `/dev/net/tun` and attaches it to the named interface, creating the
/// clone device first on minimal systems (containers) that lack it.
fn open_device(name: &str) -> Result<OwnedFd> {
    ensure_clone_device().context("No usable /dev/net/tun")?;

    let fd = match unsafe { open(DEVICE_PATH.as_ptr() as _, O_RDWR) } {
        -1 => {
            return Err(anyhow::Error::new(io::Error::last_os_error()))
                .context("Failed to open the TUN clone device");
        }
        fd => fd,
    };

    // The descriptor came straight from `open`; nothing else owns it yet.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    attach_interface(fd.as_raw_fd(), name)
        .with_context(|| format!("Failed to attach TUN interface '{name}'"))?;

    Ok(fd)
}

#[repr(C)]
struct IfReq {
    name: [u8; libc::IFNAMSIZ],
    flags: libc::c_short,
    _padding: [u8; 22],
}

fn attach_interface(fd: RawFd, name: &str) -> io::Result<()> {
    if name.len() >= libc::IFNAMSIZ {
        return Err(io::Error::other(format!("Interface name too long: {name}")));
    }

    let mut request = IfReq {
        name: [0; libc::IFNAMSIZ],
        flags: (IFF_TUN | IFF_NO_PI) as libc::c_short,
        _padding: [0; 22],
    };
    request.name[..name.len()].copy_from_slice(name.as_bytes());

    // The request struct outlives the call and matches the ioctl's ABI.
    match unsafe { libc::ioctl(fd, TUNSETIFF, &mut request) } {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

fn ensure_clone_device() -> io::Result<()> {
    let path = Path::new(DEVICE_PATH.to_str().map_err(io::Error::other)?);

    if path.exists() {
        return Ok(());
    }

    let (major, minor) = DEVICE_NUMBERS;

    let parent = path.parent().ok_or_else(|| io::Error::other("No parent dir"))?;
    fs::create_dir_all(parent)?;
    fs::set_permissions(parent, fs::Permissions::from_mode(0o751))?;

    match unsafe { mknod(DEVICE_PATH.as_ptr() as _, S_IFCHR, makedev(major, minor)) } {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}

/// Reads one datagram off the device.
///
/// Returns `Ok(None)` for packets that fail to parse; those are skipped
/// rather than tearing down the read loop.
fn read_packet(fd: RawFd) -> io::Result<Option<IpPacket>> {
    let mut buf = vec![0u8; MAX_IP_SIZE];

    // The fd stays open for as long as the reader thread runs.
    let n = match unsafe { libc::read(fd, buf.as_mut_ptr() as _, buf.len()) } {
        -1 => return Err(io::Error::last_os_error()),
        n => n as usize,
    };

    buf.truncate(n);

    match IpPacket::parse(buf) {
        Ok(packet) => Ok(Some(packet)),
        Err(e) => {
            tracing::trace!("Dropping unparsable packet: {e:#}");

            Ok(None)
        }
    }
}

fn write_packet(fd: RawFd, packet: &IpPacket) -> io::Result<usize> {
    let buf = packet.packet();

    // The fd stays open for as long as the writer thread runs.
    match unsafe { libc::write(fd, buf.as_ptr() as _, buf.len() as _) } {
        -1 => Err(io::Error::last_os_error()),
        n => Ok(n as usize),
    }
}
