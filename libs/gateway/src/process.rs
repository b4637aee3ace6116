//! Maps a flow's local port to the process that owns the socket.
//!
//! A kernel snapshot (`/proc/net/{tcp,udp}` plus a socket-inode scan on
//! Linux) is rebuilt wholesale and cached briefly. Unknown ports resolve to
//! "unknown"; callers treat that as the global-default rule, never as block.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::flow::FlowProtocol;

const SNAPSHOT_TTL: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Option<u32>,
    pub exe: Option<PathBuf>,
}

/// One atomic view of the kernel's socket tables: local port → pid.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub tcp: HashMap<u16, u32>,
    pub udp: HashMap<u16, u32>,
}

/// OS facade for socket-table snapshots and process metadata.
pub trait ProcTable: Send + Sync + 'static {
    fn snapshot(&self) -> io::Result<Snapshot>;

    fn exe_path(&self, pid: u32) -> Option<PathBuf>;
}

pub struct ProcessIdentifier<P> {
    table: P,
    ttl: Duration,
    cached: Mutex<Option<(Instant, Arc<Snapshot>)>>,
    /// Executable paths are stable for a pid's lifetime.
    exe_cache: Mutex<HashMap<u32, Option<PathBuf>>>,
}

impl<P> ProcessIdentifier<P>
where
    P: ProcTable,
{
    pub fn new(table: P) -> Self {
        Self {
            table,
            ttl: SNAPSHOT_TTL,
            cached: Mutex::new(None),
            exe_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Finds the owner of `(transport, local_port)`.
    ///
    /// May take a fresh kernel snapshot; call from a blocking context.
    pub fn find(&self, transport: FlowProtocol, local_port: u16, now: Instant) -> ProcessInfo {
        let snapshot = match self.snapshot(now) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::debug!("Failed to snapshot socket tables: {e}");

                return ProcessInfo::default();
            }
        };

        let ports = match transport {
            FlowProtocol::Tcp => &snapshot.tcp,
            FlowProtocol::Udp => &snapshot.udp,
        };

        let Some(pid) = ports.get(&local_port).copied().filter(|pid| *pid != 0) else {
            return ProcessInfo::default();
        };

        let exe = self
            .exe_cache
            .lock()
            .entry(pid)
            .or_insert_with(|| self.table.exe_path(pid))
            .clone();

        ProcessInfo {
            pid: Some(pid),
            exe,
        }
    }

    fn snapshot(&self, now: Instant) -> io::Result<Arc<Snapshot>> {
        let mut cached = self.cached.lock();

        if let Some((taken_at, snapshot)) = cached.as_ref()
            && now.saturating_duration_since(*taken_at) < self.ttl
        {
            return Ok(snapshot.clone());
        }

        let snapshot = Arc::new(self.table.snapshot()?);
        *cached = Some((now, snapshot.clone()));

        // Pids recycle; drop exe entries that no longer own a socket.
        let live = snapshot
            .tcp
            .values()
            .chain(snapshot.udp.values())
            .copied()
            .collect::<std::collections::HashSet<_>>();
        self.exe_cache.lock().retain(|pid, _| live.contains(pid));

        Ok(snapshot)
    }
}

/// Parses the body of `/proc/net/tcp` / `/proc/net/udp` into
/// `local port → socket inode`.
///
/// Format per line (header skipped):
/// `sl local_address rem_address st tx:rx tr:tm->when retrnsmt uid timeout inode ...`
fn parse_proc_net(contents: &str) -> HashMap<u16, u64> {
    let mut ports = HashMap::new();

    for line in contents.lines().skip(1) {
        let mut fields = line.split_whitespace();

        let Some(local) = fields.nth(1) else {
            continue;
        };

        let Some((_, port_hex)) = local.rsplit_once(':') else {
            continue;
        };

        let Ok(port) = u16::from_str_radix(port_hex, 16) else {
            continue;
        };

        let Some(inode) = fields.nth(7).and_then(|inode| inode.parse::<u64>().ok()) else {
            continue;
        };

        if inode == 0 {
            continue; // Socket in TIME_WAIT, no owner.
        }

        // First entry wins; the table lists more-specific binds first.
        ports.entry(port).or_insert(inode);
    }

    ports
}

#[cfg(target_os = "linux")]
pub use linux::ProcfsTable;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::fs;

    /// [`ProcTable`] backed by procfs.
    #[derive(Default)]
    pub struct ProcfsTable;

    impl ProcTable for ProcfsTable {
        fn snapshot(&self) -> io::Result<Snapshot> {
            let tcp_inodes = parse_proc_net(&fs::read_to_string("/proc/net/tcp")?);
            let udp_inodes = parse_proc_net(&fs::read_to_string("/proc/net/udp")?);

            let pids_by_inode = socket_inode_owners()?;

            let resolve = |inodes: HashMap<u16, u64>| {
                inodes
                    .into_iter()
                    .filter_map(|(port, inode)| {
                        Some((port, pids_by_inode.get(&inode).copied()?))
                    })
                    .collect::<HashMap<u16, u32>>()
            };

            Ok(Snapshot {
                tcp: resolve(tcp_inodes),
                udp: resolve(udp_inodes),
            })
        }

        fn exe_path(&self, pid: u32) -> Option<PathBuf> {
            fs::read_link(format!("/proc/{pid}/exe")).ok()
        }
    }

    /// Scans `/proc/<pid>/fd` for `socket:[inode]` links.
    fn socket_inode_owners() -> io::Result<HashMap<u64, u32>> {
        let mut owners = HashMap::new();

        for entry in fs::read_dir("/proc")? {
            let Ok(entry) = entry else {
                continue;
            };

            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };

            let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
                continue; // Process exited or not ours to inspect.
            };

            for fd in fds.flatten() {
                let Ok(target) = fs::read_link(fd.path()) else {
                    continue;
                };

                let Some(inode) = target
                    .to_str()
                    .and_then(|t| t.strip_prefix("socket:["))
                    .and_then(|t| t.strip_suffix(']'))
                    .and_then(|t| t.parse::<u64>().ok())
                else {
                    continue;
                };

                owners.entry(inode).or_insert(pid);
            }
        }

        Ok(owners)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;

    /// [`ProcTable`] with a fixed port map.
    #[derive(Default)]
    pub struct MockProcTable {
        pub tcp: HashMap<u16, u32>,
        pub udp: HashMap<u16, u32>,
        pub exes: HashMap<u32, PathBuf>,
        pub snapshots_taken: Mutex<usize>,
    }

    impl ProcTable for MockProcTable {
        fn snapshot(&self) -> io::Result<Snapshot> {
            *self.snapshots_taken.lock() += 1;

            Ok(Snapshot {
                tcp: self.tcp.clone(),
                udp: self.udp.clone(),
            })
        }

        fn exe_path(&self, pid: u32) -> Option<PathBuf> {
            self.exes.get(&pid).cloned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockProcTable;
    use super::*;
    use std::path::Path;

    const PROC_NET_TCP: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:0FC8 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 31863 1 0000000000000000 100 0 0 10 0
   1: 0A40000A:9C40 01010101:01BB 01 00000000:00000000 00:00000000 00000000  1000        0 32001 1 0000000000000000 20 4 30 10 -1
   2: 00000000:1F90 00000000:0000 06 00000000:00000000 03:000001A2 00000000     0        0 0 3 0000000000000000
";

    #[test]
    fn parses_ports_and_inodes() {
        let ports = parse_proc_net(PROC_NET_TCP);

        assert_eq!(ports.get(&0x0FC8), Some(&31863));
        assert_eq!(ports.get(&0x9C40), Some(&32001));
    }

    #[test]
    fn skips_ownerless_time_wait_sockets() {
        let ports = parse_proc_net(PROC_NET_TCP);

        assert_eq!(ports.get(&0x1F90), None);
    }

    #[test]
    fn finds_pid_and_exe() {
        let table = MockProcTable {
            tcp: HashMap::from([(40000, 42)]),
            exes: HashMap::from([(42, PathBuf::from("/usr/bin/curl"))]),
            ..Default::default()
        };
        let identifier = ProcessIdentifier::new(table);

        let info = identifier.find(FlowProtocol::Tcp, 40000, Instant::now());

        assert_eq!(info.pid, Some(42));
        assert_eq!(info.exe.as_deref(), Some(Path::new("/usr/bin/curl")));
    }

    #[test]
    fn unknown_port_is_not_an_error() {
        let identifier = ProcessIdentifier::new(MockProcTable::default());

        let info = identifier.find(FlowProtocol::Udp, 12345, Instant::now());

        assert_eq!(info, ProcessInfo::default());
    }

    #[test]
    fn snapshot_is_reused_within_ttl() {
        let table = MockProcTable {
            tcp: HashMap::from([(40000, 42)]),
            ..Default::default()
        };
        let identifier = ProcessIdentifier::new(table);
        let now = Instant::now();

        identifier.find(FlowProtocol::Tcp, 40000, now);
        identifier.find(FlowProtocol::Tcp, 40000, now + Duration::from_millis(100));

        assert_eq!(*identifier.table.snapshots_taken.lock(), 1);
    }

    #[test]
    fn stale_snapshot_is_replaced() {
        let table = MockProcTable {
            tcp: HashMap::from([(40000, 42)]),
            ..Default::default()
        };
        let identifier = ProcessIdentifier::new(table);
        let now = Instant::now();

        identifier.find(FlowProtocol::Tcp, 40000, now);
        identifier.find(FlowProtocol::Tcp, 40000, now + Duration::from_millis(400));

        assert_eq!(*identifier.table.snapshots_taken.lock(), 2);
    }
}
