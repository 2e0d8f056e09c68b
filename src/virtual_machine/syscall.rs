//! Guest syscall ABI and host-side handlers.
//!
//! The syscall number is taken from `$r0` and arguments from `$r1`, `$r2`, `$r5` and
//! `$r4`, in that order. Every handler validates all of its arguments against the
//! sandbox and guest memory before performing any host effect. A rejected call is not
//! fatal: `$r0` receives [`SYSCALL_ERROR`] and the reason is recorded in the run report.

use crate::virtual_machine::errors::SyscallError;
use crate::virtual_machine::isa::{MAP_BASE, MAP_LIMIT, PAGE_SIZE};
use crate::virtual_machine::vm::context::{Deadline, Host};
use crate::virtual_machine::vm::memory::{Access, Memory, Perms, Region, RegionKind, align_up};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::time::Duration;

/// Value returned in `$r0` when a syscall fails.
pub const SYSCALL_ERROR: u32 = 0xFFFF_FFFF;
/// Largest transfer for `READ`, `WRITE`, `RECV` and `SEND`.
pub const MAX_IO: u32 = 0x10000;
/// Largest single `MAP` request.
pub const MAX_MAP_SIZE: u32 = 0x10000;
/// Size of the descriptor table, standard streams included.
pub const MAX_FDS: usize = 16;
/// Live mappings allowed per run.
pub const MAX_MAPPINGS: usize = 16;
/// Longest path accepted by `OPEN`, terminator excluded.
pub const MAX_PATH: usize = 4096;
/// Longest dotted-quad accepted by `CONNECT`.
const MAX_IPV4_TEXT: usize = 15;

pub const PROT_READ: u32 = 1;
pub const PROT_WRITE: u32 = 2;
pub const AF_INET: u32 = 2;
pub const SOCK_STREAM: u32 = 1;
pub const SOCK_DGRAM: u32 = 2;

pub const FD_STDIN: u32 = 0;
pub const FD_STDOUT: u32 = 1;
pub const FD_STDERR: u32 = 2;

/// Assigned syscall numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Syscall {
    Read = 0x0,
    Write = 0x1,
    Map = 0x2,
    Unmap = 0x3,
    Open = 0x5,
    Close = 0x6,
    Recv = 0xA,
    Send = 0xB,
    Socket = 0xC,
    Connect = 0xD,
}

impl Syscall {
    pub const ALL: [Syscall; 10] = [
        Syscall::Read,
        Syscall::Write,
        Syscall::Map,
        Syscall::Unmap,
        Syscall::Open,
        Syscall::Close,
        Syscall::Recv,
        Syscall::Send,
        Syscall::Socket,
        Syscall::Connect,
    ];

    pub fn number(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Syscall::Read => "READ",
            Syscall::Write => "WRITE",
            Syscall::Map => "MAP",
            Syscall::Unmap => "UNMAP",
            Syscall::Open => "OPEN",
            Syscall::Close => "CLOSE",
            Syscall::Recv => "RECV",
            Syscall::Send => "SEND",
            Syscall::Socket => "SOCKET",
            Syscall::Connect => "CONNECT",
        }
    }
}

impl TryFrom<u32> for Syscall {
    type Error = u32;

    fn try_from(number: u32) -> Result<Self, Self::Error> {
        Syscall::ALL
            .into_iter()
            .find(|s| s.number() == number)
            .ok_or(number)
    }
}

impl fmt::Display for Syscall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A failed syscall as recorded in the run report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyscallFailure {
    pub call: Syscall,
    pub error: SyscallError,
}

impl fmt::Display for SyscallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.call, self.error)
    }
}

/// Why a handler did not produce a result value.
#[derive(Debug)]
pub(crate) enum Interrupt {
    /// Reported to the guest as [`SYSCALL_ERROR`].
    Error(SyscallError),
    /// The run budget ran out while the call was blocked.
    Timeout,
}

impl From<SyscallError> for Interrupt {
    fn from(e: SyscallError) -> Self {
        Interrupt::Error(e)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SocketKind {
    Stream,
    Datagram,
}

enum Connection {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl Connection {
    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Connection::Tcp(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
            Connection::Udp(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(s) => s.read(buf),
            Connection::Udp(s) => s.recv(buf),
        }
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(s) => s.write(buf),
            Connection::Udp(s) => s.send(buf),
        }
    }
}

enum Descriptor {
    Stdin,
    /// Console output; backs both fd 1 and fd 2.
    Stdout,
    File(File),
    Socket {
        kind: SocketKind,
        conn: Option<Connection>,
    },
}

/// Per-run descriptor table.
pub struct FdTable {
    slots: Vec<Option<Descriptor>>,
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FdTable {
    /// A table holding only the standard streams.
    pub fn new() -> Self {
        let mut slots: Vec<Option<Descriptor>> = (0..MAX_FDS).map(|_| None).collect();
        slots[FD_STDIN as usize] = Some(Descriptor::Stdin);
        slots[FD_STDOUT as usize] = Some(Descriptor::Stdout);
        slots[FD_STDERR as usize] = Some(Descriptor::Stdout);
        Self { slots }
    }

    /// Number of descriptors in use beyond the standard streams.
    pub fn open_count(&self) -> usize {
        self.slots.iter().skip(3).filter(|s| s.is_some()).count()
    }

    /// Closes every file and socket.
    pub fn close_all(&mut self) {
        for slot in self.slots.iter_mut().skip(3) {
            *slot = None;
        }
    }

    fn has_free(&self) -> bool {
        self.slots.iter().any(Option::is_none)
    }

    fn allocate(&mut self, descriptor: Descriptor) -> Result<u32, SyscallError> {
        let (fd, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.is_none())
            .ok_or(SyscallError::NoSpace {
                reason: "descriptor table full",
            })?;
        *slot = Some(descriptor);
        Ok(fd as u32)
    }

    fn get_mut(&mut self, fd: u32) -> Result<&mut Descriptor, SyscallError> {
        self.slots
            .get_mut(fd as usize)
            .and_then(Option::as_mut)
            .ok_or(SyscallError::BadDescriptor { fd })
    }

    fn close(&mut self, fd: u32) -> Result<(), SyscallError> {
        if fd <= FD_STDERR {
            return Err(SyscallError::BadDescriptor { fd });
        }
        match self.slots.get_mut(fd as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(SyscallError::BadDescriptor { fd }),
        }
    }
}

fn check_count(count: u32) -> Result<usize, SyscallError> {
    if count > MAX_IO {
        return Err(SyscallError::TooLarge {
            requested: count,
            limit: MAX_IO,
        });
    }
    Ok(count as usize)
}

/// Maps a host I/O error, turning a timeout at the deadline into [`Interrupt::Timeout`].
fn interrupt(deadline: &Deadline, e: io::Error) -> Interrupt {
    if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) && deadline.expired()
    {
        return Interrupt::Timeout;
    }
    Interrupt::Error(SyscallError::Io {
        message: e.to_string(),
    })
}

/// Socket timeout for the rest of the run, or `Timeout` if nothing is left.
fn socket_timeout(deadline: &Deadline) -> Result<Option<Duration>, Interrupt> {
    match deadline.remaining() {
        Some(left) if left.is_zero() => Err(Interrupt::Timeout),
        other => Ok(other),
    }
}

fn connected<'a>(
    fd: u32,
    descriptor: &'a mut Descriptor,
) -> Result<&'a mut Connection, SyscallError> {
    match descriptor {
        Descriptor::Socket {
            conn: Some(conn), ..
        } => Ok(conn),
        Descriptor::Socket { conn: None, .. } => Err(SyscallError::NotConnected { fd }),
        _ => Err(SyscallError::BadDescriptor { fd }),
    }
}

/// Guest buffer the host will write into.
fn guest_slice(memory: &mut Memory, addr: u32, len: usize) -> Result<&mut [u8], SyscallError> {
    memory
        .slice_mut(addr, len)
        .map_err(|_| SyscallError::BadAddress {
            addr,
            len: len as u32,
        })
}

/// Borrowed view of the run state a syscall may touch.
pub(crate) struct SyscallContext<'a> {
    pub memory: &'a mut Memory,
    pub fds: &'a mut FdTable,
    pub host: &'a mut Host,
    pub deadline: Deadline,
}

impl SyscallContext<'_> {
    /// Runs `call` with the raw argument registers `[r1, r2, r5, r4]`.
    pub fn dispatch(&mut self, call: Syscall, args: [u32; 4]) -> Result<u32, Interrupt> {
        let [a1, a2, a3, a4] = args;
        match call {
            Syscall::Read => self.read(a1, a2, a3),
            Syscall::Write => self.write(a1, a2, a3),
            Syscall::Map => Ok(self.map(a1, a2, a3)?),
            Syscall::Unmap => Ok(self.unmap(a1)?),
            Syscall::Open => self.open(a1, a2),
            Syscall::Close => {
                self.fds.close(a1)?;
                Ok(0)
            }
            Syscall::Recv => self.recv(a1, a2, a3, a4),
            Syscall::Send => self.send(a1, a2, a3, a4),
            Syscall::Socket => Ok(self.socket(a1, a2, a3)?),
            Syscall::Connect => self.connect(a1, a2, a3),
        }
    }

    fn read(&mut self, fd: u32, buf: u32, count: u32) -> Result<u32, Interrupt> {
        let count = check_count(count)?;
        let deadline = self.deadline;
        if matches!(self.fds.get_mut(fd)?, Descriptor::Stdout) {
            return Err(SyscallError::BadDescriptor { fd }.into());
        }
        if count == 0 {
            return Ok(0);
        }
        let dst = guest_slice(self.memory, buf, count)?;
        let n = match self.fds.get_mut(fd)? {
            Descriptor::Stdin => self.host.stdin.read(dst),
            Descriptor::File(file) => file.read(dst),
            Descriptor::Socket { conn, .. } => {
                let conn = conn.as_mut().ok_or(SyscallError::NotConnected { fd })?;
                conn.set_timeout(socket_timeout(&deadline)?)
                    .map_err(|e| interrupt(&deadline, e))?;
                conn.recv(dst)
            }
            Descriptor::Stdout => return Err(SyscallError::BadDescriptor { fd }.into()),
        }
        .map_err(|e| interrupt(&deadline, e))?;
        Ok(n as u32)
    }

    fn write(&mut self, fd: u32, buf: u32, count: u32) -> Result<u32, Interrupt> {
        let count = check_count(count)?;
        let deadline = self.deadline;
        let descriptor = self.fds.get_mut(fd)?;
        if !matches!(descriptor, Descriptor::Stdout | Descriptor::Socket { .. }) {
            return Err(SyscallError::BadDescriptor { fd }.into());
        }
        if count == 0 {
            return Ok(0);
        }
        let src = self
            .memory
            .read(buf, count, Access::Read)
            .map_err(|_| SyscallError::BadAddress {
                addr: buf,
                len: count as u32,
            })?;
        match descriptor {
            Descriptor::Stdout => {
                let out = &mut self.host.stdout;
                out.write_all(src)
                    .and_then(|()| out.flush())
                    .map_err(|e| interrupt(&deadline, e))?;
                Ok(count as u32)
            }
            Descriptor::Socket { conn, .. } => {
                let conn = conn.as_mut().ok_or(SyscallError::NotConnected { fd })?;
                conn.set_timeout(socket_timeout(&deadline)?)
                    .map_err(|e| interrupt(&deadline, e))?;
                let n = conn.send(src).map_err(|e| interrupt(&deadline, e))?;
                Ok(n as u32)
            }
            _ => Err(SyscallError::BadDescriptor { fd }.into()),
        }
    }

    fn map(&mut self, size: u32, addr: u32, prot: u32) -> Result<u32, SyscallError> {
        if size == 0 {
            return Err(SyscallError::InvalidArgument {
                reason: "mapping size must be non-zero",
            });
        }
        if size > MAX_MAP_SIZE {
            return Err(SyscallError::TooLarge {
                requested: size,
                limit: MAX_MAP_SIZE,
            });
        }
        if prot & !(PROT_READ | PROT_WRITE) != 0 {
            return Err(SyscallError::InvalidArgument {
                reason: "unknown protection bits",
            });
        }
        if self.memory.mapping_count() >= MAX_MAPPINGS {
            return Err(SyscallError::NoSpace {
                reason: "too many live mappings",
            });
        }
        // Bounded by MAX_MAP_SIZE, so this stays well inside u32.
        let len = align_up(size as u64) as u32;
        let base = if addr == 0 {
            self.memory
                .find_free(len, MAP_BASE, MAP_LIMIT)
                .ok_or(SyscallError::NoSpace {
                    reason: "map area exhausted",
                })?
        } else {
            if addr % PAGE_SIZE != 0
                || addr < MAP_BASE
                || addr as u64 + len as u64 > MAP_LIMIT as u64
            {
                return Err(SyscallError::InvalidArgument {
                    reason: "mapping address must be page aligned inside the map area",
                });
            }
            if !self.memory.is_free(addr, len) {
                return Err(SyscallError::NoSpace {
                    reason: "range overlaps an existing mapping",
                });
            }
            addr
        };
        let perms = Perms {
            read: prot & PROT_READ != 0,
            write: prot & PROT_WRITE != 0,
            execute: false,
        };
        self.memory
            .insert(Region::zeroed(base, len, perms, RegionKind::Mapping))
            .map_err(|_| SyscallError::NoSpace {
                reason: "range overlaps an existing mapping",
            })?;
        Ok(base)
    }

    fn unmap(&mut self, addr: u32) -> Result<u32, SyscallError> {
        self.memory
            .remove_mapping(addr)
            .map(|_| 0)
            .ok_or(SyscallError::NotMapped { addr })
    }

    fn open(&mut self, path_ptr: u32, flags: u32) -> Result<u32, Interrupt> {
        if flags != 0 {
            return Err(SyscallError::InvalidArgument {
                reason: "only read-only opens are supported",
            }
            .into());
        }
        let raw = self
            .memory
            .load_cstr(path_ptr, MAX_PATH)
            .map_err(|_| SyscallError::BadAddress {
                addr: path_ptr,
                len: 1,
            })?
            .ok_or(SyscallError::InvalidArgument {
                reason: "path too long",
            })?;
        let path = String::from_utf8(raw).map_err(|_| SyscallError::InvalidArgument {
            reason: "path is not valid utf-8",
        })?;
        let real = self.host.sandbox.check_path(&path)?;
        if !self.fds.has_free() {
            return Err(SyscallError::NoSpace {
                reason: "descriptor table full",
            }
            .into());
        }
        let file = File::open(&real).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => SyscallError::NotFound { path: path.clone() },
            _ => SyscallError::Io {
                message: e.to_string(),
            },
        })?;
        Ok(self.fds.allocate(Descriptor::File(file))?)
    }

    fn socket(&mut self, domain: u32, ty: u32, protocol: u32) -> Result<u32, SyscallError> {
        if domain != AF_INET {
            return Err(SyscallError::InvalidArgument {
                reason: "only AF_INET sockets are supported",
            });
        }
        let kind = match ty {
            SOCK_STREAM => SocketKind::Stream,
            SOCK_DGRAM => SocketKind::Datagram,
            _ => {
                return Err(SyscallError::InvalidArgument {
                    reason: "unknown socket type",
                });
            }
        };
        if protocol != 0 {
            return Err(SyscallError::InvalidArgument {
                reason: "protocol must be 0",
            });
        }
        if !self.host.sandbox.network_enabled() {
            return Err(SyscallError::NetworkDenied {
                target: "network access is disabled".into(),
            });
        }
        self.fds.allocate(Descriptor::Socket { kind, conn: None })
    }

    fn connect(&mut self, fd: u32, host_ptr: u32, port: u32) -> Result<u32, Interrupt> {
        let deadline = self.deadline;
        let raw = self
            .memory
            .load_cstr(host_ptr, MAX_IPV4_TEXT)
            .map_err(|_| SyscallError::BadAddress {
                addr: host_ptr,
                len: 1,
            })?
            .ok_or(SyscallError::InvalidArgument {
                reason: "address string too long",
            })?;
        let ip: Ipv4Addr = std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(SyscallError::InvalidArgument {
                reason: "not a dotted IPv4 address",
            })?;
        let kind = match self.fds.get_mut(fd)? {
            Descriptor::Socket { conn: Some(_), .. } => {
                return Err(SyscallError::InvalidArgument {
                    reason: "socket already connected",
                }
                .into());
            }
            Descriptor::Socket { kind, conn: None } => *kind,
            _ => return Err(SyscallError::BadDescriptor { fd }.into()),
        };
        let target = SocketAddr::V4(self.host.sandbox.check_target(ip, port)?);
        let timeout = socket_timeout(&deadline)?;
        let conn = match kind {
            SocketKind::Stream => match timeout {
                Some(t) => TcpStream::connect_timeout(&target, t),
                None => TcpStream::connect(target),
            }
            .map(Connection::Tcp),
            SocketKind::Datagram => UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
                .and_then(|s| s.connect(target).map(|()| s))
                .map(Connection::Udp),
        }
        .map_err(|e| interrupt(&deadline, e))?;
        if let Descriptor::Socket { conn: slot, .. } = self.fds.get_mut(fd)? {
            *slot = Some(conn);
        }
        Ok(0)
    }

    fn recv(&mut self, fd: u32, buf: u32, count: u32, flags: u32) -> Result<u32, Interrupt> {
        if flags != 0 {
            return Err(SyscallError::InvalidArgument {
                reason: "flags must be 0",
            }
            .into());
        }
        let count = check_count(count)?;
        let deadline = self.deadline;
        let conn = connected(fd, self.fds.get_mut(fd)?)?;
        if count == 0 {
            return Ok(0);
        }
        let dst = guest_slice(self.memory, buf, count)?;
        conn.set_timeout(socket_timeout(&deadline)?)
            .map_err(|e| interrupt(&deadline, e))?;
        let n = conn.recv(dst).map_err(|e| interrupt(&deadline, e))?;
        Ok(n as u32)
    }

    fn send(&mut self, fd: u32, buf: u32, count: u32, flags: u32) -> Result<u32, Interrupt> {
        if flags != 0 {
            return Err(SyscallError::InvalidArgument {
                reason: "flags must be 0",
            }
            .into());
        }
        let count = check_count(count)?;
        let deadline = self.deadline;
        let conn = connected(fd, self.fds.get_mut(fd)?)?;
        if count == 0 {
            return Ok(0);
        }
        let src = self
            .memory
            .read(buf, count, Access::Read)
            .map_err(|_| SyscallError::BadAddress {
                addr: buf,
                len: count as u32,
            })?;
        conn.set_timeout(socket_timeout(&deadline)?)
            .map_err(|e| interrupt(&deadline, e))?;
        let n = conn.send(src).map_err(|e| interrupt(&deadline, e))?;
        Ok(n as u32)
    }
}
