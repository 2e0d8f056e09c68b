//! Host-side access policy for guest file and network syscalls.

use crate::virtual_machine::errors::SyscallError;
use std::env;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Component, Path, PathBuf};

/// Paths a guest may open when nothing else is configured.
pub const DEFAULT_ALLOWED_PATHS: &[&str] = &["/etc/passwd"];

/// Which remote endpoints guest sockets may reach.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkPolicy {
    /// Master switch; when off, `SOCKET` itself is refused.
    pub enabled: bool,
    /// Permit 127.0.0.0/8 targets.
    pub allow_loopback: bool,
    /// When non-empty, the only permitted targets.
    pub allowed_hosts: Vec<Ipv4Addr>,
}

impl NetworkPolicy {
    /// Checks a `CONNECT` target.
    pub fn check_target(&self, target: SocketAddrV4) -> Result<(), SyscallError> {
        let denied = || SyscallError::NetworkDenied {
            target: target.to_string(),
        };
        if !self.enabled {
            return Err(denied());
        }
        if target.port() == 0 {
            return Err(SyscallError::InvalidArgument {
                reason: "port must be non-zero",
            });
        }
        let ip = *target.ip();
        if !self.allowed_hosts.is_empty() {
            return if self.allowed_hosts.contains(&ip) {
                Ok(())
            } else {
                Err(denied())
            };
        }
        if ip.is_loopback() {
            return if self.allow_loopback {
                Ok(())
            } else {
                Err(denied())
            };
        }
        if ip.is_private()
            || ip.is_unspecified()
            || ip.is_broadcast()
            || ip.is_multicast()
            || ip.is_link_local()
            || ip.is_documentation()
        {
            return Err(denied());
        }
        Ok(())
    }
}

/// File-system and network policy applied to one run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxConfig {
    /// Files or directories a guest may open read-only.
    pub allowed_paths: Vec<PathBuf>,
    pub network: NetworkPolicy,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            allowed_paths: DEFAULT_ALLOWED_PATHS.iter().map(PathBuf::from).collect(),
            network: NetworkPolicy::default(),
        }
    }
}

impl SandboxConfig {
    /// A policy that permits no files and no network.
    pub fn deny_all() -> Self {
        Self {
            allowed_paths: Vec::new(),
            network: NetworkPolicy::default(),
        }
    }

    /// Defaults overridden by `XVM_ALLOWED_PATHS` (colon-separated) and
    /// `XVM_ALLOW_NETWORK` (`1` enables public targets and loopback).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(paths) = env::var("XVM_ALLOWED_PATHS") {
            config.allowed_paths = paths
                .split(':')
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Ok(flag) = env::var("XVM_ALLOW_NETWORK") {
            let on = matches!(flag.trim(), "1" | "true" | "yes");
            config.network.enabled = on;
            config.network.allow_loopback = on;
        }
        config
    }

    /// Resolves a guest path and checks it against the allow-list.
    ///
    /// The path is canonicalized before matching, so `..` and symlinks cannot escape an
    /// allowed entry. A missing file is only reported as `NotFound` when it would have
    /// been allowed; otherwise the caller learns nothing about its existence.
    pub fn check_path(&self, guest: &str) -> Result<PathBuf, SyscallError> {
        let path = Path::new(guest);
        if !path.is_absolute() {
            return Err(SyscallError::InvalidArgument {
                reason: "path must be absolute",
            });
        }
        let roots: Vec<PathBuf> = self
            .allowed_paths
            .iter()
            .filter_map(|p| p.canonicalize().ok())
            .collect();
        match path.canonicalize() {
            Ok(real) if roots.iter().any(|root| real.starts_with(root)) => Ok(real),
            Ok(_) => Err(SyscallError::PathDenied {
                path: guest.to_string(),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let lexical = normalize(path);
                let resolved = lexical
                    .parent()
                    .and_then(|parent| parent.canonicalize().ok())
                    .zip(lexical.file_name())
                    .map(|(parent, name)| parent.join(name))
                    .unwrap_or_else(|| lexical.clone());
                if roots.iter().any(|root| resolved.starts_with(root)) {
                    Err(SyscallError::NotFound {
                        path: guest.to_string(),
                    })
                } else {
                    Err(SyscallError::PathDenied {
                        path: guest.to_string(),
                    })
                }
            }
            Err(_) => Err(SyscallError::PathDenied {
                path: guest.to_string(),
            }),
        }
    }

    /// Checks a `CONNECT` target against the network policy.
    pub fn check_target(&self, ip: Ipv4Addr, port: u32) -> Result<SocketAddrV4, SyscallError> {
        let port = u16::try_from(port).map_err(|_| SyscallError::InvalidArgument {
            reason: "port out of range",
        })?;
        let target = SocketAddrV4::new(ip, port);
        self.network.check_target(target)?;
        Ok(target)
    }

    /// Whether guests may create sockets at all.
    pub fn network_enabled(&self) -> bool {
        self.network.enabled
    }
}

/// Lexically resolves `.` and `..` without touching the file system.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn config_for(dir: &Path) -> SandboxConfig {
        SandboxConfig {
            allowed_paths: vec![dir.to_path_buf()],
            network: NetworkPolicy::default(),
        }
    }

    #[test]
    fn allowed_file_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("flag.txt");
        fs::write(&file, b"ok").unwrap();
        let config = config_for(dir.path());
        let real = config.check_path(file.to_str().unwrap()).unwrap();
        assert_eq!(real, file.canonicalize().unwrap());
    }

    #[test]
    fn dot_dot_cannot_escape() {
        let dir = tempfile::tempdir().unwrap();
        let inner = dir.path().join("inner");
        fs::create_dir(&inner).unwrap();
        fs::write(dir.path().join("secret"), b"x").unwrap();
        let config = config_for(&inner);
        let escape = format!("{}/../secret", inner.display());
        assert!(matches!(
            config.check_path(&escape),
            Err(SyscallError::PathDenied { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_out_of_sandbox_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let inner = dir.path().join("inner");
        fs::create_dir(&inner).unwrap();
        let outside = dir.path().join("outside");
        fs::write(&outside, b"x").unwrap();
        let link = inner.join("link");
        std::os::unix::fs::symlink(&outside, &link).unwrap();
        let config = config_for(&inner);
        assert!(matches!(
            config.check_path(link.to_str().unwrap()),
            Err(SyscallError::PathDenied { .. })
        ));
    }

    #[test]
    fn missing_files_only_reported_inside_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path());
        let inside = dir.path().join("nope");
        assert!(matches!(
            config.check_path(inside.to_str().unwrap()),
            Err(SyscallError::NotFound { .. })
        ));
        assert!(matches!(
            config.check_path("/definitely/not/here"),
            Err(SyscallError::PathDenied { .. })
        ));
        assert!(matches!(
            config.check_path("relative.txt"),
            Err(SyscallError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn network_disabled_by_default() {
        let config = SandboxConfig::default();
        assert!(!config.network_enabled());
        assert!(matches!(
            config.check_target(Ipv4Addr::new(1, 1, 1, 1), 80),
            Err(SyscallError::NetworkDenied { .. })
        ));
    }

    #[test]
    fn special_ranges_need_explicit_permission() {
        let mut config = SandboxConfig::deny_all();
        config.network.enabled = true;
        assert!(config.check_target(Ipv4Addr::new(93, 184, 216, 34), 80).is_ok());
        for ip in [
            Ipv4Addr::LOCALHOST,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::BROADCAST,
            Ipv4Addr::new(224, 0, 0, 1),
        ] {
            assert!(config.check_target(ip, 80).is_err(), "{ip} should be denied");
        }
        config.network.allow_loopback = true;
        assert!(config.check_target(Ipv4Addr::LOCALHOST, 80).is_ok());
        assert!(matches!(
            config.check_target(Ipv4Addr::LOCALHOST, 70000),
            Err(SyscallError::InvalidArgument { .. })
        ));
        assert!(matches!(
            config.check_target(Ipv4Addr::LOCALHOST, 0),
            Err(SyscallError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn host_list_restricts_targets() {
        let mut config = SandboxConfig::deny_all();
        config.network.enabled = true;
        config.network.allowed_hosts = vec![Ipv4Addr::new(10, 1, 2, 3)];
        assert!(config.check_target(Ipv4Addr::new(10, 1, 2, 3), 22).is_ok());
        assert!(config.check_target(Ipv4Addr::new(93, 184, 216, 34), 80).is_err());
    }
}
