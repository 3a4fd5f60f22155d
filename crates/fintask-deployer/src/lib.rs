//! Operator-facing glue that ships a `fintask-worker` binary to a remote
//! host, starts/stops it, and tails its logs.
//!
//! This crate has no runtime contract with the queue/worker core beyond
//! the two facts the core's design cares about: a worker is addressed by
//! one stable `worker_id` for the life of its process, and its
//! stdout/stderr land in a file an operator can read. Everything here is
//! scripted glue over `ssh`/`scp`, not a protocol the core depends on.

mod remote;

pub use remote::{RemoteOutput, RemoteTarget, SshRunner};

use anyhow::{bail, Result};
use fintask_core::Config;

/// A parsed `hosts:` entry combined with the CLI's connection overrides,
/// ready to hand to [`SshRunner`].
pub fn resolve_target(
    config: &Config,
    host: &str,
    user_override: Option<&str>,
    key_override: Option<&str>,
    port_override: Option<u16>,
) -> Result<RemoteTarget> {
    let entry = config.hosts.iter().find(|h| h.host == host);

    let user = user_override
        .or(entry.map(|e| e.user.as_str()))
        .ok_or_else(|| anyhow::anyhow!("no user configured for host {host}; pass --user or add it to hosts:"))?;
    let key_path = key_override.or(entry.map(|e| e.key_path.as_str()));
    let port = port_override.or(entry.map(|e| e.port)).unwrap_or(22);

    if entry.is_none() && user_override.is_none() {
        bail!("host {host} is not listed in hosts: and no --user override was given");
    }

    Ok(RemoteTarget {
        host: host.to_string(),
        user: user.to_string(),
        key_path: key_path.map(|s| s.to_string()),
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_host() -> Config {
        let yaml = r#"
queue:
  backend: sql
  sql: { host: localhost, port: 5432, database: fintask, user: fintask, password: x }
worker:
  kinds: [price_update]
logging:
  file: /var/log/fintask/worker.log
hosts:
  - { host: "10.0.0.1", user: "deploy", keyPath: "/home/op/.ssh/id_ed25519", port: 2222 }
"#;
        Config::parse(yaml).unwrap()
    }

    #[test]
    fn resolves_target_from_hosts_section() {
        let config = config_with_host();
        let target = resolve_target(&config, "10.0.0.1", None, None, None).unwrap();
        assert_eq!(target.user, "deploy");
        assert_eq!(target.port, 2222);
        assert_eq!(target.key_path.as_deref(), Some("/home/op/.ssh/id_ed25519"));
    }

    #[test]
    fn cli_overrides_take_precedence() {
        let config = config_with_host();
        let target = resolve_target(&config, "10.0.0.1", Some("root"), None, Some(22)).unwrap();
        assert_eq!(target.user, "root");
        assert_eq!(target.port, 22);
    }

    #[test]
    fn unknown_host_without_user_override_errors() {
        let config = config_with_host();
        assert!(resolve_target(&config, "unknown-host", None, None, None).is_err());
    }

    #[test]
    fn unknown_host_with_user_override_succeeds() {
        let config = config_with_host();
        let target = resolve_target(&config, "unknown-host", Some("root"), None, Some(22)).unwrap();
        assert_eq!(target.user, "root");
        assert_eq!(target.port, 22);
        assert!(target.key_path.is_none());
    }
}
