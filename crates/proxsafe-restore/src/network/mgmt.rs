//! Management interface detection, address snapshots and network reload

use proxsafe_core::sys::args;
use proxsafe_core::Deps;
use regex::Regex;
use std::sync::LazyLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

static DEV_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bdev\s+(\S+)").expect("route regex is valid"));

/// Reload commands in preference order
pub const RELOAD_COMMANDS: &[(&str, &[&str])] = &[
    ("ifreload", &["-a"]),
    ("systemctl", &["restart", "networking"]),
    ("ifup", &["-a"]),
];

async fn ip(deps: &Deps, cancel: &CancellationToken, argv: &[&str]) -> Option<String> {
    match deps.cmd.run(cancel, "ip", &args(argv)).await {
        Ok(out) if out.success() => Some(out.output),
        Ok(out) => {
            debug!("ip {} failed: {}", argv.join(" "), out.output.trim());
            None
        }
        Err(e) => {
            debug!("ip {}: {}", argv.join(" "), e);
            None
        }
    }
}

/// Client address of the SSH session we run under, if any.
fn ssh_client(deps: &Deps) -> Option<String> {
    ["SSH_CONNECTION", "SSH_CLIENT"]
        .iter()
        .filter_map(|name| deps.host.env_var(name))
        .find_map(|value| value.split_whitespace().next().map(str::to_string))
}

/// Interface carrying the operator's session, or the default route.
pub async fn detect_interface(deps: &Deps, cancel: &CancellationToken) -> Option<String> {
    let routed = match ssh_client(deps) {
        Some(client) => ip(deps, cancel, &["route", "get", client.as_str()]).await,
        None => ip(deps, cancel, &["route", "show", "default"]).await,
    }?;
    let iface = DEV_RE.captures(&routed).map(|c| c[1].to_string());
    debug!("Management interface: {:?}", iface);
    iface
}

/// `ip -br addr` output, empty when unavailable.
pub async fn snapshot_addresses(deps: &Deps, cancel: &CancellationToken) -> String {
    ip(deps, cancel, &["-br", "addr"]).await.unwrap_or_default()
}

/// First address of `iface` in `ip -br addr` output, preferring IPv4.
pub fn address_of(brief: &str, iface: &str) -> Option<String> {
    let line = brief.lines().find(|line| {
        line.split_whitespace()
            .next()
            .map(|name| name.split('@').next() == Some(iface))
            .unwrap_or(false)
    })?;
    let addrs: Vec<&str> = line.split_whitespace().skip(2).collect();
    addrs
        .iter()
        .find(|a| !a.contains(':'))
        .or_else(|| addrs.first())
        .map(|a| a.to_string())
}

/// First available reload command.
pub fn reload_command(deps: &Deps) -> Option<(&'static str, &'static [&'static str])> {
    RELOAD_COMMANDS
        .iter()
        .copied()
        .find(|(program, _)| deps.cmd.available(program))
}

/// Apply the on-disk network configuration.
pub async fn reload(deps: &Deps, cancel: &CancellationToken) -> Result<()> {
    let Some((program, argv)) = reload_command(deps) else {
        warn!("No network reload command available");
        return Err(proxsafe_core::Error::command_not_found("ifreload").into());
    };
    let out = deps.cmd.run(cancel, program, &args(argv)).await?;
    if !out.success() {
        return Err(Error::apply(
            crate::categories::NETWORK,
            format!("{} {} failed: {}", program, argv.join(" "), out.output.trim()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxsafe_core::sys::CommandOutput;
    use proxsafe_core::testing::TestDeps;

    const BRIEF: &str = "\
lo               UNKNOWN        127.0.0.1/8 ::1/128
eno1             UP
vmbr0            UP             fe80::1/64 192.168.1.10/24
vmbr0.20@vmbr0   UP             10.20.0.5/24
";

    #[tokio::test]
    async fn test_interface_from_ssh_session() {
        let t = TestDeps::new();
        t.host.set_env("SSH_CONNECTION", "192.168.1.50 50022 192.168.1.10 22");
        t.runner.respond(
            "ip",
            &["route", "get", "192.168.1.50"],
            CommandOutput::ok("192.168.1.50 dev vmbr0 src 192.168.1.10 uid 0\n    cache\n"),
        );
        let iface = detect_interface(&t.deps, &CancellationToken::new()).await;
        assert_eq!(iface.as_deref(), Some("vmbr0"));
    }

    #[tokio::test]
    async fn test_interface_from_default_route() {
        let t = TestDeps::new();
        t.runner.respond(
            "ip",
            &["route", "show", "default"],
            CommandOutput::ok("default via 10.0.0.1 dev eno2 proto kernel onlink\n"),
        );
        let iface = detect_interface(&t.deps, &CancellationToken::new()).await;
        assert_eq!(iface.as_deref(), Some("eno2"));
    }

    #[test]
    fn test_address_of() {
        assert_eq!(address_of(BRIEF, "vmbr0").as_deref(), Some("192.168.1.10/24"));
        assert_eq!(address_of(BRIEF, "vmbr0.20").as_deref(), Some("10.20.0.5/24"));
        assert_eq!(address_of(BRIEF, "eno1"), None);
        assert_eq!(address_of(BRIEF, "eth9"), None);
    }

    #[test]
    fn test_reload_command_preference() {
        let t = TestDeps::new();
        assert_eq!(reload_command(&t.deps).map(|(p, _)| p), Some("ifreload"));
        t.runner.set_missing("ifreload");
        assert_eq!(reload_command(&t.deps).map(|(p, _)| p), Some("systemctl"));
    }
}
