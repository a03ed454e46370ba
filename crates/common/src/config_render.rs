//! wg-quick configuration files

use crate::types::{Interface, Peer};
use crate::{Error, Result};
use std::fmt::Write;

/// Server side `<name>.conf` for an interface
pub fn render_interface_config(iface: &Interface) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail
    let _ = writeln!(out, "# wgquota interface {}", iface.name);
    let _ = writeln!(out, "[Interface]");
    let _ = writeln!(out, "Address = {}", iface.address);
    let _ = writeln!(out, "ListenPort = {}", iface.listen_port);
    let _ = writeln!(out, "PrivateKey = {}", iface.private_key);
    let _ = writeln!(out, "SaveConfig = {}", iface.save_config);

    let hooks = [
        ("PreUp", &iface.pre_up),
        ("PostUp", &iface.post_up),
        ("PreDown", &iface.pre_down),
        ("PostDown", &iface.post_down),
        ("DNS", &iface.dns),
    ];
    for (key, value) in hooks {
        if let Some(v) = value.as_deref().filter(|v| !v.trim().is_empty()) {
            let _ = writeln!(out, "{} = {}", key, v);
        }
    }

    out
}

/// Client side config for a peer. Needs the peer's private key.
pub fn render_peer_config(peer: &Peer, iface: &Interface) -> Result<String> {
    let private_key = peer
        .private_key
        .as_deref()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| {
            Error::InvalidState(format!("peer {} has no stored private key", peer.name))
        })?;

    let mut out = String::new();
    let _ = writeln!(out, "# wgquota peer {} on {}", peer.name, iface.name);
    let _ = writeln!(out, "[Interface]");
    let _ = writeln!(out, "PrivateKey = {}", private_key);
    let _ = writeln!(out, "Address = {}", peer.allowed_ips);
    if let Some(dns) = peer.dns.as_deref().or(iface.dns.as_deref()) {
        let _ = writeln!(out, "DNS = {}", dns);
    }
    if let Some(mtu) = peer.mtu {
        let _ = writeln!(out, "MTU = {}", mtu);
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "[Peer]");
    let _ = writeln!(out, "PublicKey = {}", iface.public_key);
    if !peer.preshared_key.is_empty() {
        let _ = writeln!(out, "PresharedKey = {}", peer.preshared_key);
    }
    let _ = writeln!(out, "AllowedIPs = {}", peer.endpoint_allowed_ips);
    let _ = writeln!(
        out,
        "Endpoint = {}",
        peer.endpoint.as_deref().unwrap_or(&iface.endpoint)
    );
    if let Some(keepalive) = peer.persistent_keepalive {
        let _ = writeln!(out, "PersistentKeepalive = {}", keepalive);
    }

    Ok(out)
}
