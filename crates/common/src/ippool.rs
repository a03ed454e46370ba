//! Per-interface IPv4 address pools
//!
//! Every usable host address of an interface subnet is materialized as one
//! `ip_addresses` row when the interface is provisioned. Claims flip the
//! `available` flag with a conditional update so two concurrent claims can
//! never hand out the same row.

use crate::types::IpAddress;
use crate::{Error, Result};
use ipnetwork::{IpNetwork, Ipv4Network};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// Upper bound on addresses materialized for a single interface
pub const MAX_POOL_SIZE: u64 = 1_000_000;

/// Usable host range of a subnet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolRange {
    pub first_usable: Ipv4Addr,
    pub last_usable: Ipv4Addr,
    pub count: u64,
}

impl PoolRange {
    /// Iterate over every usable address in ascending order
    pub fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> {
        let first = u32::from(self.first_usable);
        let last = u32::from(self.last_usable);
        (first..=last).map(Ipv4Addr::from)
    }
}

/// Compute the usable range of an IPv4 CIDR.
///
/// Below /31 the network address, the gateway (network + 1) and the broadcast
/// address are excluded. /31 yields both addresses, /32 the single one.
pub fn compute_range(cidr: &str) -> Result<PoolRange> {
    let v4 = parse_v4(cidr)?;
    let base = u32::from(v4.network());
    let top = u32::from(v4.broadcast());
    let (first, last) = match v4.prefix() {
        32 => (base, base),
        31 => (base, top),
        _ => (base + 2, top - 1),
    };

    Ok(PoolRange {
        first_usable: Ipv4Addr::from(first),
        last_usable: Ipv4Addr::from(last),
        count: u64::from(last - first) + 1,
    })
}

fn parse_v4(cidr: &str) -> Result<Ipv4Network> {
    let invalid = |reason: String| Error::InvalidRange {
        cidr: cidr.to_string(),
        reason,
    };

    let network: IpNetwork = cidr.trim().parse().map_err(|e| invalid(format!("{}", e)))?;
    match network {
        IpNetwork::V4(v4) => Ok(v4),
        IpNetwork::V6(_) => Err(invalid("IPv6 pools are not supported".to_string())),
    }
}

/// Write one available row per usable address of `cidr`
pub(crate) fn materialize_pool(conn: &Connection, interface_id: i64, cidr: &str) -> Result<usize> {
    let range = compute_range(cidr)?;
    if range.count > MAX_POOL_SIZE {
        return Err(Error::PoolTooLarge {
            count: range.count,
            max: MAX_POOL_SIZE,
        });
    }

    let mut stmt = conn.prepare_cached(
        "INSERT INTO ip_addresses (interface_id, address, available) VALUES (?1, ?2, 1)",
    )?;
    let mut written = 0usize;
    for addr in range.addresses() {
        stmt.execute(params![interface_id, addr.to_string()])?;
        written += 1;
    }

    info!(
        "Materialized {} addresses for interface {} ({} - {})",
        written, interface_id, range.first_usable, range.last_usable
    );
    Ok(written)
}

/// Drop the interface's own host address from its pool so no peer can claim it.
/// Returns whether a row was removed.
pub(crate) fn exclude_host_address(
    conn: &Connection,
    interface_id: i64,
    cidr: &str,
) -> Result<bool> {
    let host = parse_v4(cidr)?.ip();
    let removed = conn.execute(
        "DELETE FROM ip_addresses WHERE interface_id = ?1 AND address = ?2 AND available = 1",
        params![interface_id, host.to_string()],
    )?;
    if removed > 0 {
        debug!("Reserved {} for interface {}", host, interface_id);
    }
    Ok(removed > 0)
}

/// Claim the lowest available address of an interface
pub(crate) fn claim_one(conn: &Connection, interface_id: i64) -> Result<IpAddress> {
    let claimed = conn
        .query_row(
            "UPDATE ip_addresses SET available = 0
             WHERE id = (
                 SELECT id FROM ip_addresses
                 WHERE interface_id = ?1 AND available = 1
                 ORDER BY id LIMIT 1
             ) AND available = 1
             RETURNING id, interface_id, address, available",
            params![interface_id],
            address_from_row,
        )
        .optional()?;

    match claimed {
        Some(addr) => {
            debug!("Claimed {} on interface {}", addr.address, interface_id);
            Ok(addr)
        }
        None => Err(Error::PoolExhausted {
            requested: 1,
            available: 0,
        }),
    }
}

/// Claim `n` addresses or none at all. Must run inside a transaction.
pub(crate) fn claim_n(conn: &Connection, interface_id: i64, n: usize) -> Result<Vec<IpAddress>> {
    if n == 0 {
        return Ok(Vec::new());
    }

    let ids: Vec<i64> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM ip_addresses
             WHERE interface_id = ?1 AND available = 1
             ORDER BY id LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![interface_id, n as i64], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    if ids.len() < n {
        return Err(Error::PoolExhausted {
            requested: n,
            available: ids.len(),
        });
    }

    let mut stmt = conn.prepare_cached(
        "UPDATE ip_addresses SET available = 0
         WHERE id = ?1 AND available = 1
         RETURNING id, interface_id, address, available",
    )?;
    let mut claimed = Vec::with_capacity(n);
    for id in ids {
        let addr = stmt
            .query_row(params![id], address_from_row)
            .optional()?
            .ok_or(Error::PoolExhausted {
                requested: n,
                available: claimed.len(),
            })?;
        claimed.push(addr);
    }

    debug!("Claimed {} addresses on interface {}", claimed.len(), interface_id);
    Ok(claimed)
}

/// Return addresses to the pool. Releasing a free address is a no-op.
pub(crate) fn release(conn: &Connection, address_ids: &[i64]) -> Result<()> {
    let mut stmt = conn.prepare_cached("UPDATE ip_addresses SET available = 1 WHERE id = ?1")?;
    for id in address_ids {
        stmt.execute(params![id])?;
    }
    Ok(())
}

pub(crate) fn available_count(conn: &Connection, interface_id: i64) -> Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM ip_addresses WHERE interface_id = ?1 AND available = 1",
        params![interface_id],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

fn address_from_row(row: &Row<'_>) -> rusqlite::Result<IpAddress> {
    Ok(IpAddress {
        id: row.get(0)?,
        interface_id: row.get(1)?,
        address: row.get(2)?,
        available: row.get(3)?,
    })
}
