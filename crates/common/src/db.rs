//! SQLite persistence for interfaces, peers and address pools

use crate::accounting::UsageUpdate;
use crate::lifecycle::Transition;
use crate::types::*;
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// Peer row joined with the owning interface's accounting parameters
#[derive(Debug, Clone)]
pub struct AccountingRow {
    pub peer: Peer,
    pub interface_name: String,
    pub upload_percent: f64,
    pub download_percent: f64,
}

/// A peer that has to be taken off the live tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalTarget {
    pub peer_id: i64,
    pub peer_name: String,
    pub interface: String,
    pub public_key: String,
    pub status: PeerStatus,
}

const INTERFACE_COLUMNS: &str = "id, name, address, endpoint, listen_port, private_key, public_key, \
     status, upload_percent, download_percent, save_config, pre_up, post_up, pre_down, post_down, dns, \
     created_at, updated_at";

const PEER_COLUMNS: &str = "p.id, p.interface_id, p.name, p.public_key, p.private_key, p.preshared_key, \
     p.allowed_ips, p.ip_address_id, p.total_volume, p.expire_time, p.on_hold_expire_duration, \
     p.download_volume, p.upload_volume, p.total_received_volume, p.last_download_volume, \
     p.last_upload_volume, p.last_total_received_volume, p.status, p.removal_pending, p.endpoint, \
     p.endpoint_allowed_ips, p.dns, p.mtu, p.persistent_keepalive, p.created_at, p.updated_at";

const PEER_COLUMN_COUNT: usize = 26;

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self::from_connection(conn)?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS interfaces (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                address TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                listen_port INTEGER NOT NULL,
                private_key TEXT NOT NULL,
                public_key TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active'
                    CHECK (status IN ('active', 'disabled')),
                upload_percent REAL NOT NULL DEFAULT 1.0,
                download_percent REAL NOT NULL DEFAULT 1.0,
                save_config INTEGER NOT NULL DEFAULT 0,
                pre_up TEXT,
                post_up TEXT,
                pre_down TEXT,
                post_down TEXT,
                dns TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ip_addresses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                interface_id INTEGER NOT NULL,
                address TEXT NOT NULL,
                available INTEGER NOT NULL DEFAULT 1,
                UNIQUE (interface_id, address),
                FOREIGN KEY(interface_id) REFERENCES interfaces(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_ip_addresses_available ON ip_addresses(interface_id, available);

            CREATE TABLE IF NOT EXISTS peers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                interface_id INTEGER NOT NULL,
                name TEXT NOT NULL UNIQUE,
                public_key TEXT NOT NULL UNIQUE,
                private_key TEXT,
                preshared_key TEXT NOT NULL,
                allowed_ips TEXT NOT NULL,
                ip_address_id INTEGER,
                total_volume INTEGER NOT NULL DEFAULT 0,
                expire_time INTEGER NOT NULL DEFAULT 0,
                on_hold_expire_duration INTEGER NOT NULL DEFAULT 0,
                download_volume INTEGER NOT NULL DEFAULT 0,
                upload_volume INTEGER NOT NULL DEFAULT 0,
                total_received_volume INTEGER NOT NULL DEFAULT 0,
                last_download_volume INTEGER NOT NULL DEFAULT 0,
                last_upload_volume INTEGER NOT NULL DEFAULT 0,
                last_total_received_volume INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'onhold'
                    CHECK (status IN ('onhold', 'active', 'limited', 'expired', 'disabled')),
                removal_pending INTEGER NOT NULL DEFAULT 0,
                endpoint TEXT,
                endpoint_allowed_ips TEXT NOT NULL DEFAULT '0.0.0.0/0',
                dns TEXT,
                mtu INTEGER,
                persistent_keepalive INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY(interface_id) REFERENCES interfaces(id) ON DELETE RESTRICT,
                FOREIGN KEY(ip_address_id) REFERENCES ip_addresses(id) ON DELETE SET NULL
            );
            CREATE INDEX IF NOT EXISTS idx_peers_interface ON peers(interface_id);
            CREATE INDEX IF NOT EXISTS idx_peers_status ON peers(status);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Run `f` inside a single transaction; any error rolls everything back
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run `f` against the shared connection without an explicit transaction
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    // ========================================================================
    // Interface operations
    // ========================================================================

    pub fn get_interface(&self, id: i64) -> Result<Option<Interface>> {
        self.with_connection(|conn| get_interface(conn, id))
    }

    pub fn get_interface_by_name(&self, name: &str) -> Result<Option<Interface>> {
        let conn = self.conn.lock();
        let iface = conn
            .query_row(
                &format!("SELECT {} FROM interfaces WHERE name = ?1", INTERFACE_COLUMNS),
                params![name],
                interface_from_row,
            )
            .optional()?;
        Ok(iface)
    }

    pub fn list_interfaces(&self) -> Result<Vec<Interface>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM interfaces ORDER BY id",
            INTERFACE_COLUMNS
        ))?;
        let rows = stmt.query_map([], interface_from_row)?;

        let mut interfaces = Vec::new();
        for row in rows {
            interfaces.push(row?);
        }
        Ok(interfaces)
    }

    pub fn update_interface_status(&self, id: i64, status: InterfaceStatus) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE interfaces SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.to_string(), chrono::Utc::now().timestamp(), id],
        )?;
        if rows == 0 {
            return Err(Error::not_found("interface", id));
        }
        Ok(())
    }

    /// Delete an interface; its address pool goes with it
    pub fn delete_interface(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM interfaces WHERE id = ?1", params![id])?;
        if rows > 0 {
            debug!("Deleted interface {}", id);
        }
        Ok(rows > 0)
    }

    pub fn count_peers(&self, interface_id: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM peers WHERE interface_id = ?1",
            params![interface_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Interface list with aggregate peer and pool figures
    pub fn interface_summaries(&self) -> Result<Vec<InterfaceSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT i.name, i.address, i.listen_port, i.public_key, i.status,
                    (SELECT COUNT(*) FROM peers p WHERE p.interface_id = i.id),
                    (SELECT COUNT(*) FROM ip_addresses a WHERE a.interface_id = i.id AND a.available = 1),
                    (SELECT COALESCE(SUM(p.total_volume), 0) FROM peers p WHERE p.interface_id = i.id),
                    (SELECT COALESCE(SUM(p.total_received_volume), 0) FROM peers p WHERE p.interface_id = i.id)
             FROM interfaces i ORDER BY i.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(InterfaceSummary {
                name: row.get(0)?,
                address: row.get(1)?,
                listen_port: row.get(2)?,
                public_key: row.get(3)?,
                status: parse_text(row, 4)?,
                peer_count: row.get::<_, i64>(5)? as usize,
                available_addresses: row.get::<_, i64>(6)? as usize,
                total_quota: from_db(row.get(7)?),
                total_used: from_db(row.get(8)?),
            })
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row?);
        }
        Ok(summaries)
    }

    // ========================================================================
    // Peer operations
    // ========================================================================

    pub fn get_peer(&self, id: i64) -> Result<Option<Peer>> {
        self.with_connection(|conn| get_peer(conn, id))
    }

    pub fn get_peer_by_name(&self, name: &str) -> Result<Option<Peer>> {
        let conn = self.conn.lock();
        let peer = conn
            .query_row(
                &format!("SELECT {} FROM peers p WHERE p.name = ?1", PEER_COLUMNS),
                params![name],
                peer_from_row,
            )
            .optional()?;
        Ok(peer)
    }

    pub fn get_peer_by_public_key(&self, public_key: &str) -> Result<Option<Peer>> {
        let conn = self.conn.lock();
        let peer = conn
            .query_row(
                &format!("SELECT {} FROM peers p WHERE p.public_key = ?1", PEER_COLUMNS),
                params![public_key],
                peer_from_row,
            )
            .optional()?;
        Ok(peer)
    }

    /// Filtered, paged peer listing ordered by id
    pub fn filter_peers(&self, filter: &PeerFilter) -> Result<PeerPage> {
        let conn = self.conn.lock();
        let status = filter.status.map(|s| s.to_string());
        let where_clause = "FROM peers p JOIN interfaces i ON i.id = p.interface_id
             WHERE (?1 IS NULL OR p.name = ?1)
               AND (?2 IS NULL OR i.name = ?2)
               AND (?3 IS NULL OR p.public_key = ?3)
               AND (?4 IS NULL OR p.status = ?4)";

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) {}", where_clause),
            params![filter.name, filter.interface, filter.public_key, status],
            |row| row.get(0),
        )?;

        let take = filter.take.map(|t| t as i64).unwrap_or(-1);
        let mut stmt = conn.prepare(&format!(
            "SELECT {} {} ORDER BY p.id LIMIT ?5 OFFSET ?6",
            PEER_COLUMNS, where_clause
        ))?;
        let rows = stmt.query_map(
            params![
                filter.name,
                filter.interface,
                filter.public_key,
                status,
                take,
                filter.skip as i64
            ],
            peer_from_row,
        )?;

        let mut peers = Vec::new();
        for row in rows {
            peers.push(row?);
        }
        Ok(PeerPage {
            total: total as usize,
            peers,
        })
    }

    /// Write back every operator-mutable column of a peer
    pub fn update_peer(&self, peer: &Peer) -> Result<()> {
        self.with_connection(|conn| update_peer(conn, peer))
    }

    pub fn delete_peer(&self, id: i64) -> Result<bool> {
        self.with_connection(|conn| delete_peer(conn, id))
    }

    // ========================================================================
    // Accounting operations
    // ========================================================================

    /// All peers with their interface's accounting multipliers
    pub fn list_accounting_rows(&self) -> Result<Vec<AccountingRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {}, i.name, i.upload_percent, i.download_percent
             FROM peers p JOIN interfaces i ON i.id = p.interface_id
             ORDER BY p.id",
            PEER_COLUMNS
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(AccountingRow {
                peer: peer_from_row(row)?,
                interface_name: row.get(PEER_COLUMN_COUNT)?,
                upload_percent: row.get(PEER_COLUMN_COUNT + 1)?,
                download_percent: row.get(PEER_COLUMN_COUNT + 2)?,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Persist one tick: counter updates and status transitions, all or nothing
    pub fn apply_accounting_batch(
        &self,
        usage: &[UsageUpdate],
        transitions: &[Transition],
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        self.with_transaction(|tx| {
            {
                let mut stmt = tx.prepare_cached(
                    "UPDATE peers SET
                        download_volume = ?1,
                        upload_volume = ?2,
                        total_received_volume = ?3,
                        last_download_volume = ?4,
                        last_upload_volume = ?5,
                        last_total_received_volume = ?6,
                        updated_at = ?7
                     WHERE id = ?8",
                )?;
                for update in usage {
                    let u = &update.usage;
                    stmt.execute(params![
                        to_db(u.download_volume),
                        to_db(u.upload_volume),
                        to_db(u.total_received_volume),
                        to_db(u.last_download_volume),
                        to_db(u.last_upload_volume),
                        to_db(u.last_total_received_volume),
                        now,
                        update.peer_id,
                    ])?;
                }
            }

            {
                let mut stmt = tx.prepare_cached(
                    "UPDATE peers SET
                        status = ?1,
                        expire_time = ?2,
                        removal_pending = CASE WHEN ?3 THEN 1 ELSE removal_pending END,
                        updated_at = ?4
                     WHERE id = ?5 AND status = ?6",
                )?;
                for t in transitions {
                    let rows = stmt.execute(params![
                        t.next.to_string(),
                        t.expire_time,
                        t.requires_removal,
                        now,
                        t.peer_id,
                        t.previous.to_string(),
                    ])?;
                    if rows == 0 {
                        // Operator changed the peer since the snapshot was read
                        return Err(Error::InvalidState(format!(
                            "peer {} is no longer {}",
                            t.peer_id, t.previous
                        )));
                    }
                }
            }

            Ok(())
        })
    }

    /// Peers whose removal from the tunnel has not been confirmed yet
    pub fn peers_pending_removal(&self) -> Result<Vec<RemovalTarget>> {
        self.removal_targets("p.removal_pending = 1")
    }

    /// Every peer that must not be on the live tunnel
    pub fn inactive_peers(&self) -> Result<Vec<RemovalTarget>> {
        self.removal_targets("p.status IN ('limited', 'expired', 'disabled')")
    }

    fn removal_targets(&self, condition: &str) -> Result<Vec<RemovalTarget>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT p.id, p.name, i.name, p.public_key, p.status
             FROM peers p JOIN interfaces i ON i.id = p.interface_id
             WHERE {} ORDER BY p.id",
            condition
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(RemovalTarget {
                peer_id: row.get(0)?,
                peer_name: row.get(1)?,
                interface: row.get(2)?,
                public_key: row.get(3)?,
                status: parse_text(row, 4)?,
            })
        })?;

        let mut targets = Vec::new();
        for row in rows {
            targets.push(row?);
        }
        Ok(targets)
    }

    pub fn set_removal_pending(&self, peer_id: i64, pending: bool) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE peers SET removal_pending = ?1 WHERE id = ?2",
            params![pending, peer_id],
        )?;
        Ok(())
    }
}

// ============================================================================
// Connection-level helpers, usable inside an open transaction
// ============================================================================

pub(crate) fn insert_interface(conn: &Connection, iface: &Interface) -> Result<i64> {
    let now = chrono::Utc::now().timestamp();
    conn.execute(
        "INSERT INTO interfaces (name, address, endpoint, listen_port, private_key, public_key, status,
                                 upload_percent, download_percent, save_config, pre_up, post_up,
                                 pre_down, post_down, dns, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            iface.name,
            iface.address,
            iface.endpoint,
            iface.listen_port,
            iface.private_key,
            iface.public_key,
            iface.status.to_string(),
            iface.upload_percent,
            iface.download_percent,
            iface.save_config,
            iface.pre_up,
            iface.post_up,
            iface.pre_down,
            iface.post_down,
            iface.dns,
            now,
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn get_interface(conn: &Connection, id: i64) -> Result<Option<Interface>> {
    let iface = conn
        .query_row(
            &format!("SELECT {} FROM interfaces WHERE id = ?1", INTERFACE_COLUMNS),
            params![id],
            interface_from_row,
        )
        .optional()?;
    Ok(iface)
}

pub(crate) fn insert_peer(conn: &Connection, peer: &Peer) -> Result<i64> {
    let now = chrono::Utc::now().timestamp();
    conn.execute(
        "INSERT INTO peers (interface_id, name, public_key, private_key, preshared_key, allowed_ips,
                            ip_address_id, total_volume, expire_time, on_hold_expire_duration, status,
                            endpoint, endpoint_allowed_ips, dns, mtu, persistent_keepalive,
                            created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            peer.interface_id,
            peer.name,
            peer.public_key,
            peer.private_key,
            peer.preshared_key,
            peer.allowed_ips,
            peer.ip_address_id,
            to_db(peer.total_volume),
            peer.expire_time,
            peer.on_hold_expire_duration,
            peer.status.to_string(),
            peer.endpoint,
            peer.endpoint_allowed_ips,
            peer.dns,
            peer.mtu,
            peer.persistent_keepalive,
            now,
            now,
        ],
    )
    .map_err(|e| unique_violation(e, peer))?;
    Ok(conn.last_insert_rowid())
}

// A concurrent create can slip past the existence checks; the UNIQUE index decides
fn unique_violation(e: rusqlite::Error, peer: &Peer) -> Error {
    match &e {
        rusqlite::Error::SqliteFailure(err, msg)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            if msg.as_deref().is_some_and(|m| m.contains("peers.public_key")) {
                Error::already_exists("peer public key", &peer.public_key)
            } else {
                Error::already_exists("peer", &peer.name)
            }
        }
        _ => e.into(),
    }
}

pub(crate) fn get_peer(conn: &Connection, id: i64) -> Result<Option<Peer>> {
    let peer = conn
        .query_row(
            &format!("SELECT {} FROM peers p WHERE p.id = ?1", PEER_COLUMNS),
            params![id],
            peer_from_row,
        )
        .optional()?;
    Ok(peer)
}

pub(crate) fn delete_peer(conn: &Connection, id: i64) -> Result<bool> {
    let rows = conn.execute("DELETE FROM peers WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}

pub(crate) fn update_peer(conn: &Connection, peer: &Peer) -> Result<()> {
    let rows = conn.execute(
        "UPDATE peers SET
            allowed_ips = ?1, ip_address_id = ?2, total_volume = ?3, expire_time = ?4,
            on_hold_expire_duration = ?5, download_volume = ?6, upload_volume = ?7,
            total_received_volume = ?8, last_download_volume = ?9, last_upload_volume = ?10,
            last_total_received_volume = ?11, status = ?12, removal_pending = ?13, endpoint = ?14,
            endpoint_allowed_ips = ?15, dns = ?16, mtu = ?17, persistent_keepalive = ?18,
            updated_at = ?19
         WHERE id = ?20",
        params![
            peer.allowed_ips,
            peer.ip_address_id,
            to_db(peer.total_volume),
            peer.expire_time,
            peer.on_hold_expire_duration,
            to_db(peer.download_volume),
            to_db(peer.upload_volume),
            to_db(peer.total_received_volume),
            to_db(peer.last_download_volume),
            to_db(peer.last_upload_volume),
            to_db(peer.last_total_received_volume),
            peer.status.to_string(),
            peer.removal_pending,
            peer.endpoint,
            peer.endpoint_allowed_ips,
            peer.dns,
            peer.mtu,
            peer.persistent_keepalive,
            chrono::Utc::now().timestamp(),
            peer.id,
        ],
    )?;
    if rows == 0 {
        return Err(Error::not_found("peer", peer.id));
    }
    Ok(())
}

// ============================================================================
// Row mapping
// ============================================================================

fn interface_from_row(row: &Row<'_>) -> rusqlite::Result<Interface> {
    Ok(Interface {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        endpoint: row.get(3)?,
        listen_port: row.get(4)?,
        private_key: row.get(5)?,
        public_key: row.get(6)?,
        status: parse_text(row, 7)?,
        upload_percent: row.get(8)?,
        download_percent: row.get(9)?,
        save_config: row.get(10)?,
        pre_up: row.get(11)?,
        post_up: row.get(12)?,
        pre_down: row.get(13)?,
        post_down: row.get(14)?,
        dns: row.get(15)?,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

fn peer_from_row(row: &Row<'_>) -> rusqlite::Result<Peer> {
    Ok(Peer {
        id: row.get(0)?,
        interface_id: row.get(1)?,
        name: row.get(2)?,
        public_key: row.get(3)?,
        private_key: row.get(4)?,
        preshared_key: row.get(5)?,
        allowed_ips: row.get(6)?,
        ip_address_id: row.get(7)?,
        total_volume: from_db(row.get(8)?),
        expire_time: row.get(9)?,
        on_hold_expire_duration: row.get(10)?,
        download_volume: from_db(row.get(11)?),
        upload_volume: from_db(row.get(12)?),
        total_received_volume: from_db(row.get(13)?),
        last_download_volume: from_db(row.get(14)?),
        last_upload_volume: from_db(row.get(15)?),
        last_total_received_volume: from_db(row.get(16)?),
        status: parse_text(row, 17)?,
        removal_pending: row.get(18)?,
        endpoint: row.get(19)?,
        endpoint_allowed_ips: row.get(20)?,
        dns: row.get(21)?,
        mtu: row.get(22)?,
        persistent_keepalive: row.get(23)?,
        created_at: row.get(24)?,
        updated_at: row.get(25)?,
    })
}

/// Parse an enum column, rejecting unknown spellings instead of defaulting
fn parse_text<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

pub(crate) fn to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn from_db(value: i64) -> u64 {
    value.max(0) as u64
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_interface(name: &str, cidr: &str) -> Interface {
        Interface {
            id: 0,
            name: name.to_string(),
            address: cidr.to_string(),
            endpoint: "vpn.example.com:51820".to_string(),
            listen_port: 51820,
            private_key: "cHJpdmF0ZQ==".to_string(),
            public_key: format!("{}-pub", name),
            status: InterfaceStatus::Active,
            upload_percent: 1.0,
            download_percent: 1.0,
            save_config: true,
            pre_up: None,
            post_up: None,
            pre_down: None,
            post_down: None,
            dns: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    pub(crate) fn sample_peer(interface_id: i64, name: &str) -> Peer {
        Peer {
            id: 0,
            interface_id,
            name: name.to_string(),
            public_key: format!("{}-pk", name),
            private_key: None,
            preshared_key: "psk".to_string(),
            allowed_ips: "10.8.0.2/32".to_string(),
            ip_address_id: None,
            total_volume: 0,
            expire_time: 0,
            on_hold_expire_duration: 86_400_000,
            download_volume: 0,
            upload_volume: 0,
            total_received_volume: 0,
            last_download_volume: 0,
            last_upload_volume: 0,
            last_total_received_volume: 0,
            status: PeerStatus::OnHold,
            removal_pending: false,
            endpoint: None,
            endpoint_allowed_ips: "0.0.0.0/0".to_string(),
            dns: None,
            mtu: Some(1420),
            persistent_keepalive: Some(21),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_interface_and_peer_crud() {
        let db = Database::open_memory().unwrap();
        let iface_id = db
            .with_connection(|conn| insert_interface(conn, &sample_interface("wg0", "10.8.0.1/24")))
            .unwrap();

        let iface = db.get_interface_by_name("wg0").unwrap().unwrap();
        assert_eq!(iface.id, iface_id);
        assert_eq!(iface.status, InterfaceStatus::Active);

        let peer_id = db
            .with_connection(|conn| insert_peer(conn, &sample_peer(iface_id, "alice")))
            .unwrap();
        let mut peer = db.get_peer(peer_id).unwrap().unwrap();
        assert_eq!(peer.status, PeerStatus::OnHold);
        assert_eq!(peer.mtu, Some(1420));

        peer.status = PeerStatus::Active;
        peer.total_volume = 5_000;
        db.update_peer(&peer).unwrap();

        let fetched = db.get_peer_by_public_key("alice-pk").unwrap().unwrap();
        assert_eq!(fetched.status, PeerStatus::Active);
        assert_eq!(fetched.total_volume, 5_000);
        assert_eq!(db.count_peers(iface_id).unwrap(), 1);

        assert!(db.delete_peer(peer_id).unwrap());
        assert!(db.get_peer_by_name("alice").unwrap().is_none());
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let db = Database::open_memory().unwrap();
        let iface_id = db
            .with_connection(|conn| insert_interface(conn, &sample_interface("wg0", "10.8.0.1/24")))
            .unwrap();
        let peer_id = db
            .with_connection(|conn| insert_peer(conn, &sample_peer(iface_id, "alice")))
            .unwrap();

        // The CHECK constraint keeps foreign spellings out entirely
        let result = db.with_connection(|conn| {
            conn.execute(
                "UPDATE peers SET status = 'Active' WHERE id = ?1",
                params![peer_id],
            )?;
            Ok(())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_filter_peers_paging() {
        let db = Database::open_memory().unwrap();
        let wg0 = db
            .with_connection(|conn| insert_interface(conn, &sample_interface("wg0", "10.8.0.1/24")))
            .unwrap();
        let wg1 = db
            .with_connection(|conn| insert_interface(conn, &sample_interface("wg1", "10.9.0.1/24")))
            .unwrap();
        for i in 0..5 {
            db.with_connection(|conn| insert_peer(conn, &sample_peer(wg0, &format!("a{}", i))))
                .unwrap();
        }
        db.with_connection(|conn| insert_peer(conn, &sample_peer(wg1, "b0")))
            .unwrap();

        let page = db
            .filter_peers(&PeerFilter {
                interface: Some("wg0".to_string()),
                skip: 1,
                take: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.peers.len(), 2);
        assert_eq!(page.peers[0].name, "a1");

        let all = db.filter_peers(&PeerFilter::default()).unwrap();
        assert_eq!(all.total, 6);
        assert_eq!(all.peers.len(), 6);
    }

    #[test]
    fn test_duplicate_peer_insert_is_already_exists() {
        let db = Database::open_memory().unwrap();
        let iface_id = db
            .with_connection(|conn| insert_interface(conn, &sample_interface("wg0", "10.8.0.1/24")))
            .unwrap();
        db.with_connection(|conn| insert_peer(conn, &sample_peer(iface_id, "alice")))
            .unwrap();

        let mut same_name = sample_peer(iface_id, "alice");
        same_name.public_key = "other-pk".to_string();
        let err = db
            .with_connection(|conn| insert_peer(conn, &same_name))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { ref kind, ref id } if kind == "peer" && id == "alice"));

        let mut same_key = sample_peer(iface_id, "bob");
        same_key.public_key = "alice-pk".to_string();
        let err = db
            .with_connection(|conn| insert_peer(conn, &same_key))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { ref kind, .. } if kind == "peer public key"));
    }

    #[test]
    fn test_accounting_batch_rolls_back_on_stale_status() {
        let db = Database::open_memory().unwrap();
        let iface_id = db
            .with_connection(|conn| insert_interface(conn, &sample_interface("wg0", "10.8.0.1/24")))
            .unwrap();
        let alice = db
            .with_connection(|conn| insert_peer(conn, &sample_peer(iface_id, "alice")))
            .unwrap();
        let bob = db
            .with_connection(|conn| insert_peer(conn, &sample_peer(iface_id, "bob")))
            .unwrap();

        let usage = [UsageUpdate {
            peer_id: alice,
            usage: PeerUsage {
                total_received_volume: 99,
                last_total_received_volume: 99,
                ..Default::default()
            },
        }];
        // bob is still OnHold, so the second transition no longer applies
        let transitions = [
            Transition {
                peer_id: alice,
                previous: PeerStatus::OnHold,
                next: PeerStatus::Active,
                expire_time: 1_000,
                requires_removal: false,
            },
            Transition {
                peer_id: bob,
                previous: PeerStatus::Active,
                next: PeerStatus::Limited,
                expire_time: 0,
                requires_removal: true,
            },
        ];

        let err = db.apply_accounting_batch(&usage, &transitions).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        let alice = db.get_peer(alice).unwrap().unwrap();
        assert_eq!(alice.total_received_volume, 0);
        assert_eq!(alice.status, PeerStatus::OnHold);
        let bob = db.get_peer(bob).unwrap().unwrap();
        assert_eq!(bob.status, PeerStatus::OnHold);
        assert!(!bob.removal_pending);
        assert!(db.peers_pending_removal().unwrap().is_empty());
    }

    #[test]
    fn test_delete_interface_restricted_by_peers() {
        let db = Database::open_memory().unwrap();
        let iface_id = db
            .with_connection(|conn| insert_interface(conn, &sample_interface("wg0", "10.8.0.1/24")))
            .unwrap();
        db.with_connection(|conn| insert_peer(conn, &sample_peer(iface_id, "alice")))
            .unwrap();

        assert!(db.delete_interface(iface_id).is_err());
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let db = Database::open(&path).unwrap();
            db.with_connection(|conn| insert_interface(conn, &sample_interface("wg0", "10.8.0.1/24")))
                .unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.list_interfaces().unwrap().len(), 1);
    }
}
