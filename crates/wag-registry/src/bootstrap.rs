//! First-start seeding and legacy database migration.
//!
//! Boot order: migrate the legacy embedded SQL database (one shot, marker
//! guarded, backup first), seed ACLs/groups/settings from the on-disk
//! config with put-if-absent writes (later restarts ignore the file), and
//! repair any device reference keys left behind by an interrupted
//! multi-phase delete.

use std::path::Path;
use std::path::PathBuf;

use chrono::Local;
use rusqlite::Connection;
use thiserror::Error;
use tracing::info;
use tracing::warn;
use wag_core::entities::ADMIN_LOCKOUT_ATTEMPTS;
use wag_core::keys;
use wag_core::Config;
use wag_core::Device;
use wag_core::MfaType;
use wag_store::Compare;
use wag_store::Op;
use wag_store::SortOrder;
use wag_store::Txn;

use crate::encode;
use crate::Registry;
use crate::RegistryError;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),

    #[error("unable to back up legacy database: {0}")]
    Backup(#[from] std::io::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("migration task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Schema the legacy database is brought up to before reading.
const LEGACY_MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS Devices (
        address TEXT PRIMARY KEY,
        username TEXT NOT NULL,
        publickey TEXT NOT NULL,
        preshared_key TEXT NOT NULL DEFAULT '',
        endpoint TEXT,
        attempts INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS Users (
        username TEXT PRIMARY KEY,
        mfa TEXT NOT NULL DEFAULT '',
        mfa_type TEXT NOT NULL DEFAULT 'unset',
        locked INTEGER NOT NULL DEFAULT 0,
        enforcing INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS AdminUsers (
        username TEXT PRIMARY KEY,
        passwd_hash TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS RegistrationTokens (
        token TEXT PRIMARY KEY,
        username TEXT NOT NULL,
        overwrites TEXT,
        groups TEXT,
        uses INTEGER NOT NULL DEFAULT 1
    )",
];

#[derive(Debug, Default)]
struct LegacyData {
    devices: Vec<LegacyDevice>,
    users: Vec<LegacyUser>,
    admins: Vec<LegacyAdmin>,
    tokens: Vec<LegacyToken>,
}

#[derive(Debug)]
struct LegacyDevice {
    address: String,
    username: String,
    public_key: String,
    preshared_key: String,
}

#[derive(Debug)]
struct LegacyUser {
    username: String,
    mfa: String,
    mfa_type: MfaType,
    locked: bool,
    enforcing: bool,
}

#[derive(Debug)]
struct LegacyAdmin {
    username: String,
    hash: String,
    attempts: u32,
}

#[derive(Debug)]
struct LegacyToken {
    token: String,
    username: String,
    overwrites: Option<String>,
    groups: Vec<String>,
    uses: u32,
}

fn is_in_memory(path: &str) -> bool {
    path.starts_with("file::memory:") || path.contains("mode=memory")
}

/// Whether the database needs any migration applied.
fn pending_migrations(conn: &Connection) -> Result<bool, rusqlite::Error> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok((version as usize) < LEGACY_MIGRATIONS.len())
}

fn run_migrations(conn: &Connection) -> Result<(), rusqlite::Error> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    for (index, statement) in LEGACY_MIGRATIONS.iter().enumerate() {
        if (index as i64) < version {
            continue;
        }
        conn.execute(statement, [])?;
    }
    conn.execute_batch(&format!("PRAGMA user_version = {}", LEGACY_MIGRATIONS.len()))?;
    Ok(())
}

fn parse_mfa_type(value: &str) -> MfaType {
    match value {
        "totp" => MfaType::Totp,
        "webauthn" => MfaType::Webauthn,
        "oidc" => MfaType::Oidc,
        "pam" => MfaType::Pam,
        _ => MfaType::Unset,
    }
}

/// Open, back up, migrate, and read the legacy database.
fn load_legacy(path: &Path) -> Result<LegacyData, BootstrapError> {
    let display = path.to_string_lossy().to_string();
    let conn = Connection::open(path)?;

    if pending_migrations(&conn)? && !is_in_memory(&display) {
        let backup: PathBuf = PathBuf::from(format!("{display}.{}.bak", Local::now().format("%Y%m%d%H%M%S")));
        info!(backup = %backup.display(), "migrations pending, backing up legacy database");
        std::fs::copy(path, &backup)?;
    }
    run_migrations(&conn)?;

    let mut data = LegacyData::default();

    let mut statement = conn.prepare("SELECT address, username, publickey, preshared_key FROM Devices")?;
    let rows = statement.query_map([], |row| {
        Ok(LegacyDevice {
            address: row.get(0)?,
            username: row.get(1)?,
            public_key: row.get(2)?,
            preshared_key: row.get(3)?,
        })
    })?;
    for row in rows {
        data.devices.push(row?);
    }

    let mut statement = conn.prepare("SELECT username, mfa, mfa_type, locked, enforcing FROM Users")?;
    let rows = statement.query_map([], |row| {
        Ok(LegacyUser {
            username: row.get(0)?,
            mfa: row.get(1)?,
            mfa_type: parse_mfa_type(&row.get::<_, String>(2)?),
            locked: row.get(3)?,
            enforcing: row.get(4)?,
        })
    })?;
    for row in rows {
        data.users.push(row?);
    }

    let mut statement = conn.prepare("SELECT username, passwd_hash, attempts FROM AdminUsers")?;
    let rows = statement.query_map([], |row| {
        Ok(LegacyAdmin {
            username: row.get(0)?,
            hash: row.get(1)?,
            attempts: row.get(2)?,
        })
    })?;
    for row in rows {
        data.admins.push(row?);
    }

    let mut statement = conn.prepare("SELECT token, username, overwrites, groups, uses FROM RegistrationTokens")?;
    let rows = statement.query_map([], |row| {
        let groups: Option<String> = row.get(3)?;
        Ok(LegacyToken {
            token: row.get(0)?,
            username: row.get(1)?,
            overwrites: row.get(2)?,
            groups: groups
                .unwrap_or_default()
                .split(',')
                .filter(|g| !g.is_empty())
                .map(str::to_string)
                .collect(),
            uses: row.get(4)?,
        })
    })?;
    for row in rows {
        data.tokens.push(row?);
    }

    Ok(data)
}

impl Registry {
    /// One-shot import from the legacy embedded SQL database.
    ///
    /// A marker key makes this a no-op on every boot after the first.
    pub async fn migrate_legacy_sql(&self, path: &Path) -> Result<(), BootstrapError> {
        if self.store().get(keys::MIGRATED_SQL_KEY).await.map_err(RegistryError::from)?.is_some() {
            return Ok(());
        }

        info!(path = %path.display(), "importing legacy database");
        let owned = path.to_path_buf();
        let data = tokio::task::spawn_blocking(move || load_legacy(&owned)).await??;

        for device in &data.devices {
            match self
                .add_device(&device.username, &device.address, &device.public_key, &device.preshared_key)
                .await
            {
                Ok(_) | Err(RegistryError::AlreadyExists { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        info!(count = data.devices.len(), "imported devices");

        for admin in &data.admins {
            match self.create_admin_user(&admin.username, &admin.hash).await {
                Ok(_) | Err(RegistryError::AlreadyExists { .. }) => {}
                Err(err) => return Err(err.into()),
            }
            if admin.attempts > ADMIN_LOCKOUT_ATTEMPTS {
                self.set_admin_lock(&admin.username).await?;
            }
        }
        info!(count = data.admins.len(), "imported admin users");

        for user in &data.users {
            match self.create_user(&user.username).await {
                Ok(_) | Err(RegistryError::AlreadyExists { .. }) => {}
                Err(err) => return Err(err.into()),
            }
            if user.locked {
                self.set_user_lock(&user.username).await?;
            }
            self.set_user_mfa(&user.username, &user.mfa, user.mfa_type).await?;
            if user.enforcing {
                self.set_enforce_mfa_on(&user.username).await?;
            } else {
                self.set_enforce_mfa_off(&user.username).await?;
            }
        }
        info!(count = data.users.len(), "imported users");

        for token in &data.tokens {
            match self
                .add_registration_token(
                    &token.token,
                    &token.username,
                    token.overwrites.clone(),
                    token.groups.clone(),
                    token.uses.max(1),
                )
                .await
            {
                Ok(_) | Err(RegistryError::AlreadyExists { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        info!(count = data.tokens.len(), "imported registration tokens");

        self.store()
            .put(keys::MIGRATED_SQL_KEY, "\"done!\"")
            .await
            .map_err(RegistryError::from)?;
        Ok(())
    }

    /// Seed ACLs, groups, and settings from the config file.
    ///
    /// Everything writes with put-if-absent semantics: the file only
    /// matters on a node's first run, afterwards the store owns the data.
    pub async fn seed_from_config(&self, config: &Config) -> Result<(), RegistryError> {
        if self.store().list(keys::ACLS_PREFIX, SortOrder::Ascending).await?.is_empty() {
            info!("no acls in store, importing from config file (the file is ignored from now on)");
            for (name, acl) in &config.acls.policies {
                self.set_acl(name, acl.clone()).await?;
            }
        }

        if self.store().list(keys::GROUPS_PREFIX, SortOrder::Ascending).await?.is_empty() {
            info!("no groups in store, importing from config file (the file is ignored from now on)");
            for (name, members) in &config.acls.groups {
                self.set_group(name, members.clone()).await?;
            }
        }

        self.put_if_absent(keys::FULL_CONFIG_KEY, &encode(config), "full config").await?;
        self.put_if_absent(keys::HELP_MAIL_KEY, &encode(&config.help_mail), "help mail").await?;
        self.put_if_absent(keys::EXTERNAL_ADDRESS_KEY, &encode(&config.external_address), "external address")
            .await?;
        self.put_if_absent(keys::DNS_KEY, &encode(&config.dns), "dns").await?;
        self.put_if_absent(
            keys::INACTIVITY_TIMEOUT_KEY,
            &encode(&config.session_inactivity_timeout_minutes),
            "inactivity timeout",
        )
        .await?;
        self.put_if_absent(
            keys::SESSION_LIFETIME_KEY,
            &encode(&config.max_session_lifetime_minutes),
            "max session lifetime",
        )
        .await?;
        self.put_if_absent(keys::LOCKOUT_KEY, &encode(&config.lockout), "lockout").await?;
        self.put_if_absent(keys::ISSUER_KEY, &encode(&config.authenticators.issuer), "issuer").await?;
        self.put_if_absent(keys::DOMAIN_KEY, &encode(&config.authenticators.domain_url), "domain url").await?;
        self.put_if_absent(
            keys::WG_FILENAME_KEY,
            &encode(&config.download_config_file_name),
            "wireguard config filename",
        )
        .await?;
        self.put_if_absent(keys::CHECK_UPDATES_KEY, &encode(&config.check_updates), "update checking").await?;
        self.put_if_absent(
            keys::DEFAULT_MFA_METHOD_KEY,
            &encode(&config.authenticators.default_method),
            "default mfa method",
        )
        .await?;
        self.put_if_absent(keys::MFA_METHODS_KEY, &encode(&config.authenticators.methods), "mfa methods").await?;
        self.put_if_absent(keys::OIDC_DETAILS_KEY, &encode(&config.authenticators.oidc), "oidc settings").await?;
        self.put_if_absent(keys::PAM_DETAILS_KEY, &encode(&config.authenticators.pam), "pam settings").await?;

        Ok(())
    }

    /// Re-derive device reference keys from the primaries.
    ///
    /// Run at startup: republishes references lost to an interrupted key
    /// rotation and removes references whose primary is gone (crash
    /// between the two phases of a cascade delete).
    pub async fn repair_device_refs(&self) -> Result<(), RegistryError> {
        let primaries = self.store().list(keys::DEVICES_PREFIX, SortOrder::Ascending).await?;
        let mut ops = Vec::new();

        let mut expected: std::collections::BTreeMap<String, String> = std::collections::BTreeMap::new();
        for entry in &primaries {
            let device: Device = crate::decode(&entry.key, &entry.value)?;
            expected.insert(keys::device_ref(&device.address), entry.key.clone());
            expected.insert(keys::device_ref(&device.public_key), entry.key.clone());
        }

        let references = self.store().list(keys::DEVICE_REF_PREFIX, SortOrder::Ascending).await?;
        let mut present: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
        for reference in &references {
            match expected.get(&reference.key) {
                Some(primary) if *primary == reference.value => {
                    present.insert(reference.key.clone());
                }
                Some(primary) => {
                    // Points at the wrong primary; rewrite below.
                    warn!(reference = %reference.key, "device reference points at the wrong primary");
                    ops.push(Op::Put {
                        key: reference.key.clone(),
                        value: primary.clone(),
                    });
                    present.insert(reference.key.clone());
                }
                None => {
                    warn!(reference = %reference.key, "removing orphan device reference");
                    ops.push(Op::Delete {
                        key: reference.key.clone(),
                    });
                }
            }
        }

        for (reference, primary) in &expected {
            if !present.contains(reference) {
                warn!(reference = %reference, "republishing missing device reference");
                ops.push(Op::Put {
                    key: reference.clone(),
                    value: primary.clone(),
                });
            }
        }

        if !ops.is_empty() {
            self.store()
                .txn(Txn {
                    compares: vec![],
                    then_ops: ops,
                    else_ops: vec![],
                })
                .await?;
        }
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str, what: &str) -> Result<(), RegistryError> {
        let outcome = self
            .store()
            .txn(Txn {
                compares: vec![Compare::KeyMissing { key: key.to_string() }],
                then_ops: vec![Op::Put {
                    key: key.to_string(),
                    value: value.to_string(),
                }],
                else_ops: vec![],
            })
            .await?;
        if outcome.succeeded {
            info!(setting = what, "seeded from config file");
        }
        Ok(())
    }
}
