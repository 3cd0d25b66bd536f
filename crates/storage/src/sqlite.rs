use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};

use entitlement_core::{
    catalog::ProductCategory,
    clock::{from_millis, to_millis},
    events::{EntitlementEvent, EventPayload},
    ids::*,
    model::{Subscription, SubscriptionBundle},
    timeline,
};

use crate::error::StorageError;
use crate::traits::{BundleImage, RepairCommit, RepairRecord, Storage};

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

const BUNDLE_COLUMNS: &str = "bundle_id, bundle_key, account_id, start_date, last_system_update_time";
const SUBSCRIPTION_COLUMNS: &str = "subscription_id, bundle_id, category, start_date, bundle_start_date, align_start_date, charged_through_date, active_version";
const EVENT_COLUMNS: &str = "total_ordering, event_id, subscription_id, effective_date, processed_date, requested_date, payload, active_version, created_by";

fn read_bundle(row: &rusqlite::Row) -> Result<SubscriptionBundle, StorageError> {
    let bundle_id_bytes: Vec<u8> = row.get(0)?;
    let key: String = row.get(1)?;
    let account_id_bytes: Vec<u8> = row.get(2)?;
    let start_date: i64 = row.get(3)?;
    let updated: i64 = row.get(4)?;

    Ok(SubscriptionBundle {
        bundle_id: BundleId::from_bytes(to_array::<16>(bundle_id_bytes, "bundle_id")?),
        key,
        account_id: AccountId::from_bytes(to_array::<16>(account_id_bytes, "account_id")?),
        start_date: from_millis(start_date)?,
        last_system_update_time: from_millis(updated)?,
    })
}

fn read_subscription(row: &rusqlite::Row) -> Result<Subscription, StorageError> {
    let subscription_id_bytes: Vec<u8> = row.get(0)?;
    let bundle_id_bytes: Vec<u8> = row.get(1)?;
    let category: String = row.get(2)?;
    let start_date: i64 = row.get(3)?;
    let bundle_start_date: i64 = row.get(4)?;
    let align_start_date: i64 = row.get(5)?;
    let charged_through_date: Option<i64> = row.get(6)?;
    let active_version: u32 = row.get(7)?;

    Ok(Subscription {
        subscription_id: SubscriptionId::from_bytes(to_array::<16>(
            subscription_id_bytes,
            "subscription_id",
        )?),
        bundle_id: BundleId::from_bytes(to_array::<16>(bundle_id_bytes, "bundle_id")?),
        category: ProductCategory::parse(&category)?,
        start_date: from_millis(start_date)?,
        bundle_start_date: from_millis(bundle_start_date)?,
        align_start_date: from_millis(align_start_date)?,
        charged_through_date: charged_through_date.map(from_millis).transpose()?,
        active_version,
        events: Vec::new(),
    })
}

fn read_event(row: &rusqlite::Row) -> Result<EntitlementEvent, StorageError> {
    let total_ordering: i64 = row.get(0)?;
    let event_id_bytes: Vec<u8> = row.get(1)?;
    let subscription_id_bytes: Vec<u8> = row.get(2)?;
    let effective_date: i64 = row.get(3)?;
    let processed_date: i64 = row.get(4)?;
    let requested_date: i64 = row.get(5)?;
    let payload_bytes: Vec<u8> = row.get(6)?;
    let active_version: u32 = row.get(7)?;
    let created_by: String = row.get(8)?;

    Ok(EntitlementEvent {
        event_id: EventId::from_bytes(to_array::<16>(event_id_bytes, "event_id")?),
        subscription_id: SubscriptionId::from_bytes(to_array::<16>(
            subscription_id_bytes,
            "subscription_id",
        )?),
        effective_date: from_millis(effective_date)?,
        processed_date: from_millis(processed_date)?,
        requested_date: from_millis(requested_date)?,
        payload: EventPayload::from_msgpack(&payload_bytes)?,
        active_version,
        total_ordering: total_ordering as u64,
        from_disk: true,
        created_by,
    })
}

fn read_repair(row: &rusqlite::Row) -> Result<RepairRecord, StorageError> {
    let repair_id: i64 = row.get(0)?;
    let bundle_id_bytes: Vec<u8> = row.get(1)?;
    let subscriptions_bytes: Vec<u8> = row.get(2)?;
    let event_count: u32 = row.get(3)?;
    let checksum_bytes: Vec<u8> = row.get(4)?;
    let created_by: String = row.get(5)?;
    let created_at: i64 = row.get(6)?;

    let subscriptions: Vec<SubscriptionId> = rmp_serde::from_slice(&subscriptions_bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(RepairRecord {
        repair_id,
        bundle_id: BundleId::from_bytes(to_array::<16>(bundle_id_bytes, "bundle_id")?),
        subscriptions,
        event_count,
        checksum: to_array::<32>(checksum_bytes, "checksum")?,
        created_by,
        created_at: from_millis(created_at)?,
    })
}

/// Tunnel a StorageError through a rusqlite row-mapping closure.
fn tunnel(e: StorageError) -> rusqlite::Error {
    match e {
        StorageError::Sqlite(sq) => sq,
        other => rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Blob,
            Box::new(OpaqueStorageError(other.to_string())),
        ),
    }
}

fn load_bundle(conn: &Connection, bundle_id: BundleId) -> Result<Option<SubscriptionBundle>, StorageError> {
    let bundle = conn
        .query_row(
            &format!("SELECT {BUNDLE_COLUMNS} FROM bundles WHERE bundle_id = ?1"),
            rusqlite::params![bundle_id.as_bytes().as_slice()],
            |row| read_bundle(row).map_err(tunnel),
        )
        .optional()?;
    Ok(bundle)
}

fn load_events(
    conn: &Connection,
    subscription_id: SubscriptionId,
    version: u32,
) -> Result<Vec<EntitlementEvent>, StorageError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLUMNS} FROM events WHERE subscription_id = ?1 AND active_version = ?2 ORDER BY effective_date, total_ordering"
    ))?;
    let events = stmt
        .query_map(
            rusqlite::params![subscription_id.as_bytes().as_slice(), version],
            |row| read_event(row).map_err(tunnel),
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(events)
}

fn with_events(conn: &Connection, mut subscription: Subscription) -> Result<Subscription, StorageError> {
    subscription.events = load_events(conn, subscription.subscription_id, subscription.active_version)?;
    Ok(subscription)
}

fn load_subscription(
    conn: &Connection,
    subscription_id: SubscriptionId,
) -> Result<Option<Subscription>, StorageError> {
    let row = conn
        .query_row(
            &format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE subscription_id = ?1"),
            rusqlite::params![subscription_id.as_bytes().as_slice()],
            |row| read_subscription(row).map_err(tunnel),
        )
        .optional()?;
    row.map(|s| with_events(conn, s)).transpose()
}

fn load_bundle_subscriptions(conn: &Connection, bundle_id: BundleId) -> Result<Vec<Subscription>, StorageError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE bundle_id = ?1
         ORDER BY CASE category WHEN 'ADD_ON' THEN 1 ELSE 0 END, start_date, subscription_id"
    ))?;
    let rows = stmt
        .query_map(rusqlite::params![bundle_id.as_bytes().as_slice()], |row| {
            read_subscription(row).map_err(tunnel)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(|s| with_events(conn, s)).collect()
}

fn compute_view(conn: &Connection, bundle_id: BundleId) -> Result<String, StorageError> {
    let bundle = load_bundle(conn, bundle_id)?
        .ok_or_else(|| StorageError::NotFound(format!("bundle {bundle_id}")))?;
    let max_ordering: i64 = conn.query_row(
        "SELECT COALESCE(MAX(e.total_ordering), 0) FROM events e
         JOIN subscriptions s ON e.subscription_id = s.subscription_id AND e.active_version = s.active_version
         WHERE s.bundle_id = ?1",
        rusqlite::params![bundle_id.as_bytes().as_slice()],
        |row| row.get(0),
    )?;
    Ok(timeline::view_id(max_ordering as u64, bundle.last_system_update_time))
}

fn insert_bundle(conn: &Connection, bundle: &SubscriptionBundle) -> Result<(), StorageError> {
    let result = conn.execute(
        &format!("INSERT INTO bundles ({BUNDLE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
        rusqlite::params![
            bundle.bundle_id.as_bytes().as_slice(),
            bundle.key,
            bundle.account_id.as_bytes().as_slice(),
            to_millis(&bundle.start_date),
            to_millis(&bundle.last_system_update_time),
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(StorageError::DuplicateBundleKey {
                account_id: bundle.account_id.to_string(),
                key: bundle.key.clone(),
            })
        }
        Err(e) => Err(StorageError::Sqlite(e)),
    }
}

fn insert_subscription(conn: &Connection, subscription: &Subscription, version: u32) -> Result<(), StorageError> {
    conn.execute(
        &format!("INSERT INTO subscriptions ({SUBSCRIPTION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
        rusqlite::params![
            subscription.subscription_id.as_bytes().as_slice(),
            subscription.bundle_id.as_bytes().as_slice(),
            subscription.category.as_str(),
            to_millis(&subscription.start_date),
            to_millis(&subscription.bundle_start_date),
            to_millis(&subscription.align_start_date),
            subscription.charged_through_date.as_ref().map(to_millis),
            version,
        ],
    )?;
    Ok(())
}

/// Insert one event at `version`, returning the persisted copy with its
/// storage-assigned ordering.
fn insert_event(
    conn: &Connection,
    event: &EntitlementEvent,
    version: u32,
) -> Result<EntitlementEvent, StorageError> {
    conn.execute(
        "INSERT INTO events (event_id, subscription_id, event_type, effective_date, processed_date, requested_date, payload, active_version, created_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        rusqlite::params![
            event.event_id.as_bytes().as_slice(),
            event.subscription_id.as_bytes().as_slice(),
            event.event_type().as_str(),
            to_millis(&event.effective_date),
            to_millis(&event.processed_date),
            to_millis(&event.requested_date),
            event.payload.to_msgpack()?,
            version,
            event.created_by,
        ],
    )?;
    let mut stored = event.clone();
    stored.total_ordering = conn.last_insert_rowid() as u64;
    stored.active_version = version;
    stored.from_disk = true;
    Ok(stored)
}

fn active_version(
    conn: &Connection,
    subscription_id: SubscriptionId,
) -> Result<(BundleId, u32), StorageError> {
    let row: Option<(Vec<u8>, u32)> = conn
        .query_row(
            "SELECT bundle_id, active_version FROM subscriptions WHERE subscription_id = ?1",
            rusqlite::params![subscription_id.as_bytes().as_slice()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let (bundle_bytes, version) =
        row.ok_or_else(|| StorageError::NotFound(format!("subscription {subscription_id}")))?;
    Ok((BundleId::from_bytes(to_array::<16>(bundle_bytes, "bundle_id")?), version))
}

fn touch_bundle(conn: &Connection, bundle_id: BundleId, now: DateTime<Utc>) -> Result<(), StorageError> {
    let updated = conn.execute(
        "UPDATE bundles SET last_system_update_time = ?1 WHERE bundle_id = ?2",
        rusqlite::params![to_millis(&now), bundle_id.as_bytes().as_slice()],
    )?;
    if updated == 0 {
        return Err(StorageError::NotFound(format!("bundle {bundle_id}")));
    }
    Ok(())
}

/// Appends at each subscription's current version. Every event must belong
/// to a subscription of `bundle_id`.
fn append_in(
    conn: &Connection,
    bundle_id: BundleId,
    events: &[EntitlementEvent],
) -> Result<Vec<EntitlementEvent>, StorageError> {
    let mut stored = Vec::with_capacity(events.len());
    for event in events {
        let (owner, version) = active_version(conn, event.subscription_id)?;
        if owner != bundle_id {
            return Err(StorageError::ConstraintViolation(format!(
                "subscription {} does not belong to bundle {bundle_id}",
                event.subscription_id
            )));
        }
        stored.push(insert_event(conn, event, version)?);
    }
    Ok(stored)
}

fn events_checksum(commit: &RepairCommit) -> Result<([u8; 32], u32), StorageError> {
    let mut hasher = blake3::Hasher::new();
    let mut count = 0u32;
    for sub in &commit.subscriptions {
        hasher.update(sub.subscription_id.as_bytes());
        for event in &sub.events {
            hasher.update(event.event_id.as_bytes());
            hasher.update(&to_millis(&event.effective_date).to_be_bytes());
            hasher.update(&event.payload.to_msgpack()?);
            count += 1;
        }
    }
    Ok((*hasher.finalize().as_bytes(), count))
}

impl Storage for SqliteStorage {
    fn create_bundle(&mut self, bundle: &SubscriptionBundle) -> Result<(), StorageError> {
        insert_bundle(&self.conn, bundle)
    }

    fn get_bundle(&self, bundle_id: BundleId) -> Result<Option<SubscriptionBundle>, StorageError> {
        load_bundle(&self.conn, bundle_id)
    }

    fn get_bundle_by_key(
        &self,
        account_id: AccountId,
        key: &str,
    ) -> Result<Option<SubscriptionBundle>, StorageError> {
        let bundle = self
            .conn
            .query_row(
                &format!("SELECT {BUNDLE_COLUMNS} FROM bundles WHERE account_id = ?1 AND bundle_key = ?2"),
                rusqlite::params![account_id.as_bytes().as_slice(), key],
                |row| read_bundle(row).map_err(tunnel),
            )
            .optional()?;
        Ok(bundle)
    }

    fn get_bundles_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<SubscriptionBundle>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {BUNDLE_COLUMNS} FROM bundles WHERE account_id = ?1 ORDER BY start_date, bundle_key"
        ))?;
        let bundles = stmt
            .query_map(rusqlite::params![account_id.as_bytes().as_slice()], |row| {
                read_bundle(row).map_err(tunnel)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(bundles)
    }

    fn create_subscription(
        &mut self,
        subscription: &Subscription,
        now: DateTime<Utc>,
    ) -> Result<Subscription, StorageError> {
        let tx = self.conn.transaction()?;
        insert_subscription(&tx, subscription, 1)?;
        for event in &subscription.events {
            insert_event(&tx, event, 1)?;
        }
        touch_bundle(&tx, subscription.bundle_id, now)?;
        let stored = load_subscription(&tx, subscription.subscription_id)?.ok_or_else(|| {
            StorageError::NotFound(format!("subscription {}", subscription.subscription_id))
        })?;
        tx.commit()?;
        Ok(stored)
    }

    fn get_subscription(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<Option<Subscription>, StorageError> {
        load_subscription(&self.conn, subscription_id)
    }

    fn load_subscriptions(&self, bundle_id: BundleId) -> Result<Vec<Subscription>, StorageError> {
        load_bundle_subscriptions(&self.conn, bundle_id)
    }

    fn append_events(
        &mut self,
        subscription_id: SubscriptionId,
        events: &[EntitlementEvent],
        now: DateTime<Utc>,
    ) -> Result<Vec<EntitlementEvent>, StorageError> {
        if let Some(stray) = events.iter().find(|e| e.subscription_id != subscription_id) {
            return Err(StorageError::ConstraintViolation(format!(
                "event {} targets subscription {}, not {subscription_id}",
                stray.event_id, stray.subscription_id
            )));
        }
        let (bundle_id, _) = active_version(&self.conn, subscription_id)?;
        self.append_bundle_events(bundle_id, events, now)
    }

    fn append_bundle_events(
        &mut self,
        bundle_id: BundleId,
        events: &[EntitlementEvent],
        now: DateTime<Utc>,
    ) -> Result<Vec<EntitlementEvent>, StorageError> {
        let tx = self.conn.transaction()?;
        let stored = append_in(&tx, bundle_id, events)?;
        touch_bundle(&tx, bundle_id, now)?;
        tx.commit()?;
        Ok(stored)
    }

    fn set_charged_through_date(
        &mut self,
        subscription_id: SubscriptionId,
        date: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        let updated = self.conn.execute(
            "UPDATE subscriptions SET charged_through_date = ?1 WHERE subscription_id = ?2",
            rusqlite::params![date.as_ref().map(to_millis), subscription_id.as_bytes().as_slice()],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound(format!("subscription {subscription_id}")));
        }
        Ok(())
    }

    fn view_token(&self, bundle_id: BundleId) -> Result<String, StorageError> {
        compute_view(&self.conn, bundle_id)
    }

    fn commit_repair(
        &mut self,
        commit: &RepairCommit,
        now: DateTime<Utc>,
    ) -> Result<RepairRecord, StorageError> {
        let (checksum, event_count) = events_checksum(commit)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Compare-and-swap: the view is re-read under the write lock.
        let current = compute_view(&tx, commit.bundle_id)?;
        if current != commit.expected_view {
            return Err(StorageError::ViewChanged {
                bundle_id: commit.bundle_id.to_string(),
                expected: commit.expected_view.clone(),
                current,
            });
        }

        for sub in &commit.subscriptions {
            let (owner, version) = active_version(&tx, sub.subscription_id)?;
            if owner != commit.bundle_id {
                return Err(StorageError::ConstraintViolation(format!(
                    "subscription {} does not belong to bundle {}",
                    sub.subscription_id, commit.bundle_id
                )));
            }
            let next = version + 1;
            for event in &sub.events {
                insert_event(&tx, event, next)?;
            }
            tx.execute(
                "UPDATE subscriptions SET active_version = ?1, start_date = ?2, bundle_start_date = ?3, align_start_date = ?4
                 WHERE subscription_id = ?5",
                rusqlite::params![
                    next,
                    to_millis(&sub.start_date),
                    to_millis(&sub.bundle_start_date),
                    to_millis(&sub.align_start_date),
                    sub.subscription_id.as_bytes().as_slice(),
                ],
            )?;
        }

        if let Some(start) = commit.bundle_start_date {
            tx.execute(
                "UPDATE bundles SET start_date = ?1 WHERE bundle_id = ?2",
                rusqlite::params![to_millis(&start), commit.bundle_id.as_bytes().as_slice()],
            )?;
        }
        touch_bundle(&tx, commit.bundle_id, now)?;

        let touched: Vec<SubscriptionId> = commit.subscriptions.iter().map(|s| s.subscription_id).collect();
        let touched_bytes =
            rmp_serde::to_vec(&touched).map_err(|e| StorageError::Serialization(e.to_string()))?;
        tx.execute(
            "INSERT INTO repairs (bundle_id, subscriptions, event_count, checksum, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                commit.bundle_id.as_bytes().as_slice(),
                touched_bytes,
                event_count,
                &checksum[..],
                commit.created_by,
                to_millis(&now),
            ],
        )?;
        let repair_id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(RepairRecord {
            repair_id,
            bundle_id: commit.bundle_id,
            subscriptions: touched,
            event_count,
            checksum,
            created_by: commit.created_by.clone(),
            created_at: now,
        })
    }

    fn commit_bundles(
        &mut self,
        images: &[BundleImage],
        appended: &[EntitlementEvent],
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        for image in images {
            insert_bundle(&tx, &image.bundle)?;
            for subscription in &image.subscriptions {
                insert_subscription(&tx, subscription, 1)?;
                for event in &subscription.events {
                    insert_event(&tx, event, 1)?;
                }
            }
            touch_bundle(&tx, image.bundle.bundle_id, now)?;
        }

        for event in appended {
            let (bundle_id, _) = active_version(&tx, event.subscription_id)?;
            append_in(&tx, bundle_id, std::slice::from_ref(event))?;
            touch_bundle(&tx, bundle_id, now)?;
        }

        tx.commit()?;
        Ok(())
    }

    fn events_for_version(
        &self,
        subscription_id: SubscriptionId,
        version: u32,
    ) -> Result<Vec<EntitlementEvent>, StorageError> {
        load_events(&self.conn, subscription_id, version)
    }

    fn get_repairs(&self, bundle_id: BundleId) -> Result<Vec<RepairRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT repair_id, bundle_id, subscriptions, event_count, checksum, created_by, created_at
             FROM repairs WHERE bundle_id = ?1 ORDER BY repair_id",
        )?;
        let repairs = stmt
            .query_map(rusqlite::params![bundle_id.as_bytes().as_slice()], |row| {
                read_repair(row).map_err(tunnel)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(repairs)
    }

    fn event_count(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn try_acquire_bundle_lock(
        &mut self,
        bundle_id: BundleId,
        owner: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        // Abandoned locks expire after the TTL. A TTL reaching past the
        // calendar never expires.
        if let Some(cutoff) = now.checked_sub_signed(ttl) {
            tx.execute(
                "DELETE FROM bundle_locks WHERE bundle_id = ?1 AND acquired_at < ?2",
                rusqlite::params![bundle_id.as_bytes().as_slice(), to_millis(&cutoff)],
            )?;
        }
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO bundle_locks (bundle_id, owner, acquired_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![bundle_id.as_bytes().as_slice(), owner, to_millis(&now)],
        )?;
        tx.commit()?;
        Ok(inserted == 1)
    }

    fn release_bundle_lock(&mut self, bundle_id: BundleId, owner: &str) -> Result<(), StorageError> {
        self.conn.execute(
            "DELETE FROM bundle_locks WHERE bundle_id = ?1 AND owner = ?2",
            rusqlite::params![bundle_id.as_bytes().as_slice(), owner],
        )?;
        Ok(())
    }
}

/// Wrapper error type used to tunnel StorageError through rusqlite's error system
/// in query_map closures that must return rusqlite::Error.
#[derive(Debug)]
struct OpaqueStorageError(String);

impl std::fmt::Display for OpaqueStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for OpaqueStorageError {}
