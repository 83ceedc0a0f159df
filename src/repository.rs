//! Durable per-country state.
//!
//! Fetched resources and reconciliation bookkeeping live in buckets keyed by
//! country code. Every value is stored as self-describing JSON so schema
//! changes do not corrupt existing databases. The SQLite substrate gives the
//! single-writer, snapshot-reader semantics the reconciler relies on.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};

/// Bucket key: wall-clock time of the last successful fetch.
pub const TIMESTAMP: &str = "timestamp";
/// Bucket key: registry-reported ASNs (stored, unused downstream).
pub const ASN: &str = "asn";
/// Bucket key: IPv4 CIDR prefixes that populate the kernel set.
pub const IPV4: &str = "ipv4";
/// Bucket key: IPv6 prefixes. Stored but never installed.
pub const IPV6: &str = "ipv6";
/// Bucket key: set once the rule and set for the bucket are installed.
pub const APPLIED: &str = "applied";
/// Bucket key: name of the live kernel set backing the bucket.
pub const IPSET: &str = "ipset";
/// Bucket key: the exact rule specification installed in the chain.
pub const RULE: &str = "rule";
/// Bucket key: tombstone for buckets no longer referenced by configuration.
pub const DELETION_MARK: &str = "deletion_mark";

/// How far in the past the sentinel timestamp lies when a bucket has never
/// been fetched. Two days guarantees the 24 h freshness predicate fires.
const MISSING_TIMESTAMP_AGE_DAYS: i64 = 2;

/// Per-country data as fetched from the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountryResources {
    pub country: String,
    pub updated_at: DateTime<Utc>,
    pub asn: Vec<String>,
    pub ipv4: Vec<String>,
    pub ipv6: Vec<String>,
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("bucket {0} does not exist")]
    MissingBucket(String),

    #[error("bucket {bucket} has no {key} key")]
    MissingKey { bucket: String, key: String },

    #[error("could not decode {key} in bucket {bucket}: {source}")]
    Decode {
        bucket: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
}

/// Bucket-oriented key/value store. All operations are atomic at bucket
/// granularity; getters for optional keys report absence as the zero value
/// rather than an error.
pub trait Repository: Send + Sync {
    /// Create the bucket if absent and write the fetched resources.
    /// Resets `applied` so the applier re-verifies the kernel state.
    fn create_or_update(&self, resources: &CountryResources) -> Result<(), RepositoryError>;

    /// Full fetched resources for a bucket.
    fn resources(&self, bucket: &str) -> Result<CountryResources, RepositoryError>;

    /// Last successful fetch time. A missing bucket or key yields a sentinel
    /// two days in the past so the freshness predicate triggers.
    fn timestamp(&self, bucket: &str) -> Result<DateTime<Utc>, RepositoryError>;

    fn get_bool(&self, bucket: &str, key: &str) -> Result<bool, RepositoryError>;
    fn set_bool(&self, bucket: &str, key: &str, value: bool) -> Result<(), RepositoryError>;

    fn get_string(&self, bucket: &str, key: &str) -> Result<String, RepositoryError>;
    fn set_string(&self, bucket: &str, key: &str, value: &str) -> Result<(), RepositoryError>;

    /// The rule specification recorded for a bucket; empty if none.
    fn rule(&self, bucket: &str) -> Result<Vec<String>, RepositoryError>;
    fn store_rule(&self, bucket: &str, rule: &[String]) -> Result<(), RepositoryError>;

    fn list_buckets(&self) -> Result<Vec<String>, RepositoryError>;

    /// Buckets whose `deletion_mark` is set.
    fn list_buckets_for_deletion(&self) -> Result<Vec<String>, RepositoryError>;

    /// Remove a bucket and all its keys. Fails if the bucket is absent.
    fn delete_bucket(&self, bucket: &str) -> Result<(), RepositoryError>;
}

/// SQLite-backed repository over a single database file.
pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    /// Open (or create) the database file and ensure the schema.
    pub fn open(path: &Path) -> Result<Self, RepositoryError> {
        let conn = Connection::open(path)?;
        let repo = Self::init(conn)?;
        restrict_mode(path);
        Ok(repo)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, RepositoryError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, RepositoryError> {
        // WAL keeps readers unblocked while the single writer commits.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS buckets (
                 bucket TEXT NOT NULL,
                 key    TEXT NOT NULL,
                 value  TEXT NOT NULL,
                 PRIMARY KEY (bucket, key)
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned mutex only means another thread panicked mid-query;
        // the connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn get_raw(&self, bucket: &str, key: &str) -> Result<Option<String>, RepositoryError> {
        let conn = self.conn();
        let value = conn
            .query_row(
                "SELECT value FROM buckets WHERE bucket = ?1 AND key = ?2",
                (bucket, key),
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put_raw(&self, bucket: &str, key: &str, value: &str) -> Result<(), RepositoryError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO buckets (bucket, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (bucket, key) DO UPDATE SET value = excluded.value",
            (bucket, key, value),
        )?;
        Ok(())
    }

    fn bucket_exists(&self, bucket: &str) -> Result<bool, RepositoryError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM buckets WHERE bucket = ?1",
            (bucket,),
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Fetch a required key, reporting whether the bucket or the key is the
    /// missing piece.
    fn require<T: serde::de::DeserializeOwned>(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<T, RepositoryError> {
        match self.get_raw(bucket, key)? {
            Some(raw) => decode(bucket, key, &raw),
            None if self.bucket_exists(bucket)? => Err(RepositoryError::MissingKey {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            None => Err(RepositoryError::MissingBucket(bucket.to_string())),
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    bucket: &str,
    key: &str,
    raw: &str,
) -> Result<T, RepositoryError> {
    serde_json::from_str(raw).map_err(|source| RepositoryError::Decode {
        bucket: bucket.to_string(),
        key: key.to_string(),
        source,
    })
}

fn encode<T: serde::Serialize>(value: &T) -> String {
    // Serialising bools, strings and string vectors to JSON cannot fail.
    serde_json::to_string(value).unwrap_or_default()
}

fn sentinel_timestamp() -> DateTime<Utc> {
    Utc::now() - Duration::days(MISSING_TIMESTAMP_AGE_DAYS)
}

/// Database files hold policy state; keep them owner-only like the original
/// bolt file.
fn restrict_mode(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        warn!("could not restrict mode of {}: {}", path.display(), e);
    }
}

impl Repository for SqliteRepository {
    fn create_or_update(&self, resources: &CountryResources) -> Result<(), RepositoryError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for (key, value) in [
            (APPLIED, encode(&false)),
            (TIMESTAMP, encode(&resources.updated_at)),
            (ASN, encode(&resources.asn)),
            (IPV4, encode(&resources.ipv4)),
            (IPV6, encode(&resources.ipv6)),
        ] {
            tx.execute(
                "INSERT INTO buckets (bucket, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT (bucket, key) DO UPDATE SET value = excluded.value",
                (&resources.country, key, &value),
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn resources(&self, bucket: &str) -> Result<CountryResources, RepositoryError> {
        Ok(CountryResources {
            country: bucket.to_string(),
            updated_at: self.timestamp(bucket)?,
            asn: self.require(bucket, ASN)?,
            ipv4: self.require(bucket, IPV4)?,
            ipv6: self.require(bucket, IPV6)?,
        })
    }

    fn timestamp(&self, bucket: &str) -> Result<DateTime<Utc>, RepositoryError> {
        match self.get_raw(bucket, TIMESTAMP)? {
            Some(raw) => match decode(bucket, TIMESTAMP, &raw) {
                Ok(ts) => Ok(ts),
                Err(e) => {
                    // Unreadable timestamps force a refresh instead of
                    // wedging the fetcher.
                    warn!("{e}");
                    Ok(sentinel_timestamp())
                }
            },
            None => {
                debug!("no timestamp for {bucket}, reporting stale sentinel");
                Ok(sentinel_timestamp())
            }
        }
    }

    fn get_bool(&self, bucket: &str, key: &str) -> Result<bool, RepositoryError> {
        match self.get_raw(bucket, key)? {
            Some(raw) => decode(bucket, key, &raw),
            None => Ok(false),
        }
    }

    fn set_bool(&self, bucket: &str, key: &str, value: bool) -> Result<(), RepositoryError> {
        self.put_raw(bucket, key, &encode(&value))
    }

    fn get_string(&self, bucket: &str, key: &str) -> Result<String, RepositoryError> {
        match self.get_raw(bucket, key)? {
            Some(raw) => decode(bucket, key, &raw),
            None => Ok(String::new()),
        }
    }

    fn set_string(&self, bucket: &str, key: &str, value: &str) -> Result<(), RepositoryError> {
        self.put_raw(bucket, key, &encode(&value))
    }

    fn rule(&self, bucket: &str) -> Result<Vec<String>, RepositoryError> {
        match self.get_raw(bucket, RULE)? {
            Some(raw) => decode(bucket, RULE, &raw),
            None => Ok(Vec::new()),
        }
    }

    fn store_rule(&self, bucket: &str, rule: &[String]) -> Result<(), RepositoryError> {
        self.put_raw(bucket, RULE, &encode(&rule))
    }

    fn list_buckets(&self) -> Result<Vec<String>, RepositoryError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT DISTINCT bucket FROM buckets ORDER BY bucket")?;
        let buckets = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(buckets)
    }

    fn list_buckets_for_deletion(&self) -> Result<Vec<String>, RepositoryError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT bucket FROM buckets
             WHERE key = ?1 AND value = 'true' ORDER BY bucket",
        )?;
        let buckets = stmt
            .query_map((DELETION_MARK,), |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(buckets)
    }

    fn delete_bucket(&self, bucket: &str) -> Result<(), RepositoryError> {
        let conn = self.conn();
        let deleted = conn.execute("DELETE FROM buckets WHERE bucket = ?1", (bucket,))?;
        if deleted == 0 {
            return Err(RepositoryError::MissingBucket(bucket.to_string()));
        }
        Ok(())
    }
}
