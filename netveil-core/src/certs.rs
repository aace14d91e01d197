//! User-approved exemptions for invalid server certificates

use crate::error::StorageError;
use crate::platform::SystemClock;
use chrono::{DateTime, Utc};
use netveil_proxy::proxy::ServerCertificate;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Storage calls are attempted at most this many times
const MAX_ATTEMPTS: u32 = 2;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS cert_exemptions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    thumbprint TEXT NOT NULL,
    host TEXT NOT NULL,
    date_exempted TEXT,
    expire_date TEXT,
    UNIQUE(thumbprint, host)
)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateExemptionRecord {
    pub host: String,
    pub thumbprint: String,
    pub date_exempted: Option<DateTime<Utc>>,
    pub expire_date: Option<DateTime<Utc>>,
}

impl CertificateExemptionRecord {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.date_exempted.is_some() && self.expire_date.map_or(true, |expires| expires > now)
    }
}

pub struct CertificateExemptions {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
    clock: Arc<dyn SystemClock>,
}

impl CertificateExemptions {
    pub fn open(path: impl Into<PathBuf>, clock: Arc<dyn SystemClock>) -> Result<Self, StorageError> {
        let path = path.into();
        let conn = open_connection(Some(&path))?;
        Ok(Self {
            path: Some(path),
            conn: Mutex::new(conn),
            clock,
        })
    }

    pub fn in_memory(clock: Arc<dyn SystemClock>) -> Result<Self, StorageError> {
        Ok(Self {
            path: None,
            conn: Mutex::new(open_connection(None)?),
            clock,
        })
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now_local().with_timezone(&Utc)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn reopen(&self) {
        let Some(path) = &self.path else {
            return;
        };
        match open_connection(Some(path)) {
            Ok(conn) => *self.lock() = conn,
            Err(e) => warn!("Failed to reopen exemption database: {}", e),
        }
    }

    /// Run `op`, reopening the connection and retrying once on failure
    fn with_retry<T>(&self, op: impl Fn(&Connection) -> rusqlite::Result<T>) -> Result<T, StorageError> {
        let mut attempt = 1;
        loop {
            let result = op(&self.lock());
            match result {
                Ok(value) => return Ok(value),
                Err(e) if attempt < MAX_ATTEMPTS => {
                    warn!("Exemption database error (attempt {}): {}", attempt, e);
                    self.reopen();
                    attempt += 1;
                }
                Err(e) => return Err(StorageError::Query(e)),
            }
        }
    }

    /// Exempt `thumbprint` on `host` from certificate validation. Trusting
    /// the same pair again refreshes the existing row.
    pub fn trust_certificate(&self, host: &str, thumbprint: &str) {
        let host = normalize_host(host);
        let thumbprint = normalize_thumbprint(thumbprint);
        let now = self.now().to_rfc3339();

        let result = self.with_retry(|conn| {
            conn.execute(
                "INSERT INTO cert_exemptions (thumbprint, host, date_exempted, expire_date)
                 VALUES (?1, ?2, ?3, NULL)
                 ON CONFLICT(thumbprint, host) DO UPDATE
                 SET date_exempted = excluded.date_exempted, expire_date = NULL",
                params![thumbprint, host, now],
            )
        });

        match result {
            Ok(_) => info!("Trusted certificate {} for {}", thumbprint, host),
            Err(e) => error!("Failed to store certificate exemption for {}: {}", host, e),
        }
    }

    /// Whether the certificate presented by `host` was exempted. Storage
    /// failures count as not exempted.
    pub fn is_exempted(&self, host: &str, certificate: &ServerCertificate) -> bool {
        match self.record(host, &certificate.thumbprint) {
            Ok(Some(record)) => record.is_active(self.now()),
            Ok(None) => false,
            Err(e) => {
                error!("Exemption lookup failed for {}: {}", host, e);
                false
            }
        }
    }

    pub fn record(&self, host: &str, thumbprint: &str) -> Result<Option<CertificateExemptionRecord>, StorageError> {
        let host = normalize_host(host);
        let thumbprint = normalize_thumbprint(thumbprint);

        let row = self.with_retry(|conn| {
            conn.query_row(
                "SELECT date_exempted, expire_date FROM cert_exemptions
                 WHERE thumbprint = ?1 AND host = ?2",
                params![thumbprint, host],
                |row| Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()
        })?;

        Ok(row.map(|(exempted, expires)| {
            debug!("Exemption found for {} / {}", host, thumbprint);
            CertificateExemptionRecord {
                host: host.clone(),
                thumbprint: thumbprint.clone(),
                date_exempted: exempted.as_deref().and_then(parse_timestamp),
                expire_date: expires.as_deref().and_then(parse_timestamp),
            }
        }))
    }

    pub fn count(&self) -> Result<usize, StorageError> {
        self.with_retry(|conn| {
            conn.query_row("SELECT COUNT(*) FROM cert_exemptions", [], |row| row.get::<_, i64>(0))
        })
        .map(|n| n.max(0) as usize)
    }
}

fn open_connection(path: Option<&PathBuf>) -> Result<Connection, StorageError> {
    let conn = match path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            Connection::open(path).map_err(|source| StorageError::Open {
                path: path.clone(),
                source,
            })?
        }
        None => Connection::open_in_memory()?,
    };
    conn.execute(SCHEMA, [])?;
    Ok(conn)
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn normalize_thumbprint(thumbprint: &str) -> String {
    thumbprint
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect::<String>()
        .to_ascii_uppercase()
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
