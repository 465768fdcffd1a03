//! Identity registry: the in-memory cache and the persistent stores behind it.
//!
//! The cache is loaded once at startup and replaced wholesale on reload.
//! Stores only need to answer "every identity with its reference signatures";
//! enrollment is done by external tooling through `add_signature`.

use crate::types::{FaceSignature, Identity};
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("identity registry unavailable: {0}")]
    Unavailable(String),
    #[error("malformed record for {name:?}: {reason}")]
    MalformedRecord { name: String, reason: String },
}

impl RegistryError {
    fn malformed(name: &str, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Read side of a persistent identity store.
pub trait IdentityRegistry {
    /// Every enrolled identity, in store order.
    fn read_identities(&self) -> Result<Vec<Identity>, RegistryError>;
}

/// Immutable snapshot of the known identities.
#[derive(Debug, Clone, Default)]
pub struct RegistryCache {
    identities: Vec<Identity>,
    dimension: Option<usize>,
}

impl RegistryCache {
    /// Load a fresh snapshot from `registry`.
    pub fn load(registry: &dyn IdentityRegistry) -> Result<Self, RegistryError> {
        let cache = Self::from_identities(registry.read_identities()?)?;
        tracing::info!(
            identities = cache.len(),
            signatures = cache.signature_count(),
            dimension = ?cache.dimension(),
            "identity registry loaded"
        );
        Ok(cache)
    }

    /// Build a snapshot, checking every signature shares one finite,
    /// non-empty shape.
    pub fn from_identities(identities: Vec<Identity>) -> Result<Self, RegistryError> {
        let mut dimension: Option<usize> = None;

        for identity in &identities {
            for signature in &identity.signatures {
                if signature.is_empty() {
                    return Err(RegistryError::malformed(&identity.name, "empty signature"));
                }
                if signature.values().iter().any(|v| !v.is_finite()) {
                    return Err(RegistryError::malformed(
                        &identity.name,
                        "signature contains non-finite values",
                    ));
                }
                match dimension {
                    None => dimension = Some(signature.len()),
                    Some(dim) if dim != signature.len() => {
                        return Err(RegistryError::malformed(
                            &identity.name,
                            format!("expected {dim}-dim signature, got {}", signature.len()),
                        ));
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(Self {
            identities,
            dimension,
        })
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    /// Number of identities.
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Total reference signatures across all identities.
    pub fn signature_count(&self) -> usize {
        self.identities.iter().map(|i| i.signatures.len()).sum()
    }

    /// Signature dimensionality, once at least one signature is present.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }
}

/// Open a store by file extension: `.json` is a flat file, anything else SQLite.
pub fn open_registry(path: &Path) -> Result<Box<dyn IdentityRegistry>, RegistryError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Ok(Box::new(JsonFileRegistry::new(path))),
        _ => Ok(Box::new(SqliteRegistry::open(path)?)),
    }
}

// --- JSON flat file ---

#[derive(Debug, Default, Serialize, Deserialize)]
struct JsonRegistryFile {
    #[serde(default)]
    identities: Vec<JsonIdentity>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonIdentity {
    name: String,
    #[serde(default)]
    signatures: Vec<serde_json::Value>,
}

/// Identity store kept in a single JSON document:
///
/// ```json
/// { "identities": [ { "name": "Alice", "signatures": [[0.1, 0.2, ...]] } ] }
/// ```
pub struct JsonFileRegistry {
    path: PathBuf,
}

impl JsonFileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append a reference signature for `name`, creating the file if needed.
    pub fn add_signature(&self, name: &str, signature: &FaceSignature) -> Result<(), RegistryError> {
        let mut file = if self.path.exists() {
            self.read_file()?
        } else {
            JsonRegistryFile::default()
        };

        let value = serde_json::to_value(signature)
            .map_err(|e| RegistryError::malformed(name, e.to_string()))?;
        match file.identities.iter_mut().find(|i| i.name == name) {
            Some(identity) => identity.signatures.push(value),
            None => file.identities.push(JsonIdentity {
                name: name.to_string(),
                signatures: vec![value],
            }),
        }

        let text = serde_json::to_string_pretty(&file)
            .map_err(|e| RegistryError::Unavailable(format!("serialize registry: {e}")))?;
        std::fs::write(&self.path, text)
            .map_err(|e| RegistryError::Unavailable(format!("{}: {e}", self.path.display())))
    }

    fn read_file(&self) -> Result<JsonRegistryFile, RegistryError> {
        let text = std::fs::read_to_string(&self.path)
            .map_err(|e| RegistryError::Unavailable(format!("{}: {e}", self.path.display())))?;
        serde_json::from_str(&text).map_err(|e| {
            RegistryError::malformed(&self.path.display().to_string(), format!("invalid JSON: {e}"))
        })
    }
}

impl IdentityRegistry for JsonFileRegistry {
    fn read_identities(&self) -> Result<Vec<Identity>, RegistryError> {
        self.read_file()?
            .identities
            .into_iter()
            .map(|raw| {
                let signatures = raw
                    .signatures
                    .into_iter()
                    .map(|value| {
                        serde_json::from_value::<Vec<f32>>(value)
                            .map(FaceSignature::new)
                            .map_err(|e| RegistryError::malformed(&raw.name, e.to_string()))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Identity {
                    name: raw.name,
                    signatures,
                })
            })
            .collect()
    }
}

// --- SQLite ---

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS face_signatures (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    signature   TEXT NOT NULL,
    created_at  TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_face_signatures_name ON face_signatures(name);
";

/// Identity store in SQLite, one row per reference signature.
///
/// Signatures are stored as JSON arrays of floats. Identities come back in
/// order of their first enrolled signature.
pub struct SqliteRegistry {
    conn: Connection,
}

impl SqliteRegistry {
    /// Open an existing database read-only. A missing file is `Unavailable`.
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| RegistryError::Unavailable(format!("{}: {e}", path.display())))?;
        Ok(Self { conn })
    }

    /// Open or create a writable database and ensure the schema exists.
    pub fn create(path: &Path) -> Result<Self, RegistryError> {
        let conn = Connection::open(path)
            .map_err(|e| RegistryError::Unavailable(format!("{}: {e}", path.display())))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| RegistryError::Unavailable(format!("create schema: {e}")))?;
        Ok(Self { conn })
    }

    /// Append a reference signature for `name`.
    pub fn add_signature(&self, name: &str, signature: &FaceSignature) -> Result<(), RegistryError> {
        let encoded = serde_json::to_string(signature)
            .map_err(|e| RegistryError::malformed(name, e.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO face_signatures (name, signature) VALUES (?1, ?2)",
                params![name, encoded],
            )
            .map_err(|e| RegistryError::Unavailable(format!("insert signature: {e}")))?;
        Ok(())
    }
}

impl IdentityRegistry for SqliteRegistry {
    fn read_identities(&self) -> Result<Vec<Identity>, RegistryError> {
        let unavailable = |e: rusqlite::Error| RegistryError::Unavailable(e.to_string());

        let mut stmt = self
            .conn
            .prepare("SELECT name, signature FROM face_signatures ORDER BY id")
            .map_err(unavailable)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(unavailable)?;

        let mut identities: Vec<Identity> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for row in rows {
            let (name, encoded) = row.map_err(unavailable)?;
            let values: Vec<f32> = serde_json::from_str(&encoded)
                .map_err(|e| RegistryError::malformed(&name, e.to_string()))?;

            let slot = match index.get(&name) {
                Some(&i) => i,
                None => {
                    identities.push(Identity {
                        name: name.clone(),
                        signatures: Vec::new(),
                    });
                    index.insert(name, identities.len() - 1);
                    identities.len() - 1
                }
            };
            identities[slot].signatures.push(FaceSignature::new(values));
        }

        Ok(identities)
    }
}
