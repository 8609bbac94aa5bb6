use sha2::{Digest, Sha256};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_rusqlite::Connection;

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("cannot create mirror directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("mirror key file {path}: {source}")]
    KeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("mirror key file {path} holds {len} bytes, expected {KEY_LEN}")]
    KeyLength { path: PathBuf, len: usize },
    #[error("blob {0} could not be sealed")]
    SealFailed(String),
    #[error("blob {0} could not be opened: wrong installation key, moved or corrupted")]
    OpenFailed(String),
    #[error("blob {key} is truncated ({len} bytes)")]
    Truncated { key: String, len: usize },
    #[error("integrity check failed for {0}")]
    IntegrityMismatch(String),
}

/// Metadata about one mirrored blob (no content).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BlobInfo {
    pub key: String,
    pub size: u64,
    pub sha256: String,
    pub created_at: String,
}

/// SQLite-backed durable mirror with AES-256-GCM encryption at rest.
///
/// Every artifact a session produces (merged video, extracted frames, color
/// data, verdict document) is stored under a hierarchical key. Content is
/// sealed before it reaches SQLite; the SHA-256 of the plaintext is kept
/// alongside and checked on every read. The installation key lives next to
/// the database at `{db_dir}/.key` (mode 0600).
#[derive(Clone)]
pub struct MirrorStore {
    conn: Connection,
    cipher: BlobCipher,
}

impl MirrorStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let cipher = if db_path == Path::new(":memory:") {
            BlobCipher::new(&[0u8; KEY_LEN])
        } else {
            let dir = match db_path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            };
            std::fs::create_dir_all(dir).map_err(|source| StoreError::Directory {
                path: dir.to_path_buf(),
                source,
            })?;
            BlobCipher::from_key_file(&dir.join(".key"))?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS blobs (
                     key TEXT PRIMARY KEY,
                     session TEXT NOT NULL,
                     content BLOB NOT NULL,
                     sha256 TEXT NOT NULL,
                     size INTEGER NOT NULL,
                     created_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_blobs_session ON blobs(session);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, cipher })
    }

    /// Store `content` under `key`, replacing any previous blob.
    pub async fn put(&self, session: &str, key: &str, content: &[u8]) -> Result<(), StoreError> {
        let sha256 = sha256_hex(content);
        let size = content.len() as u64;
        let blob = self.cipher.seal(key, content)?;
        let created_at = chrono::Utc::now().to_rfc3339();

        let key_owned = key.to_string();
        let session = session.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO blobs (key, session, content, sha256, size, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![key_owned, session, blob, sha256, size, created_at],
                )?;
                Ok(())
            })
            .await?;

        tracing::debug!(key, size, "blob mirrored");
        Ok(())
    }

    /// Fetch and decrypt the blob under `key`.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let key_owned = key.to_string();
        let row: Option<(Vec<u8>, String)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT content, sha256 FROM blobs WHERE key = ?1")?;
                let mut rows = stmt.query_map([&key_owned], |row| {
                    Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?))
                })?;
                Ok(rows.next().transpose()?)
            })
            .await?;

        let Some((blob, expected)) = row else {
            return Ok(None);
        };
        let content = self.cipher.open(key, &blob)?;
        if sha256_hex(&content) != expected {
            return Err(StoreError::IntegrityMismatch(key.to_string()));
        }
        Ok(Some(content))
    }

    /// List a session's blobs (metadata only), ordered by key.
    pub async fn list_session(&self, session: &str) -> Result<Vec<BlobInfo>, StoreError> {
        let session = session.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT key, size, sha256, created_at
                     FROM blobs WHERE session = ?1 ORDER BY key",
                )?;
                let rows = stmt.query_map([&session], |row| {
                    Ok(BlobInfo {
                        key: row.get(0)?,
                        size: row.get(1)?,
                        sha256: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Count mirrored blobs across all sessions.
    pub async fn count_all(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM blobs", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }
}

// ── Blob sealing ──────────────────────────────────────────────────────────────

/// AES-256-GCM keyed once per installation. The blob's mirror key is bound
/// as associated data, so a sealed blob only opens under the key it was
/// written to.
#[derive(Clone)]
struct BlobCipher(Aes256Gcm);

impl std::fmt::Debug for BlobCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobCipher").finish_non_exhaustive()
    }
}

impl BlobCipher {
    fn new(key: &[u8; KEY_LEN]) -> Self {
        Self(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)))
    }

    /// Read the installation key, creating it on first start.
    ///
    /// `create_new` decides which process writes the key, so two daemons
    /// starting against the same directory agree on one key.
    fn from_key_file(path: &Path) -> Result<Self, StoreError> {
        let key_err = |source| StoreError::KeyFile {
            path: path.to_path_buf(),
            source,
        };

        let created = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path);
        match created {
            Ok(mut file) => {
                let mut key = [0u8; KEY_LEN];
                OsRng.fill_bytes(&mut key);
                file.write_all(&key).map_err(key_err)?;
                tracing::info!(path = %path.display(), "generated mirror key");
                Ok(Self::new(&key))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let mut bytes = Vec::with_capacity(KEY_LEN);
                std::fs::File::open(path)
                    .and_then(|mut f| f.read_to_end(&mut bytes))
                    .map_err(key_err)?;
                let key: [u8; KEY_LEN] =
                    bytes.as_slice().try_into().map_err(|_| StoreError::KeyLength {
                        path: path.to_path_buf(),
                        len: bytes.len(),
                    })?;
                tracing::debug!(path = %path.display(), "loaded mirror key");
                Ok(Self::new(&key))
            }
            Err(e) => Err(key_err(e)),
        }
    }

    /// `nonce || ciphertext || tag`
    fn seal(&self, key: &str, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let payload = Payload {
            msg: plaintext,
            aad: key.as_bytes(),
        };
        let sealed = self
            .0
            .encrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|_| StoreError::SealFailed(key.to_string()))?;
        Ok([nonce.as_slice(), &sealed].concat())
    }

    fn open(&self, key: &str, blob: &[u8]) -> Result<Vec<u8>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::Truncated {
                key: key.to_string(),
                len: blob.len(),
            });
        }
        let (nonce, sealed) = blob.split_at(NONCE_LEN);
        let payload = Payload {
            msg: sealed,
            aad: key.as_bytes(),
        };
        self.0
            .decrypt(Nonce::from_slice(nonce), payload)
            .map_err(|_| StoreError::OpenFailed(key.to_string()))
    }
}

// ── Key layout ────────────────────────────────────────────────────────────────

pub fn video_key(session: &str) -> String {
    format!("{session}/videos/{session}.mp4")
}

pub fn image_key(session: &str, label: &str) -> String {
    format!("{session}/images/{label}.png")
}

pub fn color_data_key(session: &str) -> String {
    format!("{session}/color_data/{session}.json")
}

pub fn verdict_key(session: &str) -> String {
    format!("{session}/analysis/{session}_response.json")
}

fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip() {
        let store = MirrorStore::open(Path::new(":memory:")).await.unwrap();
        let key = video_key("s1");

        store.put("s1", &key, b"\x00\x00\x00\x18ftypmp42").await.unwrap();
        let content = store.get(&key).await.unwrap().unwrap();
        assert_eq!(content, b"\x00\x00\x00\x18ftypmp42");

        assert!(store.get("s1/videos/missing.mp4").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_content_is_encrypted_at_rest() {
        let store = MirrorStore::open(Path::new(":memory:")).await.unwrap();
        store.put("s1", "s1/plain", b"plain text payload").await.unwrap();

        let raw: Vec<u8> = store
            .conn
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT content FROM blobs WHERE key = 's1/plain'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(raw.len(), NONCE_LEN + b"plain text payload".len() + 16);
        assert!(!raw.windows(5).any(|w| w == b"plain"));
    }

    #[test]
    fn test_wrong_installation_key_fails() {
        let ours = BlobCipher::new(&[1u8; KEY_LEN]);
        let theirs = BlobCipher::new(&[2u8; KEY_LEN]);

        let blob = ours.seal("s1/images/1000_red.png", b"frame bytes").unwrap();
        assert_eq!(
            ours.open("s1/images/1000_red.png", &blob).unwrap(),
            b"frame bytes"
        );
        assert!(matches!(
            theirs.open("s1/images/1000_red.png", &blob).unwrap_err(),
            StoreError::OpenFailed(_)
        ));
        assert!(matches!(
            theirs.open("s1/x", &blob[..8]).unwrap_err(),
            StoreError::Truncated { len: 8, .. }
        ));
    }

    #[tokio::test]
    async fn test_blob_copied_to_other_key_does_not_open() {
        let store = MirrorStore::open(Path::new(":memory:")).await.unwrap();
        store.put("s1", "s1/verdict", b"{\"passed\":false}").await.unwrap();
        store.put("s2", "s2/verdict", b"{\"passed\":true}").await.unwrap();

        store
            .conn
            .call(|conn| {
                conn.execute(
                    "UPDATE blobs SET
                         content = (SELECT content FROM blobs WHERE key = 's2/verdict'),
                         sha256 = (SELECT sha256 FROM blobs WHERE key = 's2/verdict')
                     WHERE key = 's1/verdict'",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let err = store.get("s1/verdict").await.unwrap_err();
        assert!(matches!(err, StoreError::OpenFailed(k) if k == "s1/verdict"));
        assert!(store.get("s2/verdict").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_integrity_mismatch_detected() {
        let store = MirrorStore::open(Path::new(":memory:")).await.unwrap();
        store.put("s1", "s1/x", b"original").await.unwrap();

        store
            .conn
            .call(|conn| {
                conn.execute("UPDATE blobs SET sha256 = 'deadbeef' WHERE key = 's1/x'", [])?;
                Ok(())
            })
            .await
            .unwrap();

        let err = store.get("s1/x").await.unwrap_err();
        assert!(matches!(err, StoreError::IntegrityMismatch(k) if k == "s1/x"));
    }

    #[tokio::test]
    async fn test_list_and_replace() {
        let store = MirrorStore::open(Path::new(":memory:")).await.unwrap();

        store.put("s1", &color_data_key("s1"), b"[]").await.unwrap();
        store.put("s1", &image_key("s1", "1000_red"), b"png").await.unwrap();
        store.put("s2", &video_key("s2"), b"mp4").await.unwrap();
        store.put("s1", &color_data_key("s1"), b"[{}]").await.unwrap();

        let listed = store.list_session("s1").await.unwrap();
        let keys: Vec<&str> = listed.iter().map(|b| b.key.as_str()).collect();
        assert_eq!(keys, vec!["s1/color_data/s1.json", "s1/images/1000_red.png"]);
        assert_eq!(listed[0].size, 4);
        assert_eq!(listed[0].sha256, sha256_hex(b"[{}]"));

        assert_eq!(store.count_all().await.unwrap(), 3);
        assert_eq!(
            store.get(&color_data_key("s1")).await.unwrap().unwrap(),
            b"[{}]"
        );
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(video_key("abc"), "abc/videos/abc.mp4");
        assert_eq!(image_key("abc", "1500_blue"), "abc/images/1500_blue.png");
        assert_eq!(color_data_key("abc"), "abc/color_data/abc.json");
        assert_eq!(verdict_key("abc"), "abc/analysis/abc_response.json");
    }

    #[test]
    fn test_key_file_created_with_owner_only_mode() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(".key");

        let first = BlobCipher::from_key_file(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let reloaded = BlobCipher::from_key_file(&path).unwrap();
        let blob = first.seal("s1/x", b"payload").unwrap();
        assert_eq!(reloaded.open("s1/x", &blob).unwrap(), b"payload");

        std::fs::write(&path, [0u8; 5]).unwrap();
        assert!(matches!(
            BlobCipher::from_key_file(&path).unwrap_err(),
            StoreError::KeyLength { len: 5, .. }
        ));
    }

    #[tokio::test]
    async fn test_open_reports_unusable_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let err = MirrorStore::open(&blocker.join("chroma.db"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::Directory { path, .. } if path == blocker));
    }

    #[tokio::test]
    async fn test_open_creates_directory_and_key() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("nested/state/chroma.db");

        let store = MirrorStore::open(&db).await.unwrap();
        store.put("s1", "s1/x", b"kept").await.unwrap();
        assert!(tmp.path().join("nested/state/.key").is_file());
        assert_eq!(store.get("s1/x").await.unwrap().unwrap(), b"kept");
    }
}
