//! Persistent fingerprint history.
//!
//! The whole database is one JSON document keyed by [`GroupKey`]. Every
//! mutation rewrites the document through a temporary file in the same
//! directory which is then renamed over the old one, so a failed write never
//! leaves a truncated database behind.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreLoadError, StoreWriteError};
use crate::fingerprint::{Fingerprint, GroupKey};

/// One sighting of an image on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationEntry {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default, with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub size: u64,
    /// Fields written by newer versions, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LocationEntry {
    pub fn new(path: impl Into<String>, filename: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            filename: filename.into(),
            timestamp: Utc::now(),
            size,
            extra: Map::new(),
        }
    }

    /// Builds an entry for `path`, reading the file size from disk.
    pub fn for_file(path: &Path) -> std::io::Result<Self> {
        let size = fs::metadata(path)?.len();
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(Self::new(path.to_string_lossy(), filename, size))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub fingerprint: Fingerprint,
    #[serde(default)]
    pub original_filename: String,
    #[serde(default, with = "timestamp")]
    pub first_seen: DateTime<Utc>,
    /// Zero only while loading an older file without the field; `load`
    /// replaces it with the number of locations.
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub locations: Vec<LocationEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FingerprintRecord {
    fn first_sighting(fingerprint: Fingerprint, filename: String, location: LocationEntry) -> Self {
        Self {
            fingerprint,
            original_filename: filename,
            first_seen: location.timestamp,
            count: 1,
            locations: vec![location],
            extra: Map::new(),
        }
    }

    /// The last `n` locations, oldest first.
    pub fn recent_locations(&self, n: usize) -> &[LocationEntry] {
        let start = self.locations.len().saturating_sub(n);
        &self.locations[start..]
    }
}

/// Snapshot of the database file for display.
#[derive(Debug, Clone)]
pub struct StoreInfo {
    pub path: Option<PathBuf>,
    pub exists: bool,
    pub size_bytes: u64,
    pub records: usize,
    pub modified: Option<DateTime<Local>>,
}

#[derive(Debug, Default)]
pub struct FingerprintStore {
    path: Option<PathBuf>,
    records: BTreeMap<GroupKey, FingerprintRecord>,
    /// Set when the file exists but could not be read; persisting would
    /// replace data we never saw.
    read_only: bool,
}

impl FingerprintStore {
    /// A store with no backing file. Mutations are never written anywhere.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Empty store bound to `path`; nothing is read.
    pub fn empty_at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Loads the database at `path`.
    ///
    /// Never fails: a missing, unreadable or corrupt file yields an empty
    /// store bound to `path` together with the reason. A corrupt file
    /// (including one that is not UTF-8) is moved aside to `<path>.backup` so
    /// the next write cannot destroy it. A file that cannot be read at all is
    /// left in place and the store refuses to persist over it.
    pub fn load(path: impl Into<PathBuf>) -> (Self, Option<StoreLoadError>) {
        let path = path.into();

        if !path.exists() {
            info!("No fingerprint database at {:?}, starting empty", path);
            let err = StoreLoadError::Missing { path: path.clone() };
            return (Self::empty_at(path), Some(err));
        }

        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(source) => {
                warn!("Failed to read fingerprint database {:?}: {}", path, source);
                let err = StoreLoadError::Read {
                    path: path.clone(),
                    source,
                };
                let store = Self {
                    read_only: true,
                    ..Self::empty_at(path)
                };
                return (store, Some(err));
            }
        };

        match serde_json::from_slice::<BTreeMap<GroupKey, FingerprintRecord>>(&content) {
            Ok(mut records) => {
                for record in records.values_mut() {
                    if record.count == 0 {
                        record.count = record.locations.len().max(1) as u64;
                    }
                }
                info!(
                    "Loaded fingerprint database {:?}: {} record(s), {} bytes",
                    path,
                    records.len(),
                    content.len()
                );
                (
                    Self {
                        path: Some(path),
                        records,
                        read_only: false,
                    },
                    None,
                )
            }
            Err(source) => {
                warn!("Fingerprint database {:?} is corrupt: {}", path, source);
                let backup = backup_path(&path);
                let backup = match fs::rename(&path, &backup) {
                    Ok(()) => {
                        warn!("Moved corrupt database to {:?}", backup);
                        Some(backup)
                    }
                    Err(e) => {
                        warn!("Could not back up corrupt database {:?}: {}", path, e);
                        None
                    }
                };
                let err = StoreLoadError::Corrupt {
                    path: path.clone(),
                    backup,
                    source,
                };
                (Self::empty_at(path), Some(err))
            }
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &GroupKey) -> Option<&FingerprintRecord> {
        self.records.get(key)
    }

    /// Read-only view of every record in key order.
    pub fn all(&self) -> impl Iterator<Item = (&GroupKey, &FingerprintRecord)> {
        self.records.iter()
    }

    /// Records one sighting of `fingerprint` under `key` and persists.
    ///
    /// A new key creates a record with `count == 1`; an existing key bumps the
    /// count and appends `location`. If persisting fails the in-memory change
    /// is rolled back.
    pub fn upsert(
        &mut self,
        key: GroupKey,
        fingerprint: Fingerprint,
        filename: impl Into<String>,
        location: LocationEntry,
    ) -> Result<&FingerprintRecord, StoreWriteError> {
        let created = match self.records.get_mut(&key) {
            Some(record) => {
                record.count += 1;
                record.locations.push(location);
                debug!("Updated {} (count {})", key, record.count);
                false
            }
            None => {
                let record = FingerprintRecord::first_sighting(fingerprint, filename.into(), location);
                self.records.insert(key.clone(), record);
                debug!("Created {}", key);
                true
            }
        };

        if let Err(e) = self.persist() {
            if created {
                self.records.remove(&key);
            } else if let Some(record) = self.records.get_mut(&key) {
                record.count -= 1;
                record.locations.pop();
            }
            return Err(e);
        }

        Ok(&self.records[&key])
    }

    /// Removes every record. Refuses unless the caller confirmed.
    pub fn clear(&mut self, confirmed: bool) -> Result<usize, StoreError> {
        if !confirmed {
            return Err(StoreError::ConfirmationRequired);
        }

        let previous = std::mem::take(&mut self.records);
        if let Err(e) = self.persist() {
            self.records = previous;
            return Err(e.into());
        }

        info!("Cleared {} record(s) from fingerprint database", previous.len());
        Ok(previous.len())
    }

    /// Writes the whole database via a temp file and an atomic rename.
    pub fn persist(&self) -> Result<(), StoreWriteError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if self.read_only {
            return Err(StoreWriteError::Unreadable { path: path.clone() });
        }

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|source| StoreWriteError::CreateDir {
            path: dir.clone(),
            source,
        })?;

        let tmp = NamedTempFile::new_in(&dir).map_err(|source| StoreWriteError::TempFile {
            dir: dir.clone(),
            source,
        })?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut writer, &self.records)?;
            writer.flush().map_err(|source| StoreWriteError::TempFile {
                dir: dir.clone(),
                source,
            })?;
        }
        tmp.as_file()
            .sync_all()
            .map_err(|source| StoreWriteError::TempFile {
                dir: dir.clone(),
                source,
            })?;
        tmp.persist(path).map_err(|e| StoreWriteError::Persist {
            path: path.clone(),
            source: e.error,
        })?;

        debug!("Saved {} record(s) to {:?}", self.records.len(), path);
        Ok(())
    }

    pub fn info(&self) -> StoreInfo {
        let metadata = self.path.as_ref().and_then(|p| fs::metadata(p).ok());
        StoreInfo {
            path: self.path.clone(),
            exists: metadata.is_some(),
            size_bytes: metadata.as_ref().map(|m| m.len()).unwrap_or(0),
            records: self.records.len(),
            modified: metadata
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Local>::from),
        }
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".backup");
    PathBuf::from(name)
}

/// RFC 3339 on write. On read also accepts naive ISO-8601 timestamps without
/// an offset, interpreted as local time.
mod timestamp {
    use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| D::Error::custom(format!("invalid timestamp {raw:?}")))
    }

    pub(super) fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
        let local = Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc));
        Some(local.unwrap_or_else(|| naive.and_utc()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn key(raw: &str) -> GroupKey {
        GroupKey::from(raw)
    }

    fn fp(raw: &str) -> Fingerprint {
        Fingerprint::from(raw.to_string())
    }

    fn location(path: &str, size: u64) -> LocationEntry {
        let filename = Path::new(path)
            .file_name()
            .unwrap()
            .to_string_lossy()
            .to_string();
        LocationEntry::new(path, filename, size)
    }

    #[test]
    fn test_upsert_creates_then_appends() {
        let mut store = FingerprintStore::in_memory();

        let record = store
            .upsert(key("k1"), fp("aa_bb_cc"), "a.png", location("/x/a.png", 10))
            .unwrap();
        assert_eq!(record.count, 1);
        assert_eq!(record.locations.len(), 1);
        assert_eq!(record.first_seen, record.locations[0].timestamp);

        let record = store
            .upsert(key("k1"), fp("aa_bb_cc"), "b.png", location("/y/b.png", 12))
            .unwrap();
        assert_eq!(record.count, 2);
        assert_eq!(record.locations.len(), 2);
        assert_eq!(record.original_filename, "a.png");
        assert_eq!(record.locations[1].filename, "b.png");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_round_trip_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let db = temp_dir.path().join("nested").join("fingerprints.json");

        let (mut store, warning) = FingerprintStore::load(&db);
        assert!(matches!(warning, Some(StoreLoadError::Missing { .. })));

        store
            .upsert(key("k1"), fp("aa_bb_cc"), "a.png", location("/x/a.png", 10))
            .unwrap();
        store
            .upsert(key("k2"), fp("11_22_33"), "b.png", location("/x/b.png", 20))
            .unwrap();
        store
            .upsert(key("k1"), fp("aa_bb_cc"), "a.png", location("/z/a.png", 10))
            .unwrap();

        let (reloaded, warning) = FingerprintStore::load(&db);
        assert!(warning.is_none());

        let before: Vec<_> = store.all().collect();
        let after: Vec<_> = reloaded.all().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_corrupt_file_yields_empty_store_and_backup() {
        let temp_dir = TempDir::new().unwrap();
        let db = temp_dir.path().join("fingerprints.json");
        fs::write(&db, b"{ this is not json").unwrap();

        let (store, warning) = FingerprintStore::load(&db);
        assert!(store.is_empty());
        match warning {
            Some(StoreLoadError::Corrupt { backup, .. }) => {
                let backup = backup.unwrap();
                assert_eq!(fs::read(&backup).unwrap(), b"{ this is not json");
            }
            other => panic!("expected corrupt warning, got {other:?}"),
        }
        assert!(!db.exists());
    }

    #[test]
    fn test_non_utf8_file_is_backed_up() {
        let temp_dir = TempDir::new().unwrap();
        let db = temp_dir.path().join("fingerprints.json");
        let original: &[u8] = b"{\"k\": \xff\xfe garbage}";
        fs::write(&db, original).unwrap();

        let (mut store, warning) = FingerprintStore::load(&db);
        let backup = match warning {
            Some(StoreLoadError::Corrupt {
                backup: Some(backup),
                ..
            }) => backup,
            other => panic!("expected corrupt warning with backup, got {other:?}"),
        };
        assert_eq!(fs::read(&backup).unwrap(), original);

        store
            .upsert(key("k1"), fp("aa_bb_cc"), "a.png", location("/x/a.png", 10))
            .unwrap();
        assert_eq!(fs::read(&backup).unwrap(), original);
        assert_eq!(FingerprintStore::load(&db).0.len(), 1);
    }

    #[test]
    fn test_unreadable_file_is_never_overwritten() {
        let temp_dir = TempDir::new().unwrap();
        // A directory exists at the path but cannot be read as a file.
        let db = temp_dir.path().join("fingerprints.json");
        fs::create_dir(&db).unwrap();
        fs::write(db.join("keep.txt"), b"data").unwrap();

        let (mut store, warning) = FingerprintStore::load(&db);
        assert!(matches!(warning, Some(StoreLoadError::Read { .. })));
        assert!(store.is_read_only());
        assert!(store.is_empty());

        let err = store
            .upsert(key("k1"), fp("aa_bb_cc"), "a.png", location("/x/a.png", 10))
            .unwrap_err();
        assert!(matches!(err, StoreWriteError::Unreadable { .. }));
        assert!(store.is_empty());
        assert!(matches!(store.clear(true), Err(StoreError::Write(_))));
        assert_eq!(fs::read(db.join("keep.txt")).unwrap(), b"data");
    }

    #[test]
    fn test_missing_count_is_derived_from_locations() {
        let temp_dir = TempDir::new().unwrap();
        let db = temp_dir.path().join("fingerprints.json");
        fs::write(
            &db,
            r#"{
  "a": {"fingerprint": "aa_bb_cc", "locations": [
    {"path": "/1/a.jpg"}, {"path": "/2/a.jpg"}, {"path": "/3/a.jpg"}
  ]},
  "b": {"fingerprint": "aa_bb_cc"},
  "c": {"fingerprint": "aa_bb_cc", "count": 7, "locations": [{"path": "/1/c.jpg"}]}
}"#,
        )
        .unwrap();

        let (store, warning) = FingerprintStore::load(&db);
        assert!(warning.is_none());
        assert_eq!(store.get(&key("a")).unwrap().count, 3);
        assert_eq!(store.get(&key("b")).unwrap().count, 1);
        assert_eq!(store.get(&key("c")).unwrap().count, 7);
    }

    #[test]
    fn test_wrong_shape_is_corrupt() {
        let temp_dir = TempDir::new().unwrap();
        let db = temp_dir.path().join("fingerprints.json");
        fs::write(&db, b"[1, 2, 3]").unwrap();

        let (store, warning) = FingerprintStore::load(&db);
        assert!(store.is_empty());
        assert!(matches!(warning, Some(StoreLoadError::Corrupt { .. })));
    }

    #[test]
    fn test_optional_and_unknown_fields() {
        let temp_dir = TempDir::new().unwrap();
        let db = temp_dir.path().join("fingerprints.json");
        fs::write(
            &db,
            r#"{
  "0123456789abcdef": {
    "fingerprint": "aa_bb_cc",
    "first_seen": "2024-03-01T10:20:30.123456",
    "locations": [{"path": "/old/a.jpg", "filename": "a.jpg", "timestamp": "2024-03-01T10:20:30"}],
    "tags": ["holiday"]
  }
}"#,
        )
        .unwrap();

        let (store, warning) = FingerprintStore::load(&db);
        assert!(warning.is_none());
        let record = store.get(&key("0123456789abcdef")).unwrap();
        assert_eq!(record.count, 1);
        assert_eq!(record.original_filename, "");
        assert_eq!(record.locations[0].size, 0);
        assert_eq!(record.extra.get("tags"), Some(&serde_json::json!(["holiday"])));

        store.persist().unwrap();
        let rewritten: Value = serde_json::from_str(&fs::read_to_string(&db).unwrap()).unwrap();
        assert_eq!(rewritten["0123456789abcdef"]["tags"], serde_json::json!(["holiday"]));
    }

    #[test]
    fn test_timestamp_parsing() {
        let utc = timestamp::parse("2024-03-01T10:20:30Z").unwrap();
        assert_eq!(utc, Utc.with_ymd_and_hms(2024, 3, 1, 10, 20, 30).unwrap());

        let offset = timestamp::parse("2024-03-01T12:20:30+02:00").unwrap();
        assert_eq!(offset, utc);

        assert!(timestamp::parse("2024-03-01T10:20:30.5").is_some());
        assert!(timestamp::parse("yesterday").is_none());
    }

    #[test]
    fn test_clear_requires_confirmation() {
        let temp_dir = TempDir::new().unwrap();
        let db = temp_dir.path().join("fingerprints.json");
        let mut store = FingerprintStore::empty_at(&db);
        store
            .upsert(key("k1"), fp("aa_bb_cc"), "a.png", location("/x/a.png", 10))
            .unwrap();

        let err = store.clear(false).unwrap_err();
        assert!(matches!(err, StoreError::ConfirmationRequired));
        assert_eq!(store.len(), 1);
        assert_eq!(FingerprintStore::load(&db).0.len(), 1);

        assert_eq!(store.clear(true).unwrap(), 1);
        assert!(store.is_empty());
        let (reloaded, warning) = FingerprintStore::load(&db);
        assert!(warning.is_none());
        assert!(reloaded.is_empty());
    }

    #[test]
    fn test_failed_write_keeps_previous_file() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("not-a-dir");
        fs::write(&blocker, b"file").unwrap();

        // Parent of the database is a regular file, so staging must fail.
        let mut store = FingerprintStore::empty_at(blocker.join("fingerprints.json"));
        let result = store.upsert(key("k1"), fp("aa_bb_cc"), "a.png", location("/x/a.png", 10));

        assert!(result.is_err());
        assert!(store.is_empty());
        assert_eq!(fs::read(&blocker).unwrap(), b"file");
    }

    #[test]
    fn test_failed_write_rolls_back_update() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("not-a-dir");
        fs::write(&blocker, b"file").unwrap();

        let mut store = FingerprintStore::in_memory();
        store
            .upsert(key("k1"), fp("aa_bb_cc"), "a.png", location("/x/a.png", 10))
            .unwrap();
        store.path = Some(blocker.join("fingerprints.json"));

        assert!(store
            .upsert(key("k1"), fp("aa_bb_cc"), "a.png", location("/y/a.png", 10))
            .is_err());
        let record = store.get(&key("k1")).unwrap();
        assert_eq!(record.count, 1);
        assert_eq!(record.locations.len(), 1);
    }

    #[test]
    fn test_info_reports_file_state() {
        let temp_dir = TempDir::new().unwrap();
        let db = temp_dir.path().join("fingerprints.json");
        let mut store = FingerprintStore::empty_at(&db);

        let info = store.info();
        assert!(!info.exists);
        assert_eq!(info.records, 0);

        store
            .upsert(key("k1"), fp("aa_bb_cc"), "a.png", location("/x/a.png", 10))
            .unwrap();
        let info = store.info();
        assert!(info.exists);
        assert!(info.size_bytes > 0);
        assert_eq!(info.records, 1);
        assert!(info.modified.is_some());
    }

    #[test]
    fn test_recent_locations() {
        let mut store = FingerprintStore::in_memory();
        for i in 0..5 {
            store
                .upsert(key("k1"), fp("aa_bb_cc"), "a.png", location(&format!("/{i}/a.png"), 1))
                .unwrap();
        }
        let record = store.get(&key("k1")).unwrap();
        let recent: Vec<_> = record.recent_locations(3).iter().map(|l| l.path.as_str()).collect();
        assert_eq!(recent, ["/2/a.png", "/3/a.png", "/4/a.png"]);
        assert_eq!(record.recent_locations(10).len(), 5);
    }
}
