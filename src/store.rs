//! Persistent credential store.
//!
//! Records are never removed: deleting one only flags it, so ids stay unique
//! for the life of the data file. Every mutation is a read-modify-write of
//! the whole collection, serialized by a single writer lock, and is published
//! to readers only after the backend has durably saved it.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::{
    normalize_secret,
    totp::{Totp, DEFAULT_DIGITS, DEFAULT_PERIOD},
    uri::OtpAuthUri,
    OtpError, OtpHashAlgorithm,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    Validation(String),
    #[error("Credential {0} not found")]
    NotFound(String),
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A stored credential, including its secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub note: String,
    pub secret: String,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub algorithm: OtpHashAlgorithm,
    #[serde(default = "default_digits")]
    pub digits: u32,
    #[serde(default = "default_period")]
    pub period: u64,
}

fn default_digits() -> u32 {
    DEFAULT_DIGITS
}

fn default_period() -> u64 {
    DEFAULT_PERIOD
}

impl CredentialRecord {
    pub fn summary(&self) -> CredentialSummary {
        CredentialSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            note: self.note.clone(),
            order: self.order,
        }
    }

    /// The otpauth URI for this credential, labelled with its name.
    pub fn otpauth_uri(&self) -> OtpAuthUri {
        let mut entry = OtpAuthUri::new(&self.name, &self.secret);
        entry.algorithm = self.algorithm;
        entry.digits = self.digits;
        entry.period = self.period;

        entry
    }

    /// Generator configured with this credential's parameters.
    pub fn totp(&self) -> Totp {
        self.otpauth_uri().to_totp()
    }
}

/// What list views get to see. Has no secret field to leak.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CredentialSummary {
    pub id: String,
    pub name: String,
    pub note: String,
    pub order: i64,
}

/// Partial edit. The secret is deliberately absent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialUpdate {
    pub name: Option<String>,
    pub note: Option<String>,
    pub order: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderAssignment {
    pub id: String,
    pub order: i64,
}

/// On-disk layout: `{"items": [...]}`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    items: Vec<CredentialRecord>,
}

/// Where the full record collection is loaded from and saved to.
pub trait Backend: Send + Sync {
    fn load(&self) -> Result<Vec<CredentialRecord>, StoreError>;

    /// Replaces the persisted collection. Must not return before the write is durable.
    fn save(&self, records: &[CredentialRecord]) -> Result<(), StoreError>;
}

/// A single JSON file, rewritten wholesale through a temporary sibling and a rename.
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl Backend for JsonFileBackend {
    fn load(&self) -> Result<Vec<CredentialRecord>, StoreError> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "Creating empty credential file");
            self.save(&[])?;
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path)?;
        let document: StoreDocument = serde_json::from_str(&content)?;
        debug!(path = %self.path.display(), records = document.items.len(), "Loaded credentials");

        Ok(document.items)
    }

    fn save(&self, records: &[CredentialRecord]) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let body = serde_json::to_vec_pretty(&serde_json::json!({ "items": records }))?;
        let tmp = self.tmp_path();
        {
            use std::io::Write;
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        Ok(())
    }
}

/// Keeps the collection in memory only.
#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<Vec<CredentialRecord>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<CredentialRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }
}

impl Backend for MemoryBackend {
    fn load(&self) -> Result<Vec<CredentialRecord>, StoreError> {
        Ok(self.records.lock().clone())
    }

    fn save(&self, records: &[CredentialRecord]) -> Result<(), StoreError> {
        *self.records.lock() = records.to_vec();
        Ok(())
    }
}

pub struct SecretStore {
    backend: Box<dyn Backend>,
    records: RwLock<Vec<CredentialRecord>>,
    writer: Mutex<()>,
}

impl SecretStore {
    /// Loads the whole collection from `backend`.
    pub fn open(backend: impl Backend + 'static) -> Result<Self, StoreError> {
        let records = backend.load()?;
        info!(
            total = records.len(),
            active = records.iter().filter(|r| !r.deleted).count(),
            "Credential store opened"
        );

        Ok(Self {
            backend: Box::new(backend),
            records: RwLock::new(records),
            writer: Mutex::new(()),
        })
    }

    /// Active credentials without their secrets, by ascending order then insertion.
    pub fn list_active(&self) -> Vec<CredentialSummary> {
        self.active_records().iter().map(CredentialRecord::summary).collect()
    }

    /// Active credentials with their secrets, in display order.
    pub fn active_records(&self) -> Vec<CredentialRecord> {
        let mut active: Vec<CredentialRecord> = self
            .records
            .read()
            .iter()
            .filter(|r| !r.deleted)
            .cloned()
            .collect();
        active.sort_by_key(|r| r.order);

        active
    }

    pub fn get_active(&self, id: &str) -> Result<CredentialRecord, StoreError> {
        self.records
            .read()
            .iter()
            .find(|r| r.id == id && !r.deleted)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Every record ever stored, deleted ones included, in insertion order.
    pub fn records(&self) -> Vec<CredentialRecord> {
        self.records.read().clone()
    }

    /// Adds a default SHA1, 6-digit, 30-second credential and returns its id.
    pub fn add(&self, name: &str, note: &str, secret: &str) -> Result<String, StoreError> {
        Ok(self.add_totp(name, note, &Totp::new(secret))?.id)
    }

    /// Adds a credential carrying `totp`'s secret and parameters.
    pub fn add_totp(
        &self,
        name: &str,
        note: &str,
        totp: &Totp,
    ) -> Result<CredentialRecord, StoreError> {
        let name = validate_name(name)?;
        let totp = validate_totp(totp)?;

        let record = self.transact(|records| {
            let mut id = uuid::Uuid::new_v4().to_string();
            while records.iter().any(|r| r.id == id) {
                id = uuid::Uuid::new_v4().to_string();
            }

            let order = records.iter().map(|r| r.order).max().map_or(1, |max| max + 1);

            let record = CredentialRecord {
                id,
                name,
                note: note.to_string(),
                secret: totp.secret,
                order,
                deleted: false,
                created_at: Utc::now(),
                algorithm: totp.algorithm,
                digits: totp.digits,
                period: totp.period,
            };
            records.push(record.clone());

            Ok(record)
        })?;

        info!(id = %record.id, "Credential added");
        Ok(record)
    }

    pub fn update(&self, id: &str, update: CredentialUpdate) -> Result<(), StoreError> {
        let name = update.name.as_deref().map(validate_name).transpose()?;

        self.transact(|records| {
            let record = find_active_mut(records, id)?;

            if let Some(name) = name {
                record.name = name;
            }
            if let Some(note) = update.note {
                record.note = note;
            }
            if let Some(order) = update.order {
                record.order = order;
            }

            Ok(())
        })?;

        info!(%id, "Credential updated");
        Ok(())
    }

    /// Overwrites the order of each listed active credential. Unknown and
    /// deleted ids are skipped.
    pub fn reorder(&self, assignments: &[OrderAssignment]) -> Result<(), StoreError> {
        let applied = self.transact(|records| {
            let mut applied = 0usize;
            for assignment in assignments {
                if let Ok(record) = find_active_mut(records, &assignment.id) {
                    record.order = assignment.order;
                    applied += 1;
                } else {
                    debug!(id = %assignment.id, "Ignoring reorder of unknown credential");
                }
            }

            Ok(applied)
        })?;

        info!(applied, requested = assignments.len(), "Credentials reordered");
        Ok(())
    }

    pub fn soft_delete(&self, id: &str) -> Result<(), StoreError> {
        self.transact(|records| {
            find_active_mut(records, id)?.deleted = true;
            Ok(())
        })?;

        info!(%id, "Credential deleted");
        Ok(())
    }

    /// Applies `mutate` to a copy of the collection, persists the copy and
    /// only then publishes it. On any error the published state is unchanged.
    fn transact<T>(
        &self,
        mutate: impl FnOnce(&mut Vec<CredentialRecord>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _writer = self.writer.lock();

        let mut next = self.records.read().clone();
        let out = mutate(&mut next)?;

        if let Err(e) = self.backend.save(&next) {
            error!(error = %e, "Failed to persist credentials");
            return Err(e);
        }

        *self.records.write() = next;
        Ok(out)
    }
}

fn find_active_mut<'a>(
    records: &'a mut [CredentialRecord],
    id: &str,
) -> Result<&'a mut CredentialRecord, StoreError> {
    records
        .iter_mut()
        .find(|r| r.id == id && !r.deleted)
        .ok_or_else(|| StoreError::NotFound(id.to_string()))
}

fn validate_name(name: &str) -> Result<String, StoreError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(StoreError::Validation("Name is required".into()));
    }

    Ok(name.to_string())
}

fn validate_totp(totp: &Totp) -> Result<Totp, StoreError> {
    let secret = normalize_secret(&totp.secret);
    if secret.is_empty() {
        return Err(StoreError::Validation("Secret is required".into()));
    }

    let totp = Totp {
        secret,
        ..totp.clone()
    };
    totp.generate(0).map_err(|e| match e {
        OtpError::SecretDecode(_) => StoreError::Validation(format!("Invalid secret format: {e}")),
        other => StoreError::Validation(format!("Invalid OTP parameters: {other}")),
    })?;

    Ok(totp)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use pretty_assertions::assert_eq;
    use rstest::{fixture, rstest};

    use super::*;

    const GITHUB_SECRET: &str = "JBSWY3DPEHPK3PXP";

    #[fixture]
    fn store() -> SecretStore {
        SecretStore::open(MemoryBackend::new()).unwrap()
    }

    fn ids(store: &SecretStore) -> Vec<String> {
        store.list_active().into_iter().map(|s| s.id).collect()
    }

    /// Fails every save while the switch is on.
    struct FlakyBackend {
        inner: MemoryBackend,
        failing: Arc<AtomicBool>,
    }

    impl Backend for FlakyBackend {
        fn load(&self) -> Result<Vec<CredentialRecord>, StoreError> {
            self.inner.load()
        }

        fn save(&self, records: &[CredentialRecord]) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into());
            }
            self.inner.save(records)
        }
    }

    #[rstest]
    fn add_github_credential(store: SecretStore) {
        let id = store.add("GitHub", "", GITHUB_SECRET).unwrap();

        let listed = store.list_active();
        assert_eq!(1, listed.len());
        assert_eq!(
            CredentialSummary {
                id: id.clone(),
                name: "GitHub".into(),
                note: "".into(),
                order: 1,
            },
            listed[0]
        );

        let record = store.get_active(&id).unwrap();
        assert_eq!(GITHUB_SECRET, record.secret);
        assert!(!record.deleted);
    }

    #[rstest]
    fn add_normalizes_name_and_secret(store: SecretStore) {
        let id = store.add("  GitHub  ", "work", "jbsw y3dp ehpk 3pxp").unwrap();

        let record = store.get_active(&id).unwrap();
        assert_eq!("GitHub", record.name);
        assert_eq!("work", record.note);
        assert_eq!(GITHUB_SECRET, record.secret);
    }

    #[rstest]
    #[case("", GITHUB_SECRET)]
    #[case("   ", GITHUB_SECRET)]
    #[case("GitHub", "")]
    #[case("GitHub", "not base32!")]
    #[case("GitHub", "ABC")]
    fn add_rejects_invalid_input(store: SecretStore, #[case] name: &str, #[case] secret: &str) {
        store.add("Existing", "", GITHUB_SECRET).unwrap();

        assert!(matches!(
            store.add(name, "", secret),
            Err(StoreError::Validation(_))
        ));
        assert_eq!(1, store.list_active().len());
        assert_eq!(1, store.records().len());
    }

    #[rstest]
    fn add_totp_keeps_parameters(store: SecretStore) {
        let mut totp = Totp::new("jbswy3dpehpk3pxp");
        totp.with_algorithm(OtpHashAlgorithm::SHA256)
            .with_digits(8)
            .with_period(60);

        let record = store.add_totp("Bank", "", &totp).unwrap();

        let stored = store.get_active(&record.id).unwrap();
        assert_eq!(record, stored);
        assert_eq!(GITHUB_SECRET, stored.secret);
        assert_eq!(OtpHashAlgorithm::SHA256, stored.algorithm);
        assert_eq!(8, stored.digits);
        assert_eq!(60, stored.period);
        assert_eq!("96023015", stored.totp().generate(59).unwrap().to_string());
    }

    #[rstest]
    #[case(0, 30)]
    #[case(10, 30)]
    #[case(6, 0)]
    fn add_totp_rejects_unusable_parameters(
        store: SecretStore,
        #[case] digits: u32,
        #[case] period: u64,
    ) {
        let mut totp = Totp::new(GITHUB_SECRET);
        totp.with_digits(digits).with_period(period);

        assert!(matches!(
            store.add_totp("Bank", "", &totp),
            Err(StoreError::Validation(_))
        ));
        assert!(store.records().is_empty());
    }

    #[rstest]
    fn orders_follow_max_plus_one_including_deleted(store: SecretStore) {
        let a = store.add("A", "", GITHUB_SECRET).unwrap();
        let b = store.add("B", "", GITHUB_SECRET).unwrap();
        store.soft_delete(&b).unwrap();
        store
            .update(&a, CredentialUpdate { order: Some(10), ..Default::default() })
            .unwrap();

        let c = store.add("C", "", GITHUB_SECRET).unwrap();

        assert_eq!(11, store.get_active(&c).unwrap().order);
    }

    #[rstest]
    fn ties_keep_insertion_order(store: SecretStore) {
        let a = store.add("A", "", GITHUB_SECRET).unwrap();
        let b = store.add("B", "", GITHUB_SECRET).unwrap();
        let c = store.add("C", "", GITHUB_SECRET).unwrap();

        store
            .reorder(&[
                OrderAssignment { id: a.clone(), order: 5 },
                OrderAssignment { id: b.clone(), order: 5 },
                OrderAssignment { id: c.clone(), order: 1 },
            ])
            .unwrap();

        assert_eq!(vec![c, a, b], ids(&store));
    }

    #[rstest]
    fn update_is_partial(store: SecretStore) {
        let id = store.add("GitHub", "old note", GITHUB_SECRET).unwrap();

        store
            .update(&id, CredentialUpdate { note: Some("new note".into()), ..Default::default() })
            .unwrap();

        let record = store.get_active(&id).unwrap();
        assert_eq!("GitHub", record.name);
        assert_eq!("new note", record.note);
        assert_eq!(1, record.order);
        assert_eq!(GITHUB_SECRET, record.secret);
    }

    #[rstest]
    fn update_rejects_blank_name(store: SecretStore) {
        let id = store.add("GitHub", "", GITHUB_SECRET).unwrap();

        assert!(matches!(
            store.update(&id, CredentialUpdate { name: Some(" ".into()), ..Default::default() }),
            Err(StoreError::Validation(_))
        ));
        assert_eq!("GitHub", store.get_active(&id).unwrap().name);
    }

    #[rstest]
    fn update_unknown_or_deleted_is_not_found(store: SecretStore) {
        let id = store.add("GitHub", "", GITHUB_SECRET).unwrap();
        store.soft_delete(&id).unwrap();

        assert!(matches!(
            store.update("missing", CredentialUpdate::default()),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.update(&id, CredentialUpdate { name: Some("X".into()), ..Default::default() }),
            Err(StoreError::NotFound(_))
        ));
    }

    #[rstest]
    fn reorder_ignores_unknown_ids(store: SecretStore) {
        let a = store.add("A", "", GITHUB_SECRET).unwrap();
        let b = store.add("B", "", GITHUB_SECRET).unwrap();
        let c = store.add("C", "", GITHUB_SECRET).unwrap();

        store
            .reorder(&[
                OrderAssignment { id: c.clone(), order: 1 },
                OrderAssignment { id: "ghost".into(), order: 2 },
                OrderAssignment { id: b.clone(), order: 3 },
                OrderAssignment { id: a.clone(), order: 4 },
            ])
            .unwrap();

        assert_eq!(vec![c, b, a], ids(&store));
        assert_eq!(3, store.records().len());
        assert!(store.records().iter().all(|r| r.id != "ghost"));
    }

    #[rstest]
    fn reorder_skips_deleted_records(store: SecretStore) {
        let a = store.add("A", "", GITHUB_SECRET).unwrap();
        store.soft_delete(&a).unwrap();

        store.reorder(&[OrderAssignment { id: a.clone(), order: 99 }]).unwrap();

        assert_eq!(1, store.records()[0].order);
    }

    #[rstest]
    fn delete_twice_is_not_found(store: SecretStore) {
        let id = store.add("GitHub", "", GITHUB_SECRET).unwrap();

        store.soft_delete(&id).unwrap();

        assert!(matches!(store.soft_delete(&id), Err(StoreError::NotFound(_))));
        assert!(matches!(store.get_active(&id), Err(StoreError::NotFound(_))));
        assert!(store.list_active().is_empty());

        let all = store.records();
        assert_eq!(1, all.len());
        assert!(all[0].deleted);
    }

    #[rstest]
    fn ids_are_never_reused(store: SecretStore) {
        let first = store.add("A", "", GITHUB_SECRET).unwrap();
        store.soft_delete(&first).unwrap();

        let second = store.add("A", "", GITHUB_SECRET).unwrap();

        assert_ne!(first, second);
    }

    #[rstest]
    fn list_never_serializes_secret(store: SecretStore) {
        store.add("GitHub", "note", GITHUB_SECRET).unwrap();

        let json = serde_json::to_string(&store.list_active()).unwrap();

        assert!(!json.contains("secret"));
        assert!(!json.contains(GITHUB_SECRET));
    }

    #[test]
    fn failed_save_leaves_state_untouched() {
        let failing = Arc::new(AtomicBool::new(false));
        let store = SecretStore::open(FlakyBackend {
            inner: MemoryBackend::new(),
            failing: failing.clone(),
        })
        .unwrap();
        let id = store.add("GitHub", "", GITHUB_SECRET).unwrap();

        failing.store(true, Ordering::SeqCst);

        assert!(matches!(store.add("Other", "", GITHUB_SECRET), Err(StoreError::Io(_))));
        assert!(matches!(store.soft_delete(&id), Err(StoreError::Io(_))));
        assert!(matches!(
            store.update(&id, CredentialUpdate { name: Some("Renamed".into()), ..Default::default() }),
            Err(StoreError::Io(_))
        ));

        assert_eq!(1, store.records().len());
        let record = store.get_active(&id).unwrap();
        assert_eq!("GitHub", record.name);
        assert!(!record.deleted);
    }

    #[test]
    fn concurrent_adds_are_serialized() {
        let store = Arc::new(SecretStore::open(MemoryBackend::new()).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for j in 0..10 {
                        store.add(&format!("cred-{i}-{j}"), "", GITHUB_SECRET).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut orders: Vec<i64> = store.records().iter().map(|r| r.order).collect();
        orders.sort();
        assert_eq!((1..=80).collect::<Vec<i64>>(), orders);
    }

    #[test]
    fn json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("2fa_data.json");

        let (kept, deleted) = {
            let store = SecretStore::open(JsonFileBackend::new(&path)).unwrap();
            let kept = store.add("GitHub", "personal", GITHUB_SECRET).unwrap();
            let deleted = store.add("Old", "", GITHUB_SECRET).unwrap();
            store.soft_delete(&deleted).unwrap();
            (kept, deleted)
        };

        let reopened = SecretStore::open(JsonFileBackend::new(&path)).unwrap();

        assert_eq!(vec![kept.clone()], ids(&reopened));
        assert_eq!("personal", reopened.get_active(&kept).unwrap().note);
        let all = reopened.records();
        assert_eq!(2, all.len());
        assert!(all.iter().any(|r| r.id == deleted && r.deleted));
    }

    #[test]
    fn json_file_is_created_on_first_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2fa_data.json");

        let store = SecretStore::open(JsonFileBackend::new(&path)).unwrap();

        assert!(store.list_active().is_empty());
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            serde_json::json!({ "items": [] }),
            serde_json::from_str::<serde_json::Value>(&content).unwrap()
        );
    }

    #[test]
    fn reads_existing_camel_case_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2fa_data.json");
        std::fs::write(
            &path,
            r#"{"items":[{"id":"1700000000000","name":"GitHub","note":"","secret":"JBSWY3DPEHPK3PXP","order":1,"deleted":false,"createdAt":"2023-11-14T22:13:20.000Z"}]}"#,
        )
        .unwrap();

        let store = SecretStore::open(JsonFileBackend::new(&path)).unwrap();

        let record = store.get_active("1700000000000").unwrap();
        assert_eq!("GitHub", record.name);
        assert_eq!(1, record.order);
        assert_eq!(OtpHashAlgorithm::SHA1, record.algorithm);
        assert_eq!(6, record.digits);
        assert_eq!(30, record.period);
    }

    #[test]
    fn corrupt_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2fa_data.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            SecretStore::open(JsonFileBackend::new(&path)),
            Err(StoreError::Serialization(_))
        ));
    }
}
