//! Async store of application profiles

use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::kv::{AppDb, Kv};
use super::{DB_FILE_NAME, NAMESPACES_DIR};
use crate::error::StoreError;
use crate::profile::{profile_key, ApplicationProfile, PortForwardRecord, PROFILE_KEY_MARKER};
use crate::time::now_timestamp;
use crate::types::{AppRef, ForwardKey, PortForwardStatus};

/// Default free-page threshold before a database is vacuumed
const DEFAULT_COMPACT_FREE_PAGES: u32 = 256;

/// Profile documents of every application under one data directory
///
/// Mutations of one application's document are serialized by a per-app lock
/// and run inside an immediate SQLite transaction, so concurrent status
/// writes and stops in this process, or in the other daemon instance, never
/// lose each other's updates.
pub struct ProfileStore {
    root: PathBuf,
    locks: DashMap<AppRef, Arc<Mutex<()>>>,
    compact_free_pages: u32,
}

impl ProfileStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: data_dir.into(),
            locks: DashMap::new(),
            compact_free_pages: DEFAULT_COMPACT_FREE_PAGES,
        }
    }

    pub fn with_compact_threshold(mut self, free_pages: u32) -> Self {
        self.compact_free_pages = free_pages;
        self
    }

    /// Database file of an application
    pub fn db_path(&self, app: &AppRef) -> PathBuf {
        self.root
            .join(NAMESPACES_DIR)
            .join(&app.namespace)
            .join(&app.application)
            .join(DB_FILE_NAME)
    }

    /// Database file of a validated application
    fn checked_path(&self, app: &AppRef) -> Result<PathBuf, StoreError> {
        app.validate()?;
        Ok(self.db_path(app))
    }

    fn lock_for(&self, app: &AppRef) -> Arc<Mutex<()>> {
        self.locks
            .entry(app.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Read an application's profile
    pub async fn load(&self, app: &AppRef) -> Result<Option<ApplicationProfile>, StoreError> {
        let path = self.checked_path(app)?;
        let app = app.clone();
        blocking(move || {
            let Some(db) = AppDb::open_existing(&path)? else {
                return Ok(None);
            };
            Ok(db.read(|kv| read_profile(kv, &app))?.map(|(_, p)| p))
        })
        .await
    }

    /// Read-modify-write an existing profile
    pub async fn update<T, F>(&self, app: &AppRef, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ApplicationProfile) -> Result<T, StoreError> + Send + 'static,
    {
        self.mutate(app, false, move |profile| f(profile).map(|out| (out, true)))
            .await?
            .ok_or_else(|| not_found(app))
    }

    /// Core read-modify-write
    ///
    /// `f` returns its result and whether the document changed; an unchanged
    /// document is not rewritten. Returns `None` when the profile is missing
    /// and `create_missing` is false.
    async fn mutate<T, F>(
        &self,
        app: &AppRef,
        create_missing: bool,
        f: F,
    ) -> Result<Option<T>, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ApplicationProfile) -> Result<(T, bool), StoreError> + Send + 'static,
    {
        let lock = self.lock_for(app);
        let _guard = lock.lock().await;

        let path = self.checked_path(app)?;
        let app = app.clone();
        let threshold = self.compact_free_pages;
        blocking(move || {
            let mut db = if create_missing {
                AppDb::open(&path)?
            } else {
                match AppDb::open_existing(&path)? {
                    Some(db) => db,
                    None => return Ok(None),
                }
            };
            db.compact_if_needed(threshold)?;

            db.write(|kv| {
                let (found_key, mut profile) = match read_profile(kv, &app)? {
                    Some(found) => found,
                    None if create_missing => (
                        None,
                        ApplicationProfile::new(&app.namespace, &app.application),
                    ),
                    None => return Ok(None),
                };

                let (out, dirty) = f(&mut profile)?;
                let primary = profile_key(&app.namespace, &app.application);
                let migrated = found_key.as_deref().is_some_and(|k| k != primary);
                if dirty || migrated {
                    let blob = serde_yaml::to_string(&profile).map_err(StoreError::Encode)?;
                    kv.put(&primary, blob.as_bytes())?;
                    if let Some(old) = found_key.filter(|_| migrated) {
                        tracing::debug!(app = %app, old_key = %old, "Migrated profile key");
                        kv.delete(&old)?;
                    }
                }
                Ok(Some(out))
            })
        })
        .await
    }

    /// Record for `key`, with the service it belongs to
    pub async fn find_record(
        &self,
        app: &AppRef,
        key: ForwardKey,
    ) -> Result<Option<(String, PortForwardRecord)>, StoreError> {
        Ok(self.load(app).await?.and_then(|profile| {
            profile
                .find_record(key)
                .map(|(svc, rec)| (svc.actual_name.clone(), rec.clone()))
        }))
    }

    /// Persist a new record, creating the profile when missing
    ///
    /// Fails with `RecordExists` if the key is already present.
    pub async fn add_record(
        &self,
        app: &AppRef,
        service: &str,
        service_type: &str,
        record: PortForwardRecord,
    ) -> Result<(), StoreError> {
        let service = service.to_string();
        let service_type = service_type.to_string();
        self.mutate(app, true, move |profile| {
            let key = record.key();
            if profile.find_record(key).is_some() {
                return Err(StoreError::RecordExists {
                    local_port: key.local_port,
                    remote_port: key.remote_port,
                });
            }
            profile.upsert_record(&service, &service_type, record);
            Ok(((), true))
        })
        .await
        .map(|_| ())
    }

    /// Persist a record, replacing any existing one for its key
    pub async fn upsert_record(
        &self,
        app: &AppRef,
        service: &str,
        service_type: &str,
        record: PortForwardRecord,
    ) -> Result<(), StoreError> {
        let service = service.to_string();
        let service_type = service_type.to_string();
        self.mutate(app, true, move |profile| {
            profile.upsert_record(&service, &service_type, record);
            Ok(((), true))
        })
        .await
        .map(|_| ())
    }

    /// Set status and reason of a record
    ///
    /// Returns whether anything was written. A missing record is left
    /// missing: a tunnel that was stopped meanwhile is not resurrected.
    pub async fn update_status(
        &self,
        app: &AppRef,
        key: ForwardKey,
        status: PortForwardStatus,
        reason: &str,
    ) -> Result<bool, StoreError> {
        let reason = reason.to_string();
        let written = self
            .mutate(app, false, move |profile| {
                let Some(record) = profile.find_record_mut(key) else {
                    return Ok((false, false));
                };
                if record.status == status && record.reason == reason {
                    return Ok((false, false));
                }
                record.status = status;
                record.reason = reason;
                record.updated_at = now_timestamp();
                Ok((true, true))
            })
            .await?;
        Ok(written.unwrap_or(false))
    }

    /// Delete a record; returns whether one existed
    pub async fn remove_record(&self, app: &AppRef, key: ForwardKey) -> Result<bool, StoreError> {
        let removed = self
            .mutate(app, false, move |profile| {
                let removed = profile.remove_record(key);
                Ok((removed, removed))
            })
            .await?;
        Ok(removed.unwrap_or(false))
    }

    /// Every application that has a profile database
    pub async fn list_all_applications(&self) -> Result<Vec<AppRef>, StoreError> {
        let ns_root = self.root.join(NAMESPACES_DIR);
        blocking(move || {
            let mut apps = Vec::new();
            let namespaces = match std::fs::read_dir(&ns_root) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(apps),
                Err(e) => return Err(e.into()),
            };

            for ns_entry in namespaces {
                let ns_entry = ns_entry?;
                if !ns_entry.file_type()?.is_dir() {
                    continue;
                }
                let namespace = ns_entry.file_name().to_string_lossy().into_owned();
                for app_entry in std::fs::read_dir(ns_entry.path())? {
                    let app_entry = app_entry?;
                    if app_entry.path().join(DB_FILE_NAME).is_file() {
                        let application = app_entry.file_name().to_string_lossy().into_owned();
                        apps.push(AppRef::new(namespace.clone(), application));
                    }
                }
            }
            apps.sort();
            Ok(apps)
        })
        .await
    }

    /// Kubeconfig recorded in an application's profile
    pub async fn kubeconfig(&self, app: &AppRef) -> Result<Option<PathBuf>, StoreError> {
        Ok(self.load(app).await?.and_then(|p| p.kubeconfig))
    }

    /// Vacuum an application's database
    pub async fn compact(&self, app: &AppRef) -> Result<(), StoreError> {
        let lock = self.lock_for(app);
        let _guard = lock.lock().await;

        let path = self.checked_path(app)?;
        blocking(move || match AppDb::open_existing(&path)? {
            Some(db) => db.compact(),
            None => Ok(()),
        })
        .await
    }
}

/// Locate and decode the profile blob
///
/// Falls back to any key containing the profile marker for databases
/// written by older layouts. Returns the key it was found under.
fn read_profile(
    kv: &Kv<'_>,
    app: &AppRef,
) -> Result<Option<(Option<String>, ApplicationProfile)>, StoreError> {
    let primary = profile_key(&app.namespace, &app.application);
    let (key, blob) = match kv.get(&primary)? {
        Some(blob) => (primary, blob),
        None => {
            let Some(legacy) = kv
                .keys()?
                .into_iter()
                .find(|k| k.contains(PROFILE_KEY_MARKER))
            else {
                return Ok(None);
            };
            match kv.get(&legacy)? {
                Some(blob) => (legacy, blob),
                None => return Ok(None),
            }
        }
    };

    let profile: ApplicationProfile =
        serde_yaml::from_slice(&blob).map_err(StoreError::Decode)?;
    Ok(Some((Some(key), profile)))
}

fn not_found(app: &AppRef) -> StoreError {
    StoreError::ProfileNotFound {
        namespace: app.namespace.clone(),
        application: app.application.clone(),
    }
}

async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}
