//! In-memory record and photo stores.
//!
//! Test doubles for the Postgres and S3 backends. Both can inject a per-call
//! latency and per-operation failures, which the unit tests drive with a
//! paused clock.

use crate::error::{SigningError, StoreError, UploadError, ValidationError};
use crate::models::{Container, ContainerPatch, LegacyEntry, NewContainer, Role, Shipper};
use crate::photo_store::{PhotoStore, SignedUrl, StoredPhoto};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Record store operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    ListShippers,
    ListContainers,
    CreateShipper,
    CreateContainer,
    UpdateContainer,
    DeleteContainer,
    DeleteShipper,
    HasRole,
}

#[derive(Default)]
struct Tables {
    shippers: Vec<Shipper>,
    containers: Vec<Container>,
    roles: HashSet<(Uuid, Role)>,
    entries: Vec<LegacyEntry>,
}

/// Record store held in process memory
#[derive(Default)]
pub struct InMemoryRecordStore {
    tables: Mutex<Tables>,
    failures: Mutex<HashSet<StoreOperation>>,
    latency: Mutex<Duration>,
    container_inserts: AtomicUsize,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied to every call
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = latency;
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn fail(&self, operation: StoreOperation, failing: bool) {
        let mut failures = self.failures.lock();
        if failing {
            failures.insert(operation);
        } else {
            failures.remove(&operation);
        }
    }

    pub fn grant_role(&self, user_id: Uuid, role: Role) {
        self.tables.lock().roles.insert((user_id, role));
    }

    pub fn seed_shipper(&self, user_id: Uuid, name: &str, created_at: DateTime<Utc>) -> Shipper {
        let shipper = Shipper {
            id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            created_at,
        };
        self.tables.lock().shippers.push(shipper.clone());
        shipper
    }

    pub fn seed_container(&self, fields: NewContainer, created_at: DateTime<Utc>) -> Container {
        let container = build_container(fields, created_at);
        self.tables.lock().containers.push(container.clone());
        container
    }

    pub fn seed_legacy_entry(&self, entry: LegacyEntry) {
        self.tables.lock().entries.push(entry);
    }

    /// Rows written through `create_container(s)` since construction
    pub fn container_inserts(&self) -> usize {
        self.container_inserts.load(Ordering::SeqCst)
    }

    pub fn container_count(&self) -> usize {
        self.tables.lock().containers.len()
    }

    pub fn shipper_count(&self) -> usize {
        self.tables.lock().shippers.len()
    }

    async fn call(&self, operation: StoreOperation) -> Result<(), StoreError> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.failures.lock().contains(&operation) {
            return Err(StoreError::Unavailable(format!("{operation:?} failed")));
        }
        Ok(())
    }
}

fn build_container(fields: NewContainer, created_at: DateTime<Utc>) -> Container {
    Container {
        id: Uuid::new_v4(),
        shipper_id: fields.shipper_id,
        user_id: fields.user_id,
        container_photo_url: fields.container_photo_url,
        commodity_photo_url: fields.commodity_photo_url,
        ispm_photo_url: fields.ispm_photo_url,
        latitude: fields.latitude,
        longitude: fields.longitude,
        created_at,
        custom_timestamp: None,
        verified: false,
        verified_at: None,
        verified_by: None,
    }
}

/// Newest first; rows inserted later win ties
fn newest_first<T>(mut rows: Vec<T>, created_at: impl Fn(&T) -> DateTime<Utc>) -> Vec<T> {
    rows.reverse();
    rows.sort_by(|a, b| created_at(b).cmp(&created_at(a)));
    rows
}

#[async_trait]
impl crate::record_store::RecordStore for InMemoryRecordStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn list_shippers(&self) -> Result<Vec<Shipper>, StoreError> {
        self.call(StoreOperation::ListShippers).await?;
        let shippers = self.tables.lock().shippers.clone();
        Ok(newest_first(shippers, |s| s.created_at))
    }

    async fn create_shipper(&self, user_id: Uuid, name: String) -> Result<Shipper, StoreError> {
        self.call(StoreOperation::CreateShipper).await?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::EmptyShipperName.into());
        }
        Ok(self.seed_shipper(user_id, name, Utc::now()))
    }

    async fn delete_shipper(&self, id: Uuid) -> Result<(), StoreError> {
        self.call(StoreOperation::DeleteShipper).await?;
        let mut tables = self.tables.lock();
        if tables.containers.iter().any(|c| c.shipper_id == id) {
            return Err(StoreError::Unavailable(format!(
                "shipper {id} still has containers"
            )));
        }
        let before = tables.shippers.len();
        tables.shippers.retain(|s| s.id != id);
        if tables.shippers.len() == before {
            return Err(StoreError::NotFound {
                entity: "shipper",
                id,
            });
        }
        Ok(())
    }

    async fn delete_shipper_cascade(&self, id: Uuid) -> Result<u64, StoreError> {
        self.call(StoreOperation::DeleteShipper).await?;
        let mut tables = self.tables.lock();
        if !tables.shippers.iter().any(|s| s.id == id) {
            return Err(StoreError::NotFound {
                entity: "shipper",
                id,
            });
        }
        let before = tables.containers.len();
        tables.containers.retain(|c| c.shipper_id != id);
        let removed = (before - tables.containers.len()) as u64;
        tables.shippers.retain(|s| s.id != id);
        Ok(removed)
    }

    async fn list_containers(&self, shipper_id: Uuid) -> Result<Vec<Container>, StoreError> {
        self.call(StoreOperation::ListContainers).await?;
        let containers: Vec<Container> = self
            .tables
            .lock()
            .containers
            .iter()
            .filter(|c| c.shipper_id == shipper_id)
            .cloned()
            .collect();
        Ok(newest_first(containers, |c| c.created_at))
    }

    async fn create_container(&self, fields: NewContainer) -> Result<Container, StoreError> {
        let mut created = self.create_containers(vec![fields]).await?;
        created.pop().ok_or_else(|| StoreError::Unavailable("empty insert".to_string()))
    }

    async fn create_containers(
        &self,
        batch: Vec<NewContainer>,
    ) -> Result<Vec<Container>, StoreError> {
        self.call(StoreOperation::CreateContainer).await?;
        let mut tables = self.tables.lock();

        for fields in &batch {
            if !tables.shippers.iter().any(|s| s.id == fields.shipper_id) {
                return Err(StoreError::InvalidReference {
                    shipper_id: fields.shipper_id,
                });
            }
        }

        let created: Vec<Container> = batch
            .into_iter()
            .map(|fields| build_container(fields, Utc::now()))
            .collect();
        tables.containers.extend(created.iter().cloned());
        self.container_inserts.fetch_add(created.len(), Ordering::SeqCst);
        Ok(created)
    }

    async fn delete_container(&self, id: Uuid) -> Result<(), StoreError> {
        self.call(StoreOperation::DeleteContainer).await?;
        let mut tables = self.tables.lock();
        let before = tables.containers.len();
        tables.containers.retain(|c| c.id != id);
        if tables.containers.len() == before {
            return Err(StoreError::NotFound {
                entity: "container",
                id,
            });
        }
        Ok(())
    }

    async fn delete_containers_for_shipper(&self, shipper_id: Uuid) -> Result<u64, StoreError> {
        self.call(StoreOperation::DeleteContainer).await?;
        let mut tables = self.tables.lock();
        let before = tables.containers.len();
        tables.containers.retain(|c| c.shipper_id != shipper_id);
        Ok((before - tables.containers.len()) as u64)
    }

    async fn update_container(
        &self,
        id: Uuid,
        patch: ContainerPatch,
    ) -> Result<Container, StoreError> {
        self.call(StoreOperation::UpdateContainer).await?;
        let mut tables = self.tables.lock();
        let container = tables
            .containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(StoreError::NotFound {
                entity: "container",
                id,
            })?;
        patch.apply(container);
        Ok(container.clone())
    }

    async fn has_role(&self, user_id: Uuid, role: Role) -> Result<bool, StoreError> {
        self.call(StoreOperation::HasRole).await?;
        Ok(self.tables.lock().roles.contains(&(user_id, role)))
    }

    async fn list_legacy_entries(&self) -> Result<Vec<LegacyEntry>, StoreError> {
        let entries = self.tables.lock().entries.clone();
        Ok(newest_first(entries, |e| e.created_at))
    }

    async fn delete_legacy_entry(&self, id: Uuid) -> Result<(), StoreError> {
        self.tables.lock().entries.retain(|e| e.id != id);
        Ok(())
    }
}

/// Photo store held in process memory
pub struct InMemoryPhotoStore {
    bucket: String,
    public_base_url: String,
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
    latency: Mutex<Duration>,
    failing_sign_paths: Mutex<HashSet<String>>,
    quota_bytes: Mutex<Option<usize>>,
    uploads: AtomicUsize,
}

impl InMemoryPhotoStore {
    pub fn new(bucket: &str, public_base_url: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            objects: Mutex::new(HashMap::new()),
            latency: Mutex::new(Duration::ZERO),
            failing_sign_paths: Mutex::new(HashSet::new()),
            quota_bytes: Mutex::new(None),
            uploads: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = latency;
        self
    }

    /// Make signing fail for one object path
    pub fn fail_signing(&self, path: &str) {
        self.failing_sign_paths.lock().insert(path.to_string());
    }

    /// Reject uploads once stored bytes would exceed `bytes`
    pub fn set_quota(&self, bytes: Option<usize>) {
        *self.quota_bytes.lock() = bytes;
    }

    /// Successful uploads since construction
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects.lock().contains_key(path)
    }

    async fn delay(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl PhotoStore for InMemoryPhotoStore {
    fn bucket(&self) -> String {
        self.bucket.clone()
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.public_base_url, self.bucket, path)
    }

    async fn upload_photo(
        &self,
        bytes: Vec<u8>,
        path: &str,
        content_type: &str,
    ) -> Result<StoredPhoto, UploadError> {
        self.delay().await;
        let mut objects = self.objects.lock();

        if objects.contains_key(path) {
            return Err(UploadError::Conflict {
                path: path.to_string(),
            });
        }

        if let Some(quota) = *self.quota_bytes.lock() {
            let used: usize = objects.values().map(|(b, _)| b.len()).sum();
            if used + bytes.len() > quota {
                return Err(UploadError::QuotaExceeded {
                    path: path.to_string(),
                });
            }
        }

        let size_bytes = bytes.len();
        objects.insert(path.to_string(), (bytes, content_type.to_string()));
        self.uploads.fetch_add(1, Ordering::SeqCst);

        Ok(StoredPhoto {
            path: path.to_string(),
            url: self.public_url(path),
            size_bytes,
        })
    }

    async fn sign_url(&self, path: &str, ttl: Duration) -> Result<SignedUrl, SigningError> {
        self.delay().await;
        if self.failing_sign_paths.lock().contains(path) {
            return Err(SigningError::Failed {
                path: path.to_string(),
                message: "signing rejected".to_string(),
            });
        }

        let lifetime = chrono::Duration::from_std(ttl).map_err(|e| SigningError::Failed {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        let expires_at = Utc::now() + lifetime;

        Ok(SignedUrl {
            url: format!(
                "{}/sign/{}/{}?expires={}",
                self.public_base_url,
                self.bucket,
                path,
                expires_at.timestamp()
            ),
            expires_at,
        })
    }

    async fn delete_photo(&self, path: &str) -> Result<(), UploadError> {
        self.objects.lock().remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_store::RecordStore;
    use chrono::TimeZone;

    fn new_container(shipper_id: Uuid, user_id: Uuid) -> NewContainer {
        NewContainer {
            shipper_id,
            user_id,
            container_photo_url: None,
            commodity_photo_url: None,
            ispm_photo_url: None,
            latitude: None,
            longitude: None,
        }
    }

    #[tokio::test]
    async fn test_lists_are_newest_first() {
        let store = InMemoryRecordStore::new();
        let user = Uuid::new_v4();
        let january = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let february = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let older = store.seed_shipper(user, "PT Lama", january);
        let newer = store.seed_shipper(user, "PT Baru", february);

        let shippers = store.list_shippers().await.unwrap();
        assert_eq!(shippers[0].id, newer.id);
        assert_eq!(shippers[1].id, older.id);
    }

    #[tokio::test]
    async fn test_legacy_entries_list_and_delete() {
        let store = InMemoryRecordStore::new();
        let user = Uuid::new_v4();
        let entry = |shipper: &str, day: u32| LegacyEntry {
            id: Uuid::new_v4(),
            user_id: user,
            shipper: shipper.to_string(),
            container_photo_url: None,
            commodity_photo_url: None,
            ispm_photo_url: None,
            latitude: None,
            longitude: None,
            created_at: Utc.with_ymd_and_hms(2023, 5, day, 0, 0, 0).unwrap(),
        };
        let old = entry("PT Lama", 1);
        let recent = entry("CV Baru", 9);
        store.seed_legacy_entry(old.clone());
        store.seed_legacy_entry(recent.clone());

        let entries = store.list_legacy_entries().await.unwrap();
        assert_eq!(entries, vec![recent.clone(), old.clone()]);

        store.delete_legacy_entry(old.id).await.unwrap();
        assert_eq!(store.list_legacy_entries().await.unwrap(), vec![recent]);
        // legacy rows never show up as shippers
        assert_eq!(store.shipper_count(), 0);
    }

    #[tokio::test]
    async fn test_plain_shipper_delete_requires_containers_removed() {
        let store = InMemoryRecordStore::new();
        let user = Uuid::new_v4();
        let shipper = store.seed_shipper(user, "PT A", Utc::now());
        store.seed_container(new_container(shipper.id, user), Utc::now());

        assert!(store.delete_shipper(shipper.id).await.is_err());
        assert_eq!(store.delete_containers_for_shipper(shipper.id).await.unwrap(), 1);
        assert!(store.delete_shipper(shipper.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_batch_insert_is_all_or_nothing() {
        let store = InMemoryRecordStore::new();
        let user = Uuid::new_v4();
        let shipper = store.seed_shipper(user, "PT A", Utc::now());

        let result = store
            .create_containers(vec![
                new_container(shipper.id, user),
                new_container(Uuid::new_v4(), user),
            ])
            .await;

        assert!(matches!(result, Err(StoreError::InvalidReference { .. })));
        assert_eq!(store.container_count(), 0);
    }

    #[tokio::test]
    async fn test_upload_conflict_and_quota() {
        let store = InMemoryPhotoStore::new("ispm-photos", "https://s.example.com/public");
        store.upload_photo(vec![1, 2, 3], "u/a.jpg", "image/jpeg").await.unwrap();

        let err = store.upload_photo(vec![1], "u/a.jpg", "image/jpeg").await.unwrap_err();
        assert!(matches!(err, UploadError::Conflict { .. }));

        store.set_quota(Some(4));
        let err = store.upload_photo(vec![1, 2], "u/b.jpg", "image/jpeg").await.unwrap_err();
        assert!(matches!(err, UploadError::QuotaExceeded { .. }));
        assert_eq!(store.upload_count(), 1);
    }
}
