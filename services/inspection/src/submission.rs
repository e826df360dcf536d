//! Inspection submission: shipper creation, draft containers and the
//! upload-then-insert write path.

use crate::error::{LocationError, Result, ValidationError};
use crate::models::{Container, GeoPoint, NewContainer, PhotoField, Shipper};
use crate::photo_store::{content_type_for, object_path, PhotoStore, StoredPhoto};
use crate::record_store::RecordStore;
use crate::session::Session;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// How a draft treats a failed geolocation lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationPolicy {
    /// The draft is not created without coordinates
    Required,
    /// The draft is created with null coordinates
    BestEffort,
}

/// One container being filled in on the form
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerDraft {
    container_photo: Option<Vec<u8>>,
    commodity_photo: Option<Vec<u8>>,
    ispm_photo: Option<Vec<u8>>,
    location: Option<GeoPoint>,
}

impl ContainerDraft {
    pub fn new(location: Option<GeoPoint>) -> Self {
        Self {
            location,
            ..Self::default()
        }
    }

    /// Start a draft from a geolocation result
    pub fn from_location(
        result: std::result::Result<GeoPoint, LocationError>,
        policy: LocationPolicy,
    ) -> std::result::Result<Self, LocationError> {
        match (result, policy) {
            (Ok(point), _) => Ok(Self::new(Some(point))),
            (Err(e), LocationPolicy::BestEffort) => {
                warn!(error = %e, "Location unavailable, continuing without coordinates");
                Ok(Self::new(None))
            }
            (Err(e), LocationPolicy::Required) => Err(e),
        }
    }

    pub fn location(&self) -> Option<GeoPoint> {
        self.location
    }

    pub fn photo(&self, field: PhotoField) -> Option<&[u8]> {
        match field {
            PhotoField::ContainerNumber => self.container_photo.as_deref(),
            PhotoField::Commodity => self.commodity_photo.as_deref(),
            PhotoField::Ispm => self.ispm_photo.as_deref(),
        }
    }

    pub fn set_photo(&mut self, field: PhotoField, bytes: Vec<u8>) {
        let slot = match field {
            PhotoField::ContainerNumber => &mut self.container_photo,
            PhotoField::Commodity => &mut self.commodity_photo,
            PhotoField::Ispm => &mut self.ispm_photo,
        };
        *slot = Some(bytes);
    }

    pub fn is_complete(&self) -> bool {
        PhotoField::ALL.iter().all(|f| self.photo(*f).is_some())
    }
}

/// Decode a camera capture: base64 JPEG, optionally as a data URL
pub fn decode_capture(capture: &str) -> std::result::Result<Vec<u8>, String> {
    let data = match capture.split_once(";base64,") {
        Some((_, data)) => data,
        None => capture,
    };

    let bytes = STANDARD.decode(data.trim()).map_err(|e| e.to_string())?;
    if bytes.is_empty() {
        return Err("empty capture".to_string());
    }
    Ok(bytes)
}

/// Shipper selection plus the drafts being submitted
#[derive(Debug, Clone, Default)]
pub struct SubmissionForm {
    pub shipper_id: Option<Uuid>,
    containers: Vec<ContainerDraft>,
}

impl SubmissionForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select_shipper(&mut self, shipper_id: Uuid) {
        self.shipper_id = Some(shipper_id);
    }

    /// Add a draft for the multi-container flow, which needs a location.
    /// Returns the draft count.
    pub fn add_container(
        &mut self,
        location: std::result::Result<GeoPoint, LocationError>,
    ) -> std::result::Result<usize, LocationError> {
        let draft = ContainerDraft::from_location(location, LocationPolicy::Required)?;
        self.containers.push(draft);
        Ok(self.containers.len())
    }

    pub fn push_draft(&mut self, draft: ContainerDraft) -> usize {
        self.containers.push(draft);
        self.containers.len()
    }

    /// `index` is 0-based
    pub fn remove_container(&mut self, index: usize) -> Option<ContainerDraft> {
        (index < self.containers.len()).then(|| self.containers.remove(index))
    }

    /// Attach a base64 capture to draft `index` (0-based)
    pub fn attach_photo(
        &mut self,
        index: usize,
        field: PhotoField,
        capture: &str,
    ) -> std::result::Result<(), ValidationError> {
        let draft = self
            .containers
            .get_mut(index)
            .ok_or(ValidationError::UnknownDraft { index: index + 1 })?;
        let bytes = decode_capture(capture).map_err(|reason| ValidationError::InvalidPhoto {
            index: index + 1,
            reason,
        })?;
        draft.set_photo(field, bytes);
        Ok(())
    }

    pub fn containers(&self) -> &[ContainerDraft] {
        &self.containers
    }

    /// Check the form is ready to submit; returns the selected shipper
    pub fn validate(&self) -> std::result::Result<Uuid, ValidationError> {
        let shipper_id = match self.shipper_id {
            Some(id) if !self.containers.is_empty() => id,
            _ => return Err(ValidationError::MissingShipperOrContainers),
        };

        if let Some(position) = self.containers.iter().position(|d| !d.is_complete()) {
            return Err(ValidationError::IncompletePhotos { index: position + 1 });
        }

        Ok(shipper_id)
    }
}

/// Result of a successful submission
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionReceipt {
    pub containers: Vec<Container>,
    pub uploaded_photos: usize,
    pub message: String,
}

/// Writes new shippers and inspected containers
pub struct Submitter {
    records: Arc<dyn RecordStore>,
    photos: Arc<dyn PhotoStore>,
    upload_concurrency: usize,
}

impl Submitter {
    pub fn new(
        records: Arc<dyn RecordStore>,
        photos: Arc<dyn PhotoStore>,
        upload_concurrency: usize,
    ) -> Self {
        Self {
            records,
            photos,
            upload_concurrency: upload_concurrency.max(1),
        }
    }

    #[instrument(skip(self, session), fields(user_id = %session.user.id))]
    pub async fn create_shipper(&self, session: &Session, name: &str) -> Result<Shipper> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::EmptyShipperName.into());
        }

        let shipper = self
            .records
            .create_shipper(session.user.id, name.to_string())
            .await?;

        info!(shipper_id = %shipper.id, "Shipper baru dibuat");
        metrics::counter!("inspection.shippers.created").increment(1);
        Ok(shipper)
    }

    /// Upload every photo, then insert all rows in one batch.
    ///
    /// Nothing touches the network until the form validates. Any failure
    /// aborts the whole submission and removes photos it already uploaded.
    #[instrument(
        skip(self, session, form),
        fields(user_id = %session.user.id, drafts = form.containers().len())
    )]
    pub async fn submit(
        &self,
        session: &Session,
        form: &SubmissionForm,
    ) -> Result<SubmissionReceipt> {
        let shipper_id = form.validate()?;
        let user_id = session.user.id;
        let timestamp_ms = Utc::now().timestamp_millis();

        let jobs: Vec<(usize, PhotoField, String, Vec<u8>)> = form
            .containers()
            .iter()
            .enumerate()
            .flat_map(|(index, draft)| {
                PhotoField::ALL.into_iter().filter_map(move |field| {
                    draft.photo(field).map(|bytes| {
                        (
                            index,
                            field,
                            object_path(user_id, field, timestamp_ms, index),
                            bytes.to_vec(),
                        )
                    })
                })
            })
            .collect();

        let results: Vec<_> = stream::iter(jobs)
            .map(|(index, field, path, bytes)| {
                let photos = self.photos.clone();
                async move {
                    let result = photos.upload_photo(bytes, &path, content_type_for("jpg")).await;
                    (index, field, result)
                }
            })
            .buffer_unordered(self.upload_concurrency)
            .collect()
            .await;

        let mut uploaded: HashMap<(usize, PhotoField), StoredPhoto> = HashMap::new();
        let mut first_error = None;
        for (index, field, result) in results {
            match result {
                Ok(photo) => {
                    uploaded.insert((index, field), photo);
                }
                Err(e) => {
                    warn!(index, ?field, error = %e, "Photo upload failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            self.discard_uploads(uploaded.into_values()).await;
            metrics::counter!("inspection.submissions.failed").increment(1);
            return Err(e.into());
        }

        let url = |index: usize, field: PhotoField| {
            uploaded.get(&(index, field)).map(|p| p.url.clone())
        };
        let batch: Vec<NewContainer> = form
            .containers()
            .iter()
            .enumerate()
            .map(|(index, draft)| NewContainer {
                shipper_id,
                user_id,
                container_photo_url: url(index, PhotoField::ContainerNumber),
                commodity_photo_url: url(index, PhotoField::Commodity),
                ispm_photo_url: url(index, PhotoField::Ispm),
                latitude: draft.location().map(|p| p.latitude),
                longitude: draft.location().map(|p| p.longitude),
            })
            .collect();

        let uploaded_photos = uploaded.len();
        let containers = match self.records.create_containers(batch).await {
            Ok(containers) => containers,
            Err(e) => {
                warn!(error = %e, "Container insert failed");
                self.discard_uploads(uploaded.into_values()).await;
                metrics::counter!("inspection.submissions.failed").increment(1);
                return Err(e.into());
            }
        };

        metrics::counter!("inspection.submissions.completed").increment(1);
        info!(
            shipper_id = %shipper_id,
            containers = containers.len(),
            uploaded_photos,
            "Submission stored"
        );

        Ok(SubmissionReceipt {
            message: format!("{} container berhasil disimpan!", containers.len()),
            containers,
            uploaded_photos,
        })
    }

    async fn discard_uploads(&self, photos: impl Iterator<Item = StoredPhoto>) {
        let deletions = photos.map(|photo| async move {
            if let Err(e) = self.photos.delete_photo(&photo.path).await {
                warn!(path = %photo.path, error = %e, "Failed to remove orphaned photo");
            }
        });
        join_all(deletions).await;
    }
}
