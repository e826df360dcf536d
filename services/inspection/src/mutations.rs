//! Admin-gated record mutations.
//!
//! Every mutation checks the session's cached admin flag first, then
//! performs the remote write and, only on success, runs a full refresh.
//! A failed write leaves the published snapshot as it was.

use crate::aggregator::{Aggregator, RefreshOutcome};
use crate::error::{Result, ValidationError};
use crate::models::ContainerPatch;
use crate::session::Session;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::{info, instrument};
use uuid::Uuid;

/// Explicit user confirmation for destructive actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confirmation {
    Confirmed,
    Unconfirmed,
}

impl Confirmation {
    fn require(self, target: &'static str) -> std::result::Result<(), ValidationError> {
        match self {
            Confirmation::Confirmed => Ok(()),
            Confirmation::Unconfirmed => Err(ValidationError::ConfirmationRequired(target)),
        }
    }
}

impl From<bool> for Confirmation {
    fn from(confirmed: bool) -> Self {
        if confirmed {
            Confirmation::Confirmed
        } else {
            Confirmation::Unconfirmed
        }
    }
}

impl Aggregator {
    #[instrument(skip(self, session), fields(user_id = %session.user.id))]
    pub async fn verify_container(
        &self,
        session: &Session,
        container_id: Uuid,
    ) -> Result<RefreshOutcome> {
        session.require_admin()?;

        let patch = ContainerPatch::verify(session.user.id, Utc::now());
        self.records.update_container(container_id, patch).await?;

        info!(container_id = %container_id, "Container verified");
        metrics::counter!("inspection.containers.verified").increment(1);
        Ok(self.refresh().await)
    }

    #[instrument(skip(self, session), fields(user_id = %session.user.id))]
    pub async fn delete_container(
        &self,
        session: &Session,
        container_id: Uuid,
        confirmation: Confirmation,
    ) -> Result<RefreshOutcome> {
        session.require_admin()?;
        confirmation.require("container")?;

        self.records.delete_container(container_id).await?;

        info!(container_id = %container_id, "Container deleted");
        metrics::counter!("inspection.containers.deleted").increment(1);
        Ok(self.refresh().await)
    }

    /// Delete a shipper together with all of its containers
    #[instrument(skip(self, session), fields(user_id = %session.user.id))]
    pub async fn delete_shipper(
        &self,
        session: &Session,
        shipper_id: Uuid,
        confirmation: Confirmation,
    ) -> Result<RefreshOutcome> {
        session.require_admin()?;
        confirmation.require("shipper")?;

        let containers = self.records.delete_shipper_cascade(shipper_id).await?;

        metrics::counter!("inspection.containers.deleted").increment(containers);
        metrics::counter!("inspection.shippers.deleted").increment(1);
        Ok(self.refresh().await)
    }

    /// Set or clear (`None`) the display timestamp override
    #[instrument(skip(self, session), fields(user_id = %session.user.id))]
    pub async fn update_timestamp(
        &self,
        session: &Session,
        container_id: Uuid,
        custom_timestamp: Option<DateTime<Utc>>,
    ) -> Result<RefreshOutcome> {
        session.require_admin()?;

        self.records
            .update_container(container_id, ContainerPatch::custom_timestamp(custom_timestamp))
            .await?;

        info!(
            container_id = %container_id,
            cleared = custom_timestamp.is_none(),
            "Timestamp updated"
        );
        Ok(self.refresh().await)
    }
}

/// Parse a timestamp editor value.
///
/// Empty input clears the override. RFC 3339 values keep their offset;
/// `datetime-local` values (`2024-08-05T09:30`) carry no zone and are read
/// in `local`, the offset the labels are rendered in.
pub fn parse_timestamp_input(
    input: Option<&str>,
    local: FixedOffset,
) -> std::result::Result<Option<DateTime<Utc>>, ValidationError> {
    let value = match input.map(str::trim) {
        None | Some("") => return Ok(None),
        Some(value) => value,
    };

    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(Some(ts.with_timezone(&Utc)));
    }

    ["%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .and_then(|naive| local.from_local_datetime(&naive).single())
        .map(|ts| Some(ts.with_timezone(&Utc)))
        .ok_or_else(|| ValidationError::InvalidTimestamp(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AuthError, Error, StoreError};
    use crate::memory::{InMemoryPhotoStore, InMemoryRecordStore, StoreOperation};
    use crate::models::{NewContainer, UserIdentity};
    use crate::record_store::{MockRecordStore, RecordStore};
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn session(is_admin: bool) -> Session {
        Session {
            user: UserIdentity {
                id: Uuid::new_v4(),
                email: Some("admin@example.com".to_string()),
            },
            is_admin,
            established_at: Utc::now(),
        }
    }

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

    fn setup() -> (Arc<InMemoryRecordStore>, Aggregator) {
        let records = Arc::new(InMemoryRecordStore::new());
        let agg = Aggregator::new(
            records.clone(),
            Arc::new(InMemoryPhotoStore::new("ispm-photos", "http://localhost:54321")),
            Duration::from_secs(3600),
        );
        (records, agg)
    }

    #[tokio::test]
    async fn test_verify_sets_audit_fields() {
        let (records, agg) = setup();
        let admin = session(true);
        let shipper = records.seed_shipper(admin.user.id, "PT Verif", Utc::now());
        let fields = new_container(shipper.id, admin.user.id);
        let container = records.seed_container(fields, Utc::now());

        let outcome = assert_ok!(agg.verify_container(&admin, container.id).await);
        assert!(outcome.is_ready());

        let snapshot = agg.snapshot();
        let view = snapshot.container(container.id).unwrap();
        assert!(view.container.verified);
        assert_eq!(view.container.verified_by, Some(admin.user.id));
        assert!(view.container.verified_at.is_some());
        assert!(view.container.verification_consistent());
    }

    #[tokio::test]
    async fn test_non_admin_is_rejected_before_any_call() {
        // no expectations: any store call panics
        let records = MockRecordStore::new();
        let agg = Aggregator::new(
            Arc::new(records),
            Arc::new(InMemoryPhotoStore::new("ispm-photos", "http://localhost:54321")),
            Duration::from_secs(3600),
        );
        let user = session(false);
        let id = Uuid::new_v4();

        let err = assert_err!(agg.verify_container(&user, id).await);
        assert!(matches!(err, Error::Auth(AuthError::AdminRequired)));

        let err = assert_err!(agg.delete_container(&user, id, Confirmation::Confirmed).await);
        assert_eq!(err.code(), "ADMIN_REQUIRED");

        let err = assert_err!(agg.delete_shipper(&user, id, Confirmation::Confirmed).await);
        assert_eq!(err.code(), "ADMIN_REQUIRED");

        let err = assert_err!(agg.update_timestamp(&user, id, None).await);
        assert_eq!(err.code(), "ADMIN_REQUIRED");
    }

    #[tokio::test]
    async fn test_unconfirmed_delete_issues_no_call() {
        let (records, agg) = setup();
        let admin = session(true);
        let shipper = records.seed_shipper(admin.user.id, "PT Ragu", Utc::now());
        let fields = new_container(shipper.id, admin.user.id);
        let container = records.seed_container(fields, Utc::now());

        let err = assert_err!(
            agg.delete_container(&admin, container.id, Confirmation::Unconfirmed)
                .await
        );
        assert_eq!(err.code(), "CONFIRMATION_REQUIRED");
        assert_eq!(records.container_count(), 1);

        let err = assert_err!(agg.delete_shipper(&admin, shipper.id, false.into()).await);
        assert_eq!(err.code(), "CONFIRMATION_REQUIRED");
        assert_eq!(records.shipper_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_shipper_removes_containers() {
        let (records, agg) = setup();
        let admin = session(true);
        let shipper = records.seed_shipper(admin.user.id, "PT Hapus", Utc::now());
        records.seed_container(new_container(shipper.id, admin.user.id), Utc::now());
        records.seed_container(new_container(shipper.id, admin.user.id), Utc::now());
        agg.refresh().await;
        assert_eq!(agg.snapshot().container_count(), 2);

        let outcome = assert_ok!(
            agg.delete_shipper(&admin, shipper.id, Confirmation::Confirmed)
                .await
        );

        assert!(outcome.is_ready());
        assert_eq!(agg.snapshot().shipper_count(), 0);
        assert_eq!(records.container_count(), 0);
        assert!(assert_ok!(records.list_containers(shipper.id).await).is_empty());
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_snapshot() {
        let (records, agg) = setup();
        let admin = session(true);
        let shipper = records.seed_shipper(admin.user.id, "PT Gagal", Utc::now());
        let fields = new_container(shipper.id, admin.user.id);
        let container = records.seed_container(fields, Utc::now());
        agg.refresh().await;
        let before = agg.snapshot();

        records.fail(StoreOperation::UpdateContainer, true);
        let err = assert_err!(agg.verify_container(&admin, container.id).await);

        assert!(matches!(err, Error::Store(StoreError::Unavailable(_))));
        assert_eq!(agg.snapshot(), before);
        assert!(!agg.snapshot().container(container.id).unwrap().container.verified);
    }

    #[tokio::test]
    async fn test_timestamp_set_and_cleared() {
        let (records, agg) = setup();
        let admin = session(true);
        let shipper = records.seed_shipper(admin.user.id, "PT Waktu", Utc::now());
        let fields = new_container(shipper.id, admin.user.id);
        let container = records.seed_container(fields, Utc::now());
        let custom = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 0).unwrap();

        assert_ok!(agg.update_timestamp(&admin, container.id, Some(custom)).await);
        let snapshot = agg.snapshot();
        let view = snapshot.container(container.id).unwrap();
        assert_eq!(view.display_timestamp, custom);
        // labels render in WIB
        assert_eq!(view.timestamp_label, "Custom: 02 Jan 2024 10:04");

        assert_ok!(agg.update_timestamp(&admin, container.id, None).await);
        let snapshot = agg.snapshot();
        let view = snapshot.container(container.id).unwrap();
        assert_eq!(view.container.custom_timestamp, None);
        assert_eq!(view.display_timestamp, view.container.created_at);
    }

    fn wib() -> FixedOffset {
        FixedOffset::east_opt(7 * 3600).unwrap()
    }

    #[test]
    fn test_parse_timestamp_input() {
        assert_eq!(parse_timestamp_input(None, wib()), Ok(None));
        assert_eq!(parse_timestamp_input(Some("  "), wib()), Ok(None));

        let expected = Utc.with_ymd_and_hms(2024, 8, 5, 9, 30, 0).unwrap();
        assert_eq!(
            parse_timestamp_input(Some("2024-08-05T16:30:00+07:00"), wib()),
            Ok(Some(expected))
        );
        assert_eq!(
            parse_timestamp_input(Some("2024-08-05T09:30:00Z"), wib()),
            Ok(Some(expected))
        );
        assert!(matches!(
            parse_timestamp_input(Some("kemarin"), wib()),
            Err(ValidationError::InvalidTimestamp(_))
        ));
    }

    #[tokio::test]
    async fn test_local_input_is_current_and_not_in_future() {
        // 09:30 WIB entered in the editor at 02:30Z
        let now = Utc.with_ymd_and_hms(2024, 8, 5, 2, 30, 0).unwrap();
        let stored = parse_timestamp_input(Some("2024-08-05T09:30"), wib())
            .unwrap()
            .unwrap();
        assert_eq!(stored, now);

        let (records, agg) = setup();
        let admin = session(true);
        let shipper = records.seed_shipper(admin.user.id, "PT Lokal", now);
        let container = records.seed_container(new_container(shipper.id, admin.user.id), now);

        assert_ok!(agg.update_timestamp(&admin, container.id, Some(stored)).await);
        let snapshot = agg.snapshot();
        let view = snapshot.container(container.id).unwrap();
        assert_eq!(view.timestamp_label, "Custom: 05 Agu 2024 09:30");
        assert!(!view.age_label.starts_with('-'));
    }
}
