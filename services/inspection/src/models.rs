use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A named grouping of inspected containers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Shipper {
    pub id: Uuid,
    /// Owner who created the shipper
    pub user_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// One inspected shipping container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Container {
    pub id: Uuid,
    pub shipper_id: Uuid,
    pub user_id: Uuid,
    pub container_photo_url: Option<String>,
    pub commodity_photo_url: Option<String>,
    pub ispm_photo_url: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Insertion time, never rewritten
    pub created_at: DateTime<Utc>,
    /// Display override for `created_at`
    pub custom_timestamp: Option<DateTime<Utc>>,
    pub verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub verified_by: Option<Uuid>,
}

impl Container {
    /// Stored URL for one of the three evidentiary photos
    pub fn photo_url(&self, field: PhotoField) -> Option<&str> {
        match field {
            PhotoField::ContainerNumber => self.container_photo_url.as_deref(),
            PhotoField::Commodity => self.commodity_photo_url.as_deref(),
            PhotoField::Ispm => self.ispm_photo_url.as_deref(),
        }
    }

    pub fn location(&self) -> Option<GeoPoint> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(GeoPoint {
                latitude,
                longitude,
            }),
            _ => None,
        }
    }

    /// Timestamp shown to users: the custom override when set
    pub fn display_timestamp(&self) -> DateTime<Utc> {
        self.custom_timestamp.unwrap_or(self.created_at)
    }

    /// `verified` implies both audit fields are present
    pub fn verification_consistent(&self) -> bool {
        !self.verified || (self.verified_at.is_some() && self.verified_by.is_some())
    }
}

/// Fields for a container insert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewContainer {
    pub shipper_id: Uuid,
    pub user_id: Uuid,
    pub container_photo_url: Option<String>,
    pub commodity_photo_url: Option<String>,
    pub ispm_photo_url: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Partial update of a container row.
///
/// Only constructible through [`ContainerPatch::verify`] and
/// [`ContainerPatch::custom_timestamp`], so a verify patch always carries
/// its audit fields.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerPatch {
    verification: Option<(DateTime<Utc>, Uuid)>,
    custom_timestamp: Option<Option<DateTime<Utc>>>,
}

impl ContainerPatch {
    /// Mark verified by `actor` at `at`
    pub fn verify(actor: Uuid, at: DateTime<Utc>) -> Self {
        Self {
            verification: Some((at, actor)),
            ..Default::default()
        }
    }

    /// Set (`Some`) or clear (`None`) the display timestamp override
    pub fn custom_timestamp(value: Option<DateTime<Utc>>) -> Self {
        Self {
            custom_timestamp: Some(value),
            ..Default::default()
        }
    }

    pub fn verification(&self) -> Option<(DateTime<Utc>, Uuid)> {
        self.verification
    }

    /// Outer `None` leaves the column untouched
    pub fn custom_timestamp_change(&self) -> Option<Option<DateTime<Utc>>> {
        self.custom_timestamp
    }

    /// Apply to an in-memory row
    pub fn apply(&self, container: &mut Container) {
        if let Some((at, actor)) = self.verification {
            container.verified = true;
            container.verified_at = Some(at);
            container.verified_by = Some(actor);
        }
        if let Some(value) = self.custom_timestamp {
            container.custom_timestamp = value;
        }
    }
}

/// Flat record from the superseded schema, shipper as free text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct LegacyEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub shipper: String,
    pub container_photo_url: Option<String>,
    pub commodity_photo_url: Option<String>,
    pub ispm_photo_url: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// The three photographs attached to a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhotoField {
    ContainerNumber,
    Commodity,
    Ispm,
}

impl PhotoField {
    pub const ALL: [PhotoField; 3] = [
        PhotoField::ContainerNumber,
        PhotoField::Commodity,
        PhotoField::Ispm,
    ];

    /// Category segment used in object paths
    pub fn category(&self) -> &'static str {
        match self {
            PhotoField::ContainerNumber => "container",
            PhotoField::Commodity => "commodity",
            PhotoField::Ispm => "ispm",
        }
    }
}

/// Time-limited read link for one photo, recomputed every aggregation pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignedPhotoView {
    pub container_id: Uuid,
    pub field: PhotoField,
    pub url: String,
    /// `None` when the stored URL is served unsigned
    pub expires_at: Option<DateTime<Utc>>,
}

impl SignedPhotoView {
    pub fn is_signed(&self) -> bool {
        self.expires_at.is_some()
    }
}

/// Authenticated user as reported by the auth provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn container() -> Container {
        Container {
            id: Uuid::new_v4(),
            shipper_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            container_photo_url: Some("a".to_string()),
            commodity_photo_url: None,
            ispm_photo_url: Some("c".to_string()),
            latitude: Some(-6.2),
            longitude: None,
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
            custom_timestamp: None,
            verified: false,
            verified_at: None,
            verified_by: None,
        }
    }

    #[test]
    fn test_verify_patch_sets_audit_fields() {
        let mut c = container();
        let actor = Uuid::new_v4();
        let at = Utc.with_ymd_and_hms(2024, 3, 2, 9, 0, 0).unwrap();

        ContainerPatch::verify(actor, at).apply(&mut c);

        assert!(c.verified);
        assert_eq!(c.verified_at, Some(at));
        assert_eq!(c.verified_by, Some(actor));
        assert!(c.verification_consistent());
    }

    #[test]
    fn test_custom_timestamp_precedence_and_reset() {
        let mut c = container();
        let custom = Utc.with_ymd_and_hms(2024, 2, 28, 17, 30, 0).unwrap();

        ContainerPatch::custom_timestamp(Some(custom)).apply(&mut c);
        assert_eq!(c.display_timestamp(), custom);
        assert_eq!(
            c.created_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
        );

        ContainerPatch::custom_timestamp(None).apply(&mut c);
        assert_eq!(c.display_timestamp(), c.created_at);
    }

    #[test]
    fn test_location_requires_both_coordinates() {
        let mut c = container();
        assert!(c.location().is_none());
        c.longitude = Some(106.8);
        assert_eq!(
            c.location(),
            Some(GeoPoint {
                latitude: -6.2,
                longitude: 106.8
            })
        );
    }

    #[test]
    fn test_photo_url_lookup() {
        let c = container();
        assert_eq!(c.photo_url(PhotoField::ContainerNumber), Some("a"));
        assert_eq!(c.photo_url(PhotoField::Commodity), None);
        assert_eq!(PhotoField::Ispm.category(), "ispm");
    }

    #[test]
    fn test_role_grants_are_a_set() {
        use std::collections::HashSet;

        let user = Uuid::new_v4();
        let mut grants = HashSet::new();
        assert!(grants.insert((user, Role::Admin)));
        assert!(!grants.insert((user, Role::Admin)));
        assert!(grants.insert((user, Role::User)));
        assert!(grants.contains(&(user, Role::Admin)));
        assert_eq!(Role::Admin.as_str(), "admin");
    }
}
