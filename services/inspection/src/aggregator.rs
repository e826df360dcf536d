//! Aggregation layer.
//!
//! Builds the Shipper → Container view tree from the record store, resolving
//! signed photo URLs for every container. Each refresh cycle is numbered;
//! a cycle that finishes after a newer one has been applied is discarded, so
//! the published snapshot always reflects the newest request that succeeded.

use crate::config::DisplayConfig;
use crate::display::{location_label, relative_age, timestamp_label};
use crate::error::StoreError;
use crate::models::{Container, PhotoField, Shipper, SignedPhotoView};
use crate::photo_store::{resolve_signed_url, PhotoStore};
use crate::record_store::RecordStore;
use chrono::{DateTime, FixedOffset, Utc};
use futures::future::{join_all, try_join_all};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// One container as presented in the list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerView {
    #[serde(flatten)]
    pub container: Container,
    pub container_photo: Option<SignedPhotoView>,
    pub commodity_photo: Option<SignedPhotoView>,
    pub ispm_photo: Option<SignedPhotoView>,
    /// `custom_timestamp` when set, else `created_at`
    pub display_timestamp: DateTime<Utc>,
    pub timestamp_label: String,
    pub age_label: String,
    pub location_label: String,
}

impl ContainerView {
    fn build(
        container: Container,
        photos: [Option<SignedPhotoView>; 3],
        now: DateTime<Utc>,
        offset: FixedOffset,
    ) -> Self {
        let [container_photo, commodity_photo, ispm_photo] = photos;
        let display_timestamp = container.display_timestamp();

        Self {
            container_photo,
            commodity_photo,
            ispm_photo,
            display_timestamp,
            timestamp_label: timestamp_label(&container, offset),
            age_label: relative_age(now, display_timestamp),
            location_label: location_label(container.location()),
            container,
        }
    }

    pub fn photo(&self, field: PhotoField) -> Option<&SignedPhotoView> {
        match field {
            PhotoField::ContainerNumber => self.container_photo.as_ref(),
            PhotoField::Commodity => self.commodity_photo.as_ref(),
            PhotoField::Ispm => self.ispm_photo.as_ref(),
        }
    }
}

/// A shipper with its containers, newest first
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShipperView {
    #[serde(flatten)]
    pub shipper: Shipper,
    pub containers: Vec<ContainerView>,
}

impl ShipperView {
    pub fn container_count(&self) -> usize {
        self.containers.len()
    }
}

/// Immutable result of one successful refresh cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ViewSnapshot {
    pub shippers: Vec<ShipperView>,
    /// Sequence number of the cycle that produced this snapshot
    pub sequence: u64,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl ViewSnapshot {
    pub fn shipper_count(&self) -> usize {
        self.shippers.len()
    }

    pub fn container_count(&self) -> usize {
        self.shippers.iter().map(ShipperView::container_count).sum()
    }

    pub fn shipper(&self, id: Uuid) -> Option<&ShipperView> {
        self.shippers.iter().find(|s| s.shipper.id == id)
    }

    pub fn container(&self, id: Uuid) -> Option<&ContainerView> {
        self.shippers
            .iter()
            .flat_map(|s| s.containers.iter())
            .find(|c| c.container.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AggregationState {
    Idle,
    Loading,
    Ready,
    Failed { error: String },
}

/// How a refresh cycle ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefreshOutcome {
    Ready {
        sequence: u64,
        shippers: usize,
        containers: usize,
    },
    /// A newer cycle was applied first; this result was discarded
    Superseded { sequence: u64, current: u64 },
    Failed { sequence: u64, error: String },
}

impl RefreshOutcome {
    pub fn sequence(&self) -> u64 {
        match self {
            RefreshOutcome::Ready { sequence, .. }
            | RefreshOutcome::Superseded { sequence, .. }
            | RefreshOutcome::Failed { sequence, .. } => *sequence,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, RefreshOutcome::Ready { .. })
    }
}

/// Owns the published view snapshot and runs refresh cycles
pub struct Aggregator {
    pub(crate) records: Arc<dyn RecordStore>,
    photos: Arc<dyn PhotoStore>,
    signed_url_ttl: Duration,
    display_offset: FixedOffset,
    snapshot: RwLock<Arc<ViewSnapshot>>,
    state: RwLock<AggregationState>,
    /// Highest sequence number handed out
    requested: AtomicU64,
}

impl Aggregator {
    pub fn new(
        records: Arc<dyn RecordStore>,
        photos: Arc<dyn PhotoStore>,
        signed_url_ttl: Duration,
    ) -> Self {
        Self {
            records,
            photos,
            signed_url_ttl,
            display_offset: DisplayConfig::default().utc_offset(),
            snapshot: RwLock::new(Arc::new(ViewSnapshot::default())),
            state: RwLock::new(AggregationState::Idle),
            requested: AtomicU64::new(0),
        }
    }

    /// Render labels in `offset` instead of the default WIB
    pub fn with_display_offset(mut self, offset: FixedOffset) -> Self {
        self.display_offset = offset;
        self
    }

    pub fn display_offset(&self) -> FixedOffset {
        self.display_offset
    }

    /// The last applied snapshot
    pub fn snapshot(&self) -> Arc<ViewSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn state(&self) -> AggregationState {
        self.state.read().clone()
    }

    /// Run one full refresh cycle.
    ///
    /// On failure the previous snapshot stays published. A result older than
    /// the published snapshot is discarded and reported as superseded.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> RefreshOutcome {
        let sequence = self.requested.fetch_add(1, Ordering::SeqCst) + 1;
        *self.state.write() = AggregationState::Loading;
        metrics::counter!("inspection.refresh.started").increment(1);

        let started = Instant::now();
        let result = self.build_tree().await;
        metrics::histogram!("inspection.refresh.duration_ms")
            .record(started.elapsed().as_millis() as f64);

        match result {
            Ok(shippers) => self.publish(sequence, shippers),
            Err(e) => {
                error!(sequence, error = %e, "Refresh failed, keeping previous snapshot");
                metrics::counter!("inspection.refresh.failed").increment(1);

                if self.is_newest(sequence) {
                    *self.state.write() = AggregationState::Failed {
                        error: e.to_string(),
                    };
                }

                RefreshOutcome::Failed {
                    sequence,
                    error: e.to_string(),
                }
            }
        }
    }

    fn publish(&self, sequence: u64, shippers: Vec<ShipperView>) -> RefreshOutcome {
        let mut current = self.snapshot.write();
        if sequence <= current.sequence {
            debug!(
                sequence,
                current = current.sequence,
                "Discarding superseded refresh"
            );
            metrics::counter!("inspection.refresh.superseded").increment(1);
            return RefreshOutcome::Superseded {
                sequence,
                current: current.sequence,
            };
        }

        let snapshot = ViewSnapshot {
            shippers,
            sequence,
            refreshed_at: Some(Utc::now()),
        };
        let outcome = RefreshOutcome::Ready {
            sequence,
            shippers: snapshot.shipper_count(),
            containers: snapshot.container_count(),
        };
        *current = Arc::new(snapshot);
        drop(current);

        if self.is_newest(sequence) {
            *self.state.write() = AggregationState::Ready;
        }

        info!(?outcome, "Snapshot published");
        metrics::counter!("inspection.refresh.ready").increment(1);
        outcome
    }

    fn is_newest(&self, sequence: u64) -> bool {
        self.requested.load(Ordering::SeqCst) == sequence
    }

    async fn build_tree(&self) -> Result<Vec<ShipperView>, StoreError> {
        let shippers = self.records.list_shippers().await?;
        let now = Utc::now();

        try_join_all(
            shippers
                .into_iter()
                .map(|shipper| self.build_shipper(shipper, now)),
        )
        .await
    }

    async fn build_shipper(
        &self,
        shipper: Shipper,
        now: DateTime<Utc>,
    ) -> Result<ShipperView, StoreError> {
        let containers = self.records.list_containers(shipper.id).await.map_err(|e| {
            warn!(shipper_id = %shipper.id, error = %e, "Container fetch failed");
            e
        })?;

        let containers =
            join_all(containers.into_iter().map(|c| self.build_container(c, now))).await;

        Ok(ShipperView { shipper, containers })
    }

    async fn build_container(&self, container: Container, now: DateTime<Utc>) -> ContainerView {
        let photos = self.photos.as_ref();
        let ttl = self.signed_url_ttl;
        let id = container.id;

        let (container_photo, commodity_photo, ispm_photo) = tokio::join!(
            resolve_signed_url(
                photos,
                id,
                PhotoField::ContainerNumber,
                container.container_photo_url.as_deref(),
                ttl
            ),
            resolve_signed_url(
                photos,
                id,
                PhotoField::Commodity,
                container.commodity_photo_url.as_deref(),
                ttl
            ),
            resolve_signed_url(
                photos,
                id,
                PhotoField::Ispm,
                container.ispm_photo_url.as_deref(),
                ttl
            ),
        );

        ContainerView::build(
            container,
            [container_photo, commodity_photo, ispm_photo],
            now,
            self.display_offset,
        )
    }

    /// Drop the published view once the last session signs out. Cycles
    /// already in flight are discarded when they finish.
    pub fn clear(&self) {
        let mut snapshot = self.snapshot.write();
        *snapshot = Arc::new(ViewSnapshot {
            sequence: self.requested.load(Ordering::SeqCst),
            ..ViewSnapshot::default()
        });
        drop(snapshot);

        *self.state.write() = AggregationState::Idle;
        info!("View cleared");
    }

    /// Consume refresh commands and react to session changes until shutdown.
    ///
    /// `sessions` carries the number of active sessions: a new sign-in
    /// refreshes (when enabled) and the last sign-out clears the view.
    /// Each command runs in its own task so a slow cycle never blocks newer
    /// requests; ordering between them is settled by sequence numbers.
    pub fn spawn_refresh_loop(
        self: Arc<Self>,
        mut commands: mpsc::Receiver<RefreshCommand>,
        mut sessions: watch::Receiver<usize>,
        refresh_on_sign_in: bool,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Refresh loop started");
            let mut active = *sessions.borrow_and_update();

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Refresh loop shutting down");
                        break;
                    }
                    command = commands.recv() => {
                        let Some(command) = command else {
                            info!("Refresh channel closed");
                            break;
                        };
                        debug!(reason = ?command.reason, "Refresh requested");
                        self.clone().spawn_cycle(command.reply);
                    }
                    changed = sessions.changed() => {
                        if changed.is_err() {
                            info!("Session channel closed");
                            break;
                        }
                        let now_active = *sessions.borrow_and_update();
                        if now_active == 0 {
                            self.clear();
                        } else if now_active > active && refresh_on_sign_in {
                            debug!(reason = ?RefreshReason::SignIn, "Refresh requested");
                            self.clone().spawn_cycle(None);
                        }
                        active = now_active;
                    }
                }
            }
        })
    }

    fn spawn_cycle(self: Arc<Self>, reply: Option<oneshot::Sender<RefreshOutcome>>) {
        tokio::spawn(async move {
            let outcome = self.refresh().await;
            if let Some(reply) = reply {
                let _ = reply.send(outcome);
            }
        });
    }
}

/// What prompted a refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshReason {
    Startup,
    SignIn,
    Manual,
    Submission,
}

#[derive(Debug)]
pub struct RefreshCommand {
    pub reason: RefreshReason,
    pub reply: Option<oneshot::Sender<RefreshOutcome>>,
}

/// Sending half of the refresh command channel
#[derive(Clone)]
pub struct RefreshHandle {
    tx: mpsc::Sender<RefreshCommand>,
}

pub fn refresh_channel(buffer: usize) -> (RefreshHandle, mpsc::Receiver<RefreshCommand>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (RefreshHandle { tx }, rx)
}

impl RefreshHandle {
    /// Queue a refresh without waiting for it; false once the loop is gone
    pub async fn request(&self, reason: RefreshReason) -> bool {
        self.tx
            .send(RefreshCommand { reason, reply: None })
            .await
            .is_ok()
    }

    /// Queue a refresh and wait for its outcome
    pub async fn request_and_wait(&self, reason: RefreshReason) -> Option<RefreshOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RefreshCommand {
                reason,
                reply: Some(reply),
            })
            .await
            .ok()?;
        rx.await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryPhotoStore, InMemoryRecordStore, StoreOperation};
    use crate::models::NewContainer;
    use crate::record_store::MockRecordStore;
    use chrono::TimeZone;

    const BASE: &str = "https://project.supabase.co/storage/v1/object/public";

    fn stored_url(path: &str) -> String {
        format!("{BASE}/ispm-photos/{path}")
    }

    fn photo_fields(shipper_id: Uuid, user_id: Uuid, tag: &str) -> NewContainer {
        NewContainer {
            shipper_id,
            user_id,
            container_photo_url: Some(stored_url(&format!("{user_id}/container_{tag}.jpg"))),
            commodity_photo_url: Some(stored_url(&format!("{user_id}/commodity_{tag}.jpg"))),
            ispm_photo_url: Some(stored_url(&format!("{user_id}/ispm_{tag}.jpg"))),
            latitude: Some(-6.2),
            longitude: Some(106.8),
        }
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 8, 5, 9, minute, 0).unwrap()
    }

    fn aggregator(
        records: Arc<InMemoryRecordStore>,
        photos: Arc<InMemoryPhotoStore>,
    ) -> Aggregator {
        Aggregator::new(records, photos, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_refresh_builds_newest_first_tree() {
        let records = Arc::new(InMemoryRecordStore::new());
        let user = Uuid::new_v4();
        let older = records.seed_shipper(user, "PT Lama", at(0));
        let newer = records.seed_shipper(user, "PT Baru", at(5));
        records.seed_container(photo_fields(older.id, user, "a"), at(1));
        records.seed_container(photo_fields(older.id, user, "b"), at(2));
        records.seed_container(photo_fields(newer.id, user, "c"), at(6));

        let agg = aggregator(records, Arc::new(InMemoryPhotoStore::new("ispm-photos", BASE)));
        let outcome = agg.refresh().await;

        assert_eq!(
            outcome,
            RefreshOutcome::Ready {
                sequence: 1,
                shippers: 2,
                containers: 3
            }
        );
        assert_eq!(agg.state(), AggregationState::Ready);

        let snapshot = agg.snapshot();
        assert_eq!(snapshot.shippers[0].shipper.name, "PT Baru");
        let lama = &snapshot.shippers[1];
        assert_eq!(lama.container_count(), 2);
        assert!(lama.containers[0].container.created_at > lama.containers[1].container.created_at);

        let view = &lama.containers[0];
        assert!(view.photo(PhotoField::Ispm).unwrap().is_signed());
        assert_eq!(view.location_label, "Lat: -6.200000, Lng: 106.800000");
        assert!(view.timestamp_label.starts_with("Dibuat: "));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_tracks_slowest_resolution() {
        let latency = Duration::from_millis(100);
        let records = Arc::new(InMemoryRecordStore::new().with_latency(latency));
        let user = Uuid::new_v4();
        for i in 0..5 {
            let shipper = records.seed_shipper(user, &format!("Shipper {i}"), at(i));
            for j in 0..4 {
                let fields = photo_fields(shipper.id, user, &format!("{i}_{j}"));
                records.seed_container(fields, at(10 + j));
            }
        }
        let photos = Arc::new(InMemoryPhotoStore::new("ispm-photos", BASE).with_latency(latency));

        let agg = aggregator(records, photos);
        let started = tokio::time::Instant::now();
        let outcome = agg.refresh().await;
        let elapsed = started.elapsed();

        assert!(outcome.is_ready());
        assert_eq!(agg.snapshot().container_count(), 20);
        // shippers, then containers, then signing: three sequential stages
        assert!(elapsed < Duration::from_millis(400), "refresh took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_one_signing_failure_leaves_others_signed() {
        let records = Arc::new(InMemoryRecordStore::new());
        let user = Uuid::new_v4();
        let shipper = records.seed_shipper(user, "PT Satu", at(0));
        records.seed_container(photo_fields(shipper.id, user, "x"), at(1));

        let photos = Arc::new(InMemoryPhotoStore::new("ispm-photos", BASE));
        photos.fail_signing(&format!("{user}/commodity_x.jpg"));

        let agg = aggregator(records, photos);
        assert!(agg.refresh().await.is_ready());

        let snapshot = agg.snapshot();
        let view = &snapshot.shippers[0].containers[0];
        let commodity = view.photo(PhotoField::Commodity).unwrap();
        assert!(!commodity.is_signed());
        assert_eq!(Some(commodity.url.as_str()), view.container.commodity_photo_url.as_deref());
        assert!(view.photo(PhotoField::ContainerNumber).unwrap().is_signed());
        assert!(view.photo(PhotoField::Ispm).unwrap().is_signed());
    }

    #[tokio::test]
    async fn test_null_photo_fields_stay_null() {
        let records = Arc::new(InMemoryRecordStore::new());
        let user = Uuid::new_v4();
        let shipper = records.seed_shipper(user, "PT Kosong", at(0));
        let mut fields = photo_fields(shipper.id, user, "n");
        fields.commodity_photo_url = None;
        fields.latitude = None;
        records.seed_container(fields, at(1));

        let agg = aggregator(records, Arc::new(InMemoryPhotoStore::new("ispm-photos", BASE)));
        agg.refresh().await;

        let snapshot = agg.snapshot();
        let view = &snapshot.shippers[0].containers[0];
        assert!(view.commodity_photo.is_none());
        assert!(view.container_photo.is_some());
        assert_eq!(view.location_label, "Tidak ada data lokasi");
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let records = Arc::new(InMemoryRecordStore::new());
        let user = Uuid::new_v4();
        let shipper = records.seed_shipper(user, "PT Tetap", at(0));
        records.seed_container(photo_fields(shipper.id, user, "k"), at(1));

        let photos = Arc::new(InMemoryPhotoStore::new("ispm-photos", BASE));
        let agg = aggregator(records.clone(), photos);
        assert!(agg.refresh().await.is_ready());
        let before = agg.snapshot();

        records.fail(StoreOperation::ListContainers, true);
        let outcome = agg.refresh().await;

        assert!(matches!(outcome, RefreshOutcome::Failed { sequence: 2, .. }));
        assert!(matches!(agg.state(), AggregationState::Failed { .. }));
        assert_eq!(agg.snapshot(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newest_request_wins() {
        let records = Arc::new(InMemoryRecordStore::new().with_latency(Duration::from_millis(300)));
        let user = Uuid::new_v4();
        records.seed_shipper(user, "PT Awal", at(0));

        let photos = Arc::new(InMemoryPhotoStore::new("ispm-photos", BASE));
        let agg = Arc::new(aggregator(records.clone(), photos));

        // first cycle is slow, second is fast and sees an extra shipper
        let slow = tokio::spawn({
            let agg = agg.clone();
            async move { agg.refresh().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        records.set_latency(Duration::from_millis(10));
        records.seed_shipper(user, "PT Baru", at(1));
        let fast = agg.refresh().await;

        let slow = slow.await.unwrap();
        assert_eq!(fast.sequence(), 2);
        assert!(fast.is_ready());
        assert_eq!(slow, RefreshOutcome::Superseded { sequence: 1, current: 2 });
        assert_eq!(agg.state(), AggregationState::Ready);

        let snapshot = agg.snapshot();
        assert_eq!(snapshot.sequence, 2);
        assert_eq!(snapshot.shipper_count(), 2);
    }

    #[tokio::test]
    async fn test_shipper_fetch_failure_is_reported() {
        let mut records = MockRecordStore::new();
        records
            .expect_list_shippers()
            .returning(|| Err(StoreError::Unavailable("timeout".to_string())));

        let agg = Aggregator::new(
            Arc::new(records),
            Arc::new(InMemoryPhotoStore::new("ispm-photos", BASE)),
            Duration::from_secs(60),
        );

        let outcome = agg.refresh().await;
        assert!(matches!(outcome, RefreshOutcome::Failed { .. }));
        assert_eq!(agg.snapshot().sequence, 0);
    }

    #[tokio::test]
    async fn test_labels_follow_display_offset() {
        let records = Arc::new(InMemoryRecordStore::new());
        let user = Uuid::new_v4();
        let shipper = records.seed_shipper(user, "PT Zona", at(0));
        records.seed_container(photo_fields(shipper.id, user, "z"), at(15));

        let photos = Arc::new(InMemoryPhotoStore::new("ispm-photos", BASE));
        let wib = aggregator(records.clone(), photos.clone());
        let utc =
            aggregator(records, photos).with_display_offset(FixedOffset::east_opt(0).unwrap());
        wib.refresh().await;
        utc.refresh().await;

        let label =
            |agg: &Aggregator| agg.snapshot().shippers[0].containers[0].timestamp_label.clone();
        assert_eq!(label(&wib), "Dibuat: 05 Agu 2024 16:15");
        assert_eq!(label(&utc), "Dibuat: 05 Agu 2024 09:15");
    }

    #[tokio::test]
    async fn test_refresh_loop_serves_commands_and_sign_out() {
        let records = Arc::new(InMemoryRecordStore::new());
        let user = Uuid::new_v4();
        records.seed_shipper(user, "PT Loop", at(0));

        let photos = Arc::new(InMemoryPhotoStore::new("ispm-photos", BASE));
        let agg = Arc::new(aggregator(records, photos));
        let (handle, commands) = refresh_channel(4);
        let (session_tx, session_rx) = watch::channel(0usize);
        let shutdown = CancellationToken::new();

        let task = agg
            .clone()
            .spawn_refresh_loop(commands, session_rx, false, shutdown.clone());

        let outcome = handle.request_and_wait(RefreshReason::Manual).await.unwrap();
        assert!(outcome.is_ready());
        assert_eq!(agg.snapshot().shipper_count(), 1);

        session_tx.send_replace(1);
        session_tx.send_replace(0);

        tokio::time::timeout(Duration::from_secs(1), async {
            while agg.snapshot().shipper_count() != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(agg.state(), AggregationState::Idle);

        shutdown.cancel();
        task.await.unwrap();
        assert!(!handle.request(RefreshReason::Manual).await);
    }
}
