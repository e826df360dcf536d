//! Inspection Service
//!
//! Records data plane for shipping-container inspections. Field inspectors
//! register shippers, photograph containers (container number, commodity and
//! ISPM stamp) and submit them with the capture location. Administrators
//! review the list, verify containers, correct display timestamps and delete
//! records.
//!
//! ## Features
//!
//! - **Typed record store**: shippers, containers, roles and legacy entries in
//!   PostgreSQL, with all-or-nothing batch inserts and transactional cascade
//!   deletes
//! - **Per-request sessions**: callers present the auth provider's access
//!   token; each verified user gets their own session and cached admin flag
//! - **Photo storage**: S3-compatible bucket, conflict-checked uploads and
//!   time-limited signed read URLs that degrade to the stored URL
//! - **Aggregated view**: concurrent fan-out over shippers, containers and
//!   photos into one snapshot; the newest refresh request wins
//! - **Admin-gated mutations**: verify, delete and timestamp edits checked
//!   against the admin flag cached once per session
//! - **Local time**: labels and editor input use a configured UTC offset
//!   (WIB by default)
//!
//! ## Architecture
//!
//! ```text
//!  Auth provider          HTTP API (axum)
//! ┌──────────────┐ Bearer┌──────────────┐
//! │ access token │──────▶│ Session      │
//! └──────────────┘       │ Manager      │
//!                        └──────────────┘
//!                          │          │
//!                          ▼          ▼
//!                 ┌──────────────┐ ┌──────────────┐
//!                 │ Submitter    │ │ Aggregator   │◀── RefreshCommand
//!                 └──────────────┘ └──────────────┘
//!                   │         │      │         │
//!                   ▼         ▼      ▼         ▼
//!            ┌──────────────┐ ┌──────────────┐
//!            │ Photo Store  │ │ Record Store │
//!            │ (S3 bucket)  │ │ (PostgreSQL) │
//!            └──────────────┘ └──────────────┘
//! ```

pub mod aggregator;
pub mod api;
pub mod auth;
pub mod config;
pub mod display;
pub mod error;
pub mod memory;
pub mod models;
pub mod mutations;
pub mod photo_store;
pub mod record_store;
pub mod session;
pub mod submission;

pub use aggregator::{
    refresh_channel, AggregationState, Aggregator, ContainerView, RefreshCommand, RefreshHandle,
    RefreshOutcome, RefreshReason, ShipperView, ViewSnapshot,
};
pub use api::{start_api_server, AppState, CurrentSession};
pub use auth::TokenVerifier;
pub use config::Config;
pub use error::{Error, Result};
pub use models::{Container, ContainerPatch, NewContainer, PhotoField, Shipper, UserIdentity};
pub use mutations::{parse_timestamp_input, Confirmation};
pub use photo_store::{resolve_signed_url, PhotoStore, S3PhotoStore};
pub use record_store::{PgRecordStore, RecordStore};
pub use session::{Session, SessionManager};
pub use submission::{ContainerDraft, SubmissionForm, SubmissionReceipt, Submitter};
