//! Display strings for the record list (Indonesian locale).
//!
//! Timestamps are stored in UTC and rendered in the configured local offset.

use crate::models::{Container, GeoPoint};
use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc};

const MONTHS_ID: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "Mei", "Jun", "Jul", "Agu", "Sep", "Okt", "Nov", "Des",
];

/// `dd MMM yyyy`
pub fn format_date(ts: DateTime<Utc>, offset: FixedOffset) -> String {
    let ts = ts.with_timezone(&offset);
    format!(
        "{:02} {} {}",
        ts.day(),
        MONTHS_ID[ts.month0() as usize],
        ts.year()
    )
}

/// `dd MMM yyyy HH:mm`
pub fn format_date_time(ts: DateTime<Utc>, offset: FixedOffset) -> String {
    let local = ts.with_timezone(&offset);
    format!(
        "{} {:02}:{:02}",
        format_date(ts, offset),
        local.hour(),
        local.minute()
    )
}

/// "Custom: ..." when the override is set, otherwise "Dibuat: ..."
pub fn timestamp_label(container: &Container, offset: FixedOffset) -> String {
    match container.custom_timestamp {
        Some(custom) => format!("Custom: {}", format_date_time(custom, offset)),
        None => format!("Dibuat: {}", format_date_time(container.created_at, offset)),
    }
}

/// Age of `ts` at `now` in the largest non-zero unit.
///
/// A timestamp in the future reads as zero seconds old.
pub fn relative_age(now: DateTime<Utc>, ts: DateTime<Utc>) -> String {
    let seconds = now.signed_duration_since(ts).num_seconds().max(0);
    let minutes = seconds / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("{days} hari yang lalu")
    } else if hours > 0 {
        format!("{hours} jam yang lalu")
    } else if minutes > 0 {
        format!("{minutes} menit yang lalu")
    } else {
        format!("{seconds} detik yang lalu")
    }
}

pub fn location_label(location: Option<GeoPoint>) -> String {
    match location {
        Some(p) => format!("Lat: {:.6}, Lng: {:.6}", p.latitude, p.longitude),
        None => "Tidak ada data lokasi".to_string(),
    }
}
