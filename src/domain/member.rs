use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use super::MemberPass;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Member record as it comes out of storage
///
/// Dates stay as raw text here: historical rows contain sentinels such as `0000-00-00` that no
/// date type can hold.
#[derive(Clone, Debug, PartialEq)]
pub struct MemberRow {
    pub id: i64,
    pub member_uuid: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub phone_number: String,
    pub email: Option<String>,
    pub birthdate: Option<String>,
    pub member_level_id: Option<i64>,
    pub level_name_zh: Option<String>,
    pub level_name_es: Option<String>,
    pub points_balance: Decimal,
    pub is_active: bool,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

/// A store member, as returned to the POS
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Member {
    pub id: i64,
    pub member_uuid: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub phone_number: String,
    pub email: Option<String>,
    pub birthdate: Option<NaiveDate>,
    pub member_level_id: Option<i64>,
    pub level_name_zh: Option<String>,
    pub level_name_es: Option<String>,
    pub points_balance: Decimal,
    pub is_active: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Currently valid passes
    pub passes: Vec<MemberPass>,
}

impl From<MemberRow> for Member {
    fn from(row: MemberRow) -> Self {
        Self {
            id: row.id,
            member_uuid: row.member_uuid,
            first_name: row.first_name,
            last_name: row.last_name,
            phone_number: row.phone_number,
            email: row.email.filter(|email| !email.trim().is_empty()),
            birthdate: normalize_date(row.birthdate.as_deref()),
            member_level_id: row.member_level_id,
            level_name_zh: row.level_name_zh,
            level_name_es: row.level_name_es,
            points_balance: row.points_balance,
            is_active: row.is_active,
            created_at: normalize_timestamp(row.created_at.as_deref()),
            updated_at: normalize_timestamp(row.updated_at.as_deref()),
            passes: Vec::new(),
        }
    }
}

/// Values for a member insert
#[derive(Clone, Debug, PartialEq)]
pub struct NewMember {
    pub member_uuid: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub phone_number: String,
    pub email: Option<String>,
    pub birthdate: Option<NaiveDate>,
    pub member_level_id: i64,
    pub points_balance: Decimal,
    /// Used for both `created_at` and `updated_at`. Always UTC.
    pub created_at: DateTime<Utc>,
}

fn is_sentinel(raw: &str) -> bool {
    raw.is_empty() || raw.starts_with("0000-00-00")
}

/// Parse a stored date, mapping legacy sentinels and garbage to `None`
pub fn normalize_date(raw: Option<&str>) -> Option<NaiveDate> {
    let raw = raw?.trim();
    if is_sentinel(raw) {
        return None;
    }
    // Some legacy rows store a full timestamp in date columns
    let date_part = raw.get(..10).unwrap_or(raw);
    match NaiveDate::parse_from_str(date_part, DATE_FORMAT) {
        Ok(date) => Some(date),
        Err(err) => {
            tracing::warn!(value = raw, error = %err, "discarding unparsable stored date");
            None
        }
    }
}

/// Parse a stored timestamp (UTC), mapping legacy sentinels and garbage to `None`
pub fn normalize_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    if is_sentinel(raw) {
        return None;
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT) {
        return Some(naive.and_utc());
    }
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(err) => {
            tracing::warn!(value = raw, error = %err, "discarding unparsable stored timestamp");
            None
        }
    }
}

/// Format a timestamp the way member rows store it
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Hide everything but the last four characters of a phone number
///
/// Numbers of four characters or fewer are fully masked.
pub fn mask_phone(phone: &str) -> String {
    let phone = phone.trim();
    let len = phone.chars().count();
    if len <= 4 {
        return "*".repeat(len);
    }
    phone
        .chars()
        .enumerate()
        .map(|(i, c)| if i < len - 4 { '*' } else { c })
        .collect()
}
