use chrono::{DateTime, SecondsFormat, Utc};

use chatline_core::ids::{RoomId, UserId};
use chatline_core::Recipient;

use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Get an optional column value.
pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    get(row, idx, table, column)
}

/// Timestamps are stored as fixed-width RFC 3339 text so that string order is time order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table,
            column,
            detail: format!("invalid timestamp {raw:?}: {e}"),
        })
}

/// Rebuild a recipient from the two mutually exclusive nullable columns.
pub fn parse_recipient(
    receiver_id: Option<String>,
    chatroom_id: Option<String>,
    table: &'static str,
) -> Result<Recipient, StoreError> {
    match (receiver_id, chatroom_id) {
        (Some(user), None) => Ok(Recipient::User(UserId::from_raw(user))),
        (None, Some(room)) => Ok(Recipient::Room(RoomId::from_raw(room))),
        (Some(_), Some(_)) => Err(StoreError::CorruptRow {
            table,
            column: "receiver_id",
            detail: "both receiver_id and chatroom_id set".into(),
        }),
        (None, None) => Err(StoreError::CorruptRow {
            table,
            column: "receiver_id",
            detail: "neither receiver_id nor chatroom_id set".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_text_sorts_chronologically() {
        let early = DateTime::parse_from_rfc3339("2026-01-01T09:00:00.5Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2026-01-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(format_timestamp(&early) < format_timestamp(&late));
    }

    #[test]
    fn timestamp_roundtrip_keeps_micros() {
        let now = Utc::now();
        let parsed = parse_timestamp(&format_timestamp(&now), "messages", "created_at").unwrap();
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn parse_timestamp_failure() {
        let result = parse_timestamp("yesterday", "messages", "created_at");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "messages", column: "created_at", .. })
        ));
    }

    #[test]
    fn recipient_requires_exactly_one_column() {
        assert_eq!(
            parse_recipient(Some("u2".into()), None, "messages").unwrap(),
            Recipient::User(UserId::from_raw("u2"))
        );
        assert_eq!(
            parse_recipient(None, Some("lobby".into()), "messages").unwrap(),
            Recipient::Room(RoomId::from_raw("lobby"))
        );
        assert!(parse_recipient(None, None, "messages").is_err());
        assert!(parse_recipient(Some("u2".into()), Some("lobby".into()), "messages").is_err());
    }
}
