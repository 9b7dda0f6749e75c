use chrono::{SecondsFormat, Utc};

/// Server clock in Unix milliseconds. All windowing and persisted
/// timestamps are stamped with this at message ingress; client-supplied
/// timestamps are never used for anything but debug logging.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// RFC 3339 timestamp for operator-facing endpoints and greetings.
pub fn iso_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
