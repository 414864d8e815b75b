//! Wall-clock helpers. Snapshot and evaluation times are milliseconds since the Unix epoch, the
//! unit the server uses for `time` and `sinceTime`.

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
