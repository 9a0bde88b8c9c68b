//! # 时间戳处理
//!
//! 线上时间戳统一为 KST（UTC+9）ISO-8601 字符串，精度微秒。

use chrono::{DateTime, FixedOffset, Offset, SecondsFormat, Utc};

/// KST 相对 UTC 的偏移（秒）
pub const KST_OFFSET_SECS: i32 = 9 * 3600;

/// KST 时区
pub fn kst() -> FixedOffset {
    FixedOffset::east_opt(KST_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

/// 当前 KST 时间
pub fn now_kst() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&kst())
}

/// 格式化为线上时间戳（如 `2025-01-27T10:00:00.123456+09:00`）
pub fn format(ts: &DateTime<FixedOffset>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// 当前 KST 时间戳字符串
pub fn now_string() -> String {
    format(&now_kst())
}

/// 解析线上时间戳（接受任意偏移的 RFC 3339）
pub fn parse(s: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(s).ok()
}
