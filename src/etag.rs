//! ETag 计算与 If-Range 校验。

use axum::http::{HeaderMap, header};
use httpdate::parse_http_date;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::fs::FileInfo;

/// Derives the entity tag from a file's size and last-modified time. Two
/// reads of an unchanged file yield the same tag; any write changes it.
pub fn file_etag(info: &FileInfo) -> String {
    let modified = info
        .last_modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{}-{}", info.size, modified)
}

/// 校验 If-Range 条件：仅在文件自给定时间后未修改时应用 Range。
pub fn if_range_matches(headers: &HeaderMap, modified: SystemTime) -> bool {
    match headers
        .get(header::IF_RANGE)
        .and_then(|value| value.to_str().ok())
    {
        Some(value) => match parse_http_date(value) {
            Ok(date) => modified <= date,
            Err(_) => false,
        },
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn etag_tracks_size_and_mtime() {
        let created = UNIX_EPOCH + Duration::from_secs(100);
        let info = FileInfo {
            created,
            last_modified: created,
            size: 2,
        };
        let tag = file_etag(&info);
        assert!(tag.starts_with("2-"));
        assert_eq!(tag, file_etag(&info));

        let touched = FileInfo {
            last_modified: created + Duration::from_nanos(1),
            ..info
        };
        assert_ne!(tag, file_etag(&touched));
    }
}
