//! 统一的 WebDAV 错误类型与状态码映射。

use axum::http::StatusCode;
use std::fmt;

/// Error kinds reportable from the protocol core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DavErrorKind {
    BadPath,
    BadDepth,
    BadDest,
    BadPropfind,
    BadProppatch,
    BadLock,
    Underrun,
    Conflict,
    MissingParent,
    NotFound,
    NotAllowed,
    IsDir,
    IsNotDir,
    UnsupportedType,
    DestExists,
    SameFile,
    Locked,
    BadHost,
    Internal,
}

/// 带有 HTTP 状态码、短标签与内部原因的错误值。
///
/// The cause is logged server-side and never written to a client.
#[derive(Debug, Clone)]
pub struct DavError {
    kind: DavErrorKind,
    cause: Option<String>,
}

impl DavError {
    pub const BAD_PATH: DavError = DavError::new(DavErrorKind::BadPath);
    pub const BAD_DEPTH: DavError = DavError::new(DavErrorKind::BadDepth);
    pub const BAD_DEST: DavError = DavError::new(DavErrorKind::BadDest);
    pub const BAD_PROPFIND: DavError = DavError::new(DavErrorKind::BadPropfind);
    pub const BAD_PROPPATCH: DavError = DavError::new(DavErrorKind::BadProppatch);
    pub const BAD_LOCK: DavError = DavError::new(DavErrorKind::BadLock);
    pub const UNDERRUN: DavError = DavError::new(DavErrorKind::Underrun);
    pub const CONFLICT: DavError = DavError::new(DavErrorKind::Conflict);
    pub const MISSING_PARENT: DavError = DavError::new(DavErrorKind::MissingParent);
    pub const NOT_FOUND: DavError = DavError::new(DavErrorKind::NotFound);
    pub const NOT_ALLOWED: DavError = DavError::new(DavErrorKind::NotAllowed);
    pub const IS_DIR: DavError = DavError::new(DavErrorKind::IsDir);
    pub const IS_NOT_DIR: DavError = DavError::new(DavErrorKind::IsNotDir);
    pub const UNSUPPORTED_TYPE: DavError = DavError::new(DavErrorKind::UnsupportedType);
    pub const DEST_EXISTS: DavError = DavError::new(DavErrorKind::DestExists);
    pub const SAME_FILE: DavError = DavError::new(DavErrorKind::SameFile);
    pub const LOCKED: DavError = DavError::new(DavErrorKind::Locked);
    pub const BAD_HOST: DavError = DavError::new(DavErrorKind::BadHost);
    pub const INTERNAL: DavError = DavError::new(DavErrorKind::Internal);

    pub const fn new(kind: DavErrorKind) -> Self {
        Self { kind, cause: None }
    }

    /// 追加内部原因（仅用于日志）。
    pub fn with_cause(self, cause: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            cause: Some(cause.to_string()),
        }
    }

    pub fn kind(&self) -> DavErrorKind {
        self.kind
    }

    pub fn status(&self) -> StatusCode {
        match self.kind {
            DavErrorKind::BadPath
            | DavErrorKind::BadDepth
            | DavErrorKind::BadDest
            | DavErrorKind::BadPropfind
            | DavErrorKind::BadProppatch
            | DavErrorKind::BadLock
            | DavErrorKind::Underrun => StatusCode::BAD_REQUEST,
            DavErrorKind::Conflict | DavErrorKind::MissingParent => StatusCode::CONFLICT,
            DavErrorKind::NotFound => StatusCode::NOT_FOUND,
            DavErrorKind::NotAllowed | DavErrorKind::IsDir | DavErrorKind::IsNotDir => {
                StatusCode::METHOD_NOT_ALLOWED
            }
            DavErrorKind::UnsupportedType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            DavErrorKind::DestExists => StatusCode::PRECONDITION_FAILED,
            DavErrorKind::SameFile => StatusCode::FORBIDDEN,
            DavErrorKind::Locked => StatusCode::LOCKED,
            DavErrorKind::BadHost => StatusCode::BAD_GATEWAY,
            DavErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn label(&self) -> &'static str {
        match self.kind {
            DavErrorKind::BadPath => "BadPath",
            DavErrorKind::BadDepth => "BadDepth",
            DavErrorKind::BadDest => "BadDest",
            DavErrorKind::BadPropfind => "BadPropfind",
            DavErrorKind::BadProppatch => "BadProppatch",
            DavErrorKind::BadLock => "BadLock",
            DavErrorKind::Underrun => "Underrun",
            DavErrorKind::Conflict => "Conflict",
            DavErrorKind::MissingParent => "MissingParent",
            DavErrorKind::NotFound => "NotFound",
            DavErrorKind::NotAllowed => "NotAllowed",
            DavErrorKind::IsDir => "IsDir",
            DavErrorKind::IsNotDir => "IsNotDir",
            DavErrorKind::UnsupportedType => "UnsupportedType",
            DavErrorKind::DestExists => "DestExists",
            DavErrorKind::SameFile => "SameFile",
            DavErrorKind::Locked => "Locked",
            DavErrorKind::BadHost => "BadHost",
            DavErrorKind::Internal => "Internal",
        }
    }

    /// Status line used inside multistatus `status` elements.
    pub fn status_line(&self) -> String {
        status_line(self.status())
    }
}

/// Formats a plain HTTP/1.1 status line for the given code.
pub fn status_line(status: StatusCode) -> String {
    format!(
        "HTTP/1.1 {} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
}

impl fmt::Display for DavError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status();
        write!(
            f,
            "{} {} : {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or(""),
            self.label()
        )?;
        if let Some(cause) = &self.cause {
            write!(f, " ({cause})")?;
        }
        Ok(())
    }
}

impl std::error::Error for DavError {}

impl From<DavErrorKind> for DavError {
    fn from(kind: DavErrorKind) -> Self {
        DavError::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(DavError::LOCKED.status(), StatusCode::LOCKED);
        assert_eq!(DavError::BAD_HOST.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(DavError::SAME_FILE.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            DavError::DEST_EXISTS.status(),
            StatusCode::PRECONDITION_FAILED
        );
        assert_eq!(DavError::MISSING_PARENT.status(), StatusCode::CONFLICT);
        assert_eq!(DavError::IS_DIR.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn display_includes_cause() {
        let err = DavError::NOT_FOUND.with_cause("no such entry");
        assert_eq!(err.to_string(), "404 Not Found : NotFound (no such entry)");
        assert_eq!(err.status_line(), "HTTP/1.1 404 Not Found");
    }
}
