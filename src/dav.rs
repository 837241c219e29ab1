//! WebDAV method dispatcher.
//!
//! Each request runs the same pipeline: resolve the target path, parse
//! the Depth/If/Timeout/Overwrite headers into a request context,
//! evaluate the `If` precondition, check write authorization against the
//! lock manager for mutating verbs, then hand off to the verb handler.

use axum::body::{Body, Bytes};
use axum::extract::Extension;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::StreamExt;
use http_body_util::BodyExt;
use httpdate::fmt_http_date;
use percent_encoding::percent_decode_str;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use xmltree::{Element, XMLNode};

use crate::cond::{Env, IfTag};
use crate::davpath;
use crate::error::DavError;
use crate::etag::{file_etag, if_range_matches};
use crate::fs::{CopyOptions, FileSystem, FsFile, FsPath};
use crate::http::{parse_depth, parse_overwrite, parse_timeout, request_host, same_host};
use crate::lock::LockManager;
use crate::xml::{self, MultiStatus, PropfindRequest};

/// Properties synthesized by the server for every file.
const SYNTHETIC_PROPS: [&str; 8] = [
    "DAV::resourcetype",
    "DAV::supportedlock",
    "DAV::lockdiscovery",
    "DAV::displayname",
    "DAV::getlastmodified",
    "DAV::getetag",
    "DAV::getcontentlength",
    "DAV::creationdate",
];

/// Axum entry point; the shared handler does the actual work.
pub async fn webdav_handler(
    Extension(handler): Extension<Arc<DavHandler>>,
    req: Request<Body>,
) -> Response {
    handler.handle(req).await
}

/// Per-request derived values.
struct RequestContext {
    path: Box<dyn FsPath>,
    depth: i32,
    timeout: Duration,
    cond: Option<IfTag>,
    overwrite: bool,
}

/// WebDAV protocol handler over an abstract filesystem.
pub struct DavHandler {
    fs: Arc<dyn FileSystem>,
    locks: LockManager,
    debug: bool,
    serialize: tokio::sync::Mutex<()>,
}

/// Condition environment backed by the handler's filesystem and locks.
struct FsEnv<'a> {
    handler: &'a DavHandler,
}

impl Env for FsEnv<'_> {
    fn etag(&self, resource: &str) -> String {
        let Ok(path) = self.handler.fs.for_path(resource) else {
            return String::new();
        };
        let Ok(file) = path.lookup() else {
            return String::new();
        };
        match file.stat() {
            Ok(info) => file_etag(&info),
            Err(_) => String::new(),
        }
    }

    fn locked(&self, resource: &str, token: &str) -> bool {
        self.handler.locks.is_locked(&davpath::clean(resource), token)
    }
}

fn header_value(value: &str) -> Result<HeaderValue, DavError> {
    HeaderValue::from_str(value).map_err(|e| DavError::INTERNAL.with_cause(e))
}

async fn collect_body(body: Body) -> Result<Bytes, DavError> {
    body.collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| DavError::INTERNAL.with_cause(e))
}

impl DavHandler {
    pub fn new(fs: Arc<dyn FileSystem>, debug: bool) -> Self {
        Self {
            fs,
            locks: LockManager::new(),
            debug,
            serialize: tokio::sync::Mutex::new(()),
        }
    }

    /// Handles one WebDAV request end to end.
    pub async fn handle(&self, req: Request<Body>) -> Response {
        // Debug mode serializes all request handling and logs details.
        let _serialized = if self.debug {
            Some(self.serialize.lock().await)
        } else {
            None
        };
        if self.debug {
            debug!(method = %req.method(), uri = %req.uri(), "request");
            for (name, value) in req.headers() {
                debug!(header = %name, value = ?value);
            }
        }

        if req.uri().path() == "/dumpz" {
            self.fs.dump();
            return StatusCode::OK.into_response();
        }

        let (parts, body) = req.into_parts();
        let ctx = match self.extract_context(&parts) {
            Ok(ctx) => ctx,
            Err(err) => return self.error_response(None, &err),
        };

        if let Some(cond) = &ctx.cond {
            let env = FsEnv { handler: self };
            if !cond.eval(&env, ctx.path.as_str()) {
                debug!(path = ctx.path.as_str(), "precondition failed");
                return StatusCode::PRECONDITION_FAILED.into_response();
            }
        }

        let result = match parts.method.as_str() {
            "OPTIONS" => self.do_options(&ctx),
            "GET" | "POST" => self.do_get(&ctx, &parts.headers, true),
            "HEAD" => self.do_get(&ctx, &parts.headers, false),
            "DELETE" => self.do_delete(&ctx),
            "PUT" => self.do_put(&ctx, body).await,
            "MKCOL" => self.do_mkcol(&ctx, body).await,
            "COPY" => self.do_copy_move(&ctx, &parts, false),
            "MOVE" => self.do_copy_move(&ctx, &parts, true),
            "PROPFIND" => self.do_propfind(&ctx, body).await,
            "PROPPATCH" => self.do_proppatch(&ctx, body).await,
            "LOCK" => self.do_lock(&ctx, body).await,
            "UNLOCK" => self.do_unlock(&ctx, &parts.headers),
            _ => Ok(StatusCode::BAD_REQUEST.into_response()),
        };
        match result {
            Ok(response) => response,
            Err(err) => self.error_response(Some(ctx.path.as_ref()), &err),
        }
    }

    fn extract_context(&self, parts: &Parts) -> Result<RequestContext, DavError> {
        let decoded = percent_decode_str(parts.uri.path())
            .decode_utf8()
            .map_err(|e| DavError::BAD_PATH.with_cause(e))?;
        let path = self.fs.for_path(&decoded)?;
        let depth = parse_depth(&parts.headers)?;
        let cond = self.parse_if_header(&parts.headers)?;
        Ok(RequestContext {
            path,
            depth,
            timeout: parse_timeout(&parts.headers),
            cond,
            overwrite: parse_overwrite(&parts.headers),
        })
    }

    fn parse_if_header(&self, headers: &HeaderMap) -> Result<Option<IfTag>, DavError> {
        let Some(value) = headers.get("if") else {
            return Ok(None);
        };
        let value = value.to_str().map_err(|e| DavError::BAD_LOCK.with_cause(e))?;
        if value.is_empty() {
            return Ok(None);
        }
        let mut tag = IfTag::parse(value)?;
        tag.rewrite_hosts(request_host(headers))?;
        debug!(condition = ?tag, "parsed If header");
        Ok(Some(tag))
    }

    /// Write authorization for mutating verbs: a covering lock demands a
    /// matching token in the `If` header.
    fn check_can_write(&self, ctx: &RequestContext, path: &str) -> bool {
        if self.locks.lock_for_path(path).is_none() {
            return true;
        }
        let Some(cond) = &ctx.cond else {
            return false;
        };
        cond.all_tokens()
            .iter()
            .any(|token| self.locks.is_locked(path, token))
    }

    fn allow_header(&self, path: &dyn FsPath) -> String {
        match path.lookup() {
            Err(_) => "OPTIONS, MKCOL, PUT, LOCK".to_string(),
            Ok(file) => {
                let mut allowed = String::from(
                    "OPTIONS, GET, HEAD, POST, DELETE, TRACE, PROPPATCH, COPY, MOVE, LOCK, UNLOCK",
                );
                if file.is_directory() {
                    allowed.push_str(", PUT, PROPFIND");
                }
                allowed
            }
        }
    }

    fn error_response(&self, path: Option<&dyn FsPath>, err: &DavError) -> Response {
        match path {
            Some(path) => warn!(path = path.as_str(), error = %err, "request failed"),
            None => warn!(error = %err, "request failed"),
        }
        let mut response = err.status().into_response();
        if err.status() == StatusCode::METHOD_NOT_ALLOWED
            && let Some(path) = path
            && let Ok(value) = HeaderValue::from_str(&self.allow_header(path))
        {
            response.headers_mut().insert(header::ALLOW, value);
        }
        response
    }

    fn do_options(&self, ctx: &RequestContext) -> Result<Response, DavError> {
        let mut headers = HeaderMap::new();
        headers.insert("dav", HeaderValue::from_static("1, 2"));
        headers.insert(
            header::ALLOW,
            header_value(&self.allow_header(ctx.path.as_ref()))?,
        );
        headers.insert("ms-author-via", HeaderValue::from_static("DAV"));
        Ok((StatusCode::OK, headers).into_response())
    }

    fn do_get(
        &self,
        ctx: &RequestContext,
        headers: &HeaderMap,
        content: bool,
    ) -> Result<Response, DavError> {
        let file = ctx
            .path
            .lookup()
            .map_err(|e| DavError::NOT_FOUND.with_cause(e))?;
        let info = file.stat()?;

        let mut response_headers = HeaderMap::new();
        let mime = mime_guess::from_path(ctx.path.as_str()).first_or_octet_stream();
        response_headers.insert(header::CONTENT_TYPE, header_value(mime.essence_str())?);
        response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        response_headers.insert(header::ETAG, header_value(&file_etag(&info))?);
        response_headers.insert(
            header::LAST_MODIFIED,
            header_value(&fmt_http_date(info.last_modified))?,
        );

        if !content {
            return Ok((StatusCode::OK, response_headers).into_response());
        }

        let mut handle = file.open()?;
        let range = if if_range_matches(headers, info.last_modified) {
            parse_range(headers, info.size)
        } else {
            None
        };

        match range {
            Some(RangeOutcome::Unsatisfiable) => {
                response_headers.insert(
                    header::CONTENT_RANGE,
                    header_value(&format!("bytes */{}", info.size))?,
                );
                Ok((StatusCode::RANGE_NOT_SATISFIABLE, response_headers).into_response())
            }
            Some(RangeOutcome::Span(start, end)) => {
                let length = (end - start + 1) as usize;
                debug!(path = ctx.path.as_str(), start, end, "serving range");
                handle
                    .seek(SeekFrom::Start(start))
                    .map_err(|e| DavError::UNDERRUN.with_cause(e))?;
                let mut data = vec![0u8; length];
                handle
                    .read_exact(&mut data)
                    .map_err(|e| DavError::INTERNAL.with_cause(e))?;
                response_headers.insert(
                    header::CONTENT_RANGE,
                    header_value(&format!("bytes {start}-{end}/{}", info.size))?,
                );
                Ok((StatusCode::PARTIAL_CONTENT, response_headers, Body::from(data))
                    .into_response())
            }
            None => {
                let mut data = Vec::with_capacity(info.size as usize);
                handle
                    .read_to_end(&mut data)
                    .map_err(|e| DavError::INTERNAL.with_cause(e))?;
                Ok((StatusCode::OK, response_headers, Body::from(data)).into_response())
            }
        }
    }

    fn do_delete(&self, ctx: &RequestContext) -> Result<Response, DavError> {
        if !self.check_can_write(ctx, ctx.path.as_str()) {
            return Err(DavError::LOCKED);
        }
        let file = ctx.path.lookup()?;

        if !file.is_directory() {
            ctx.path.remove()?;
            return Ok(StatusCode::NO_CONTENT.into_response());
        }

        let errors = ctx.path.recursive_remove();
        if errors.is_empty() {
            return Ok(StatusCode::NO_CONTENT.into_response());
        }
        let mut failed: Vec<(String, DavError)> = errors.into_iter().collect();
        failed.sort_by(|a, b| a.0.cmp(&b.0));
        let mut ms = MultiStatus::new();
        for (path, err) in &failed {
            ms.add_status(path, err);
        }
        Ok(ms.into_response())
    }

    async fn do_put(&self, ctx: &RequestContext, body: Body) -> Result<Response, DavError> {
        if !self.check_can_write(ctx, ctx.path.as_str()) {
            return Err(DavError::LOCKED);
        }

        let (exists, mut handle) = match ctx.path.lookup() {
            Ok(file) => {
                if file.is_directory() {
                    return Err(DavError::IS_DIR);
                }
                (
                    true,
                    file.truncate()
                        .map_err(|e| DavError::CONFLICT.with_cause(e))?,
                )
            }
            Err(_) => {
                let (_, handle) = ctx
                    .path
                    .create()
                    .map_err(|e| DavError::CONFLICT.with_cause(e))?;
                (false, handle)
            }
        };

        let mut stream = body.into_data_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| DavError::CONFLICT.with_cause(e))?;
            if !chunk.is_empty() {
                handle
                    .write_all(&chunk)
                    .map_err(|e| DavError::CONFLICT.with_cause(e))?;
            }
        }

        let status = if exists {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::CREATED
        };
        Ok(status.into_response())
    }

    async fn do_mkcol(&self, ctx: &RequestContext, body: Body) -> Result<Response, DavError> {
        if !self.check_can_write(ctx, ctx.path.as_str()) {
            return Err(DavError::LOCKED);
        }
        if ctx.path.lookup().is_ok() {
            return Err(DavError::NOT_ALLOWED);
        }
        if !collect_body(body).await?.is_empty() {
            return Err(DavError::UNSUPPORTED_TYPE);
        }
        ctx.path
            .mkdir()
            .map_err(|e| DavError::CONFLICT.with_cause(e))?;
        Ok(StatusCode::CREATED.into_response())
    }

    fn do_copy_move(
        &self,
        ctx: &RequestContext,
        parts: &Parts,
        is_move: bool,
    ) -> Result<Response, DavError> {
        if is_move && !self.check_can_write(ctx, ctx.path.as_str()) {
            return Err(DavError::LOCKED);
        }

        let destination = parts
            .headers
            .get("destination")
            .and_then(|v| v.to_str().ok())
            .ok_or(DavError::BAD_DEST)?;
        let uri: Uri = destination
            .parse()
            .map_err(|e| DavError::BAD_DEST.with_cause(e))?;
        if let Some(authority) = uri.authority()
            && !same_host(
                authority.as_str(),
                uri.scheme_str(),
                request_host(&parts.headers),
            )
        {
            return Err(DavError::BAD_HOST);
        }

        let decoded = percent_decode_str(uri.path())
            .decode_utf8()
            .map_err(|e| DavError::BAD_DEST.with_cause(e))?;
        let dst = self
            .fs
            .for_path(&decoded)
            .map_err(|e| DavError::BAD_DEST.with_cause(e))?;
        if !self.check_can_write(ctx, dst.as_str()) {
            return Err(DavError::LOCKED);
        }

        debug!(
            source = ctx.path.as_str(),
            destination = dst.as_str(),
            is_move,
            "copy"
        );
        let created = ctx.path.copy_to(
            dst.as_ref(),
            CopyOptions {
                overwrite: ctx.overwrite,
                move_source: is_move,
                depth: ctx.depth,
            },
        )?;
        let status = if created {
            StatusCode::CREATED
        } else {
            StatusCode::NO_CONTENT
        };
        Ok(status.into_response())
    }

    async fn do_propfind(&self, ctx: &RequestContext, body: Body) -> Result<Response, DavError> {
        let body = collect_body(body).await?;
        let request = xml::parse_propfind(&body)?;

        let files = ctx.path.lookup_subtree(ctx.depth)?;
        debug!(path = ctx.path.as_str(), files = files.len(), "propfind");

        let mut ms = MultiStatus::new();
        for file in &files {
            let (found, missing) = self.resolve_props(&request, file.as_ref());
            ms.add_prop_status(&file.path(), found, missing);
        }
        Ok(ms.into_response())
    }

    fn resolve_props(
        &self,
        request: &PropfindRequest,
        file: &dyn FsFile,
    ) -> (Vec<Element>, Vec<Element>) {
        let mut found = Vec::new();
        let mut missing = Vec::new();
        match request {
            PropfindRequest::Props(names) => {
                for name in names {
                    let (element, ok) = self.prop_value(name, file);
                    if ok {
                        found.push(element);
                    } else {
                        missing.push(element);
                    }
                }
            }
            PropfindRequest::AllProp => {
                let names = SYNTHETIC_PROPS
                    .iter()
                    .map(|n| n.to_string())
                    .chain(file.prop_names());
                for name in names {
                    let (element, ok) = self.prop_value(&name, file);
                    if ok {
                        found.push(element);
                    } else {
                        missing.push(element);
                    }
                }
            }
            PropfindRequest::PropName => {
                found = SYNTHETIC_PROPS
                    .iter()
                    .map(|n| n.to_string())
                    .chain(file.prop_names())
                    .map(|name| xml::prop_element(&name))
                    .collect();
            }
        }
        (found, missing)
    }

    /// Resolves one property, synthesizing the well-known `DAV:` set and
    /// falling back to the file's user properties.
    fn prop_value(&self, name: &str, file: &dyn FsFile) -> (Element, bool) {
        let mut element = xml::prop_element(name);
        match name {
            "DAV::resourcetype" => {
                if file.is_directory() {
                    element
                        .children
                        .push(XMLNode::Element(xml::dav_element("collection")));
                }
                (element, true)
            }
            "DAV::supportedlock" => {
                let mut scope = xml::dav_element("lockscope");
                scope
                    .children
                    .push(XMLNode::Element(xml::dav_element("exclusive")));
                let mut kind = xml::dav_element("locktype");
                kind.children
                    .push(XMLNode::Element(xml::dav_element("write")));
                let mut entry = xml::dav_element("lockentry");
                entry.children.push(XMLNode::Element(scope));
                entry.children.push(XMLNode::Element(kind));
                element.children.push(XMLNode::Element(entry));
                (element, true)
            }
            "DAV::lockdiscovery" => {
                if let Some(lock) = self.locks.lock_for_path(&file.path()) {
                    element
                        .children
                        .push(XMLNode::Element(lock.active_lock_xml()));
                }
                (element, true)
            }
            "DAV::displayname" => {
                element
                    .children
                    .push(XMLNode::Text(davpath::base(&file.path()).to_string()));
                (element, true)
            }
            "DAV::getlastmodified"
            | "DAV::getetag"
            | "DAV::getcontentlength"
            | "DAV::creationdate" => {
                let Ok(info) = file.stat() else {
                    return (element, false);
                };
                let value = match name {
                    "DAV::getlastmodified" => fmt_http_date(info.last_modified),
                    "DAV::getetag" => file_etag(&info),
                    "DAV::getcontentlength" => info.size.to_string(),
                    _ => DateTime::<Utc>::from(info.created)
                        .to_rfc3339_opts(SecondsFormat::Secs, true),
                };
                element.children.push(XMLNode::Text(value));
                (element, true)
            }
            _ => match file.get_prop(name) {
                Some(value) => {
                    if !value.is_empty() {
                        element.children.push(XMLNode::Text(value));
                    }
                    (element, true)
                }
                None => (element, false),
            },
        }
    }

    async fn do_proppatch(&self, ctx: &RequestContext, body: Body) -> Result<Response, DavError> {
        if !self.check_can_write(ctx, ctx.path.as_str()) {
            return Err(DavError::LOCKED);
        }
        let file = ctx.path.lookup()?;

        let body = collect_body(body).await?;
        let request = xml::parse_proppatch(&body)?;
        file.patch_prop(&request.set, &request.remove)
            .map_err(|e| DavError::CONFLICT.with_cause(e))?;
        Ok(StatusCode::NO_CONTENT.into_response())
    }

    async fn do_lock(&self, ctx: &RequestContext, body: Body) -> Result<Response, DavError> {
        let body = collect_body(body).await?;
        let request = xml::parse_lock(&body)?;

        // Locks may precede the resource they protect, but not its parent.
        if ctx.path.parent().lookup().is_err() {
            return Err(DavError::MISSING_PARENT);
        }

        let (lock, refresh) = if request.refresh {
            let token = ctx
                .cond
                .as_ref()
                .and_then(IfTag::single_state)
                .ok_or(DavError::BAD_LOCK)?;
            let lock = self
                .locks
                .refresh_lock(&token, ctx.path.as_str(), ctx.timeout)?;
            (lock, true)
        } else {
            let lock = self.locks.create_lock(
                request.owner,
                ctx.path.as_str(),
                ctx.depth,
                ctx.timeout,
            )?;
            (lock, false)
        };

        let status = if ctx.path.lookup().is_err() {
            match ctx.path.create() {
                Ok((_, handle)) => drop(handle),
                Err(err) => {
                    // A failure after acquiring the lock must release it.
                    self.locks.unlock(&lock.token);
                    return Err(err);
                }
            }
            StatusCode::CREATED
        } else {
            StatusCode::OK
        };

        let mut discovery = xml::dav_element("lockdiscovery");
        discovery
            .children
            .push(XMLNode::Element(lock.active_lock_xml()));
        let mut response = xml::prop_response(status, discovery);
        if !refresh {
            response
                .headers_mut()
                .insert("lock-token", header_value(&format!("<{}>", lock.token))?);
        }
        Ok(response)
    }

    fn do_unlock(&self, ctx: &RequestContext, headers: &HeaderMap) -> Result<Response, DavError> {
        let token = headers
            .get("lock-token")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let token = token
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .unwrap_or(token);

        if !self.locks.is_locked(ctx.path.as_str(), token) {
            return Err(DavError::BAD_LOCK);
        }
        self.locks.unlock(token);
        Ok(StatusCode::NO_CONTENT.into_response())
    }
}

enum RangeOutcome {
    Span(u64, u64),
    Unsatisfiable,
}

/// Parses a single-range `Range` header. Malformed or multi-range values
/// are ignored and the full entity is served.
fn parse_range(headers: &HeaderMap, size: u64) -> Option<RangeOutcome> {
    let value = headers.get(header::RANGE)?.to_str().ok()?;
    let range = value.strip_prefix("bytes=")?;
    if range.contains(',') {
        return None;
    }
    if size == 0 {
        return Some(RangeOutcome::Unsatisfiable);
    }

    let (start_part, end_part) = range.split_once('-')?;
    if start_part.is_empty() {
        let suffix: u64 = end_part.parse().ok()?;
        if suffix == 0 {
            return None;
        }
        return Some(RangeOutcome::Span(size.saturating_sub(suffix), size - 1));
    }

    let start: u64 = start_part.parse().ok()?;
    let end: u64 = if end_part.is_empty() {
        size - 1
    } else {
        end_part.parse().ok()?
    };
    if start > end || start >= size || end >= size {
        return Some(RangeOutcome::Unsatisfiable);
    }
    Some(RangeOutcome::Span(start, end))
}
