//! Multistatus envelope construction and WebDAV request body parsing.
//!
//! Property names travel through the server in the canonical
//! `"<namespace>:<local>"` form (e.g. `DAV::getetag`), split at the last
//! colon. Elements are built and parsed with `xmltree`; the `DAV:` default
//! namespace is declared on envelope roots and inherited below.

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use std::io::Cursor;
use tracing::error;
use xmltree::{Element, EmitterConfig, Namespace, XMLNode};

use crate::davpath;
use crate::error::{DavError, status_line};

pub const DAV_NS: &str = "DAV:";

/// Canonical `"<namespace>:<local>"` name of a parsed element.
pub fn canonical_name(element: &Element) -> String {
    format!(
        "{}:{}",
        element.namespace.as_deref().unwrap_or(""),
        element.name
    )
}

/// Builds a property element from a canonical name, declaring the
/// element's namespace as its default.
pub fn prop_element(canonical: &str) -> Element {
    let (ns, local) = match canonical.rsplit_once(':') {
        Some((ns, local)) => (ns, local),
        None => ("", canonical),
    };
    let mut element = Element::new(local);
    if !ns.is_empty() {
        element.namespace = Some(ns.to_string());
    }
    let mut declarations = Namespace::empty();
    declarations.put("", ns);
    element.namespaces = Some(declarations);
    element
}

/// A `DAV:`-namespaced element without its own declarations; it inherits
/// the default namespace from the enclosing envelope.
pub fn dav_element(name: &str) -> Element {
    let mut element = Element::new(name);
    element.namespace = Some(DAV_NS.to_string());
    element
}

/// A `DAV:` element wrapping character data.
pub fn text_element(name: &str, text: impl Into<String>) -> Element {
    let mut element = dav_element(name);
    element.children.push(XMLNode::Text(text.into()));
    element
}

fn envelope_root(name: &str) -> Element {
    let mut root = dav_element(name);
    let mut declarations = Namespace::empty();
    declarations.put("", DAV_NS);
    root.namespaces = Some(declarations);
    root
}

fn render_document(root: &Element) -> Vec<u8> {
    let mut out = Vec::new();
    let config = EmitterConfig::new().perform_indent(true);
    if let Err(err) = root.write_with_config(&mut out, config) {
        error!(error = %err, "xml serialization failed");
    }
    out
}

fn xml_response(status: StatusCode, body: Vec<u8>) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/xml; charset=utf-8")],
        Body::from(body),
    )
        .into_response()
}

/// Response envelope carrying per-resource statuses for PROPFIND,
/// recursive DELETE, and LOCK discovery.
#[derive(Default)]
pub struct MultiStatus {
    responses: Vec<Element>,
}

impl MultiStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a single-resource error response.
    pub fn add_status(&mut self, href: &str, error: &DavError) {
        let mut response = dav_element("response");
        response
            .children
            .push(XMLNode::Element(text_element("href", davpath::url_encode(href))));
        response
            .children
            .push(XMLNode::Element(text_element("status", error.status_line())));
        self.responses.push(response);
    }

    /// Adds a response with up to two propstat blocks, one for resolved
    /// properties and one for names without a value.
    pub fn add_prop_status(&mut self, href: &str, found: Vec<Element>, missing: Vec<Element>) {
        let mut response = dav_element("response");
        response
            .children
            .push(XMLNode::Element(text_element("href", davpath::url_encode(href))));
        for (props, status) in [(found, StatusCode::OK), (missing, StatusCode::NOT_FOUND)] {
            if props.is_empty() {
                continue;
            }
            let mut prop = dav_element("prop");
            prop.children
                .extend(props.into_iter().map(XMLNode::Element));
            let mut propstat = dav_element("propstat");
            propstat.children.push(XMLNode::Element(prop));
            propstat
                .children
                .push(XMLNode::Element(text_element("status", status_line(status))));
            response.children.push(XMLNode::Element(propstat));
        }
        self.responses.push(response);
    }

    pub fn render(&self) -> Vec<u8> {
        let mut root = envelope_root("multistatus");
        root.children
            .extend(self.responses.iter().cloned().map(XMLNode::Element));
        render_document(&root)
    }

    pub fn into_response(self) -> Response {
        xml_response(StatusCode::MULTI_STATUS, self.render())
    }
}

/// Sends a single `prop` envelope, as used by the LOCK response.
pub fn prop_response(status: StatusCode, inner: Element) -> Response {
    let mut root = envelope_root("prop");
    root.children.push(XMLNode::Element(inner));
    xml_response(status, render_document(&root))
}

/// What a PROPFIND request asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropfindRequest {
    AllProp,
    PropName,
    Props(Vec<String>),
}

/// Parses a PROPFIND body. An absent body selects `allprop`.
pub fn parse_propfind(body: &[u8]) -> Result<PropfindRequest, DavError> {
    if is_blank(body) {
        return Ok(PropfindRequest::AllProp);
    }
    let root = Element::parse(Cursor::new(body)).map_err(|e| DavError::BAD_PROPFIND.with_cause(e))?;
    if root.name != "propfind" {
        return Err(DavError::BAD_PROPFIND.with_cause(format!("unexpected root {}", root.name)));
    }
    if root.get_child("propname").is_some() {
        return Ok(PropfindRequest::PropName);
    }
    if let Some(prop) = root.get_child("prop") {
        let names = prop
            .children
            .iter()
            .filter_map(XMLNode::as_element)
            .map(canonical_name)
            .collect();
        return Ok(PropfindRequest::Props(names));
    }
    Ok(PropfindRequest::AllProp)
}

/// Property updates requested by a PROPPATCH body, normalized so that a
/// later directive for the same name overrides an earlier one.
#[derive(Debug, Default)]
pub struct PropPatchRequest {
    pub set: HashMap<String, String>,
    pub remove: HashMap<String, String>,
}

/// Parses a PROPPATCH body, respecting the document order of its `set`
/// and `remove` blocks.
pub fn parse_proppatch(body: &[u8]) -> Result<PropPatchRequest, DavError> {
    let root =
        Element::parse(Cursor::new(body)).map_err(|e| DavError::BAD_PROPPATCH.with_cause(e))?;
    if root.name != "propertyupdate" {
        return Err(DavError::BAD_PROPPATCH.with_cause(format!("unexpected root {}", root.name)));
    }

    let mut request = PropPatchRequest::default();
    for node in &root.children {
        let Some(block) = node.as_element() else {
            continue;
        };
        if block.name != "set" && block.name != "remove" {
            continue;
        }
        let Some(prop) = block.get_child("prop") else {
            continue;
        };
        for property in prop.children.iter().filter_map(XMLNode::as_element) {
            let name = canonical_name(property);
            let value = property
                .get_text()
                .map(|t| t.into_owned())
                .unwrap_or_default();
            // Later directives win over earlier ones for the same name.
            let (add, sub) = if block.name == "set" {
                (&mut request.set, &mut request.remove)
            } else {
                (&mut request.remove, &mut request.set)
            };
            add.insert(name.clone(), value);
            sub.remove(&name);
        }
    }
    Ok(request)
}

/// A parsed LOCK request body; an empty body asks for a refresh.
#[derive(Debug, Default)]
pub struct LockRequest {
    pub owner: Option<Element>,
    pub refresh: bool,
}

/// Parses a LOCK body, accepting only exclusive write lock requests.
pub fn parse_lock(body: &[u8]) -> Result<LockRequest, DavError> {
    if is_blank(body) {
        return Ok(LockRequest {
            owner: None,
            refresh: true,
        });
    }
    let root = Element::parse(Cursor::new(body)).map_err(|e| DavError::BAD_LOCK.with_cause(e))?;
    if root.name != "lockinfo" {
        return Err(DavError::BAD_LOCK.with_cause(format!("unexpected root {}", root.name)));
    }
    let scope = root.get_child("lockscope");
    if scope.is_some_and(|s| s.get_child("shared").is_some()) {
        return Err(DavError::BAD_LOCK.with_cause("must not be shared"));
    }
    if !scope.is_some_and(|s| s.get_child("exclusive").is_some()) {
        return Err(DavError::BAD_LOCK.with_cause("must be exclusive"));
    }
    if !root
        .get_child("locktype")
        .is_some_and(|t| t.get_child("write").is_some())
    {
        return Err(DavError::BAD_LOCK.with_cause("must be write"));
    }
    Ok(LockRequest {
        owner: root.get_child("owner").cloned(),
        refresh: false,
    })
}

fn is_blank(body: &[u8]) -> bool {
    body.iter().all(u8::is_ascii_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propfind_prop_list() {
        let body = br#"<?xml version="1.0"?>
            <D:propfind xmlns:D="DAV:">
              <D:prop><D:getetag/><D:displayname/></D:prop>
            </D:propfind>"#;
        let request = parse_propfind(body).unwrap();
        assert_eq!(
            request,
            PropfindRequest::Props(vec![
                "DAV::getetag".to_string(),
                "DAV::displayname".to_string()
            ])
        );
    }

    #[test]
    fn propfind_allprop_and_propname() {
        assert_eq!(parse_propfind(b"").unwrap(), PropfindRequest::AllProp);
        assert_eq!(parse_propfind(b"   \n").unwrap(), PropfindRequest::AllProp);

        let allprop = br#"<propfind xmlns="DAV:"><allprop/></propfind>"#;
        assert_eq!(parse_propfind(allprop).unwrap(), PropfindRequest::AllProp);

        let propname = br#"<propfind xmlns="DAV:"><propname/></propfind>"#;
        assert_eq!(parse_propfind(propname).unwrap(), PropfindRequest::PropName);

        assert!(parse_propfind(b"<unrelated/>").is_err());
        assert!(parse_propfind(b"not xml").is_err());
    }

    #[test]
    fn proppatch_later_directive_wins() {
        let body = br#"<?xml version="1.0"?>
            <D:propertyupdate xmlns:D="DAV:" xmlns:o="urn:example">
              <D:set><D:prop><o:color>blue</o:color></D:prop></D:set>
              <D:remove><D:prop><o:color/></D:prop></D:remove>
              <D:set><D:prop><o:size>small</o:size></D:prop></D:set>
            </D:propertyupdate>"#;
        let request = parse_proppatch(body).unwrap();
        assert!(!request.set.contains_key("urn:example:color"));
        assert_eq!(request.remove["urn:example:color"], "");
        assert_eq!(request.set["urn:example:size"], "small");
    }

    #[test]
    fn lock_body_validation() {
        let exclusive = br#"<?xml version="1.0"?>
            <D:lockinfo xmlns:D="DAV:">
              <D:lockscope><D:exclusive/></D:lockscope>
              <D:locktype><D:write/></D:locktype>
              <D:owner><D:href>client</D:href></D:owner>
            </D:lockinfo>"#;
        let request = parse_lock(exclusive).unwrap();
        assert!(!request.refresh);
        assert!(request.owner.is_some());

        let shared = br#"<lockinfo xmlns="DAV:">
              <lockscope><shared/></lockscope>
              <locktype><write/></locktype>
            </lockinfo>"#;
        assert!(parse_lock(shared).is_err());

        let read_lock = br#"<lockinfo xmlns="DAV:">
              <lockscope><exclusive/></lockscope>
              <locktype><read/></locktype>
            </lockinfo>"#;
        assert!(parse_lock(read_lock).is_err());

        let refresh = parse_lock(b"").unwrap();
        assert!(refresh.refresh);
    }

    #[test]
    fn multistatus_rendering() {
        let mut ms = MultiStatus::new();
        ms.add_prop_status(
            "/dir/with space",
            vec![text_element("displayname", "with space")],
            vec![prop_element("urn:example:missing")],
        );
        ms.add_status("/gone", &DavError::NOT_FOUND);

        let body = String::from_utf8(ms.render()).unwrap();
        assert!(body.starts_with("<?xml"));
        assert!(body.contains(r#"<multistatus xmlns="DAV:">"#));
        assert!(body.contains("<href>/dir/with%20space</href>"));
        assert!(body.contains("HTTP/1.1 200 OK"));
        assert!(body.contains("HTTP/1.1 404 Not Found"));
        assert!(body.contains("<href>/gone</href>"));
    }

    #[test]
    fn canonical_names_round_trip() {
        let element = prop_element("DAV::resourcetype");
        assert_eq!(element.name, "resourcetype");
        assert_eq!(element.namespace.as_deref(), Some("DAV:"));
        assert_eq!(canonical_name(&element), "DAV::resourcetype");

        let bare = prop_element("plain");
        assert_eq!(canonical_name(&bare), ":plain");
    }
}
