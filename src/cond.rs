//! Parser and evaluator for the WebDAV `If` request header.
//!
//! The header is a disjunctive normal form over lock tokens and entity
//! tags: each parenthesized list AND-joins its conditions, the lists
//! themselves are OR-joined, and a list may name the resource its
//! conditions apply to:
//!
//! ```text
//! IfTag  := List+
//! List   := ("<" Resource ">")? "(" Cond+ ")"
//! Cond   := "Not"? ( "[" ETag "]" | "<" Token ">" | BareToken )
//! ```

use axum::http::Uri;

use crate::error::DavError;
use crate::http::same_host;

/// Environment against which conditions are evaluated.
pub trait Env {
    /// Current entity tag for a resource, empty when unknown.
    fn etag(&self, resource: &str) -> String;
    /// Whether the lock identified by `token` covers `resource`.
    fn locked(&self, resource: &str, token: &str) -> bool;
}

/// What a single condition matches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Match {
    ETag(String),
    Token(String),
}

/// A single, possibly negated condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub not: bool,
    pub matcher: Match,
}

impl Condition {
    fn eval(&self, env: &dyn Env, resource: &str) -> bool {
        let result = match &self.matcher {
            Match::ETag(etag) => env.etag(resource) == *etag,
            Match::Token(token) => env.locked(resource, token),
        };
        result != self.not
    }
}

/// Conditions AND-joined against one resource (or the request default).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CondList {
    pub resource: Option<String>,
    pub conditions: Vec<Condition>,
}

impl CondList {
    fn eval(&self, env: &dyn Env, default_resource: &str) -> bool {
        let resource = self.resource.as_deref().unwrap_or(default_resource);
        self.conditions.iter().all(|c| c.eval(env, resource))
    }
}

/// A parsed `If` header: lists OR-joined into a DNF condition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IfTag {
    pub lists: Vec<CondList>,
}

impl IfTag {
    /// Parses the header value. Unterminated brackets, empty etags, empty
    /// conditions, and missing parentheses are reported as errors.
    pub fn parse(input: &str) -> Result<IfTag, DavError> {
        let mut lexer = Lexer::new(input);
        let mut tag = IfTag::default();
        while lexer.peek() != Token::Eof {
            tag.lists.push(parse_list(&mut lexer)?);
        }
        Ok(tag)
    }

    /// Evaluates the header for the given default resource.
    pub fn eval(&self, env: &dyn Env, default_resource: &str) -> bool {
        self.lists.iter().any(|l| l.eval(env, default_resource))
    }

    /// Every state token across every list, for lock-token matching.
    pub fn all_tokens(&self) -> Vec<String> {
        self.lists
            .iter()
            .flat_map(|l| &l.conditions)
            .filter_map(|c| match &c.matcher {
                Match::Token(token) => Some(token.clone()),
                Match::ETag(_) => None,
            })
            .collect()
    }

    /// The sole token, if the header consists of exactly one list holding
    /// exactly one non-negated state condition. Anything else is ambiguous
    /// and yields `None`.
    pub fn single_state(&self) -> Option<String> {
        let [list] = self.lists.as_slice() else {
            return None;
        };
        let [condition] = list.conditions.as_slice() else {
            return None;
        };
        if condition.not {
            return None;
        }
        match &condition.matcher {
            Match::Token(token) => Some(token.clone()),
            Match::ETag(_) => None,
        }
    }

    /// Reduces absolute resource URIs to their path, rejecting any whose
    /// host does not match the request host.
    pub fn rewrite_hosts(&mut self, host: &str) -> Result<(), DavError> {
        for list in &mut self.lists {
            let Some(resource) = &list.resource else {
                continue;
            };
            if resource.starts_with('/') {
                continue;
            }
            let uri: Uri = resource
                .parse()
                .map_err(|e| DavError::BAD_LOCK.with_cause(e))?;
            if let Some(authority) = uri.authority()
                && !same_host(authority.as_str(), uri.scheme_str(), host)
            {
                return Err(DavError::BAD_HOST.with_cause(format!("resource {resource}")));
            }
            list.resource = Some(uri.path().to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Eof,
    Not,
    Char(char),
}

struct Lexer {
    input: Vec<char>,
    pos: usize,
    last: Token,
}

impl Lexer {
    fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            pos: 0,
            last: Token::Eof,
        }
    }

    fn skip_whitespace(&mut self) {
        while self.input.get(self.pos).is_some_and(|c| c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Token {
        self.skip_whitespace();
        let token = match self.input.get(self.pos) {
            None => Token::Eof,
            Some('N')
                if self.input.get(self.pos + 1) == Some(&'o')
                    && self.input.get(self.pos + 2) == Some(&'t') =>
            {
                Token::Not
            }
            Some(&c) => Token::Char(c),
        };
        self.last = token;
        token
    }

    fn consume(&mut self) {
        match self.last {
            Token::Not => self.pos += 3,
            Token::Char(_) => self.pos += 1,
            Token::Eof => {}
        }
    }

    /// Consumes characters while `accept` holds; the flag reports whether
    /// the input ended mid-scan.
    fn consume_while(&mut self, accept: impl Fn(char) -> bool) -> (String, bool) {
        let mut result = String::new();
        loop {
            match self.input.get(self.pos) {
                None => return (result, true),
                Some(&c) if accept(c) => {
                    self.pos += 1;
                    result.push(c);
                }
                Some(_) => return (result, false),
            }
        }
    }

    fn consume_until(&mut self, stop: char) -> Result<String, DavError> {
        let (result, eof) = self.consume_while(|c| c != stop);
        if eof {
            return Err(DavError::BAD_LOCK.with_cause(format!("unterminated, expected {stop}")));
        }
        self.pos += 1;
        Ok(result)
    }
}

fn parse_condition(lexer: &mut Lexer) -> Result<Condition, DavError> {
    let mut not = false;
    let mut token = lexer.peek();
    if token == Token::Not {
        lexer.consume();
        not = true;
        token = lexer.peek();
    }
    if token == Token::Char('[') {
        lexer.consume();
        let etag = lexer.consume_until(']')?;
        if etag.is_empty() {
            return Err(DavError::BAD_LOCK.with_cause("empty etag"));
        }
        return Ok(Condition {
            not,
            matcher: Match::ETag(etag),
        });
    }
    let (mut state, _) = lexer.consume_while(|c| c != ')' && !c.is_whitespace());
    if state.len() >= 2 && state.starts_with('<') && state.ends_with('>') {
        state = state[1..state.len() - 1].to_string();
    }
    if state.is_empty() {
        return Err(DavError::BAD_LOCK.with_cause("empty condition"));
    }
    Ok(Condition {
        not,
        matcher: Match::Token(state),
    })
}

fn parse_list(lexer: &mut Lexer) -> Result<CondList, DavError> {
    let mut list = CondList::default();
    let mut token = lexer.peek();
    if token == Token::Char('<') {
        lexer.consume();
        let resource = lexer.consume_until('>')?;
        if resource.is_empty() {
            return Err(DavError::BAD_LOCK.with_cause("empty resource"));
        }
        list.resource = Some(resource);
        token = lexer.peek();
    }
    if token != Token::Char('(') {
        return Err(DavError::BAD_LOCK.with_cause("expected ("));
    }
    lexer.consume();
    let mut token = lexer.peek();
    while token != Token::Char(')') && token != Token::Eof {
        list.conditions.push(parse_condition(lexer)?);
        token = lexer.peek();
    }
    if token != Token::Char(')') {
        return Err(DavError::BAD_LOCK.with_cause("expected )"));
    }
    lexer.consume();
    Ok(list)
}
