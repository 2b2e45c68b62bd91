//! SIP message types and parsing

use bytes::Bytes;
use rsip::{Header, Headers, Method, Request, Response, Uri};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

/// SIP method types the engine handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Message,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Message => "MESSAGE",
        }
    }

    pub fn from_rsip(method: &Method) -> Option<Self> {
        match method {
            Method::Register => Some(SipMethod::Register),
            Method::Invite => Some(SipMethod::Invite),
            Method::Ack => Some(SipMethod::Ack),
            Method::Cancel => Some(SipMethod::Cancel),
            Method::Bye => Some(SipMethod::Bye),
            Method::Options => Some(SipMethod::Options),
            Method::Message => Some(SipMethod::Message),
            _ => None,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Strip the "Name: " prefix rsip's Display adds to header lines.
fn header_value(line: &str) -> &str {
    match line.split_once(':') {
        Some((_, v)) => v.trim_start(),
        None => line,
    }
}

/// Pull a named parameter out of a header value (e.g. branch= from Via).
fn header_param<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    for part in value.split(';') {
        let part = part.trim();
        if let Some((k, v)) = part.split_once('=') {
            if k.eq_ignore_ascii_case(name) {
                return Some(v.trim_matches('"'));
            }
        }
    }
    None
}

/// SIP Request wrapper
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Ok(Self::new(request))
    }

    pub fn method(&self) -> Option<SipMethod> {
        SipMethod::from_rsip(&self.inner.method)
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    fn find_header_value(&self, matcher: impl Fn(&Header) -> bool) -> Option<String> {
        self.inner.headers.iter().find_map(|h| {
            if matcher(h) {
                Some(header_value(&h.to_string()).to_string())
            } else {
                None
            }
        })
    }

    pub fn call_id(&self) -> Option<String> {
        self.find_header_value(|h| matches!(h, Header::CallId(_)))
    }

    pub fn from_value(&self) -> Option<String> {
        self.find_header_value(|h| matches!(h, Header::From(_)))
    }

    pub fn to_value(&self) -> Option<String> {
        self.find_header_value(|h| matches!(h, Header::To(_)))
    }

    pub fn via_value(&self) -> Option<String> {
        self.find_header_value(|h| matches!(h, Header::Via(_)))
    }

    /// Via branch parameter, the transaction identifier.
    pub fn via_branch(&self) -> Option<String> {
        self.via_value()
            .and_then(|v| header_param(&v, "branch").map(|b| b.to_string()))
    }

    pub fn cseq(&self) -> Option<u32> {
        self.find_header_value(|h| matches!(h, Header::CSeq(_)))
            .and_then(|v| v.split_whitespace().next().and_then(|n| n.parse().ok()))
    }

    /// Key identifying a transaction for retransmission deduplication.
    pub fn transaction_key(&self) -> Option<String> {
        let branch = self.via_branch()?;
        let method = self.method()?;
        let cseq = self.cseq().unwrap_or(0);
        Some(format!("{}|{}|{}", branch, method, cseq))
    }

    /// Every header as a (name, value) pair, for filter evaluation.
    pub fn header_pairs(&self) -> Vec<(String, String)> {
        self.inner
            .headers
            .iter()
            .filter_map(|h| {
                let line = h.to_string();
                line.split_once(':')
                    .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
            })
            .collect()
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// SIP Response wrapper
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    fn find_header_value(&self, matcher: impl Fn(&Header) -> bool) -> Option<String> {
        self.inner.headers.iter().find_map(|h| {
            if matcher(h) {
                Some(header_value(&h.to_string()).to_string())
            } else {
                None
            }
        })
    }

    pub fn call_id(&self) -> Option<String> {
        self.find_header_value(|h| matches!(h, Header::CallId(_)))
    }

    pub fn cseq_method(&self) -> Option<String> {
        self.find_header_value(|h| matches!(h, Header::CSeq(_)))
            .and_then(|v| v.split_whitespace().nth(1).map(|m| m.to_string()))
    }

    pub fn cseq(&self) -> Option<u32> {
        self.find_header_value(|h| matches!(h, Header::CSeq(_)))
            .and_then(|v| v.split_whitespace().next().and_then(|n| n.parse().ok()))
    }

    /// Granted registration lifetime: the Expires header, else the expires
    /// parameter of the Contact header.
    pub fn granted_expires(&self) -> Option<u32> {
        if let Some(v) = self.find_header_value(|h| matches!(h, Header::Expires(_))) {
            if let Ok(n) = v.trim().parse() {
                return Some(n);
            }
        }
        self.find_header_value(|h| matches!(h, Header::Contact(_)))
            .and_then(|v| header_param(&v, "expires").and_then(|e| e.parse().ok()))
    }

    /// WWW-Authenticate / Proxy-Authenticate challenge value, if present.
    pub fn auth_challenge(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::WwwAuthenticate(_) | Header::ProxyAuthenticate(_) => {
                Some(header_value(&h.to_string()).to_string())
            }
            _ => None,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        // Requests are the common case on the listening path
        if data.starts_with(b"SIP/2.0") {
            return Ok(SipMessage::Response(SipResponse::parse(data)?));
        }
        if let Ok(request) = SipRequest::parse(data) {
            return Ok(SipMessage::Request(request));
        }
        if let Ok(response) = SipResponse::parse(data) {
            return Ok(SipMessage::Response(response));
        }
        Err(SipError::ParseError(
            "could not parse as SIP request or response".to_string(),
        ))
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}
