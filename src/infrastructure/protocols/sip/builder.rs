//! SIP message construction

use super::message::{SipError, SipRequest, SipResponse};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rsip::{Header, Headers, Method, Request, Response, StatusCode, Uri, Version};

/// Build a response for an inbound request, echoing the transaction headers.
pub struct ResponseBuilder {
    status_code: u16,
    reason: Option<String>,
    headers: Vec<Header>,
    body: Vec<u8>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            reason: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Put a custom reason phrase on the status line instead of the default
    /// one for the code.
    pub fn with_phrase(mut self, phrase: impl Into<String>) -> Self {
        self.reason = Some(phrase.into());
        self
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn ringing() -> Self {
        Self::new(180)
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn build_for_request(mut self, request: &SipRequest) -> Result<SipResponse, SipError> {
        // Copy the transaction headers from the request
        for header in request.headers().iter() {
            match header {
                Header::Via(_)
                | Header::From(_)
                | Header::To(_)
                | Header::CallId(_)
                | Header::CSeq(_) => {
                    self.headers.push(header.clone());
                }
                _ => {}
            }
        }

        self.headers.push(Header::ContentLength(
            self.body.len().to_string().into(),
        ));

        let status_code = match self.reason.take() {
            Some(reason) => StatusCode::Other(self.status_code, reason),
            None => StatusCode::from(self.status_code),
        };
        let response = Response {
            status_code,
            headers: Headers::from(self.headers),
            body: self.body,
            version: Version::V2,
        };

        Ok(SipResponse::new(response))
    }
}

/// Random token generators for Via branches, tags and Call-IDs.
pub fn make_branch() -> String {
    format!("z9hG4bK{}", random_token(16))
}

pub fn make_tag() -> String {
    random_token(10)
}

pub fn make_call_id(host: &str) -> String {
    format!("{}@{}", uuid::Uuid::new_v4().simple(), host)
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Fields needed to build an outbound REGISTER toward a remote registrar.
pub struct RegisterParams<'a> {
    pub username: &'a str,
    pub registrar: &'a str,
    /// host:port advertised in Contact (public address when configured)
    pub contact_host: &'a str,
    /// host:port of the local listener, placed in Via
    pub via_host: &'a str,
    pub user_agent: &'a str,
    pub call_id: &'a str,
    pub cseq: u32,
    pub expires: u32,
    pub from_tag: &'a str,
    /// Ready-made Authorization header value, when answering a challenge
    pub authorization: Option<String>,
}

/// Build an outbound REGISTER request.
pub fn build_register_request(params: &RegisterParams<'_>) -> Result<SipRequest, SipError> {
    let uri = Uri::try_from(format!("sip:{}", params.registrar).as_str())
        .map_err(|e| SipError::InvalidMessage(format!("bad registrar address: {}", e)))?;

    let aor = format!("sip:{}@{}", params.username, params.registrar);
    let mut headers: Vec<Header> = Vec::new();
    headers.push(Header::Via(
        format!(
            "SIP/2.0/UDP {};branch={};rport",
            params.via_host,
            make_branch()
        )
        .into(),
    ));
    headers.push(Header::MaxForwards("70".into()));
    headers.push(Header::From(
        format!("<{}>;tag={}", aor, params.from_tag).into(),
    ));
    headers.push(Header::To(format!("<{}>", aor).into()));
    headers.push(Header::CallId(params.call_id.into()));
    headers.push(Header::CSeq(format!("{} REGISTER", params.cseq).into()));
    headers.push(Header::Contact(
        format!("<sip:{}@{}>", params.username, params.contact_host).into(),
    ));
    headers.push(Header::Expires(params.expires.to_string().into()));
    headers.push(Header::UserAgent(params.user_agent.into()));
    if let Some(authorization) = &params.authorization {
        headers.push(Header::Authorization(authorization.as_str().into()));
    }
    headers.push(Header::ContentLength("0".into()));

    let request = Request {
        method: Method::Register,
        uri,
        headers: Headers::from(headers),
        version: Version::V2,
        body: Vec::new(),
    };

    Ok(SipRequest::new(request))
}

/// Keepalive payload: the double CRLF recommended for NAT binding refresh.
pub fn keepalive_packet() -> &'static [u8] {
    b"\r\n\r\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::message::SipMethod;

    #[test]
    fn test_build_register_request() {
        let req = build_register_request(&RegisterParams {
            username: "alice",
            registrar: "sip.example.com",
            contact_host: "203.0.113.7:4998",
            via_host: "10.0.0.5:4998",
            user_agent: "Local Push",
            call_id: "reg-1@10.0.0.5",
            cseq: 1,
            expires: 600,
            from_tag: "tag1",
            authorization: None,
        })
        .unwrap();

        assert_eq!(req.method(), Some(SipMethod::Register));
        assert_eq!(req.cseq(), Some(1));
        assert_eq!(req.call_id(), Some("reg-1@10.0.0.5".to_string()));

        let wire = String::from_utf8(req.to_bytes().to_vec()).unwrap();
        assert!(wire.starts_with("REGISTER sip:sip.example.com SIP/2.0"));
        assert!(wire.contains("Contact: <sip:alice@203.0.113.7:4998>"));
        assert!(wire.contains("Expires: 600"));
    }

    #[test]
    fn test_register_request_round_trips() {
        let req = build_register_request(&RegisterParams {
            username: "bob",
            registrar: "sip.example.com:5060",
            contact_host: "10.0.0.5:4998",
            via_host: "10.0.0.5:4998",
            user_agent: "Local Push",
            call_id: "reg-2@10.0.0.5",
            cseq: 7,
            expires: 300,
            from_tag: "tag2",
            authorization: Some("Digest username=\"bob\"".to_string()),
        })
        .unwrap();

        let parsed = SipRequest::parse(&req.to_bytes()).unwrap();
        assert_eq!(parsed.cseq(), Some(7));
        assert_eq!(parsed.method(), Some(SipMethod::Register));
    }

    #[test]
    fn test_response_builder_echoes_transaction_headers() {
        let data = b"MESSAGE sip:bob@example.com SIP/2.0\r\n\
            Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKmsg1\r\n\
            From: <sip:alice@example.com>;tag=88\r\n\
            To: <sip:bob@example.com>\r\n\
            Call-ID: msg-1@host\r\n\
            CSeq: 1 MESSAGE\r\n\
            Content-Length: 0\r\n\r\n";
        let req = SipRequest::parse(data).unwrap();

        let resp = ResponseBuilder::new(413).build_for_request(&req).unwrap();
        assert_eq!(resp.status_code(), 413);
        assert_eq!(resp.call_id(), Some("msg-1@host".to_string()));

        let wire = String::from_utf8(resp.to_bytes().to_vec()).unwrap();
        assert!(wire.starts_with("SIP/2.0 413"));
    }

    #[test]
    fn test_configured_phrase_reaches_the_status_line() {
        let data = b"MESSAGE sip:bob@example.com SIP/2.0\r\n\
            Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKmsg2\r\n\
            From: <sip:alice@example.com>;tag=88\r\n\
            To: <sip:bob@example.com>\r\n\
            Call-ID: msg-2@host\r\n\
            CSeq: 1 MESSAGE\r\n\
            Content-Length: 0\r\n\r\n";
        let req = SipRequest::parse(data).unwrap();

        let resp = ResponseBuilder::new(606)
            .with_phrase("Blocked By Policy")
            .build_for_request(&req)
            .unwrap();
        assert_eq!(resp.status_code(), 606);

        let wire = String::from_utf8(resp.to_bytes().to_vec()).unwrap();
        assert!(
            wire.starts_with("SIP/2.0 606 Blocked By Policy"),
            "got {}",
            wire
        );
    }

    #[test]
    fn test_branch_tokens_are_unique() {
        assert_ne!(make_branch(), make_branch());
        assert!(make_branch().starts_with("z9hG4bK"));
    }
}
