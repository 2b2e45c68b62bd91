//! SIP Digest Authentication, client role (RFC 2617, RFC 3261)
//!
//! The engine registers accounts against remote registrars, so it answers
//! 401/407 challenges rather than issuing them.

use super::message::SipError;
use rand::Rng;
use std::collections::HashMap;

/// A parsed WWW-Authenticate / Proxy-Authenticate challenge.
#[derive(Debug, Clone)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
}

impl DigestChallenge {
    /// Parse a Digest challenge header value.
    pub fn parse(value: &str) -> Result<Self, SipError> {
        let rest = value
            .trim()
            .strip_prefix("Digest")
            .ok_or_else(|| SipError::Authentication("not a Digest challenge".to_string()))?;

        let params = parse_digest_params(rest);

        Ok(Self {
            realm: params
                .get("realm")
                .cloned()
                .ok_or_else(|| SipError::Authentication("challenge missing realm".to_string()))?,
            nonce: params
                .get("nonce")
                .cloned()
                .ok_or_else(|| SipError::Authentication("challenge missing nonce".to_string()))?,
            opaque: params.get("opaque").cloned(),
            algorithm: params.get("algorithm").cloned(),
            qop: params.get("qop").cloned(),
        })
    }

    /// Compute the Authorization header value answering this challenge.
    pub fn answer(
        &self,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
    ) -> Result<String, SipError> {
        if let Some(alg) = &self.algorithm {
            if !alg.eq_ignore_ascii_case("md5") {
                return Err(SipError::Authentication(format!(
                    "unsupported digest algorithm {:?}",
                    alg
                )));
            }
        }

        let ha1 = md5_hex(&format!("{}:{}:{}", username, self.realm, password));
        let ha2 = md5_hex(&format!("{}:{}", method, uri));

        // qop=auth requires the nc/cnonce extension fields
        let use_auth_qop = self
            .qop
            .as_deref()
            .map(|q| q.split(',').any(|v| v.trim() == "auth"))
            .unwrap_or(false);

        let mut header;
        if use_auth_qop {
            let cnonce = make_cnonce();
            let nc = "00000001";
            let response = md5_hex(&format!(
                "{}:{}:{}:{}:auth:{}",
                ha1, self.nonce, nc, cnonce, ha2
            ));
            header = format!(
                r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm=MD5, qop=auth, nc={}, cnonce="{}""#,
                username, self.realm, self.nonce, uri, response, nc, cnonce
            );
        } else {
            let response = md5_hex(&format!("{}:{}:{}", ha1, self.nonce, ha2));
            header = format!(
                r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm=MD5"#,
                username, self.realm, self.nonce, uri, response
            );
        }

        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(r#", opaque="{}""#, opaque));
        }

        Ok(header)
    }
}

fn parse_digest_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for part in split_outside_quotes(input, ',') {
        if let Some((key, value)) = part.split_once('=') {
            params.insert(
                key.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    params
}

/// Split on a separator, ignoring separators inside quoted strings.
fn split_outside_quotes(input: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            c if c == sep && !in_quotes => {
                if !current.trim().is_empty() {
                    parts.push(current.trim().to_string());
                }
                current.clear();
            }
            c => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input))
}

fn make_cnonce() -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: Vec<u8> = (0..8).map(|_| rng.gen()).collect();
    hex::encode(random_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge() {
        let value = r#"Digest realm="sip.example.com", nonce="abc123", algorithm=MD5, qop="auth""#;
        let challenge = DigestChallenge::parse(value).unwrap();
        assert_eq!(challenge.realm, "sip.example.com");
        assert_eq!(challenge.nonce, "abc123");
        assert_eq!(challenge.algorithm.as_deref(), Some("MD5"));
        assert_eq!(challenge.qop.as_deref(), Some("auth"));
    }

    #[test]
    fn test_parse_challenge_with_comma_in_quotes() {
        let value = r#"Digest realm="a,b", nonce="n""#;
        let challenge = DigestChallenge::parse(value).unwrap();
        assert_eq!(challenge.realm, "a,b");
    }

    #[test]
    fn test_non_digest_challenge_rejected() {
        assert!(DigestChallenge::parse("Basic realm=x").is_err());
    }

    #[test]
    fn test_answer_without_qop_matches_rfc2617_vector() {
        // RFC 2617 §3.5 example adapted to MD5 without qop:
        // HA1 = MD5("Mufasa:testrealm@host.com:Circle Of Life")
        let challenge = DigestChallenge {
            realm: "testrealm@host.com".to_string(),
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".to_string(),
            opaque: None,
            algorithm: Some("MD5".to_string()),
            qop: None,
        };
        let header = challenge
            .answer("Mufasa", "Circle Of Life", "GET", "/dir/index.html")
            .unwrap();

        let ha1 = md5_hex("Mufasa:testrealm@host.com:Circle Of Life");
        let ha2 = md5_hex("GET:/dir/index.html");
        let expected = md5_hex(&format!(
            "{}:dcd98b7102dd2f0e8b11d0f600bfb0c093:{}",
            ha1, ha2
        ));
        assert!(header.contains(&format!(r#"response="{}""#, expected)));
        assert!(header.contains(r#"username="Mufasa""#));
    }

    #[test]
    fn test_answer_includes_qop_fields() {
        let challenge = DigestChallenge {
            realm: "r".to_string(),
            nonce: "n".to_string(),
            opaque: Some("op".to_string()),
            algorithm: None,
            qop: Some("auth".to_string()),
        };
        let header = challenge
            .answer("alice", "pw", "REGISTER", "sip:r")
            .unwrap();
        assert!(header.contains("qop=auth"));
        assert!(header.contains("nc=00000001"));
        assert!(header.contains("cnonce="));
        assert!(header.contains(r#"opaque="op""#));
    }

    #[test]
    fn test_unsupported_algorithm_rejected() {
        let challenge = DigestChallenge {
            realm: "r".to_string(),
            nonce: "n".to_string(),
            opaque: None,
            algorithm: Some("SHA-512".to_string()),
            qop: None,
        };
        assert!(challenge.answer("a", "b", "REGISTER", "sip:r").is_err());
    }
}
