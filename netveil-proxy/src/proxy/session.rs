//! A single intercepted HTTP transaction

use bytes::Bytes;
use hyper::header::{HeaderMap, CONTENT_TYPE};
use hyper::Method;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use url::{Host, Url};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Certificate presented by the upstream server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCertificate {
    /// Hex SHA-1 thumbprint, as shown in certificate dialogs
    pub thumbprint: String,
    pub subject: String,
    /// Empty when the chain validated
    pub validation_errors: Vec<String>,
}

impl ServerCertificate {
    pub fn is_valid(&self) -> bool {
        self.validation_errors.is_empty()
    }
}

/// Response received from upstream
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    /// Buffered body; only a prefix when `truncated`, empty when not inspected
    pub body: Bytes,
    pub truncated: bool,
}

/// Response substituted by a filter callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Bytes,
}

#[derive(Debug)]
pub struct Session {
    id: u64,
    method: Method,
    url: Url,
    request_headers: HeaderMap,
    response: Option<UpstreamResponse>,
    certificate: Option<ServerCertificate>,
    custom: Option<CustomResponse>,
    whitelisted: bool,
}

impl Session {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            method,
            url,
            request_headers: HeaderMap::new(),
            response: None,
            certificate: None,
            custom: None,
            whitelisted: false,
        }
    }

    pub fn with_request_headers(mut self, headers: HeaderMap) -> Self {
        self.request_headers = headers;
        self
    }

    pub fn with_certificate(mut self, certificate: ServerCertificate) -> Self {
        self.certificate = Some(certificate);
        self
    }

    pub fn with_response(mut self, status: u16, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        self.set_response(status, headers, body);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Literal address when the request targets an IP rather than a name
    pub fn ip(&self) -> Option<IpAddr> {
        match self.url.host()? {
            Host::Ipv4(addr) => Some(IpAddr::V4(addr)),
            Host::Ipv6(addr) => Some(IpAddr::V6(addr)),
            Host::Domain(_) => None,
        }
    }

    pub fn request_headers(&self) -> &HeaderMap {
        &self.request_headers
    }

    pub fn certificate(&self) -> Option<&ServerCertificate> {
        self.certificate.as_ref()
    }

    pub fn response(&self) -> Option<&UpstreamResponse> {
        self.response.as_ref()
    }

    pub fn set_response(&mut self, status: u16, headers: HeaderMap, body: impl Into<Bytes>) {
        self.response = Some(UpstreamResponse {
            status,
            headers,
            body: body.into(),
            truncated: false,
        });
    }

    /// The buffered body stops short of the full upstream body
    pub fn mark_response_truncated(&mut self) {
        if let Some(response) = self.response.as_mut() {
            response.truncated = true;
        }
    }

    /// Response `Content-Type` without parameters, lowercased
    pub fn response_content_type(&self) -> Option<String> {
        content_type_essence(&self.response.as_ref()?.headers)
    }

    /// Replace whatever the proxy would have returned
    pub fn send_custom_response(&mut self, status: u16, content_type: &str, body: impl Into<Bytes>) {
        self.custom = Some(CustomResponse {
            status,
            content_type: content_type.to_string(),
            body: body.into(),
        });
    }

    pub fn custom_response(&self) -> Option<&CustomResponse> {
        self.custom.as_ref()
    }

    pub fn take_custom_response(&mut self) -> Option<CustomResponse> {
        self.custom.take()
    }

    pub fn mark_whitelisted(&mut self) {
        self.whitelisted = true;
    }

    pub fn is_whitelisted(&self) -> bool {
        self.whitelisted
    }
}

/// `Content-Type` without parameters, lowercased
pub fn content_type_essence(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(CONTENT_TYPE)?.to_str().ok()?;
    let essence = value.split(';').next().unwrap_or_default().trim();
    Some(essence.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn test_session_ids_unique() {
        let a = Session::new(Method::GET, Url::parse("http://a.example/").unwrap());
        let b = Session::new(Method::GET, Url::parse("http://b.example/").unwrap());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.host(), "a.example");
        assert!(a.ip().is_none());
    }

    #[test]
    fn test_ip_host() {
        let s = Session::new(Method::GET, Url::parse("http://10.1.2.3:8080/x").unwrap());
        assert_eq!(s.ip(), Some("10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn test_content_type_essence() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("Text/HTML; charset=utf-8"));
        let s = Session::new(Method::GET, Url::parse("http://a.example/").unwrap())
            .with_response(200, headers, "body");
        assert_eq!(s.response_content_type().as_deref(), Some("text/html"));
        assert!(!s.response().unwrap().truncated);
    }

    #[test]
    fn test_custom_response() {
        let mut s = Session::new(Method::GET, Url::parse("http://a.example/").unwrap());
        assert!(s.custom_response().is_none());
        s.send_custom_response(403, "text/html", "blocked");
        assert_eq!(s.custom_response().unwrap().status, 403);
        let taken = s.take_custom_response().unwrap();
        assert_eq!(taken.body, Bytes::from("blocked"));
        assert!(s.custom_response().is_none());
    }
}
