//! The HTTP/1.1 upgrade handshake (RFC 6455 section 4).

use crate::{
    config::{ClientConfig, ServerConfig},
    extension::{Extension, ExtensionChain, ExtensionOffer},
    Error, HandshakeError,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use log::{debug, warn};
use sha1_smol::Sha1;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::Url;

pub const WEBSOCKET_VERSION: &str = "13";
const SEC_WEBSOCKET_ACCEPT_UUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `base64(SHA-1(key + GUID))`, the value of `Sec-WebSocket-Accept`.
pub fn compute_accept(key: &str) -> String {
    let digest = Sha1::from(format!("{}{}", key, SEC_WEBSOCKET_ACCEPT_UUID))
        .digest()
        .bytes();
    BASE64.encode(digest)
}

/// HTTP headers in the order they were received. Lookups ignore case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Headers::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace every header called `name` with a single value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries
            .retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Every comma-separated element of every header called `name`.
    pub fn tokens<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.get_all(name)
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }

    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.tokens(name)
            .any(|candidate| candidate.eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn write_to(&self, out: &mut String) {
        for (name, value) in self.iter() {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Path and query, as in the request line.
    pub resource: String,
    pub headers: Headers,
}

impl HandshakeRequest {
    pub fn new(resource: impl Into<String>) -> Self {
        HandshakeRequest {
            resource: resource.into(),
            headers: Headers::new(),
        }
    }

    pub fn path(&self) -> &str {
        self.resource
            .split_once('?')
            .map_or(self.resource.as_str(), |(path, _)| path)
    }

    pub fn query(&self) -> Option<&str> {
        self.resource.split_once('?').map(|(_, query)| query)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("GET {} HTTP/1.1\r\n", self.resource);
        self.headers.write_to(&mut out);
        out.into_bytes()
    }

    pub async fn write(&self, stream: &mut (impl AsyncWrite + Unpin)) -> Result<(), Error> {
        stream.write_all(&self.to_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read a request line and headers, at most `max_len` bytes in all.
    pub async fn read(
        stream: &mut (impl AsyncRead + Unpin),
        max_len: usize,
    ) -> Result<Self, Error> {
        let (request_line, headers) = read_head(stream, max_len).await?;
        let mut split = request_line.split_ascii_whitespace();
        let (Some("GET"), Some(resource), Some("HTTP/1.1"), None) =
            (split.next(), split.next(), split.next(), split.next())
        else {
            return Err(HandshakeError::InvalidRequest(request_line).into());
        };

        Ok(HandshakeRequest {
            resource: resource.into(),
            headers,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl HandshakeResponse {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        HandshakeResponse {
            status,
            reason: reason.into(),
            headers: Headers::new(),
        }
    }

    /// A response refusing the upgrade.
    pub fn rejection(status: u16, reason: &str) -> Self {
        let mut response = HandshakeResponse::new(status, reason);
        response.headers.append("Connection", "close");
        response.headers.append("Content-Length", "0");
        response
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason);
        self.headers.write_to(&mut out);
        out.into_bytes()
    }

    pub async fn write(&self, stream: &mut (impl AsyncWrite + Unpin)) -> Result<(), Error> {
        stream.write_all(&self.to_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    pub async fn read(
        stream: &mut (impl AsyncRead + Unpin),
        max_len: usize,
    ) -> Result<Self, Error> {
        let (status_line, headers) = read_head(stream, max_len).await?;
        let mut split = status_line.splitn(3, ' ');
        let (Some(version), Some(status)) = (split.next(), split.next()) else {
            return Err(HandshakeError::UnexpectedResponse(status_line).into());
        };
        let Ok(status) = status.parse::<u16>() else {
            return Err(HandshakeError::UnexpectedResponse(status_line).into());
        };
        if !version.starts_with("HTTP/1.") {
            return Err(HandshakeError::UnexpectedResponse(status_line).into());
        }

        Ok(HandshakeResponse {
            status,
            reason: split.next().unwrap_or_default().into(),
            headers,
        })
    }
}

struct CodepointReceiver {
    string: String,
    valid: bool,
}

impl utf8parse::Receiver for CodepointReceiver {
    fn codepoint(&mut self, c: char) {
        self.string.push(c);
    }

    fn invalid_sequence(&mut self) {
        self.valid = false;
    }
}

async fn read_utf8_until(
    stream: &mut (impl AsyncRead + Unpin),
    max_len: usize,
    until: &'static str,
) -> Result<String, Error> {
    let mut parser = utf8parse::Parser::new();
    let mut receiver = CodepointReceiver {
        valid: true,
        string: String::new(),
    };

    let mut read = 0;
    loop {
        let byte = stream.read_u8().await?;
        read += 1;
        parser.advance(&mut receiver, byte);
        if !receiver.valid {
            return Err(HandshakeError::InvalidUtf8.into());
        }
        if receiver.string.ends_with(until) {
            break;
        }
        if read >= max_len {
            return Err(HandshakeError::TooLong(max_len).into());
        }
    }

    Ok(receiver.string)
}

/// The start line and the headers of an HTTP message.
async fn read_head(
    stream: &mut (impl AsyncRead + Unpin),
    max_len: usize,
) -> Result<(String, Headers), Error> {
    let head = read_utf8_until(stream, max_len, "\r\n\r\n").await?;
    let mut lines = head.split("\r\n");
    let start_line = lines.next().unwrap_or_default().to_string();

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(HandshakeError::MissingOrInvalidHeader(line.into()).into());
        };
        headers.append(name.trim(), value.trim());
    }

    Ok((start_line, headers))
}

/// What both sides agreed on.
#[derive(Debug, Default)]
pub struct Negotiated {
    pub subprotocol: Option<String>,
    pub extensions: ExtensionChain,
    /// Server side only, when the server counts its sessions.
    pub permit: Option<SessionPermit>,
}

/// One accepted session, counted until dropped.
#[derive(Debug)]
pub struct SessionPermit {
    count: Arc<AtomicUsize>,
    over_limit: bool,
}

impl SessionPermit {
    pub(crate) fn acquire(count: &Arc<AtomicUsize>, max_sessions: Option<usize>) -> Self {
        let open = count.fetch_add(1, Ordering::AcqRel) + 1;
        SessionPermit {
            count: count.clone(),
            over_limit: max_sessions.map_or(false, |max| open > max),
        }
    }

    /// Whether the session was accepted past the limit and must be refused.
    pub fn is_over_limit(&self) -> bool {
        self.over_limit
    }
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug)]
pub enum Upgrade {
    Accepted {
        response: HandshakeResponse,
        negotiated: Negotiated,
    },
    /// Not a WebSocket request; hand it to something else.
    NotApplicable,
    Failed {
        response: HandshakeResponse,
        error: HandshakeError,
    },
}

/// The server side of the handshake.
#[derive(Debug, Clone)]
pub struct Negotiator {
    config: ServerConfig,
}

impl Negotiator {
    pub fn new(config: ServerConfig) -> Self {
        Negotiator { config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn upgrade(&self, request: &HandshakeRequest) -> Upgrade {
        let headers = &request.headers;
        if !headers.contains_token("upgrade", "websocket")
            || !headers.contains_token("connection", "upgrade")
        {
            return Upgrade::NotApplicable;
        }

        let version = headers.get("sec-websocket-version").unwrap_or_default();
        if version != WEBSOCKET_VERSION {
            debug!("refusing websocket version {:?}", version);
            let mut response = HandshakeResponse::rejection(426, "Upgrade Required");
            response
                .headers
                .append("Sec-WebSocket-Version", WEBSOCKET_VERSION);
            return Upgrade::Failed {
                response,
                error: HandshakeError::UnsupportedVersion(version.into()),
            };
        }

        let key = match headers.get("sec-websocket-key") {
            Some(key) if is_valid_key(key) => key,
            _ => {
                return bad_request(HandshakeError::MissingOrInvalidHeader(
                    "Sec-WebSocket-Key".into(),
                ))
            }
        };
        if headers.get("host").is_none() {
            return bad_request(HandshakeError::MissingOrInvalidHeader("Host".into()));
        }

        let subprotocol = headers.tokens("sec-websocket-protocol").find(|offered| {
            self.config
                .subprotocols
                .iter()
                .any(|supported| supported == offered)
        });
        if subprotocol.is_none() && self.config.require_subprotocol {
            return bad_request(HandshakeError::NoMatchingSubprotocol);
        }

        let offers = ExtensionOffer::parse_headers(headers.get_all("sec-websocket-extensions"));
        let mut accepted = Vec::new();
        let mut chain: Vec<Box<dyn Extension>> = Vec::new();
        for factory in &self.config.extensions {
            let Some(offer) = offers.iter().find(|offer| offer.name == factory.name()) else {
                continue;
            };
            let mut extension = factory.create();
            match extension.on_extension_negotiation(&offer.parameters) {
                Ok(Some(parameters)) => {
                    debug!("accepted extension {}", offer.name);
                    accepted.push(ExtensionOffer {
                        name: offer.name.clone(),
                        parameters,
                    });
                    chain.push(extension);
                }
                Ok(None) => debug!("extension {} declined", offer.name),
                Err(error) => warn!("extension {} failed to negotiate: {}", offer.name, error),
            }
        }

        let mut response = HandshakeResponse::new(101, "Switching Protocols");
        response.headers.append("Upgrade", "websocket");
        response.headers.append("Connection", "Upgrade");
        response
            .headers
            .append("Sec-WebSocket-Accept", compute_accept(key));
        if let Some(subprotocol) = subprotocol {
            response.headers.append("Sec-WebSocket-Protocol", subprotocol);
        }
        if !accepted.is_empty() {
            response
                .headers
                .append("Sec-WebSocket-Extensions", ExtensionOffer::join(&accepted));
        }

        let permit = SessionPermit::acquire(&self.config.sessions, self.config.max_sessions);
        if permit.is_over_limit() {
            debug!("session limit reached, {} open", self.config.open_sessions());
        }

        Upgrade::Accepted {
            response,
            negotiated: Negotiated {
                subprotocol: subprotocol.map(String::from),
                extensions: ExtensionChain::new(chain),
                permit: Some(permit),
            },
        }
    }
}

fn bad_request(error: HandshakeError) -> Upgrade {
    debug!("bad upgrade request: {}", error);
    Upgrade::Failed {
        response: HandshakeResponse::rejection(400, "Bad Request"),
        error,
    }
}

/// A key is 16 random bytes, base64 encoded.
fn is_valid_key(key: &str) -> bool {
    BASE64
        .decode(key)
        .map_or(false, |decoded| decoded.len() == 16)
}

/// The client side of the handshake: a prepared request and what it offered.
pub struct ClientHandshake {
    request: HandshakeRequest,
    key: String,
    subprotocols: Vec<String>,
    extensions: Vec<Box<dyn Extension>>,
}

impl ClientHandshake {
    pub fn prepare_request(url: &Url, config: &ClientConfig) -> Result<Self, Error> {
        let ("ws" | "wss") = url.scheme() else {
            return Err(HandshakeError::IncorrectScheme(url.scheme().into()).into());
        };
        let host = url.host_str().ok_or(HandshakeError::NoHostInUrl)?;
        let host = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let resource = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().into(),
        };

        let mut key_bytes = [0u8; 16];
        getrandom::getrandom(&mut key_bytes)?;
        let key = BASE64.encode(key_bytes);

        let mut request = HandshakeRequest::new(resource);
        let headers = &mut request.headers;
        headers.append("Host", host);
        headers.append("Connection", "Upgrade");
        headers.append("Upgrade", "websocket");
        headers.append("Sec-WebSocket-Version", WEBSOCKET_VERSION);
        headers.append("Sec-WebSocket-Key", key.as_str());
        if let Some(origin) = &config.origin {
            headers.append("Origin", origin.as_str());
        }
        if !config.subprotocols.is_empty() {
            headers.append("Sec-WebSocket-Protocol", config.subprotocols.join(", "));
        }

        let extensions: Vec<_> = config
            .extensions
            .iter()
            .map(|factory| factory.create())
            .collect();
        if !extensions.is_empty() {
            let offers: Vec<_> = extensions
                .iter()
                .map(|extension| ExtensionOffer {
                    name: extension.name().to_string(),
                    parameters: extension.offer(),
                })
                .collect();
            headers.append("Sec-WebSocket-Extensions", ExtensionOffer::join(&offers));
        }
        for (name, value) in &config.headers {
            headers.append(name.as_str(), value.as_str());
        }

        Ok(ClientHandshake {
            request,
            key,
            subprotocols: config.subprotocols.clone(),
            extensions,
        })
    }

    pub fn request(&self) -> &HandshakeRequest {
        &self.request
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn validate_server_response(
        self,
        response: &HandshakeResponse,
    ) -> Result<Negotiated, HandshakeError> {
        if response.status != 101 {
            return Err(HandshakeError::UnexpectedStatus(response.status));
        }
        let headers = &response.headers;
        if !headers.contains_token("upgrade", "websocket") {
            return Err(HandshakeError::MissingOrInvalidHeader("Upgrade".into()));
        }
        if !headers.contains_token("connection", "upgrade") {
            return Err(HandshakeError::MissingOrInvalidHeader("Connection".into()));
        }
        if headers.get("sec-websocket-accept") != Some(compute_accept(&self.key).as_str()) {
            return Err(HandshakeError::InvalidAccept);
        }

        let subprotocol = match headers.get("sec-websocket-protocol") {
            None => None,
            Some(selected) if self.subprotocols.iter().any(|offered| offered == selected) => {
                Some(selected.to_string())
            }
            Some(selected) => return Err(HandshakeError::UnexpectedSubprotocol(selected.into())),
        };

        let mut offered: Vec<Option<Box<dyn Extension>>> =
            self.extensions.into_iter().map(Some).collect();
        let mut chain = Vec::new();
        for accepted in ExtensionOffer::parse_headers(headers.get_all("sec-websocket-extensions")) {
            let Some(mut extension) = offered
                .iter_mut()
                .find(|slot| {
                    slot.as_ref()
                        .map_or(false, |extension| extension.name() == accepted.name)
                })
                .and_then(Option::take)
            else {
                return Err(HandshakeError::UnexpectedExtension(accepted.name));
            };
            extension
                .on_handshake_response(&accepted.parameters)
                .map_err(|error| HandshakeError::Extension {
                    name: accepted.name.clone(),
                    message: error.to_string(),
                })?;
            chain.push(extension);
        }

        Ok(Negotiated {
            subprotocol,
            extensions: ExtensionChain::new(chain),
            permit: None,
        })
    }
}

impl std::fmt::Debug for ClientHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandshake")
            .field("request", &self.request)
            .field("subprotocols", &self.subprotocols)
            .finish()
    }
}
