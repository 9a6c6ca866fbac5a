//! Negotiated per-connection frame transforms.
//!
//! Every connection gets its own extension instances from the registered
//! [`ExtensionFactory`]s, so an extension may keep per-connection state
//! (a compression context, say) without any locking of its own.

use crate::{Error, Frame};
use log::{debug, trace};
use std::{fmt, sync::Arc};

pub type ExtensionError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionParameter {
    pub name: String,
    pub value: Option<String>,
}

impl ExtensionParameter {
    pub fn new(name: impl Into<String>, value: Option<&str>) -> Self {
        ExtensionParameter {
            name: name.into(),
            value: value.map(String::from),
        }
    }
}

impl fmt::Display for ExtensionParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            None => write!(f, "{}", self.name),
            Some(value) if is_token(value) => write!(f, "{}={}", self.name, value),
            Some(value) => {
                write!(f, "{}=\"", self.name)?;
                for c in value.chars() {
                    if c == '"' || c == '\\' {
                        write!(f, "\\")?;
                    }
                    write!(f, "{}", c)?;
                }
                write!(f, "\"")
            }
        }
    }
}

fn is_token(value: &str) -> bool {
    !value.is_empty()
        && value.bytes().all(|b| {
            b.is_ascii_graphic() && !b"()<>@,;:\\\"/[]?={}".contains(&b)
        })
}

/// One entry of a `Sec-WebSocket-Extensions` header: a name and its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionOffer {
    pub name: String,
    pub parameters: Vec<ExtensionParameter>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ParserState {
    Name,
    ParamName,
    ParamValue,
    ParamValueQuoted,
    ParamValueQuotedEscape,
    ParamValueQuotedPost,
    Error,
}

#[derive(Default)]
struct OfferParser {
    offers: Vec<ExtensionOffer>,
    name: String,
    param_name: String,
    param_value: String,
    parameters: Vec<ExtensionParameter>,
}

impl OfferParser {
    fn push_parameter(&mut self, with_value: bool) {
        let name = self.param_name.trim().to_string();
        let value = std::mem::take(&mut self.param_value);
        self.param_name.clear();
        if name.is_empty() {
            return;
        }
        let value = with_value.then(|| value.trim().to_string());
        self.parameters.push(ExtensionParameter { name, value });
    }

    fn push_quoted_parameter(&mut self) {
        let name = self.param_name.trim().to_string();
        let value = std::mem::take(&mut self.param_value);
        self.param_name.clear();
        self.parameters.push(ExtensionParameter {
            name,
            value: Some(value),
        });
    }

    fn push_offer(&mut self) {
        let name = self.name.trim().to_string();
        let parameters = std::mem::take(&mut self.parameters);
        self.reset();
        if !name.is_empty() {
            self.offers.push(ExtensionOffer { name, parameters });
        }
    }

    fn reset(&mut self) {
        self.name.clear();
        self.param_name.clear();
        self.param_value.clear();
        self.parameters.clear();
    }
}

impl ExtensionOffer {
    pub fn new(name: impl Into<String>) -> Self {
        ExtensionOffer {
            name: name.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        self.parameters.push(ExtensionParameter::new(name, value));
        self
    }

    /// Parse every `Sec-WebSocket-Extensions` header value, in order.
    ///
    /// A malformed entry is skipped and parsing resumes at the next `,`.
    pub fn parse_headers<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<ExtensionOffer> {
        let mut parser = OfferParser::default();

        for value in values {
            let mut state = ParserState::Name;
            for c in value.chars() {
                state = match (state, c) {
                    (ParserState::Name, ';') => ParserState::ParamName,
                    (ParserState::Name, ',') => {
                        parser.push_offer();
                        ParserState::Name
                    }
                    (ParserState::Name, '=') => ParserState::Error,
                    (ParserState::Name, c) => {
                        parser.name.push(c);
                        ParserState::Name
                    }

                    (ParserState::ParamName, ';') => {
                        parser.push_parameter(false);
                        ParserState::ParamName
                    }
                    (ParserState::ParamName, ',') => {
                        parser.push_parameter(false);
                        parser.push_offer();
                        ParserState::Name
                    }
                    (ParserState::ParamName, '=') => ParserState::ParamValue,
                    (ParserState::ParamName, c) => {
                        parser.param_name.push(c);
                        ParserState::ParamName
                    }

                    (ParserState::ParamValue, '"') if parser.param_value.trim().is_empty() => {
                        parser.param_value.clear();
                        ParserState::ParamValueQuoted
                    }
                    (ParserState::ParamValue, '"' | '=') => ParserState::Error,
                    (ParserState::ParamValue, ';') => {
                        parser.push_parameter(true);
                        ParserState::ParamName
                    }
                    (ParserState::ParamValue, ',') => {
                        parser.push_parameter(true);
                        parser.push_offer();
                        ParserState::Name
                    }
                    (ParserState::ParamValue, c) => {
                        parser.param_value.push(c);
                        ParserState::ParamValue
                    }

                    (ParserState::ParamValueQuoted, '"') => {
                        parser.push_quoted_parameter();
                        ParserState::ParamValueQuotedPost
                    }
                    (ParserState::ParamValueQuoted, '\\') => ParserState::ParamValueQuotedEscape,
                    (ParserState::ParamValueQuoted, c) => {
                        parser.param_value.push(c);
                        ParserState::ParamValueQuoted
                    }
                    (ParserState::ParamValueQuotedEscape, c) => {
                        parser.param_value.push(c);
                        ParserState::ParamValueQuoted
                    }

                    (ParserState::ParamValueQuotedPost, ',') => {
                        parser.push_offer();
                        ParserState::Name
                    }
                    (ParserState::ParamValueQuotedPost, ';') => ParserState::ParamName,
                    (ParserState::ParamValueQuotedPost, c) if c.is_whitespace() => {
                        ParserState::ParamValueQuotedPost
                    }
                    (ParserState::ParamValueQuotedPost, _) => ParserState::Error,

                    (ParserState::Error, ',') => {
                        debug!("skipping malformed extension {:?}", parser.name.trim());
                        parser.reset();
                        ParserState::Name
                    }
                    (ParserState::Error, _) => ParserState::Error,
                };
            }

            match state {
                ParserState::Error
                | ParserState::ParamValueQuoted
                | ParserState::ParamValueQuotedEscape => {
                    debug!("skipping malformed extension {:?}", parser.name.trim());
                    parser.reset();
                }
                ParserState::ParamName => {
                    parser.push_parameter(false);
                    parser.push_offer();
                }
                ParserState::ParamValue => {
                    parser.push_parameter(true);
                    parser.push_offer();
                }
                ParserState::Name | ParserState::ParamValueQuotedPost => parser.push_offer(),
            }
        }

        parser.offers
    }

    pub fn to_header_value(&self) -> String {
        self.to_string()
    }

    /// Join offers into a single header value.
    pub fn join(offers: &[ExtensionOffer]) -> String {
        offers
            .iter()
            .map(ExtensionOffer::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for ExtensionOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for parameter in &self.parameters {
            write!(f, "; {}", parameter)?;
        }
        Ok(())
    }
}

/// A frame transform negotiated during the handshake.
pub trait Extension: Send {
    fn name(&self) -> &str;

    /// RSV bits this extension may set, RSV1 as `0b100`. A received frame
    /// with any other RSV bit set is a protocol error.
    fn rsv_bits(&self) -> u8 {
        0
    }

    /// Whether control frames are passed through this extension too.
    fn applies_to_control(&self) -> bool {
        false
    }

    /// Server side. Called with the parameters the client requested; return
    /// the accepted parameters, or `None` to decline the extension.
    fn on_extension_negotiation(
        &mut self,
        requested: &[ExtensionParameter],
    ) -> Result<Option<Vec<ExtensionParameter>>, ExtensionError> {
        Ok(Some(requested.to_vec()))
    }

    /// Client side. The parameters to put in the request.
    fn offer(&self) -> Vec<ExtensionParameter> {
        Vec::new()
    }

    /// Client side. Called with the parameters the server accepted.
    fn on_handshake_response(
        &mut self,
        _accepted: &[ExtensionParameter],
    ) -> Result<(), ExtensionError> {
        Ok(())
    }

    fn process_incoming(&mut self, frame: Frame) -> Result<Frame, ExtensionError>;

    fn process_outgoing(&mut self, frame: Frame) -> Result<Frame, ExtensionError>;

    /// Release per-connection resources. Called once, when the connection closes.
    fn destroy(&mut self) {}
}

/// Creates a fresh [`Extension`] for each connection.
#[derive(Clone)]
pub struct ExtensionFactory {
    name: String,
    create: Arc<dyn Fn() -> Box<dyn Extension> + Send + Sync>,
}

impl ExtensionFactory {
    pub fn new<F>(name: impl Into<String>, create: F) -> Self
    where
        F: Fn() -> Box<dyn Extension> + Send + Sync + 'static,
    {
        ExtensionFactory {
            name: name.into(),
            create: Arc::new(create),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn create(&self) -> Box<dyn Extension> {
        (self.create)()
    }
}

impl fmt::Debug for ExtensionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionFactory")
            .field("name", &self.name)
            .finish()
    }
}

/// The negotiated extensions of one connection, in negotiated order.
///
/// Incoming frames run through the chain front to back, outgoing frames back
/// to front, so the last extension to touch an outgoing frame is the first to
/// see it on the other side.
#[derive(Default)]
pub struct ExtensionChain {
    extensions: Vec<Box<dyn Extension>>,
    destroyed: bool,
}

impl ExtensionChain {
    pub fn new(extensions: Vec<Box<dyn Extension>>) -> Self {
        ExtensionChain {
            extensions,
            destroyed: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn names(&self) -> Vec<String> {
        self.extensions
            .iter()
            .map(|extension| extension.name().to_string())
            .collect()
    }

    /// Every RSV bit claimed by an extension in the chain.
    pub fn rsv_bits(&self) -> u8 {
        self.extensions
            .iter()
            .fold(0, |bits, extension| bits | extension.rsv_bits())
    }

    pub fn process_incoming(&mut self, mut frame: Frame) -> Result<Frame, Error> {
        for extension in self.extensions.iter_mut() {
            if frame.is_control() && !extension.applies_to_control() {
                continue;
            }
            trace!("incoming {:?} through {}", frame.opcode(), extension.name());
            frame = extension
                .process_incoming(frame)
                .map_err(|source| Error::Extension {
                    name: extension.name().to_string(),
                    source,
                })?;
        }
        Ok(frame)
    }

    pub fn process_outgoing(&mut self, mut frame: Frame) -> Result<Frame, Error> {
        for extension in self.extensions.iter_mut().rev() {
            if frame.is_control() && !extension.applies_to_control() {
                continue;
            }
            trace!("outgoing {:?} through {}", frame.opcode(), extension.name());
            frame = extension
                .process_outgoing(frame)
                .map_err(|source| Error::Extension {
                    name: extension.name().to_string(),
                    source,
                })?;
        }
        Ok(frame)
    }

    /// Destroy every extension. Later calls do nothing.
    pub fn destroy(&mut self) {
        if std::mem::replace(&mut self.destroyed, true) {
            return;
        }
        for extension in self.extensions.iter_mut() {
            debug!("destroying extension {}", extension.name());
            extension.destroy();
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl Drop for ExtensionChain {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for ExtensionChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionChain")
            .field("extensions", &self.names())
            .field("destroyed", &self.destroyed)
            .finish()
    }
}
