//! The permessage-deflate extension (RFC 7692).
//!
//! Only the default 15-bit window is used for compression; a server offer
//! that asks for a smaller one is declined, a response that imposes one on
//! the client is refused.

use crate::{
    extension::{Extension, ExtensionError, ExtensionFactory, ExtensionParameter},
    frame::{Frame, Opcode},
};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use log::debug;

pub const PERMESSAGE_DEFLATE: &str = "permessage-deflate";

const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";
const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";
const SERVER_MAX_WINDOW_BITS: &str = "server_max_window_bits";
const CLIENT_MAX_WINDOW_BITS: &str = "client_max_window_bits";

/// Ends every sync flush. Stripped from the final frame of a message and
/// put back before inflating it.
const TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];
const WINDOW_BITS: u8 = 15;
const CHUNK: usize = 4096;

#[derive(Debug, Clone)]
pub struct DeflateConfig {
    pub level: Compression,
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    /// Largest message inflated before failing the connection.
    pub max_inflated_size: usize,
}

impl Default for DeflateConfig {
    fn default() -> Self {
        DeflateConfig {
            level: Compression::default(),
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            max_inflated_size: crate::config::DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

pub struct PerMessageDeflate {
    config: DeflateConfig,
    is_server: bool,
    compress: Option<Compress>,
    decompress: Option<Decompress>,
    /// Whether the message being received is compressed.
    inflating: bool,
    inflated: usize,
}

impl PerMessageDeflate {
    pub fn new(config: DeflateConfig) -> Self {
        PerMessageDeflate {
            config,
            is_server: false,
            compress: None,
            decompress: None,
            inflating: false,
            inflated: 0,
        }
    }

    /// A factory to register with a server or client config.
    pub fn factory(config: DeflateConfig) -> ExtensionFactory {
        ExtensionFactory::new(PERMESSAGE_DEFLATE, move || {
            Box::new(PerMessageDeflate::new(config.clone()))
        })
    }

    fn resets_compressor(&self) -> bool {
        if self.is_server {
            self.config.server_no_context_takeover
        } else {
            self.config.client_no_context_takeover
        }
    }

    fn resets_decompressor(&self) -> bool {
        if self.is_server {
            self.config.client_no_context_takeover
        } else {
            self.config.server_no_context_takeover
        }
    }

    fn inflate(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(), ExtensionError> {
        let decompress = self
            .decompress
            .get_or_insert_with(|| Decompress::new(false));
        let start = decompress.total_in();
        loop {
            output.reserve(CHUNK);
            let consumed = (decompress.total_in() - start) as usize;
            let produced = decompress.total_out();
            let status =
                decompress.decompress_vec(&input[consumed..], output, FlushDecompress::Sync)?;
            let progress = decompress.total_in() - start != consumed as u64
                || decompress.total_out() != produced;

            self.inflated += (decompress.total_out() - produced) as usize;
            if self.inflated > self.config.max_inflated_size {
                return Err(format!(
                    "inflated message is over {} bytes",
                    self.config.max_inflated_size
                )
                .into());
            }

            let consumed = (decompress.total_in() - start) as usize;
            if status == Status::StreamEnd
                || (consumed == input.len() && output.len() < output.capacity())
            {
                return Ok(());
            }
            if !progress {
                return Err("deflate stream is corrupt".into());
            }
        }
    }
}

fn deflate(compress: &mut Compress, input: &[u8]) -> Result<Vec<u8>, ExtensionError> {
    let mut output = Vec::with_capacity(input.len() / 2 + TRAILER.len());
    let start = compress.total_in();
    loop {
        output.reserve(CHUNK);
        let consumed = (compress.total_in() - start) as usize;
        compress.compress_vec(&input[consumed..], &mut output, FlushCompress::Sync)?;
        let consumed = (compress.total_in() - start) as usize;
        // A flush that left room in the buffer is complete.
        if consumed == input.len() && output.len() < output.capacity() {
            return Ok(output);
        }
    }
}

fn window_bits(value: Option<&str>) -> Result<u8, ExtensionError> {
    let bits: u8 = value.ok_or("window bits need a value")?.parse()?;
    if !(8..=WINDOW_BITS).contains(&bits) {
        return Err(format!("window bits out of range: {}", bits).into());
    }
    Ok(bits)
}

impl Extension for PerMessageDeflate {
    fn name(&self) -> &str {
        PERMESSAGE_DEFLATE
    }

    fn rsv_bits(&self) -> u8 {
        0b100
    }

    fn on_extension_negotiation(
        &mut self,
        requested: &[ExtensionParameter],
    ) -> Result<Option<Vec<ExtensionParameter>>, ExtensionError> {
        self.is_server = true;
        let mut seen: Vec<&str> = Vec::new();
        for parameter in requested {
            let name = parameter.name.as_str();
            if seen.contains(&name) {
                debug!("declining {}, {} given twice", PERMESSAGE_DEFLATE, name);
                return Ok(None);
            }
            seen.push(name);

            match name {
                SERVER_NO_CONTEXT_TAKEOVER | CLIENT_NO_CONTEXT_TAKEOVER
                    if parameter.value.is_some() =>
                {
                    return Ok(None);
                }
                SERVER_NO_CONTEXT_TAKEOVER => self.config.server_no_context_takeover = true,
                CLIENT_NO_CONTEXT_TAKEOVER => self.config.client_no_context_takeover = true,
                SERVER_MAX_WINDOW_BITS => {
                    if window_bits(parameter.value.as_deref())? != WINDOW_BITS {
                        debug!("declining {} with a small server window", PERMESSAGE_DEFLATE);
                        return Ok(None);
                    }
                }
                // The client may shrink its window; it keeps 15 unless told.
                CLIENT_MAX_WINDOW_BITS => {
                    if parameter.value.is_some() {
                        window_bits(parameter.value.as_deref())?;
                    }
                }
                other => {
                    debug!("declining {} with parameter {}", PERMESSAGE_DEFLATE, other);
                    return Ok(None);
                }
            }
        }

        let mut accepted = Vec::new();
        if self.config.server_no_context_takeover {
            accepted.push(ExtensionParameter::new(SERVER_NO_CONTEXT_TAKEOVER, None));
        }
        if self.config.client_no_context_takeover {
            accepted.push(ExtensionParameter::new(CLIENT_NO_CONTEXT_TAKEOVER, None));
        }
        if seen.contains(&SERVER_MAX_WINDOW_BITS) {
            accepted.push(ExtensionParameter::new(SERVER_MAX_WINDOW_BITS, Some("15")));
        }
        Ok(Some(accepted))
    }

    fn offer(&self) -> Vec<ExtensionParameter> {
        let mut offer = Vec::new();
        if self.config.server_no_context_takeover {
            offer.push(ExtensionParameter::new(SERVER_NO_CONTEXT_TAKEOVER, None));
        }
        if self.config.client_no_context_takeover {
            offer.push(ExtensionParameter::new(CLIENT_NO_CONTEXT_TAKEOVER, None));
        }
        offer
    }

    fn on_handshake_response(
        &mut self,
        accepted: &[ExtensionParameter],
    ) -> Result<(), ExtensionError> {
        self.is_server = false;
        // Only the server decides whether its own context is kept.
        self.config.server_no_context_takeover = false;
        for parameter in accepted {
            match parameter.name.as_str() {
                SERVER_NO_CONTEXT_TAKEOVER => self.config.server_no_context_takeover = true,
                CLIENT_NO_CONTEXT_TAKEOVER => self.config.client_no_context_takeover = true,
                // Inflating with the full window works for any smaller one.
                SERVER_MAX_WINDOW_BITS => {
                    window_bits(parameter.value.as_deref())?;
                }
                CLIENT_MAX_WINDOW_BITS => {
                    if window_bits(parameter.value.as_deref())? != WINDOW_BITS {
                        return Err("client_max_window_bits below 15 is not supported".into());
                    }
                }
                other => return Err(format!("unexpected parameter {}", other).into()),
            }
        }
        Ok(())
    }

    fn process_incoming(&mut self, frame: Frame) -> Result<Frame, ExtensionError> {
        if frame.opcode() == Opcode::Continuation {
            if frame.rsv1() {
                return Err("RSV1 set on a continuation frame".into());
            }
        } else {
            self.inflating = frame.rsv1();
            self.inflated = 0;
        }
        if !self.inflating {
            return Ok(frame);
        }

        let mut payload = Vec::with_capacity(frame.payload().len() * 2);
        self.inflate(frame.payload(), &mut payload)?;
        if frame.fin() {
            self.inflate(&TRAILER, &mut payload)?;
            self.inflating = false;
            if self.resets_decompressor() {
                self.decompress = None;
            }
        }
        Ok(frame.to_builder().rsv1(false).payload(payload).build())
    }

    fn process_outgoing(&mut self, frame: Frame) -> Result<Frame, ExtensionError> {
        let level = self.config.level;
        let compress = self
            .compress
            .get_or_insert_with(|| Compress::new(level, false));
        let mut payload = deflate(compress, frame.payload())?;
        if frame.fin() {
            if payload.ends_with(&TRAILER) {
                payload.truncate(payload.len() - TRAILER.len());
            }
            if self.resets_compressor() {
                self.compress = None;
            }
        }
        let first = frame.opcode() != Opcode::Continuation;
        Ok(frame.to_builder().rsv1(first).payload(payload).build())
    }

    fn destroy(&mut self) {
        debug!("dropping {} contexts", PERMESSAGE_DEFLATE);
        self.compress = None;
        self.decompress = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressed(opcode: Opcode, payload: &[u8], fin: bool) -> Frame {
        Frame::builder(opcode)
            .rsv1(opcode != Opcode::Continuation)
            .fin(fin)
            .payload(payload.to_vec())
            .build()
    }

    fn parameter(name: &str, value: Option<&str>) -> ExtensionParameter {
        ExtensionParameter::new(name, value)
    }

    #[test]
    fn inflates_hello() {
        let mut deflate = PerMessageDeflate::new(DeflateConfig::default());
        let frame = deflate
            .process_incoming(compressed(
                Opcode::Text,
                &[0xf2, 0x48, 0xcd, 0xc9, 0xc9, 0x07, 0x00],
                true,
            ))
            .unwrap();
        assert_eq!(&frame.payload()[..], b"Hello");
        assert!(!frame.rsv1());
    }

    #[test]
    fn inflates_across_fragments() {
        let mut deflate = PerMessageDeflate::new(DeflateConfig::default());
        let first = deflate
            .process_incoming(compressed(Opcode::Text, &[0xf2, 0x48, 0xcd], false))
            .unwrap();
        let last = deflate
            .process_incoming(compressed(
                Opcode::Continuation,
                &[0xc9, 0xc9, 0x07, 0x00],
                true,
            ))
            .unwrap();
        let mut whole = first.payload().to_vec();
        whole.extend_from_slice(last.payload());
        assert_eq!(whole, b"Hello");
    }

    #[test]
    fn second_message_uses_the_shared_window() {
        let mut deflate = PerMessageDeflate::new(DeflateConfig::default());
        let hello = [0xf2, 0x48, 0xcd, 0xc9, 0xc9, 0x07, 0x00];
        let first = deflate
            .process_incoming(compressed(Opcode::Text, &hello, true))
            .unwrap();
        let second = deflate
            .process_incoming(compressed(Opcode::Text, &[0xf2, 0x00, 0x11, 0x00, 0x00], true))
            .unwrap();
        assert_eq!(&first.payload()[..], b"Hello");
        assert_eq!(&second.payload()[..], b"Hello");
    }

    #[test]
    fn uncompressed_messages_pass_through() {
        let mut deflate = PerMessageDeflate::new(DeflateConfig::default());
        let frame = deflate.process_incoming(Frame::text("plain")).unwrap();
        assert_eq!(&frame.payload()[..], b"plain");
    }

    #[test]
    fn rsv1_on_continuation_is_refused() {
        let mut deflate = PerMessageDeflate::new(DeflateConfig::default());
        deflate
            .process_incoming(compressed(Opcode::Text, &[0xf2, 0x48, 0xcd], false))
            .unwrap();
        let frame = Frame::builder(Opcode::Continuation)
            .rsv1(true)
            .payload(vec![0xc9u8])
            .build();
        assert!(deflate.process_incoming(frame).is_err());
    }

    #[test]
    fn round_trip_between_peers() {
        let mut sender = PerMessageDeflate::new(DeflateConfig::default());
        let mut receiver = PerMessageDeflate::new(DeflateConfig::default());
        let big = "all work and no play ".repeat(2000);
        for text in ["first", "", big.as_str(), "first"] {
            let sent = sender.process_outgoing(Frame::text(text)).unwrap();
            assert!(sent.rsv1());
            let got = receiver.process_incoming(sent).unwrap();
            assert_eq!(&got.payload()[..], text.as_bytes());
        }

        let sent = sender.process_outgoing(Frame::text(big.as_str())).unwrap();
        assert!(sent.payload().len() < big.len() / 10);
        assert!(!sent.payload().ends_with(&TRAILER));
    }

    #[test]
    fn fragments_only_flag_the_first_frame() {
        let mut sender = PerMessageDeflate::new(DeflateConfig::default());
        let mut receiver = PerMessageDeflate::new(DeflateConfig::default());
        let first = sender
            .process_outgoing(Frame::builder(Opcode::Binary).fin(false).payload("abcabc").build())
            .unwrap();
        let last = sender
            .process_outgoing(Frame::builder(Opcode::Continuation).payload("abcabc").build())
            .unwrap();
        assert!(first.rsv1());
        assert!(!last.rsv1());

        let mut whole = receiver.process_incoming(first).unwrap().payload().to_vec();
        whole.extend_from_slice(receiver.process_incoming(last).unwrap().payload());
        assert_eq!(whole, b"abcabcabcabc");
    }

    #[test]
    fn no_context_takeover_repeats_the_same_bytes() {
        let config = DeflateConfig {
            client_no_context_takeover: true,
            ..DeflateConfig::default()
        };
        let mut resetting = PerMessageDeflate::new(config);
        let first = resetting.process_outgoing(Frame::text("Hello")).unwrap();
        let second = resetting.process_outgoing(Frame::text("Hello")).unwrap();
        assert_eq!(first.payload(), second.payload());

        let mut keeping = PerMessageDeflate::new(DeflateConfig::default());
        let first = keeping.process_outgoing(Frame::text("Hello")).unwrap();
        let second = keeping.process_outgoing(Frame::text("Hello")).unwrap();
        assert_ne!(first.payload(), second.payload());
    }

    #[test]
    fn inflating_past_the_limit_fails() {
        let mut sender = PerMessageDeflate::new(DeflateConfig::default());
        let mut receiver = PerMessageDeflate::new(DeflateConfig {
            max_inflated_size: 100,
            ..DeflateConfig::default()
        });
        let sent = sender.process_outgoing(Frame::binary(vec![0u8; 10_000])).unwrap();
        assert!(receiver.process_incoming(sent).is_err());
    }

    #[test]
    fn server_accepts_and_echoes_flags() {
        let mut deflate = PerMessageDeflate::new(DeflateConfig::default());
        let accepted = deflate
            .on_extension_negotiation(&[
                parameter(CLIENT_NO_CONTEXT_TAKEOVER, None),
                parameter(SERVER_MAX_WINDOW_BITS, Some("15")),
                parameter(CLIENT_MAX_WINDOW_BITS, None),
            ])
            .unwrap()
            .unwrap();
        assert_eq!(
            accepted,
            vec![
                parameter(CLIENT_NO_CONTEXT_TAKEOVER, None),
                parameter(SERVER_MAX_WINDOW_BITS, Some("15")),
            ]
        );
        assert!(deflate.is_server);
        assert!(deflate.resets_decompressor());
        assert!(!deflate.resets_compressor());

        let mut configured = PerMessageDeflate::new(DeflateConfig {
            server_no_context_takeover: true,
            ..DeflateConfig::default()
        });
        assert_eq!(
            configured.on_extension_negotiation(&[]).unwrap().unwrap(),
            vec![parameter(SERVER_NO_CONTEXT_TAKEOVER, None)]
        );
    }

    #[test]
    fn server_declines_what_it_cannot_do() {
        let declined = |requested: &[ExtensionParameter]| {
            PerMessageDeflate::new(DeflateConfig::default())
                .on_extension_negotiation(requested)
                .unwrap()
                .is_none()
        };
        assert!(declined(&[parameter(SERVER_MAX_WINDOW_BITS, Some("10"))]));
        assert!(declined(&[parameter("mystery", None)]));
        assert!(declined(&[
            parameter(CLIENT_NO_CONTEXT_TAKEOVER, None),
            parameter(CLIENT_NO_CONTEXT_TAKEOVER, None),
        ]));
        assert!(declined(&[parameter(SERVER_NO_CONTEXT_TAKEOVER, Some("yes"))]));

        let mut deflate = PerMessageDeflate::new(DeflateConfig::default());
        assert!(deflate
            .on_extension_negotiation(&[parameter(CLIENT_MAX_WINDOW_BITS, Some("99"))])
            .is_err());
        assert!(deflate
            .on_extension_negotiation(&[parameter(SERVER_MAX_WINDOW_BITS, None)])
            .is_err());
    }

    #[test]
    fn client_offers_and_checks_the_response() {
        let config = DeflateConfig {
            server_no_context_takeover: true,
            client_no_context_takeover: true,
            ..DeflateConfig::default()
        };
        let mut deflate = PerMessageDeflate::new(config.clone());
        assert_eq!(
            deflate.offer(),
            vec![
                parameter(SERVER_NO_CONTEXT_TAKEOVER, None),
                parameter(CLIENT_NO_CONTEXT_TAKEOVER, None),
            ]
        );

        deflate
            .on_handshake_response(&[parameter(SERVER_MAX_WINDOW_BITS, Some("10"))])
            .unwrap();
        assert!(!deflate.resets_decompressor());
        assert!(deflate.resets_compressor());

        let mut deflate = PerMessageDeflate::new(config);
        assert!(deflate
            .on_handshake_response(&[parameter(CLIENT_MAX_WINDOW_BITS, Some("9"))])
            .is_err());
        assert!(deflate
            .on_handshake_response(&[parameter("mystery", None)])
            .is_err());
    }

    #[test]
    fn destroy_drops_both_contexts() {
        let mut deflate = PerMessageDeflate::new(DeflateConfig::default());
        let sent = deflate.process_outgoing(Frame::text("Hello")).unwrap();
        deflate.process_incoming(sent).unwrap();
        assert!(deflate.compress.is_some() && deflate.decompress.is_some());
        deflate.destroy();
        assert!(deflate.compress.is_none() && deflate.decompress.is_none());
        assert_eq!(deflate.rsv_bits(), 0b100);
    }
}
