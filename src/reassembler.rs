use crate::{Fragment, Frame, Message, MessageKind, Opcode, ProtocolError};
use bytes::{Bytes, BytesMut};

/// What one frame amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembled {
    /// Control frames are never held back, even mid-message.
    Control(Frame),
    Message(Message),
    /// Only produced when partial delivery is on.
    Fragment(Fragment),
}

struct Partial {
    kind: MessageKind,
    buffer: BytesMut,
    /// Trailing bytes of a codepoint cut off by a frame boundary.
    utf8_tail: Vec<u8>,
}

/// Joins data frames into messages, one message at a time.
pub struct MessageReassembler {
    max_message_size: usize,
    partial_messages: bool,
    partial: Option<Partial>,
}

impl MessageReassembler {
    pub fn new(max_message_size: usize, partial_messages: bool) -> Self {
        MessageReassembler {
            max_message_size,
            partial_messages,
            partial: None,
        }
    }

    pub fn in_progress(&self) -> Option<MessageKind> {
        self.partial.as_ref().map(|partial| partial.kind)
    }

    /// Drop any half-received message.
    pub fn reset(&mut self) {
        self.partial = None;
    }

    /// Feed one frame. `Ok(None)` means the message is still accumulating.
    pub fn accept(&mut self, frame: Frame) -> Result<Option<Assembled>, ProtocolError> {
        if frame.is_control() {
            return Ok(Some(Assembled::Control(frame)));
        }

        let fin = frame.fin();
        let kind = match (frame.opcode(), &self.partial) {
            (Opcode::Text, None) => MessageKind::Text,
            (Opcode::Binary, None) => MessageKind::Binary,
            (Opcode::Continuation, Some(partial)) => partial.kind,
            (Opcode::Continuation, None) => {
                return Err(ProtocolError::UnexpectedContinuation);
            }
            (opcode, Some(_)) => {
                self.reset();
                return Err(ProtocolError::ExpectedContinuation(opcode));
            }
            (opcode, None) => return Err(ProtocolError::ExpectedContinuation(opcode)),
        };

        if self.partial_messages {
            return self.accept_fragment(kind, frame.into_payload(), fin).map(Some);
        }

        let payload = frame.into_payload();
        let size = self
            .partial
            .as_ref()
            .map_or(0, |partial| partial.buffer.len())
            + payload.len();
        if size > self.max_message_size {
            self.reset();
            return Err(ProtocolError::MessageTooBig {
                size,
                max: self.max_message_size,
            });
        }

        let payload = match (self.partial.take(), fin) {
            (None, true) => payload,
            (None, false) => {
                let mut buffer = BytesMut::with_capacity(payload.len().max(4096));
                buffer.extend_from_slice(&payload);
                self.partial = Some(Partial {
                    kind,
                    buffer,
                    utf8_tail: Vec::new(),
                });
                return Ok(None);
            }
            (Some(mut partial), false) => {
                partial.buffer.extend_from_slice(&payload);
                self.partial = Some(partial);
                return Ok(None);
            }
            (Some(mut partial), true) => {
                partial.buffer.extend_from_slice(&payload);
                partial.buffer.freeze()
            }
        };

        let message = match kind {
            MessageKind::Text => Message::Text(
                String::from_utf8(payload.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)?,
            ),
            MessageKind::Binary => Message::Binary(payload),
        };
        Ok(Some(Assembled::Message(message)))
    }

    fn accept_fragment(
        &mut self,
        kind: MessageKind,
        payload: Bytes,
        last: bool,
    ) -> Result<Assembled, ProtocolError> {
        let mut partial = self.partial.take().unwrap_or_else(|| Partial {
            kind,
            buffer: BytesMut::new(),
            utf8_tail: Vec::new(),
        });

        let fragment = match kind {
            MessageKind::Binary => Fragment::Binary {
                data: payload,
                last,
            },
            MessageKind::Text => {
                let mut bytes = std::mem::take(&mut partial.utf8_tail);
                bytes.extend_from_slice(&payload);
                let valid_up_to = match std::str::from_utf8(&bytes) {
                    Ok(_) => bytes.len(),
                    // An incomplete sequence at the very end may finish in the next frame.
                    Err(error) if error.error_len().is_none() && !last => error.valid_up_to(),
                    Err(_) => return Err(ProtocolError::InvalidUtf8),
                };
                partial.utf8_tail = bytes.split_off(valid_up_to);
                let text = String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
                Fragment::Text { text, last }
            }
        };

        if !last {
            self.partial = Some(partial);
        }
        Ok(Assembled::Fragment(fragment))
    }
}
