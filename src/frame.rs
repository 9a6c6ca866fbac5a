use crate::{close::CloseReason, Error, ProtocolError, Role};
use bytes::{BufMut, Bytes, BytesMut};
use std::mem::size_of;

pub const FIN: u16 = 0b1000_0000_0000_0000;
pub const RSV1: u16 = 0b0100_0000_0000_0000;
pub const RSV2: u16 = 0b0010_0000_0000_0000;
pub const RSV3: u16 = 0b0001_0000_0000_0000;
pub const RSV: u16 = RSV1 | RSV2 | RSV3;
pub const OPCODE: u16 = 0b0000_1111_0000_0000;
pub const MASK: u16 = 0b0000_0000_1000_0000;
pub const PAYLOAD_LEN: u16 = 0b0000_0000_0111_1111;
pub const SMALL_PAYLOAD: u16 = 0b0000_0000_0111_1101;
pub const SMALL_PAYLOAD_USIZE: usize = SMALL_PAYLOAD as usize;
pub const EXTENDED_PAYLOAD: u16 = 0b0000_0000_0111_1110;
pub const EXTENDED_PAYLOAD_USIZE: usize = EXTENDED_PAYLOAD as usize;
pub const BIG_EXTENDED_PAYLOAD: u16 = 0b0000_0000_0111_1111;
pub const FIRST_SHORT_SIZE: usize = size_of::<u16>();
pub const EXTENDED_PAYLOAD_SIZE: usize = size_of::<u16>();
pub const BIG_EXTENDED_PAYLOAD_SIZE: usize = size_of::<u64>();
pub const MASK_KEY_SIZE: usize = size_of::<u32>();
pub const MAX_HEADER_SIZE: usize = FIRST_SHORT_SIZE + BIG_EXTENDED_PAYLOAD_SIZE + MASK_KEY_SIZE;
pub const MAX_CONTROL_PAYLOAD: usize = SMALL_PAYLOAD_USIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl Opcode {
    pub fn from_u8(value: u8) -> Self {
        match value & 0x0f {
            0 => Opcode::Continuation,
            1 => Opcode::Text,
            2 => Opcode::Binary,
            8 => Opcode::Close,
            9 => Opcode::Ping,
            10 => Opcode::Pong,
            other => Opcode::Reserved(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0,
            Opcode::Text => 1,
            Opcode::Binary => 2,
            Opcode::Close => 8,
            Opcode::Ping => 9,
            Opcode::Pong => 10,
            Opcode::Reserved(other) => other & 0x0f,
        }
    }

    /// Control opcodes have the high bit of the nibble set, reserved ones included.
    pub fn is_control(self) -> bool {
        self.as_u8() & 0x08 != 0
    }

    pub fn is_data(self) -> bool {
        matches!(self, Opcode::Text | Opcode::Binary)
    }
}

/// XOR `payload` with `mask_key`, byte `i` with `mask_key[i % 4]`.
///
/// Masking and unmasking are the same operation.
pub fn mask_payload(payload: &mut [u8], mask_key: [u8; 4]) {
    let mut chunks = payload.chunks_exact_mut(MASK_KEY_SIZE);
    let key = u32::from_ne_bytes(mask_key);
    for chunk in &mut chunks {
        let word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ key;
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }
}

/// A single wire-level frame. The payload is always stored unmasked.
///
/// Frames are immutable; extensions that change a frame build a new one with
/// [`Frame::to_builder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    fin: bool,
    rsv: u8,
    opcode: Opcode,
    mask_key: Option<[u8; 4]>,
    payload: Bytes,
}

impl Frame {
    pub fn builder(opcode: Opcode) -> FrameBuilder {
        FrameBuilder {
            fin: true,
            rsv: 0,
            opcode,
            mask_key: None,
            payload: Bytes::new(),
        }
    }

    pub fn to_builder(&self) -> FrameBuilder {
        FrameBuilder {
            fin: self.fin,
            rsv: self.rsv,
            opcode: self.opcode,
            mask_key: self.mask_key,
            payload: self.payload.clone(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Frame::builder(Opcode::Text)
            .payload(Bytes::from(text.into()))
            .build()
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Frame::builder(Opcode::Binary).payload(data).build()
    }

    pub fn ping(data: impl Into<Bytes>) -> Self {
        Frame::builder(Opcode::Ping).payload(data).build()
    }

    pub fn pong(data: impl Into<Bytes>) -> Self {
        Frame::builder(Opcode::Pong).payload(data).build()
    }

    pub fn close(reason: &CloseReason) -> Self {
        Frame::builder(Opcode::Close)
            .payload(reason.to_payload())
            .build()
    }

    pub fn fin(&self) -> bool {
        self.fin
    }

    pub fn rsv1(&self) -> bool {
        self.rsv & 0b100 != 0
    }

    pub fn rsv2(&self) -> bool {
        self.rsv & 0b010 != 0
    }

    pub fn rsv3(&self) -> bool {
        self.rsv & 0b001 != 0
    }

    /// The three RSV bits, RSV1 in the most significant position.
    pub fn rsv(&self) -> u8 {
        self.rsv
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    /// The key the frame was masked with on the wire, if it was masked.
    pub fn mask_key(&self) -> Option<[u8; 4]> {
        self.mask_key
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

#[derive(Debug, Clone)]
pub struct FrameBuilder {
    fin: bool,
    rsv: u8,
    opcode: Opcode,
    mask_key: Option<[u8; 4]>,
    payload: Bytes,
}

impl FrameBuilder {
    pub fn fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    pub fn rsv1(self, set: bool) -> Self {
        self.rsv_bit(0b100, set)
    }

    pub fn rsv2(self, set: bool) -> Self {
        self.rsv_bit(0b010, set)
    }

    pub fn rsv3(self, set: bool) -> Self {
        self.rsv_bit(0b001, set)
    }

    fn rsv_bit(mut self, bit: u8, set: bool) -> Self {
        if set {
            self.rsv |= bit;
        } else {
            self.rsv &= !bit;
        }
        self
    }

    pub fn opcode(mut self, opcode: Opcode) -> Self {
        self.opcode = opcode;
        self
    }

    pub fn mask_key(mut self, mask_key: Option<[u8; 4]>) -> Self {
        self.mask_key = mask_key;
        self
    }

    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn build(self) -> Frame {
        Frame {
            fin: self.fin,
            rsv: self.rsv,
            opcode: self.opcode,
            mask_key: self.mask_key,
            payload: self.payload,
        }
    }
}

/// Converts between bytes and frames for one side of a connection.
///
/// The codec holds no parse state. A truncated frame is left in the buffer
/// untouched and parsed again from the start once more bytes arrive.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    role: Role,
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(role: Role, max_frame_size: usize) -> Self {
        FrameCodec {
            role,
            max_frame_size,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Take the next complete frame off the front of `buffer`.
    ///
    /// Returns `Ok(None)` when the buffer does not hold a whole frame yet.
    pub fn unframe(&self, buffer: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if buffer.len() < FIRST_SHORT_SIZE {
            return Ok(None);
        }

        let first_short = u16::from_be_bytes([buffer[0], buffer[1]]);
        let fin = first_short & FIN != 0;
        let opcode = Opcode::from_u8(((first_short & OPCODE) >> 8) as u8);
        if let Opcode::Reserved(opcode) = opcode {
            return Err(ProtocolError::ReservedOpcode(opcode));
        }

        let masked = first_short & MASK != 0;
        match (self.role, masked) {
            (Role::Server, false) => return Err(ProtocolError::UnmaskedFrame),
            (Role::Client, true) => return Err(ProtocolError::MaskedFrame),
            _ => {}
        }

        let payload_len_size = match first_short & PAYLOAD_LEN {
            0..=SMALL_PAYLOAD => 0,
            EXTENDED_PAYLOAD => EXTENDED_PAYLOAD_SIZE,
            _ => BIG_EXTENDED_PAYLOAD_SIZE,
        };

        if opcode.is_control() {
            if !fin {
                return Err(ProtocolError::FragmentedControl);
            }
            if payload_len_size != 0 {
                return Err(ProtocolError::TooLargeControl(
                    (first_short & PAYLOAD_LEN) as usize,
                ));
            }
        }

        let mask_key_size = if masked { MASK_KEY_SIZE } else { 0 };
        let header_size = FIRST_SHORT_SIZE + payload_len_size + mask_key_size;
        if buffer.len() < header_size {
            return Ok(None);
        }

        let payload_len = match payload_len_size {
            0 => (first_short & PAYLOAD_LEN) as u64,
            EXTENDED_PAYLOAD_SIZE => u16::from_be_bytes([
                buffer[FIRST_SHORT_SIZE],
                buffer[FIRST_SHORT_SIZE + 1],
            ]) as u64,
            _ => {
                let mut len_bytes = [0u8; BIG_EXTENDED_PAYLOAD_SIZE];
                len_bytes.copy_from_slice(
                    &buffer[FIRST_SHORT_SIZE..FIRST_SHORT_SIZE + BIG_EXTENDED_PAYLOAD_SIZE],
                );
                let len = u64::from_be_bytes(len_bytes);
                if len >> 63 != 0 {
                    return Err(ProtocolError::InvalidPayloadLen);
                }
                len
            }
        };

        if payload_len > self.max_frame_size as u64 {
            return Err(ProtocolError::FrameTooLarge {
                len: payload_len,
                max: self.max_frame_size,
            });
        }

        let mask_key = if masked {
            let start = FIRST_SHORT_SIZE + payload_len_size;
            Some([
                buffer[start],
                buffer[start + 1],
                buffer[start + 2],
                buffer[start + 3],
            ])
        } else {
            None
        };

        let frame_size = header_size + payload_len as usize;
        if buffer.len() < frame_size {
            buffer.reserve(frame_size - buffer.len());
            return Ok(None);
        }

        let mut payload = buffer.split_to(frame_size).split_off(header_size);
        if let Some(mask_key) = mask_key {
            mask_payload(&mut payload, mask_key);
        }

        Ok(Some(Frame {
            fin,
            rsv: ((first_short & RSV) >> 12) as u8,
            opcode,
            mask_key,
            payload: payload.freeze(),
        }))
    }

    /// Append the wire form of `frame` to `dst`.
    ///
    /// Clients mask every frame with a fresh random key; servers never mask.
    pub fn frame(&self, frame: &Frame, dst: &mut BytesMut) -> Result<(), Error> {
        let payload_len = frame.payload.len();
        if let Opcode::Reserved(opcode) = frame.opcode {
            return Err(ProtocolError::ReservedOpcode(opcode).into());
        }
        if frame.is_control() {
            if !frame.fin {
                return Err(ProtocolError::FragmentedControl.into());
            }
            if payload_len > MAX_CONTROL_PAYLOAD {
                return Err(ProtocolError::TooLargeControl(payload_len).into());
            }
        }

        let mut first_short = if frame.fin { FIN } else { 0 };
        first_short |= (frame.rsv as u16 & 0b111) << 12;
        first_short |= (frame.opcode.as_u8() as u16) << 8;
        first_short |= match payload_len {
            0..=SMALL_PAYLOAD_USIZE => payload_len as u16,
            EXTENDED_PAYLOAD_USIZE.. if payload_len <= u16::MAX as usize => EXTENDED_PAYLOAD,
            _ => BIG_EXTENDED_PAYLOAD,
        };

        let mask_key = match self.role {
            Role::Client => {
                let mut mask_key = [0u8; 4];
                getrandom::getrandom(&mut mask_key)?;
                first_short |= MASK;
                Some(mask_key)
            }
            Role::Server => None,
        };

        dst.reserve(MAX_HEADER_SIZE + payload_len);
        dst.put_u16(first_short);
        match first_short & PAYLOAD_LEN {
            EXTENDED_PAYLOAD => dst.put_u16(payload_len as u16),
            BIG_EXTENDED_PAYLOAD => dst.put_u64(payload_len as u64),
            _ => {}
        }

        let payload_start = match mask_key {
            Some(mask_key) => {
                dst.put_slice(&mask_key);
                dst.len()
            }
            None => dst.len(),
        };
        dst.put_slice(&frame.payload);
        if let Some(mask_key) = mask_key {
            mask_payload(&mut dst[payload_start..], mask_key);
        }

        Ok(())
    }
}
