//! RFC 7252 message framing: the 4-byte header, token, delta-coded
//! options, and payload marker. No hand-rolled parsing framework is
//! used here; the codec reads and writes the wire format directly.

use crate::options::{OptionNumber, Options};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    fn bits(self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }

    fn from_bits(bits: u8) -> MessageType {
        match bits & 0b11 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }
}

/// `class.detail` CoAP code, e.g. 0.01 (GET) or 2.05 (Content).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Code(u8);

impl Code {
    pub const EMPTY: Code = Code::new(0, 0);
    pub const GET: Code = Code::new(0, 1);
    pub const POST: Code = Code::new(0, 2);
    pub const PUT: Code = Code::new(0, 3);
    pub const DELETE: Code = Code::new(0, 4);

    pub const CREATED: Code = Code::new(2, 1);
    pub const DELETED: Code = Code::new(2, 2);
    pub const VALID: Code = Code::new(2, 3);
    pub const CHANGED: Code = Code::new(2, 4);
    pub const CONTENT: Code = Code::new(2, 5);
    pub const CONTINUE: Code = Code::new(2, 31);

    pub const BAD_REQUEST: Code = Code::new(4, 0);
    pub const UNAUTHORIZED: Code = Code::new(4, 1);
    pub const BAD_OPTION: Code = Code::new(4, 2);
    pub const FORBIDDEN: Code = Code::new(4, 3);
    pub const NOT_FOUND: Code = Code::new(4, 4);
    pub const METHOD_NOT_ALLOWED: Code = Code::new(4, 5);
    pub const NOT_ACCEPTABLE: Code = Code::new(4, 6);
    pub const REQUEST_ENTITY_INCOMPLETE: Code = Code::new(4, 8);
    pub const CONFLICT: Code = Code::new(4, 9);
    pub const PRECONDITION_FAILED: Code = Code::new(4, 12);
    pub const REQUEST_ENTITY_TOO_LARGE: Code = Code::new(4, 13);
    pub const UNSUPPORTED_CONTENT_FORMAT: Code = Code::new(4, 15);

    pub const INTERNAL_SERVER_ERROR: Code = Code::new(5, 0);
    pub const NOT_IMPLEMENTED: Code = Code::new(5, 1);
    pub const SERVICE_UNAVAILABLE: Code = Code::new(5, 3);

    pub const fn new(class: u8, detail: u8) -> Code {
        Code((class << 5) | (detail & 0b0001_1111))
    }

    pub fn class(self) -> u8 {
        self.0 >> 5
    }

    pub fn detail(self) -> u8 {
        self.0 & 0b0001_1111
    }

    pub fn raw(self) -> u8 {
        self.0
    }

    pub fn from_raw(byte: u8) -> Code {
        Code(byte)
    }

    pub fn is_successful(self) -> bool {
        self.class() == 2
    }

    pub fn is_request(self) -> bool {
        self.class() == 0 && self.0 != 0
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("message shorter than the 4-byte fixed header")]
    HeaderTooShort,
    #[error("unsupported CoAP version {0}, only version 1 is handled")]
    UnsupportedVersion(u8),
    #[error("token length {0} exceeds the 8-byte maximum")]
    TokenTooLong(u8),
    #[error("message truncated while reading token")]
    TruncatedToken,
    #[error("message truncated while reading an option")]
    TruncatedOption,
    #[error("option delta/length extension byte 15 is reserved")]
    ReservedExtension,
}

/// A single CoAP message: request, response, empty ACK, or reset.
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageType,
    pub code: Code,
    pub message_id: u16,
    pub token: Vec<u8>,
    pub options: Options,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageType, code: Code, message_id: u16) -> Message {
        Message {
            kind,
            code,
            message_id,
            token: Vec::new(),
            options: Options::new(),
            payload: Vec::new(),
        }
    }

    pub fn with_token(mut self, token: Vec<u8>) -> Message {
        self.token = token;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Message {
        self.payload = payload;
        self
    }

    pub fn ack(message_id: u16, token: Vec<u8>, code: Code) -> Message {
        Message::new(MessageType::Acknowledgement, code, message_id).with_token(token)
    }

    pub fn reset(message_id: u16) -> Message {
        Message::new(MessageType::Reset, Code::EMPTY, message_id)
    }

    pub fn encode(&self) -> Vec<u8> {
        assert!(self.token.len() <= 8, "token must fit RFC 7252's 4-bit TKL field");
        let mut out = Vec::with_capacity(16 + self.payload.len());
        let first = (1 << 6) | (self.kind.bits() << 4) | self.token.len() as u8;
        out.push(first);
        out.push(self.code.raw());
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.token);

        let mut last_number = 0u16;
        for (number, value) in self.options.sorted() {
            let delta = number - last_number;
            last_number = number;
            encode_option(&mut out, delta, value);
        }

        if !self.payload.is_empty() {
            out.push(0xFF);
            out.extend_from_slice(&self.payload);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Message, MessageError> {
        if bytes.len() < 4 {
            return Err(MessageError::HeaderTooShort);
        }
        let first = bytes[0];
        let version = first >> 6;
        if version != 1 {
            return Err(MessageError::UnsupportedVersion(version));
        }
        let kind = MessageType::from_bits(first >> 4);
        let tkl = first & 0b0000_1111;
        if tkl > 8 {
            return Err(MessageError::TokenTooLong(tkl));
        }
        let code = Code::from_raw(bytes[1]);
        let message_id = u16::from_be_bytes([bytes[2], bytes[3]]);

        let mut pos = 4usize;
        let tkl = tkl as usize;
        if bytes.len() < pos + tkl {
            return Err(MessageError::TruncatedToken);
        }
        let token = bytes[pos..pos + tkl].to_vec();
        pos += tkl;

        let mut options = Options::new();
        let mut last_number = 0u16;
        while pos < bytes.len() {
            if bytes[pos] == 0xFF {
                pos += 1;
                break;
            }
            let (number, value, consumed) = decode_option(&bytes[pos..], last_number)?;
            last_number = number;
            options.push(OptionNumber::from_number(number), value);
            pos += consumed;
        }
        let payload = bytes[pos..].to_vec();

        Ok(Message {
            kind,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }
}

fn encode_extended(out: &mut Vec<u8>, nibble_slot: &mut u8, shift: u8, value: u16) {
    if value < 13 {
        *nibble_slot |= (value as u8) << shift;
    } else if value < 269 {
        *nibble_slot |= 13 << shift;
        out.push((value - 13) as u8);
    } else {
        *nibble_slot |= 14 << shift;
        let ext = value - 269;
        out.push((ext >> 8) as u8);
        out.push((ext & 0xFF) as u8);
    }
}

fn encode_option(out: &mut Vec<u8>, delta: u16, value: &[u8]) {
    let mut header = 0u8;
    let header_pos = out.len();
    out.push(0); // placeholder, patched below
    let mut ext = Vec::new();
    encode_extended(&mut ext, &mut header, 4, delta);
    let len = value.len() as u16;
    encode_extended(&mut ext, &mut header, 0, len);
    out[header_pos] = header;
    out.extend_from_slice(&ext);
    out.extend_from_slice(value);
}

fn decode_ext_nibble(bytes: &[u8], nibble: u8, pos: &mut usize) -> Result<u16, MessageError> {
    match nibble {
        15 => Err(MessageError::ReservedExtension),
        13 => {
            let b = *bytes.get(*pos).ok_or(MessageError::TruncatedOption)?;
            *pos += 1;
            Ok(b as u16 + 13)
        }
        14 => {
            let b = bytes.get(*pos..*pos + 2).ok_or(MessageError::TruncatedOption)?;
            *pos += 2;
            Ok(u16::from_be_bytes([b[0], b[1]]) + 269)
        }
        n => Ok(n as u16),
    }
}

/// Decode one option starting at `bytes[0]`, given `last_number` from the
/// preceding option. Returns `(absolute number, value, bytes consumed)`.
fn decode_option(bytes: &[u8], last_number: u16) -> Result<(u16, Vec<u8>, usize), MessageError> {
    let header = *bytes.first().ok_or(MessageError::TruncatedOption)?;
    let mut pos = 1usize;
    let delta = decode_ext_nibble(bytes, header >> 4, &mut pos)?;
    let len = decode_ext_nibble(bytes, header & 0x0F, &mut pos)?;
    let len = len as usize;
    let value = bytes.get(pos..pos + len).ok_or(MessageError::TruncatedOption)?.to_vec();
    pos += len;
    Ok((last_number + delta, value, pos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::MediaType;

    #[test]
    fn code_formats_as_class_dot_detail() {
        assert_eq!(Code::GET.to_string(), "0.01");
        assert_eq!(Code::CONTENT.to_string(), "2.05");
    }

    #[test]
    fn empty_ack_round_trips() {
        let msg = Message::ack(0x1234, vec![], Code::EMPTY);
        let encoded = msg.encode();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded.kind, MessageType::Acknowledgement);
        assert_eq!(decoded.message_id, 0x1234);
        assert!(decoded.token.is_empty());
    }

    #[test]
    fn request_with_options_and_payload_round_trips() {
        let mut opts = Options::new();
        opts.push_uri_path("rd");
        opts.push_uri_query("ep=urn:imei:123");
        opts.push(OptionNumber::ContentFormat, vec![(MediaType::Tlv.code() >> 8) as u8, (MediaType::Tlv.code() & 0xFF) as u8]);

        let msg = Message::new(MessageType::Confirmable, Code::POST, 7)
            .with_token(vec![0xAA, 0xBB])
            .with_payload(vec![1, 2, 3, 4]);
        let mut msg = msg;
        msg.options = opts;

        let encoded = msg.encode();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded.kind, MessageType::Confirmable);
        assert_eq!(decoded.code, Code::POST);
        assert_eq!(decoded.token, vec![0xAA, 0xBB]);
        assert_eq!(decoded.payload, vec![1, 2, 3, 4]);
        assert_eq!(decoded.options.uri_path(), vec!["rd".to_string()]);
        assert_eq!(decoded.options.uri_query(), vec!["ep=urn:imei:123".to_string()]);
    }

    #[test]
    fn option_delta_extension_bytes_round_trip_large_numbers() {
        // Force both a 1-byte and a 2-byte extended delta/length.
        let mut opts = Options::new();
        opts.push(OptionNumber::Unknown(300), vec![0u8; 300]);
        let msg = Message::new(MessageType::NonConfirmable, Code::CONTENT, 1);
        let mut msg = msg;
        msg.options = opts;
        let encoded = msg.encode();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded.options.raw()[0].0, 300);
        assert_eq!(decoded.options.raw()[0].1.len(), 300);
    }

    #[test]
    fn rejects_truncated_header() {
        assert_eq!(Message::decode(&[0u8; 2]), Err(MessageError::HeaderTooShort));
    }

    #[test]
    fn rejects_unsupported_version() {
        let bytes = [0b1000_0000, 0, 0, 0];
        assert_eq!(Message::decode(&bytes), Err(MessageError::UnsupportedVersion(2)));
    }
}
