//! CoAP option numbers and the handful of option values the client
//! needs: Uri-Path/Query, Content-Format, Observe, Location-Path, and
//! the RFC 7959 Block1/Block2 descriptors.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OptionNumber {
    IfMatch,
    UriHost,
    Etag,
    IfNoneMatch,
    Observe,
    UriPort,
    LocationPath,
    UriPath,
    ContentFormat,
    MaxAge,
    UriQuery,
    Accept,
    LocationQuery,
    Block2,
    Block1,
    Size2,
    ProxyUri,
    ProxyScheme,
    Size1,
    Unknown(u16),
}

impl OptionNumber {
    pub fn number(self) -> u16 {
        match self {
            OptionNumber::IfMatch => 1,
            OptionNumber::UriHost => 3,
            OptionNumber::Etag => 4,
            OptionNumber::IfNoneMatch => 5,
            OptionNumber::Observe => 6,
            OptionNumber::UriPort => 7,
            OptionNumber::LocationPath => 8,
            OptionNumber::UriPath => 11,
            OptionNumber::ContentFormat => 12,
            OptionNumber::MaxAge => 14,
            OptionNumber::UriQuery => 15,
            OptionNumber::Accept => 17,
            OptionNumber::LocationQuery => 20,
            OptionNumber::Block2 => 23,
            OptionNumber::Block1 => 27,
            OptionNumber::Size2 => 28,
            OptionNumber::ProxyUri => 35,
            OptionNumber::ProxyScheme => 39,
            OptionNumber::Size1 => 60,
            OptionNumber::Unknown(n) => n,
        }
    }

    pub fn from_number(n: u16) -> OptionNumber {
        match n {
            1 => OptionNumber::IfMatch,
            3 => OptionNumber::UriHost,
            4 => OptionNumber::Etag,
            5 => OptionNumber::IfNoneMatch,
            6 => OptionNumber::Observe,
            7 => OptionNumber::UriPort,
            8 => OptionNumber::LocationPath,
            11 => OptionNumber::UriPath,
            12 => OptionNumber::ContentFormat,
            14 => OptionNumber::MaxAge,
            15 => OptionNumber::UriQuery,
            17 => OptionNumber::Accept,
            20 => OptionNumber::LocationQuery,
            23 => OptionNumber::Block2,
            27 => OptionNumber::Block1,
            28 => OptionNumber::Size2,
            35 => OptionNumber::ProxyUri,
            39 => OptionNumber::ProxyScheme,
            60 => OptionNumber::Size1,
            n => OptionNumber::Unknown(n),
        }
    }

    /// Whether an unrecognized option of this number must abort
    /// processing (RFC 7252 §5.4.1: critical <=> odd option number).
    pub fn is_critical(self) -> bool {
        self.number() % 2 == 1
    }
}

/// LwM2M-relevant Content-Format / Accept values (OMA registry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    TextPlain,
    LinkFormat,
    Opaque,
    Tlv,
}

impl MediaType {
    pub fn code(self) -> u16 {
        match self {
            MediaType::TextPlain => 0,
            MediaType::LinkFormat => 40,
            MediaType::Opaque => 42,
            MediaType::Tlv => 11542,
        }
    }

    pub fn from_code(code: u16) -> Option<MediaType> {
        match code {
            0 => Some(MediaType::TextPlain),
            40 => Some(MediaType::LinkFormat),
            42 => Some(MediaType::Opaque),
            11542 => Some(MediaType::Tlv),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("block option must be 1-3 bytes, got {0}")]
    BadLength(usize),
    #[error("block size exponent {0} exceeds the maximum of 6 (1024 bytes)")]
    ExponentTooLarge(u8),
}

/// A decoded Block1/Block2 option (RFC 7959 §2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockValue {
    pub block_number: u32,
    pub more: bool,
    pub size_exponent: u8,
}

pub const MAX_BLOCK_SIZE_EXPONENT: u8 = 6;

impl BlockValue {
    pub fn new(block_number: u32, more: bool, size_exponent: u8) -> Result<BlockValue, BlockError> {
        if size_exponent > MAX_BLOCK_SIZE_EXPONENT {
            return Err(BlockError::ExponentTooLarge(size_exponent));
        }
        Ok(BlockValue {
            block_number,
            more,
            size_exponent,
        })
    }

    pub fn size(self) -> usize {
        1usize << (4 + self.size_exponent as u32)
    }

    pub fn encode(self) -> Vec<u8> {
        let szx = self.size_exponent & 0b111;
        let m = if self.more { 0b1000 } else { 0 };
        let value = (self.block_number << 4) | m as u32 | szx as u32;
        let bytes = value.to_be_bytes();
        // Trim leading zero bytes but always keep at least one.
        let first_nonzero = bytes.iter().position(|b| *b != 0).unwrap_or(3);
        bytes[first_nonzero..].to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<BlockValue, BlockError> {
        if bytes.is_empty() || bytes.len() > 3 {
            return Err(BlockError::BadLength(bytes.len()));
        }
        let mut buf = [0u8; 4];
        buf[4 - bytes.len()..].copy_from_slice(bytes);
        let value = u32::from_be_bytes(buf);
        let szx = (value & 0b111) as u8;
        let more = value & 0b1000 != 0;
        let block_number = value >> 4;
        BlockValue::new(block_number, more, szx)
    }
}

/// An unordered bag of `(option number, raw value)` pairs as parsed off
/// the wire; option-specific getters decode lazily.
#[derive(Debug, Clone, Default)]
pub struct Options {
    entries: Vec<(u16, Vec<u8>)>,
}

impl Options {
    pub fn new() -> Options {
        Options::default()
    }

    pub fn push(&mut self, number: OptionNumber, value: Vec<u8>) {
        self.entries.push((number.number(), value));
    }

    pub fn push_uint(&mut self, number: OptionNumber, value: u32) {
        let bytes = value.to_be_bytes();
        let first_nonzero = bytes.iter().position(|b| *b != 0);
        let trimmed = match first_nonzero {
            Some(i) => bytes[i..].to_vec(),
            None => Vec::new(),
        };
        self.push(number, trimmed);
    }

    pub fn raw(&self) -> &[(u16, Vec<u8>)] {
        &self.entries
    }

    /// Entries in ascending option-number order, as the wire format
    /// requires (RFC 7252 §3.1: options MUST appear in order, delta-coded).
    pub fn sorted(&self) -> Vec<(u16, &[u8])> {
        let mut v: Vec<(u16, &[u8])> = self.entries.iter().map(|(n, b)| (*n, b.as_slice())).collect();
        v.sort_by_key(|(n, _)| *n);
        v
    }

    fn values_of(&self, number: OptionNumber) -> impl Iterator<Item = &[u8]> {
        let target = number.number();
        self.entries
            .iter()
            .filter(move |(n, _)| *n == target)
            .map(|(_, v)| v.as_slice())
    }

    pub fn uri_path(&self) -> Vec<String> {
        self.values_of(OptionNumber::UriPath)
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    pub fn uri_query(&self) -> Vec<String> {
        self.values_of(OptionNumber::UriQuery)
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    pub fn location_path(&self) -> Vec<String> {
        self.values_of(OptionNumber::LocationPath)
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    pub fn content_format(&self) -> Option<u16> {
        self.values_of(OptionNumber::ContentFormat)
            .next()
            .map(uint_from_be_bytes)
            .map(|v| v as u16)
    }

    pub fn accept(&self) -> Option<u16> {
        self.values_of(OptionNumber::Accept)
            .next()
            .map(uint_from_be_bytes)
            .map(|v| v as u16)
    }

    pub fn observe(&self) -> Option<u32> {
        self.values_of(OptionNumber::Observe).next().map(uint_from_be_bytes)
    }

    pub fn block1(&self) -> Option<Result<BlockValue, BlockError>> {
        self.values_of(OptionNumber::Block1).next().map(BlockValue::decode)
    }

    pub fn block2(&self) -> Option<Result<BlockValue, BlockError>> {
        self.values_of(OptionNumber::Block2).next().map(BlockValue::decode)
    }

    pub fn size1(&self) -> Option<u32> {
        self.values_of(OptionNumber::Size1).next().map(uint_from_be_bytes)
    }

    pub fn size2(&self) -> Option<u32> {
        self.values_of(OptionNumber::Size2).next().map(uint_from_be_bytes)
    }

    pub fn push_block1(&mut self, block: BlockValue) {
        self.push(OptionNumber::Block1, block.encode());
    }

    pub fn push_block2(&mut self, block: BlockValue) {
        self.push(OptionNumber::Block2, block.encode());
    }

    pub fn push_uri_path(&mut self, path: &str) {
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.push(OptionNumber::UriPath, segment.as_bytes().to_vec());
        }
    }

    pub fn push_uri_query(&mut self, query: &str) {
        self.push(OptionNumber::UriQuery, query.as_bytes().to_vec());
    }
}

fn uint_from_be_bytes(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    let n = bytes.len().min(4);
    buf[4 - n..].copy_from_slice(&bytes[bytes.len() - n..]);
    u32::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_value_round_trips() {
        for szx in 0..=6u8 {
            for more in [true, false] {
                let b = BlockValue::new(12, more, szx).unwrap();
                let encoded = b.encode();
                assert!(encoded.len() <= 3);
                assert_eq!(BlockValue::decode(&encoded).unwrap(), b);
            }
        }
    }

    #[test]
    fn block_value_rejects_oversized_exponent() {
        assert_eq!(BlockValue::new(0, false, 7), Err(BlockError::ExponentTooLarge(7)));
    }

    #[test]
    fn block_size_matches_exponent() {
        assert_eq!(BlockValue::new(0, false, 0).unwrap().size(), 16);
        assert_eq!(BlockValue::new(0, false, 6).unwrap().size(), 1024);
    }

    #[test]
    fn critical_option_numbers_are_odd() {
        assert!(OptionNumber::UriPath.is_critical());
        assert!(!OptionNumber::ContentFormat.is_critical());
    }

    #[test]
    fn uri_path_round_trips_through_options() {
        let mut opts = Options::new();
        opts.push_uri_path("rd");
        assert_eq!(opts.uri_path(), vec!["rd".to_string()]);
    }
}
