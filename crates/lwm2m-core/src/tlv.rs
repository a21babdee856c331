//! TLV encoder/decoder for LwM2M resources and objects.
//!
//! Grounded directly on the wire grammar of the original Python
//! `lwm2m.tlv` module: a TLV record is
//! `type(1) | id(1|2) | len(0|1|2|3) | value(len)`, with the type byte
//! encoding kind (bits 7-6), id width (bit 5), length-kind (bits 4-3),
//! and inline length (bits 2-0) per spec.md §4.1.

use crate::path::{ResourceId, ResourceInstanceId};
use crate::value::{Value, ValueKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlvKind {
    ObjectInstance,
    ResourceInstance,
    MultipleResource,
    ResourceValue,
}

impl TlvKind {
    fn type_bits(self) -> u8 {
        match self {
            TlvKind::ObjectInstance => 0b0000_0000,
            TlvKind::ResourceInstance => 0b0100_0000,
            TlvKind::MultipleResource => 0b1000_0000,
            TlvKind::ResourceValue => 0b1100_0000,
        }
    }

    fn from_type_bits(bits: u8) -> TlvKind {
        match bits & 0b1100_0000 {
            0b0000_0000 => TlvKind::ObjectInstance,
            0b0100_0000 => TlvKind::ResourceInstance,
            0b1000_0000 => TlvKind::MultipleResource,
            _ => TlvKind::ResourceValue,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TlvError {
    #[error("truncated TLV header")]
    Truncated,
    #[error("TLV value length {declared} exceeds remaining payload of {available} bytes")]
    LengthExceedsPayload { declared: usize, available: usize },
    #[error("unexpected TLV kind {found:?}, expected {expected:?}")]
    UnexpectedKind { expected: TlvKind, found: TlvKind },
    #[error("unexpected TLV id {found}, expected {expected}")]
    UnexpectedId { expected: u16, found: u16 },
    #[error("invalid {kind:?} value encoding ({len} bytes)")]
    InvalidValueEncoding { kind: ValueKind, len: usize },
    #[error("invalid UTF-8 in String value")]
    InvalidUtf8,
}

/// Minimum number of big-endian bytes needed to hold `v` as two's
/// complement, at least one byte.
fn needed_signed_bytes(v: i64) -> usize {
    for n in 1..=8usize {
        let bits = (n * 8) as u32;
        let min = if bits == 64 { i64::MIN } else { -(1i64 << (bits - 1)) };
        let max = if bits == 64 {
            i64::MAX
        } else {
            (1i64 << (bits - 1)) - 1
        };
        if v >= min && v <= max {
            return n;
        }
    }
    8
}

fn encode_signed(v: i64, width: usize) -> Vec<u8> {
    v.to_be_bytes()[8 - width..].to_vec()
}

fn decode_signed(bytes: &[u8]) -> i64 {
    let mut buf = if bytes[0] & 0x80 != 0 {
        [0xFFu8; 8]
    } else {
        [0u8; 8]
    };
    buf[8 - bytes.len()..].copy_from_slice(bytes);
    i64::from_be_bytes(buf)
}

/// Encode a resource value to bytes based on its variant (spec.md §4.1).
pub fn encode_value(value: &Value) -> Vec<u8> {
    match value {
        Value::Integer(v) | Value::Timestamp(v) => {
            let width = needed_signed_bytes(*v);
            encode_signed(*v, width)
        }
        Value::String(s) => s.as_bytes().to_vec(),
        Value::Float(f) => {
            let single = *f as f32;
            if single as f64 == *f && single.is_finite() == f.is_finite() {
                single.to_be_bytes().to_vec()
            } else {
                f.to_be_bytes().to_vec()
            }
        }
        Value::Boolean(b) => vec![if *b { 0x01 } else { 0x00 }],
        Value::Opaque(bytes) => bytes.clone(),
        Value::ObjectLink(obj, inst) => {
            let mut out = Vec::with_capacity(4);
            out.extend_from_slice(&obj.to_be_bytes());
            out.extend_from_slice(&inst.to_be_bytes());
            out
        }
    }
}

/// Decode a resource value from bytes, interpreted as `kind`.
pub fn decode_value(kind: ValueKind, bytes: &[u8]) -> Result<Value, TlvError> {
    match kind {
        ValueKind::Integer => {
            if bytes.is_empty() || bytes.len() > 8 {
                return Err(TlvError::InvalidValueEncoding {
                    kind,
                    len: bytes.len(),
                });
            }
            Ok(Value::Integer(decode_signed(bytes)))
        }
        ValueKind::Timestamp => {
            if bytes.is_empty() || bytes.len() > 8 {
                return Err(TlvError::InvalidValueEncoding {
                    kind,
                    len: bytes.len(),
                });
            }
            Ok(Value::Timestamp(decode_signed(bytes)))
        }
        ValueKind::String => std::str::from_utf8(bytes)
            .map(|s| Value::String(s.to_string()))
            .map_err(|_| TlvError::InvalidUtf8),
        ValueKind::Float => match bytes.len() {
            4 => {
                let arr: [u8; 4] = bytes.try_into().unwrap();
                Ok(Value::Float(f32::from_be_bytes(arr) as f64))
            }
            8 => {
                let arr: [u8; 8] = bytes.try_into().unwrap();
                Ok(Value::Float(f64::from_be_bytes(arr)))
            }
            len => Err(TlvError::InvalidValueEncoding { kind, len }),
        },
        ValueKind::Boolean => match bytes {
            [0x00] => Ok(Value::Boolean(false)),
            [0x01] => Ok(Value::Boolean(true)),
            _ => Err(TlvError::InvalidValueEncoding {
                kind,
                len: bytes.len(),
            }),
        },
        ValueKind::Opaque => Ok(Value::Opaque(bytes.to_vec())),
        ValueKind::ObjectLink => {
            if bytes.len() != 4 {
                return Err(TlvError::InvalidValueEncoding {
                    kind,
                    len: bytes.len(),
                });
            }
            let obj = u16::from_be_bytes([bytes[0], bytes[1]]);
            let inst = u16::from_be_bytes([bytes[2], bytes[3]]);
            Ok(Value::ObjectLink(obj, inst))
        }
    }
}

/// Encode a single TLV record: header + payload.
pub fn encode_tlv(kind: TlvKind, id: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 + payload.len());
    let mut type_byte = kind.type_bits();

    let id_is_wide = id > 0xFF;
    if id_is_wide {
        type_byte |= 0b0010_0000;
    }

    let len = payload.len();
    if len < 8 {
        type_byte |= len as u8;
    } else if len < 0x100 {
        type_byte |= 0b0000_1000;
    } else if len < 0x1_0000 {
        type_byte |= 0b0001_0000;
    } else {
        type_byte |= 0b0001_1000;
    }

    out.push(type_byte);
    if id_is_wide {
        out.extend_from_slice(&id.to_be_bytes());
    } else {
        out.push(id as u8);
    }

    if len >= 8 {
        if len < 0x100 {
            out.push(len as u8);
        } else if len < 0x1_0000 {
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            let len = len as u32;
            out.push(((len >> 16) & 0xFF) as u8);
            out.extend_from_slice(&((len & 0xFFFF) as u16).to_be_bytes());
        }
    }

    out.extend_from_slice(payload);
    out
}

/// Decode one TLV record from the front of `bytes`, returning
/// `(kind, id, value_bytes, rest)`. Never allocates.
pub fn decode_tlv(bytes: &[u8]) -> Result<(TlvKind, u16, &[u8], &[u8]), TlvError> {
    let type_byte = *bytes.first().ok_or(TlvError::Truncated)?;
    let kind = TlvKind::from_type_bits(type_byte);
    let id_is_wide = type_byte & 0b0010_0000 != 0;
    let length_kind = (type_byte >> 3) & 0b11;

    let mut rest = bytes.get(1..).ok_or(TlvError::Truncated)?;

    let id = if id_is_wide {
        let b = rest.get(0..2).ok_or(TlvError::Truncated)?;
        rest = &rest[2..];
        u16::from_be_bytes([b[0], b[1]])
    } else {
        let b = *rest.first().ok_or(TlvError::Truncated)?;
        rest = &rest[1..];
        b as u16
    };

    let len = if length_kind == 0 {
        (type_byte & 0b0000_0111) as usize
    } else {
        let n = length_kind as usize;
        let b = rest.get(0..n).ok_or(TlvError::Truncated)?;
        rest = &rest[n..];
        b.iter().fold(0usize, |acc, byte| (acc << 8) | *byte as usize)
    };

    if len > rest.len() {
        return Err(TlvError::LengthExceedsPayload {
            declared: len,
            available: rest.len(),
        });
    }

    let (value, remain) = rest.split_at(len);
    Ok((kind, id, value, remain))
}

/// Pack a single resource value as a RESOURCE_VALUE TLV.
pub fn pack_resource_value(id: ResourceId, value: &Value) -> Vec<u8> {
    encode_tlv(TlvKind::ResourceValue, id, &encode_value(value))
}

/// Pack one resource instance as a RESOURCE_INSTANCE TLV.
pub fn pack_resource_instance(inst: ResourceInstanceId, value: &Value) -> Vec<u8> {
    encode_tlv(TlvKind::ResourceInstance, inst, &encode_value(value))
}

/// Pack a multi-resource: a MULTIPLE_RESOURCE TLV wrapping the
/// concatenation of its RESOURCE_INSTANCE children in ascending id.
/// `instances` must already be sorted by id ascending.
pub fn pack_multi_resource(id: ResourceId, instances: &[(ResourceInstanceId, Value)]) -> Vec<u8> {
    let mut payload = Vec::new();
    for (inst, value) in instances {
        payload.extend(pack_resource_instance(*inst, value));
    }
    encode_tlv(TlvKind::MultipleResource, id, &payload)
}

/// Pack an object instance: an OBJECT_INSTANCE TLV wrapping
/// already-concatenated resource TLV bytes.
pub fn pack_object_instance(inst: crate::path::InstanceId, resource_bytes: &[u8]) -> Vec<u8> {
    encode_tlv(TlvKind::ObjectInstance, inst, resource_bytes)
}

/// Decode a MULTIPLE_RESOURCE payload into `(resource-instance id, Value)`
/// pairs. Every entry must be a RESOURCE_INSTANCE TLV of `kind`; the whole
/// payload is scanned before returning, so a malformed trailing entry
/// fails the call without yielding a partial result.
pub fn decode_multi_resource(
    kind: ValueKind,
    mut payload: &[u8],
) -> Result<Vec<(ResourceInstanceId, Value)>, TlvError> {
    let mut out = Vec::new();
    while !payload.is_empty() {
        let (entry_kind, inst, value_bytes, rest) = decode_tlv(payload)?;
        if entry_kind != TlvKind::ResourceInstance {
            return Err(TlvError::UnexpectedKind {
                expected: TlvKind::ResourceInstance,
                found: entry_kind,
            });
        }
        out.push((inst, decode_value(kind, value_bytes)?));
        payload = rest;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(kind: ValueKind, value: Value, id: u16) {
        let encoded = encode_tlv(TlvKind::ResourceValue, id, &encode_value(&value));
        let (decoded_kind, decoded_id, value_bytes, rest) = decode_tlv(&encoded).unwrap();
        assert_eq!(decoded_kind, TlvKind::ResourceValue);
        assert_eq!(decoded_id, id);
        assert!(rest.is_empty());
        assert_eq!(decode_value(kind, value_bytes).unwrap(), value);
    }

    #[test]
    fn integer_round_trips_minimal_width() {
        round_trip(ValueKind::Integer, Value::Integer(0), 0);
        round_trip(ValueKind::Integer, Value::Integer(127), 5);
        round_trip(ValueKind::Integer, Value::Integer(-1), 5);
        round_trip(ValueKind::Integer, Value::Integer(i64::MAX), 300);
        round_trip(ValueKind::Integer, Value::Integer(i64::MIN), 300);
    }

    #[test]
    fn string_round_trips() {
        round_trip(ValueKind::String, Value::String("Laird Connectivity, Inc.".into()), 0);
    }

    #[test]
    fn float_stays_single_when_representable() {
        let encoded = encode_value(&Value::Float(1.5));
        assert_eq!(encoded.len(), 4);
        round_trip(ValueKind::Float, Value::Float(1.5), 2);
    }

    #[test]
    fn float_widens_to_double_when_not_representable() {
        let v = 1.0 / 3.0;
        let encoded = encode_value(&Value::Float(v));
        assert_eq!(encoded.len(), 8);
    }

    #[test]
    fn boolean_and_opaque_round_trip() {
        round_trip(ValueKind::Boolean, Value::Boolean(true), 1);
        round_trip(ValueKind::Opaque, Value::Opaque(vec![1, 2, 3]), 3);
    }

    #[test]
    fn object_link_round_trips() {
        round_trip(ValueKind::ObjectLink, Value::ObjectLink(11, 0), 11);
    }

    #[test]
    fn wide_id_sets_id_width_bit() {
        let encoded = encode_tlv(TlvKind::ResourceValue, 300, &[1]);
        assert_eq!(encoded[0] & 0b0010_0000, 0b0010_0000);
        let (_, id, _, _) = decode_tlv(&encoded).unwrap();
        assert_eq!(id, 300);
    }

    #[test]
    fn long_value_uses_explicit_length() {
        let payload = vec![0xAB; 300];
        let encoded = encode_tlv(TlvKind::ResourceValue, 0, &payload);
        let (_, _, value, rest) = decode_tlv(&encoded).unwrap();
        assert_eq!(value, payload.as_slice());
        assert!(rest.is_empty());
    }

    #[test]
    fn truncated_input_is_malformed() {
        assert_eq!(decode_tlv(&[]), Err(TlvError::Truncated));
        assert_eq!(decode_tlv(&[0b1100_0000]), Err(TlvError::Truncated));
    }

    #[test]
    fn length_exceeding_payload_is_malformed() {
        // RESOURCE_VALUE, 8-bit id, inline length 5, but only 2 bytes follow.
        let bytes = [0b1100_0101, 0x00, 0xAA, 0xBB];
        assert!(matches!(
            decode_tlv(&bytes),
            Err(TlvError::LengthExceedsPayload { .. })
        ));
    }

    #[test]
    fn multi_resource_composes_and_decomposes() {
        let instances = vec![
            (0u16, Value::Integer(41)),
            (1u16, Value::Integer(42)),
        ];
        let packed = pack_multi_resource(6, &instances);
        let (kind, id, payload, rest) = decode_tlv(&packed).unwrap();
        assert_eq!(kind, TlvKind::MultipleResource);
        assert_eq!(id, 6);
        assert!(rest.is_empty());
        let decoded = decode_multi_resource(ValueKind::Integer, payload).unwrap();
        assert_eq!(decoded, instances);
    }

    #[test]
    fn object_instance_wraps_concatenated_resources() {
        let r0 = pack_resource_value(0, &Value::String("a".into()));
        let r1 = pack_resource_value(1, &Value::Integer(1));
        let mut body = Vec::new();
        body.extend(&r0);
        body.extend(&r1);
        let packed = pack_object_instance(0, &body);
        let (kind, id, payload, rest) = decode_tlv(&packed).unwrap();
        assert_eq!(kind, TlvKind::ObjectInstance);
        assert_eq!(id, 0);
        assert!(rest.is_empty());
        assert_eq!(payload, body.as_slice());
    }
}
