//! BACnet 标签编码（ASHRAE 135 第 20.2 节的子集）。

use std::fmt;

use serde_json::{Value, json};

use crate::error::ProtocolError;

/// 对象类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectType {
    AnalogInput,
    AnalogOutput,
    AnalogValue,
    BinaryInput,
    BinaryOutput,
    BinaryValue,
    Device,
    MultiStateInput,
    MultiStateOutput,
    MultiStateValue,
    LargeAnalogValue,
    Other(u16),
}

impl ObjectType {
    pub fn code(&self) -> u16 {
        match self {
            Self::AnalogInput => 0,
            Self::AnalogOutput => 1,
            Self::AnalogValue => 2,
            Self::BinaryInput => 3,
            Self::BinaryOutput => 4,
            Self::BinaryValue => 5,
            Self::Device => 8,
            Self::MultiStateInput => 13,
            Self::MultiStateOutput => 14,
            Self::MultiStateValue => 19,
            Self::LargeAnalogValue => 46,
            Self::Other(code) => *code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            0 => Self::AnalogInput,
            1 => Self::AnalogOutput,
            2 => Self::AnalogValue,
            3 => Self::BinaryInput,
            4 => Self::BinaryOutput,
            5 => Self::BinaryValue,
            8 => Self::Device,
            13 => Self::MultiStateInput,
            14 => Self::MultiStateOutput,
            19 => Self::MultiStateValue,
            46 => Self::LargeAnalogValue,
            other => Self::Other(other),
        }
    }

    /// 接受 `analogInput` / `analog-input` / `AI` / 数字编码。
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let norm: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        Ok(match norm.as_str() {
            "analoginput" | "ai" => Self::AnalogInput,
            "analogoutput" | "ao" => Self::AnalogOutput,
            "analogvalue" | "av" => Self::AnalogValue,
            "binaryinput" | "bi" => Self::BinaryInput,
            "binaryoutput" | "bo" => Self::BinaryOutput,
            "binaryvalue" | "bv" => Self::BinaryValue,
            "device" => Self::Device,
            "multistateinput" | "msi" => Self::MultiStateInput,
            "multistateoutput" | "mso" => Self::MultiStateOutput,
            "multistatevalue" | "msv" => Self::MultiStateValue,
            "largeanalogvalue" | "lav" => Self::LargeAnalogValue,
            other => match other.parse::<u16>() {
                Ok(code) if code < 1024 => Self::from_code(code),
                _ => {
                    return Err(ProtocolError::Config(format!("unknown objectType {raw}")));
                }
            },
        })
    }

    pub fn is_analog(&self) -> bool {
        matches!(
            self,
            Self::AnalogInput | Self::AnalogOutput | Self::AnalogValue
        )
    }

    pub fn is_binary(&self) -> bool {
        matches!(
            self,
            Self::BinaryInput | Self::BinaryOutput | Self::BinaryValue
        )
    }

    pub fn is_multi_state(&self) -> bool {
        matches!(
            self,
            Self::MultiStateInput | Self::MultiStateOutput | Self::MultiStateValue
        )
    }

    /// 可周期采集的对象类型。
    pub fn is_point(&self) -> bool {
        self.is_analog()
            || self.is_binary()
            || self.is_multi_state()
            || matches!(self, Self::LargeAnalogValue)
    }
}

/// 对象标识：`(type << 22) | instance`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    pub object_type: ObjectType,
    pub instance: u32,
}

impl ObjectId {
    pub const MAX_INSTANCE: u32 = 0x3F_FFFF;

    pub fn new(object_type: ObjectType, instance: u32) -> Self {
        Self {
            object_type,
            instance: instance & Self::MAX_INSTANCE,
        }
    }

    pub fn encode(&self) -> u32 {
        (u32::from(self.object_type.code()) << 22) | (self.instance & Self::MAX_INSTANCE)
    }

    pub fn decode(raw: u32) -> Self {
        Self {
            object_type: ObjectType::from_code((raw >> 22) as u16),
            instance: raw & Self::MAX_INSTANCE,
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.object_type, self.instance)
    }
}

/// 属性标识。
pub mod property {
    pub const OBJECT_IDENTIFIER: u32 = 75;
    pub const OBJECT_NAME: u32 = 77;
    pub const PRESENT_VALUE: u32 = 85;
    pub const STATUS_FLAGS: u32 = 111;
}

/// 应用标签编号。
pub mod app_tag {
    pub const NULL: u8 = 0;
    pub const BOOLEAN: u8 = 1;
    pub const UNSIGNED: u8 = 2;
    pub const SIGNED: u8 = 3;
    pub const REAL: u8 = 4;
    pub const DOUBLE: u8 = 5;
    pub const OCTET_STRING: u8 = 6;
    pub const CHARACTER_STRING: u8 = 7;
    pub const BIT_STRING: u8 = 8;
    pub const ENUMERATED: u8 = 9;
    pub const DATE: u8 = 10;
    pub const TIME: u8 = 11;
    pub const OBJECT_ID: u8 = 12;
}

/// 应用层取值。
#[derive(Debug, Clone, PartialEq)]
pub enum BacnetValue {
    Null,
    Boolean(bool),
    Unsigned(u32),
    Signed(i32),
    Real(f32),
    Double(f64),
    OctetString(Vec<u8>),
    CharacterString(String),
    /// `bits[i]` 为第 i 位（自首字节最高位起）
    BitString(Vec<bool>),
    Enumerated(u32),
    Date([u8; 4]),
    Time([u8; 4]),
    ObjectId(ObjectId),
}

impl BacnetValue {
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Boolean(b) => Value::Bool(*b),
            Self::Unsigned(v) | Self::Enumerated(v) => Value::from(*v),
            Self::Signed(v) => Value::from(*v),
            Self::Real(v) => serde_json::Number::from_f64(f64::from(*v))
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Double(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::OctetString(bytes) => Value::from(bytes.clone()),
            Self::CharacterString(s) => Value::String(s.clone()),
            Self::BitString(bits) => Value::from(bits.clone()),
            Self::Date(d) => json!(format!(
                "{:04}-{:02}-{:02}",
                1900 + u32::from(d[0]),
                d[1],
                d[2]
            )),
            Self::Time(t) => json!(format!("{:02}:{:02}:{:02}", t[0], t[1], t[2])),
            Self::ObjectId(id) => json!({
                "type": id.object_type.code(),
                "instance": id.instance,
            }),
        }
    }

    /// 与 JSON 目标值比较（回读确认用）。
    pub fn matches_json(&self, expected: &Value) -> bool {
        let actual = self.to_json();
        match (actual.as_f64(), expected.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs() < 1e-4,
            _ => match (&actual, expected) {
                (Value::Bool(a), Value::Number(n)) => n.as_f64() == Some(f64::from(u8::from(*a))),
                _ => actual == *expected,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// 编码
// ---------------------------------------------------------------------------

fn encode_tag(buf: &mut Vec<u8>, tag: u8, context: bool, len: u32) {
    let class = if context { 0x08 } else { 0x00 };
    let lvt = if len <= 4 { len as u8 } else { 5 };
    if tag <= 14 {
        buf.push((tag << 4) | class | lvt);
    } else {
        buf.push(0xF0 | class | lvt);
        buf.push(tag);
    }
    if len > 4 {
        if len <= 253 {
            buf.push(len as u8);
        } else if len <= u32::from(u16::MAX) {
            buf.push(254);
            buf.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            buf.push(255);
            buf.extend_from_slice(&len.to_be_bytes());
        }
    }
}

pub fn encode_opening(buf: &mut Vec<u8>, tag: u8) {
    buf.push((tag << 4) | 0x0E);
}

pub fn encode_closing(buf: &mut Vec<u8>, tag: u8) {
    buf.push((tag << 4) | 0x0F);
}

fn unsigned_bytes(v: u32) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let skip = bytes.iter().take(3).take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

fn signed_bytes(v: i32) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let mut start = 0;
    while start < 3 {
        let b = bytes[start];
        let next_high = bytes[start + 1] & 0x80;
        if (b == 0x00 && next_high == 0) || (b == 0xFF && next_high != 0) {
            start += 1;
        } else {
            break;
        }
    }
    bytes[start..].to_vec()
}

pub fn encode_context_unsigned(buf: &mut Vec<u8>, tag: u8, v: u32) {
    let bytes = unsigned_bytes(v);
    encode_tag(buf, tag, true, bytes.len() as u32);
    buf.extend_from_slice(&bytes);
}

pub fn encode_context_enumerated(buf: &mut Vec<u8>, tag: u8, v: u32) {
    encode_context_unsigned(buf, tag, v);
}

pub fn encode_context_object_id(buf: &mut Vec<u8>, tag: u8, id: ObjectId) {
    encode_tag(buf, tag, true, 4);
    buf.extend_from_slice(&id.encode().to_be_bytes());
}

/// 应用标签编码。
pub fn encode_application(buf: &mut Vec<u8>, value: &BacnetValue) {
    match value {
        BacnetValue::Null => encode_tag(buf, app_tag::NULL, false, 0),
        BacnetValue::Boolean(b) => encode_tag(buf, app_tag::BOOLEAN, false, u32::from(*b)),
        BacnetValue::Unsigned(v) => {
            let bytes = unsigned_bytes(*v);
            encode_tag(buf, app_tag::UNSIGNED, false, bytes.len() as u32);
            buf.extend_from_slice(&bytes);
        }
        BacnetValue::Signed(v) => {
            let bytes = signed_bytes(*v);
            encode_tag(buf, app_tag::SIGNED, false, bytes.len() as u32);
            buf.extend_from_slice(&bytes);
        }
        BacnetValue::Real(v) => {
            encode_tag(buf, app_tag::REAL, false, 4);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        BacnetValue::Double(v) => {
            encode_tag(buf, app_tag::DOUBLE, false, 8);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        BacnetValue::OctetString(bytes) => {
            encode_tag(buf, app_tag::OCTET_STRING, false, bytes.len() as u32);
            buf.extend_from_slice(bytes);
        }
        BacnetValue::CharacterString(s) => {
            encode_tag(buf, app_tag::CHARACTER_STRING, false, s.len() as u32 + 1);
            buf.push(0);
            buf.extend_from_slice(s.as_bytes());
        }
        BacnetValue::BitString(bits) => {
            let nbytes = bits.len().div_ceil(8);
            let unused = (nbytes * 8 - bits.len()) as u8;
            encode_tag(buf, app_tag::BIT_STRING, false, nbytes as u32 + 1);
            buf.push(unused);
            for chunk in bits.chunks(8) {
                let mut byte = 0u8;
                for (i, bit) in chunk.iter().enumerate() {
                    if *bit {
                        byte |= 0x80 >> i;
                    }
                }
                buf.push(byte);
            }
        }
        BacnetValue::Enumerated(v) => {
            let bytes = unsigned_bytes(*v);
            encode_tag(buf, app_tag::ENUMERATED, false, bytes.len() as u32);
            buf.extend_from_slice(&bytes);
        }
        BacnetValue::Date(d) => {
            encode_tag(buf, app_tag::DATE, false, 4);
            buf.extend_from_slice(d);
        }
        BacnetValue::Time(t) => {
            encode_tag(buf, app_tag::TIME, false, 4);
            buf.extend_from_slice(t);
        }
        BacnetValue::ObjectId(id) => {
            encode_tag(buf, app_tag::OBJECT_ID, false, 4);
            buf.extend_from_slice(&id.encode().to_be_bytes());
        }
    }
}

// ---------------------------------------------------------------------------
// 解码
// ---------------------------------------------------------------------------

/// 标签的长度/值/类型字段。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Length(u32),
    Opening,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub number: u8,
    pub context: bool,
    pub kind: TagKind,
}

impl Tag {
    pub fn is_opening(&self, number: u8) -> bool {
        self.context && self.number == number && self.kind == TagKind::Opening
    }

    pub fn is_closing(&self, number: u8) -> bool {
        self.context && self.number == number && self.kind == TagKind::Closing
    }

    pub fn is_context(&self, number: u8) -> bool {
        self.context && self.number == number && matches!(self.kind, TagKind::Length(_))
    }

    fn len(&self) -> usize {
        match self.kind {
            TagKind::Length(n) => n as usize,
            _ => 0,
        }
    }
}

/// 顺序读取缓冲区。
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

fn truncated() -> ProtocolError {
    ProtocolError::Decode("truncated bacnet frame".to_string())
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos.min(self.buf.len())..]
    }

    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        let b = *self.buf.get(self.pos).ok_or_else(truncated)?;
        self.pos += 1;
        Ok(b)
    }

    pub fn u16(&mut self) -> Result<u16, ProtocolError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos.checked_add(n).ok_or_else(truncated)?;
        let out = self.buf.get(self.pos..end).ok_or_else(truncated)?;
        self.pos = end;
        Ok(out)
    }

    pub fn peek_tag(&self) -> Result<Tag, ProtocolError> {
        self.clone().read_tag()
    }

    pub fn read_tag(&mut self) -> Result<Tag, ProtocolError> {
        let first = self.u8()?;
        let mut number = first >> 4;
        if number == 0x0F {
            number = self.u8()?;
        }
        let context = first & 0x08 != 0;
        let lvt = first & 0x07;
        let kind = match (context, lvt) {
            (true, 6) => TagKind::Opening,
            (true, 7) => TagKind::Closing,
            (_, 5) => {
                let ext = self.u8()?;
                TagKind::Length(match ext {
                    254 => u32::from(self.u16()?),
                    255 => {
                        let b = self.take(4)?;
                        u32::from_be_bytes([b[0], b[1], b[2], b[3]])
                    }
                    n => u32::from(n),
                })
            }
            (_, n) => TagKind::Length(u32::from(n)),
        };
        Ok(Tag {
            number,
            context,
            kind,
        })
    }

    fn unsigned_of(&mut self, len: usize) -> Result<u32, ProtocolError> {
        if len == 0 || len > 4 {
            return Err(ProtocolError::Decode(format!("unsigned of length {len}")));
        }
        Ok(self
            .take(len)?
            .iter()
            .fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
    }

    /// 读取指定编号的上下文标签无符号数。
    pub fn context_unsigned(&mut self, number: u8) -> Result<u32, ProtocolError> {
        let tag = self.read_tag()?;
        if !tag.is_context(number) {
            return Err(ProtocolError::Decode(format!(
                "expected context tag {number}, got {tag:?}"
            )));
        }
        self.unsigned_of(tag.len())
    }

    pub fn context_object_id(&mut self, number: u8) -> Result<ObjectId, ProtocolError> {
        let tag = self.read_tag()?;
        if !tag.is_context(number) || tag.len() != 4 {
            return Err(ProtocolError::Decode(format!(
                "expected object id in context tag {number}, got {tag:?}"
            )));
        }
        Ok(ObjectId::decode(self.unsigned_of(4)?))
    }

    pub fn expect_opening(&mut self, number: u8) -> Result<(), ProtocolError> {
        let tag = self.read_tag()?;
        if tag.is_opening(number) {
            Ok(())
        } else {
            Err(ProtocolError::Decode(format!(
                "expected opening tag {number}, got {tag:?}"
            )))
        }
    }

    pub fn expect_closing(&mut self, number: u8) -> Result<(), ProtocolError> {
        let tag = self.read_tag()?;
        if tag.is_closing(number) {
            Ok(())
        } else {
            Err(ProtocolError::Decode(format!(
                "expected closing tag {number}, got {tag:?}"
            )))
        }
    }

    /// 读取一个应用标签值。
    pub fn application(&mut self) -> Result<BacnetValue, ProtocolError> {
        let tag = self.read_tag()?;
        if tag.context {
            return Err(ProtocolError::Decode(format!(
                "expected application tag, got {tag:?}"
            )));
        }
        let len = tag.len();
        Ok(match tag.number {
            app_tag::NULL => BacnetValue::Null,
            app_tag::BOOLEAN => BacnetValue::Boolean(len != 0),
            app_tag::UNSIGNED => BacnetValue::Unsigned(self.unsigned_of(len)?),
            app_tag::SIGNED => {
                let bytes = self.take(len)?;
                if bytes.is_empty() || bytes.len() > 4 {
                    return Err(ProtocolError::Decode(format!("signed of length {len}")));
                }
                let fill = if bytes[0] & 0x80 != 0 { 0xFF } else { 0x00 };
                let mut raw = [fill; 4];
                raw[4 - bytes.len()..].copy_from_slice(bytes);
                BacnetValue::Signed(i32::from_be_bytes(raw))
            }
            app_tag::REAL => {
                let b = self.take(4)?;
                BacnetValue::Real(f32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            }
            app_tag::DOUBLE => {
                let b = self.take(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                BacnetValue::Double(f64::from_be_bytes(raw))
            }
            app_tag::OCTET_STRING => BacnetValue::OctetString(self.take(len)?.to_vec()),
            app_tag::CHARACTER_STRING => {
                let bytes = self.take(len)?;
                let text = bytes.get(1..).unwrap_or_default();
                BacnetValue::CharacterString(String::from_utf8_lossy(text).into_owned())
            }
            app_tag::BIT_STRING => {
                let bytes = self.take(len)?;
                let (unused, data) = bytes.split_first().ok_or_else(truncated)?;
                let total = (data.len() * 8).saturating_sub(usize::from(*unused));
                let bits = (0..total)
                    .map(|i| data[i / 8] & (0x80 >> (i % 8)) != 0)
                    .collect();
                BacnetValue::BitString(bits)
            }
            app_tag::ENUMERATED => BacnetValue::Enumerated(self.unsigned_of(len)?),
            app_tag::DATE => {
                let b = self.take(4)?;
                BacnetValue::Date([b[0], b[1], b[2], b[3]])
            }
            app_tag::TIME => {
                let b = self.take(4)?;
                BacnetValue::Time([b[0], b[1], b[2], b[3]])
            }
            app_tag::OBJECT_ID => BacnetValue::ObjectId(ObjectId::decode(self.unsigned_of(4)?)),
            other => {
                self.take(len)?;
                return Err(ProtocolError::Decode(format!(
                    "unsupported application tag {other}"
                )));
            }
        })
    }

    /// 读取到指定编号的闭合标签为止的全部应用值（不消耗闭合标签）。
    pub fn application_values_until(&mut self, closing: u8) -> Result<Vec<BacnetValue>, ProtocolError> {
        let mut values = Vec::new();
        loop {
            let tag = self.peek_tag()?;
            if tag.is_closing(closing) {
                return Ok(values);
            }
            values.push(self.application()?);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(value: &BacnetValue) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_application(&mut buf, value);
        buf
    }

    #[test]
    fn test_object_id() {
        let id = ObjectId::new(ObjectType::AnalogValue, 7);
        assert_eq!(id.encode(), (2 << 22) | 7);
        assert_eq!(ObjectId::decode(id.encode()), id);
        assert_eq!(
            encoded(&BacnetValue::ObjectId(id)),
            vec![0xC4, 0x00, 0x80, 0x00, 0x07]
        );
    }

    #[test]
    fn test_application_bytes() {
        assert_eq!(encoded(&BacnetValue::Real(1.0)), vec![0x44, 0x3F, 0x80, 0, 0]);
        assert_eq!(encoded(&BacnetValue::Unsigned(5)), vec![0x21, 0x05]);
        assert_eq!(encoded(&BacnetValue::Unsigned(300)), vec![0x22, 0x01, 0x2C]);
        assert_eq!(encoded(&BacnetValue::Enumerated(1)), vec![0x91, 0x01]);
        assert_eq!(encoded(&BacnetValue::Null), vec![0x00]);
        assert_eq!(encoded(&BacnetValue::Boolean(true)), vec![0x11]);
        assert_eq!(encoded(&BacnetValue::Signed(-1)), vec![0x31, 0xFF]);
        assert_eq!(encoded(&BacnetValue::Signed(128)), vec![0x32, 0x00, 0x80]);
    }

    #[test]
    fn test_status_flags_bits() {
        let flags = BacnetValue::BitString(vec![false, true, false, false]);
        let buf = encoded(&flags);
        assert_eq!(buf, vec![0x82, 0x04, 0x40]);
        let back = Reader::new(&buf).application().expect("decode");
        assert_eq!(back, flags);
    }

    #[test]
    fn test_extended_length() {
        let text = BacnetValue::CharacterString("a".repeat(300));
        let buf = encoded(&text);
        assert_eq!(&buf[..2], &[0x75, 254]);
        assert_eq!(Reader::new(&buf).application().expect("decode"), text);
    }

    #[test]
    fn test_decode_values() {
        for value in [
            BacnetValue::Real(21.5),
            BacnetValue::Double(-3.25),
            BacnetValue::Unsigned(70_000),
            BacnetValue::Signed(-70_000),
            BacnetValue::Enumerated(3),
            BacnetValue::CharacterString("ahu".to_string()),
            BacnetValue::Boolean(false),
        ] {
            let buf = encoded(&value);
            let mut reader = Reader::new(&buf);
            assert_eq!(reader.application().expect("decode"), value);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn test_object_type_names() {
        assert_eq!(ObjectType::parse("analogInput").expect("ai"), ObjectType::AnalogInput);
        assert_eq!(ObjectType::parse("multi-state-value").expect("msv"), ObjectType::MultiStateValue);
        assert_eq!(ObjectType::parse("BO").expect("bo"), ObjectType::BinaryOutput);
        assert!(ObjectType::parse("calendarish").is_err());
    }

    #[test]
    fn test_matches_json() {
        assert!(BacnetValue::Real(21.5).matches_json(&serde_json::json!(21.5)));
        assert!(BacnetValue::Enumerated(1).matches_json(&serde_json::json!(1)));
        assert!(!BacnetValue::Unsigned(2).matches_json(&serde_json::json!(3)));
    }
}
