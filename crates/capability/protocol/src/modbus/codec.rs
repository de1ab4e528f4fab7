//! 寄存器数值编解码。
//!
//! 标量按 `byteSwap` 选择大端/小端序列化为字节，再按 `wordSwap` 以 4 字节为单位
//! 交换高低字（[0,1,2,3] → [2,3,0,1]），最后两两组成大端 u16 寄存器。

use std::str::FromStr;

use serde_json::Value;

use crate::error::ProtocolError;

/// 点位的寄存器原始类型（`extends.rawType`）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawType {
    Uint16,
    Int16,
    Uint32,
    Int32,
    Float32,
    Uint64,
    Int64,
    Float64,
    /// 字符串，寄存器数由点位 `quantity` 决定
    String,
}

impl RawType {
    /// 定长类型占用的寄存器数；字符串返回 `None`。
    pub fn register_count(&self) -> Option<usize> {
        match self {
            Self::Uint16 | Self::Int16 => Some(1),
            Self::Uint32 | Self::Int32 | Self::Float32 => Some(2),
            Self::Uint64 | Self::Int64 | Self::Float64 => Some(4),
            Self::String => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uint16 => "uint16",
            Self::Int16 => "int16",
            Self::Uint32 => "uint32",
            Self::Int32 => "int32",
            Self::Float32 => "float32",
            Self::Uint64 => "uint64",
            Self::Int64 => "int64",
            Self::Float64 => "float64",
            Self::String => "string",
        }
    }
}

impl FromStr for RawType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "uint16" | "u16" => Self::Uint16,
            "int16" | "i16" => Self::Int16,
            "uint32" | "u32" => Self::Uint32,
            "int32" | "i32" => Self::Int32,
            "float32" | "f32" | "float" => Self::Float32,
            "uint64" | "u64" => Self::Uint64,
            "int64" | "i64" => Self::Int64,
            "float64" | "f64" | "double" => Self::Float64,
            "string" => Self::String,
            other => return Err(ProtocolError::UnknownRawType(other.to_string())),
        })
    }
}

/// 解码后的标量。
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    U64(u64),
    I64(i64),
    F64(f64),
    Str(String),
}

impl ScalarValue {
    pub fn raw_type(&self) -> RawType {
        match self {
            Self::U16(_) => RawType::Uint16,
            Self::I16(_) => RawType::Int16,
            Self::U32(_) => RawType::Uint32,
            Self::I32(_) => RawType::Int32,
            Self::F32(_) => RawType::Float32,
            Self::U64(_) => RawType::Uint64,
            Self::I64(_) => RawType::Int64,
            Self::F64(_) => RawType::Float64,
            Self::Str(_) => RawType::String,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::U16(v) => Value::from(*v),
            Self::I16(v) => Value::from(*v),
            Self::U32(v) => Value::from(*v),
            Self::I32(v) => Value::from(*v),
            Self::F32(v) => serde_json::Number::from_f64(f64::from(*v))
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::U64(v) => Value::from(*v),
            Self::I64(v) => Value::from(*v),
            Self::F64(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Str(v) => Value::String(v.clone()),
        }
    }

    /// 整数视图（位运算/掩码写入用）。
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::U16(v) => Some(u64::from(*v)),
            Self::I16(v) => Some(*v as u16 as u64),
            Self::U32(v) => Some(u64::from(*v)),
            Self::I32(v) => Some(*v as u32 as u64),
            Self::U64(v) => Some(*v),
            Self::I64(v) => Some(*v as u64),
            _ => None,
        }
    }

    /// 按目标类型把 JSON 值转换为标量（写入路径）。
    pub fn from_json(raw_type: RawType, value: &Value) -> Result<Self, ProtocolError> {
        let bad = || ProtocolError::Encode(format!("{value} is not a valid {}", raw_type.as_str()));
        let as_f64 = || -> Option<f64> {
            match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse().ok(),
                Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                _ => None,
            }
        };
        let as_i128 = || -> Option<i128> {
            match value {
                Value::Number(n) => n
                    .as_i64()
                    .map(i128::from)
                    .or_else(|| n.as_u64().map(i128::from))
                    .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i128)),
                Value::String(s) => s.trim().parse().ok(),
                Value::Bool(b) => Some(i128::from(*b)),
                _ => None,
            }
        };
        Ok(match raw_type {
            RawType::Uint16 => Self::U16(as_i128().and_then(|v| u16::try_from(v).ok()).ok_or_else(bad)?),
            RawType::Int16 => Self::I16(as_i128().and_then(|v| i16::try_from(v).ok()).ok_or_else(bad)?),
            RawType::Uint32 => Self::U32(as_i128().and_then(|v| u32::try_from(v).ok()).ok_or_else(bad)?),
            RawType::Int32 => Self::I32(as_i128().and_then(|v| i32::try_from(v).ok()).ok_or_else(bad)?),
            RawType::Uint64 => Self::U64(as_i128().and_then(|v| u64::try_from(v).ok()).ok_or_else(bad)?),
            RawType::Int64 => Self::I64(as_i128().and_then(|v| i64::try_from(v).ok()).ok_or_else(bad)?),
            RawType::Float32 => Self::F32(as_f64().ok_or_else(bad)? as f32),
            RawType::Float64 => Self::F64(as_f64().ok_or_else(bad)?),
            RawType::String => Self::Str(match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
        })
    }
}

fn to_bytes<const N: usize>(be: [u8; N], le: [u8; N], byte_swap: bool) -> Vec<u8> {
    if byte_swap { le.to_vec() } else { be.to_vec() }
}

fn swap_words(bytes: &mut [u8]) {
    for chunk in bytes.chunks_exact_mut(4) {
        chunk.swap(0, 2);
        chunk.swap(1, 3);
    }
}

fn bytes_to_registers(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|pair| {
            let hi = pair[0];
            let lo = pair.get(1).copied().unwrap_or(0);
            u16::from_be_bytes([hi, lo])
        })
        .collect()
}

fn registers_to_bytes(regs: &[u16]) -> Vec<u8> {
    regs.iter().flat_map(|r| r.to_be_bytes()).collect()
}

/// 标量 → 寄存器序列。
pub fn encode_scalar(value: &ScalarValue, byte_swap: bool, word_swap: bool) -> Vec<u16> {
    let mut bytes = match value {
        ScalarValue::U16(v) => to_bytes(v.to_be_bytes(), v.to_le_bytes(), byte_swap),
        ScalarValue::I16(v) => to_bytes(v.to_be_bytes(), v.to_le_bytes(), byte_swap),
        ScalarValue::U32(v) => to_bytes(v.to_be_bytes(), v.to_le_bytes(), byte_swap),
        ScalarValue::I32(v) => to_bytes(v.to_be_bytes(), v.to_le_bytes(), byte_swap),
        ScalarValue::F32(v) => to_bytes(v.to_be_bytes(), v.to_le_bytes(), byte_swap),
        ScalarValue::U64(v) => to_bytes(v.to_be_bytes(), v.to_le_bytes(), byte_swap),
        ScalarValue::I64(v) => to_bytes(v.to_be_bytes(), v.to_le_bytes(), byte_swap),
        ScalarValue::F64(v) => to_bytes(v.to_be_bytes(), v.to_le_bytes(), byte_swap),
        ScalarValue::Str(s) => {
            let mut bytes = s.as_bytes().to_vec();
            if bytes.len() % 2 == 1 {
                bytes.push(0);
            }
            if byte_swap {
                for pair in bytes.chunks_exact_mut(2) {
                    pair.swap(0, 1);
                }
            }
            return bytes_to_registers(&bytes);
        }
    };
    if word_swap {
        swap_words(&mut bytes);
    }
    bytes_to_registers(&bytes)
}

fn fixed<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// 寄存器序列 → 标量。
pub fn decode_scalar(
    raw_type: RawType,
    byte_swap: bool,
    word_swap: bool,
    regs: &[u16],
) -> Result<ScalarValue, ProtocolError> {
    if let Some(expected) = raw_type.register_count()
        && regs.len() != expected
    {
        return Err(ProtocolError::LengthMismatch {
            expected,
            actual: regs.len(),
        });
    }

    let mut bytes = registers_to_bytes(regs);
    if raw_type == RawType::String {
        if byte_swap {
            for pair in bytes.chunks_exact_mut(2) {
                pair.swap(0, 1);
            }
        }
        while bytes.last() == Some(&0) {
            bytes.pop();
        }
        return String::from_utf8(bytes)
            .map(ScalarValue::Str)
            .map_err(|e| ProtocolError::Decode(e.to_string()));
    }
    if word_swap {
        swap_words(&mut bytes);
    }

    macro_rules! read {
        ($ty:ty, $n:literal, $variant:ident) => {{
            let b = fixed::<$n>(&bytes);
            ScalarValue::$variant(if byte_swap {
                <$ty>::from_le_bytes(b)
            } else {
                <$ty>::from_be_bytes(b)
            })
        }};
    }

    Ok(match raw_type {
        RawType::Uint16 => read!(u16, 2, U16),
        RawType::Int16 => read!(i16, 2, I16),
        RawType::Uint32 => read!(u32, 4, U32),
        RawType::Int32 => read!(i32, 4, I32),
        RawType::Float32 => read!(f32, 4, F32),
        RawType::Uint64 => read!(u64, 8, U64),
        RawType::Int64 => read!(i64, 8, I64),
        RawType::Float64 => read!(f64, 8, F64),
        RawType::String => unreachable!("string handled above"),
    })
}

/// 取出 `[bit, bit + len)` 位段。
pub fn get_bits(value: u64, bit: u32, len: u32) -> u64 {
    let len = len.clamp(1, 64);
    let shifted = value >> bit.min(63);
    if len == 64 {
        shifted
    } else {
        shifted & ((1u64 << len) - 1)
    }
}

/// 由位段生成 16 位掩码。
pub fn bit_mask(bit: u32, len: u32) -> u16 {
    let len = len.clamp(1, 16);
    let ones: u32 = if len == 16 { 0xFFFF } else { (1u32 << len) - 1 };
    ((ones << bit.min(15)) & 0xFFFF) as u16
}

/// 掩码合并：`(current & !mask) | (new & mask)`。
pub fn apply_mask(current: u16, new: u16, mask: u16) -> u16 {
    (current & !mask) | (new & mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u16_plain() {
        let v = decode_scalar(RawType::Uint16, false, false, &[0x1234]).expect("decode");
        assert_eq!(v, ScalarValue::U16(0x1234));
        assert_eq!(v.to_json(), serde_json::json!(4660));
    }

    #[test]
    fn test_u16_byte_swap() {
        let v = decode_scalar(RawType::Uint16, true, false, &[0x1234]).expect("decode");
        assert_eq!(v, ScalarValue::U16(0x3412));
    }

    #[test]
    fn test_u32_word_swap() {
        let regs = encode_scalar(&ScalarValue::U32(0x1122_3344), false, true);
        assert_eq!(regs, vec![0x3344, 0x1122]);
        let regs = encode_scalar(&ScalarValue::U32(0x1122_3344), false, false);
        assert_eq!(regs, vec![0x1122, 0x3344]);
    }

    #[test]
    fn test_u64_word_swap_pairs() {
        let regs = encode_scalar(&ScalarValue::U64(0x1122_3344_5566_7788), false, true);
        assert_eq!(regs, vec![0x3344, 0x1122, 0x7788, 0x5566]);
    }

    #[test]
    fn test_round_trip_all_types() {
        let samples = [
            ScalarValue::U16(65535),
            ScalarValue::I16(-12),
            ScalarValue::U32(4_000_000_000),
            ScalarValue::I32(-123_456),
            ScalarValue::F32(3.25),
            ScalarValue::U64(u64::MAX - 7),
            ScalarValue::I64(-9_876_543_210),
            ScalarValue::F64(-0.125),
            ScalarValue::Str("ABCDE".to_string()),
        ];
        for sample in samples {
            for byte_swap in [false, true] {
                for word_swap in [false, true] {
                    let regs = encode_scalar(&sample, byte_swap, word_swap);
                    let back = decode_scalar(sample.raw_type(), byte_swap, word_swap, &regs)
                        .expect("decode");
                    assert_eq!(back, sample, "{sample:?} bs={byte_swap} ws={word_swap}");
                    assert_eq!(encode_scalar(&back, byte_swap, word_swap), regs);
                }
            }
        }
    }

    #[test]
    fn test_f32_bitwise() {
        let regs = encode_scalar(&ScalarValue::F32(1.0), false, false);
        assert_eq!(regs, vec![0x3F80, 0x0000]);
    }

    #[test]
    fn test_length_mismatch() {
        let err = decode_scalar(RawType::Float32, false, false, &[1]).expect_err("mismatch");
        assert!(matches!(
            err,
            ProtocolError::LengthMismatch {
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn test_unknown_raw_type() {
        let err = "bcd16".parse::<RawType>().expect_err("unknown");
        assert!(matches!(err, ProtocolError::UnknownRawType(_)));
        assert_eq!("FLOAT32".parse::<RawType>().expect("case"), RawType::Float32);
    }

    #[test]
    fn test_mask_and_bits() {
        assert_eq!(apply_mask(0xAB12, 0x00F0, 0x00FF), 0xABF0);
        assert_eq!(bit_mask(4, 4), 0x00F0);
        assert_eq!(get_bits(0b1011_0000, 4, 4), 0b1011);
    }

    #[test]
    fn test_from_json() {
        let v = ScalarValue::from_json(RawType::Int16, &serde_json::json!("-5")).expect("str");
        assert_eq!(v, ScalarValue::I16(-5));
        assert!(ScalarValue::from_json(RawType::Uint16, &serde_json::json!(70000)).is_err());
    }
}
