//! Modbus 寄存器表与起始地址解析。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// 寄存器表。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrimaryTable {
    Coil,
    DiscreteInput,
    InputRegister,
    HoldingRegister,
}

impl PrimaryTable {
    /// 线圈/离散输入按位寻址。
    pub fn is_bit(&self) -> bool {
        matches!(self, Self::Coil | Self::DiscreteInput)
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, Self::Coil | Self::HoldingRegister)
    }

    /// 五位传统地址的表基址（如 40001）。
    fn legacy_base(&self) -> u32 {
        match self {
            Self::Coil => 1,
            Self::DiscreteInput => 10001,
            Self::InputRegister => 30001,
            Self::HoldingRegister => 40001,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_value(Value::String(raw.trim().to_ascii_uppercase()))
            .map_err(|_| ProtocolError::Config(format!("unknown primaryTable {raw}")))
    }
}

/// 解析结果：零基地址，以及传统地址推断出的寄存器表。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedAddress {
    pub address: u16,
    pub table: Option<PrimaryTable>,
}

fn legacy_table(n: u32) -> Option<PrimaryTable> {
    match n {
        1..=9999 => Some(PrimaryTable::Coil),
        10001..=19999 => Some(PrimaryTable::DiscreteInput),
        30001..=39999 => Some(PrimaryTable::InputRegister),
        40001..=49999 => Some(PrimaryTable::HoldingRegister),
        _ => None,
    }
}

fn out_of_range(raw: &str) -> ProtocolError {
    ProtocolError::Config(format!("startAddress {raw} out of range"))
}

/// 解析 `startAddress`：
///
/// - 数字或纯数字串：零基地址
/// - `0x…`：十六进制零基地址
/// - `…d`：十进制零基地址
/// - 五位数字串（如 `"40001"`）：传统记法，同时推断寄存器表
pub fn parse_address(raw: &Value) -> Result<ParsedAddress, ProtocolError> {
    let text = match raw {
        Value::Number(n) => {
            let n = n.as_u64().ok_or_else(|| out_of_range(&n.to_string()))?;
            let address = u16::try_from(n).map_err(|_| out_of_range(&n.to_string()))?;
            return Ok(ParsedAddress {
                address,
                table: None,
            });
        }
        Value::String(s) => s.trim(),
        other => {
            return Err(ProtocolError::Config(format!(
                "startAddress must be a number or string, got {other}"
            )));
        }
    };

    if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        let address = u16::from_str_radix(hex, 16).map_err(|_| out_of_range(text))?;
        return Ok(ParsedAddress {
            address,
            table: None,
        });
    }
    if let Some(dec) = text.strip_suffix('d').or_else(|| text.strip_suffix('D')) {
        let address = dec.parse::<u16>().map_err(|_| out_of_range(text))?;
        return Ok(ParsedAddress {
            address,
            table: None,
        });
    }

    if text.len() == 5 && text.bytes().all(|b| b.is_ascii_digit()) {
        let n: u32 = text.parse().map_err(|_| out_of_range(text))?;
        let table = legacy_table(n).ok_or_else(|| out_of_range(text))?;
        return Ok(ParsedAddress {
            address: (n - table.legacy_base()) as u16,
            table: Some(table),
        });
    }

    let address = text.parse::<u16>().map_err(|_| out_of_range(text))?;
    Ok(ParsedAddress {
        address,
        table: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: Value) -> ParsedAddress {
        parse_address(&v).expect("parse address")
    }

    #[test]
    fn test_legacy_boundaries() {
        assert_eq!(
            parse(json!("00001")),
            ParsedAddress {
                address: 0,
                table: Some(PrimaryTable::Coil)
            }
        );
        assert_eq!(
            parse(json!("10001")),
            ParsedAddress {
                address: 0,
                table: Some(PrimaryTable::DiscreteInput)
            }
        );
        assert_eq!(
            parse(json!("40001")),
            ParsedAddress {
                address: 0,
                table: Some(PrimaryTable::HoldingRegister)
            }
        );
        assert_eq!(
            parse(json!("49999")),
            ParsedAddress {
                address: 9998,
                table: Some(PrimaryTable::HoldingRegister)
            }
        );
        assert_eq!(
            parse(json!("30005")),
            ParsedAddress {
                address: 4,
                table: Some(PrimaryTable::InputRegister)
            }
        );
    }

    #[test]
    fn test_plain_forms() {
        assert_eq!(parse(json!(100)).address, 100);
        assert_eq!(parse(json!("0x10")).address, 16);
        assert_eq!(parse(json!("40001d")).address, 40001);
        assert_eq!(parse(json!("12")).address, 12);
        assert_eq!(parse(json!("12")).table, None);
    }

    #[test]
    fn test_invalid() {
        assert!(parse_address(&json!("20001")).is_err());
        assert!(parse_address(&json!(70000)).is_err());
        assert!(parse_address(&json!(true)).is_err());
    }

    #[test]
    fn test_table_names() {
        assert_eq!(
            PrimaryTable::parse("holding_register").expect("table"),
            PrimaryTable::HoldingRegister
        );
        assert!(PrimaryTable::Coil.is_bit());
        assert!(!PrimaryTable::InputRegister.is_writable());
    }
}
