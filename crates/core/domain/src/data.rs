use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ValueType;

/// 编码模式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodeMode {
    Read,
    Write,
}

/// 单个点位的原始值（解码结果或下发参数）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointData {
    pub point_name: String,
    #[serde(default)]
    pub value: Value,
}

impl PointData {
    pub fn new(point_name: impl Into<String>, value: Value) -> Self {
        Self {
            point_name: point_name.into(),
            value,
        }
    }
}

/// 一台设备的一帧数据。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceData {
    #[serde(alias = "id")]
    pub device_sn: String,
    #[serde(default)]
    pub values: Vec<PointData>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ValueError {
    #[error("cannot convert {value} to {target}")]
    Conversion { value: String, target: &'static str },
}

/// 截断小数部分；超出 i64 范围（含 NaN/无穷）返回 None，`as` 转换会静默饱和。
fn truncate_i64(f: f64) -> Option<i64> {
    let t = f.trunc();
    // i64::MAX as f64 == 2^63，不在范围内
    (t >= i64::MIN as f64 && t < i64::MAX as f64).then_some(t as i64)
}

/// 按点位类型转换后的值。
///
/// 相等比较基于类型化的值：`I64(1)` 与 `F64(1.0)` 相等，
/// 因此 `"1"` 与 `"1.0"` 不会被判定为变化。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointValueData {
    I64(i64),
    F64(f64),
    Bool(bool),
    String(String),
}

impl PointValueData {
    /// 将原始 JSON 值转换为点位声明的类型。
    pub fn coerce(value: &Value, value_type: ValueType) -> Result<Self, ValueError> {
        let fail = || ValueError::Conversion {
            value: value.to_string(),
            target: value_type.as_str(),
        };
        match value_type {
            ValueType::Int => match value {
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Ok(Self::I64(i))
                    } else {
                        n.as_f64().and_then(truncate_i64).map(Self::I64).ok_or_else(fail)
                    }
                }
                Value::Bool(b) => Ok(Self::I64(i64::from(*b))),
                Value::String(s) => {
                    let s = s.trim();
                    if let Ok(i) = s.parse::<i64>() {
                        return Ok(Self::I64(i));
                    }
                    s.parse::<f64>()
                        .ok()
                        .and_then(truncate_i64)
                        .map(Self::I64)
                        .ok_or_else(fail)
                }
                _ => Err(fail()),
            },
            ValueType::Float => match value {
                Value::Number(n) => n.as_f64().map(Self::F64).ok_or_else(fail),
                Value::Bool(b) => Ok(Self::F64(if *b { 1.0 } else { 0.0 })),
                Value::String(s) => s.trim().parse::<f64>().map(Self::F64).map_err(|_| fail()),
                _ => Err(fail()),
            },
            ValueType::Bool => match value {
                Value::Bool(b) => Ok(Self::Bool(*b)),
                Value::Number(n) => n.as_f64().map(|f| Self::Bool(f != 0.0)).ok_or_else(fail),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "on" => Ok(Self::Bool(true)),
                    "false" | "0" | "off" => Ok(Self::Bool(false)),
                    _ => Err(fail()),
                },
                _ => Err(fail()),
            },
            ValueType::String => match value {
                Value::String(s) => Ok(Self::String(s.clone())),
                Value::Null => Err(fail()),
                other => Ok(Self::String(other.to_string())),
            },
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::I64(v) => Value::from(*v),
            Self::F64(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Bool(v) => Value::Bool(*v),
            Self::String(v) => Value::String(v.clone()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::I64(v) => Some(*v as f64),
            Self::F64(v) => Some(*v),
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Self::String(_) => None,
        }
    }
}

impl PartialEq for PointValueData {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::I64(a), Self::I64(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::I64(_) | Self::F64(_), Self::I64(_) | Self::F64(_)) => {
                self.as_f64() == other.as_f64()
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for PointValueData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::I64(v) => write!(f, "{v}"),
            Self::F64(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::String(v) => f.write_str(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coerce_int_from_string_and_float() {
        assert_eq!(
            PointValueData::coerce(&json!("1"), ValueType::Int).expect("int"),
            PointValueData::I64(1)
        );
        assert_eq!(
            PointValueData::coerce(&json!("1.0"), ValueType::Int).expect("int"),
            PointValueData::I64(1)
        );
        assert_eq!(
            PointValueData::coerce(&json!(2.9), ValueType::Int).expect("int"),
            PointValueData::I64(2)
        );
    }

    #[test]
    fn coerce_rejects_garbage() {
        assert!(PointValueData::coerce(&json!("abc"), ValueType::Int).is_err());
        assert!(PointValueData::coerce(&json!("maybe"), ValueType::Bool).is_err());
        assert!(PointValueData::coerce(&Value::Null, ValueType::String).is_err());
    }

    #[test]
    fn numeric_equality_is_typed() {
        assert_eq!(PointValueData::I64(1), PointValueData::F64(1.0));
        assert_ne!(PointValueData::I64(1), PointValueData::String("1".to_string()));
        assert_ne!(PointValueData::Bool(true), PointValueData::I64(1));
    }

    #[test]
    fn test_int_out_of_range_rejected() {
        let too_big = json!(9_223_372_036_854_775_808u64);
        assert!(PointValueData::coerce(&too_big, ValueType::Int).is_err());
        assert!(PointValueData::coerce(&json!(1e19), ValueType::Int).is_err());
        assert!(PointValueData::coerce(&json!(-1e19), ValueType::Int).is_err());
        assert!(PointValueData::coerce(&json!("9223372036854775808"), ValueType::Int).is_err());
        assert!(PointValueData::coerce(&json!("1e30"), ValueType::Int).is_err());
        assert!(PointValueData::coerce(&json!("NaN"), ValueType::Int).is_err());

        let max = PointValueData::coerce(&json!(i64::MAX), ValueType::Int).expect("max");
        assert!(matches!(max, PointValueData::I64(i64::MAX)));
        let min = PointValueData::coerce(&json!(i64::MIN.to_string()), ValueType::Int).expect("min");
        assert!(matches!(min, PointValueData::I64(i64::MIN)));
        let truncated = PointValueData::coerce(&json!(-2.9), ValueType::Int).expect("float");
        assert!(matches!(truncated, PointValueData::I64(-2)));
    }
}
