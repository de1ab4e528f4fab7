//! 应用层 PDU：ReadProperty / ReadPropertyMultiple / WriteProperty / Who-Is / I-Am。

use crate::bacnet::encoding::{
    BacnetValue, ObjectId, Reader, encode_application, encode_closing, encode_context_enumerated,
    encode_context_object_id, encode_context_unsigned, encode_opening,
};
use crate::error::ProtocolError;

const PDU_CONFIRMED_REQUEST: u8 = 0x00;
const PDU_UNCONFIRMED_REQUEST: u8 = 0x10;
const PDU_SIMPLE_ACK: u8 = 0x20;
const PDU_COMPLEX_ACK: u8 = 0x30;
const PDU_ERROR: u8 = 0x50;
const PDU_REJECT: u8 = 0x60;
const PDU_ABORT: u8 = 0x70;

const SEGMENTED_MESSAGE: u8 = 0x08;
/// 不分段，最大 APDU 1476
const MAX_APDU_1476: u8 = 0x05;

const UNCONFIRMED_I_AM: u8 = 0x00;
const UNCONFIRMED_WHO_IS: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    ReadProperty,
    ReadPropertyMultiple,
    WriteProperty,
}

impl Service {
    pub fn code(&self) -> u8 {
        match self {
            Self::ReadProperty => 12,
            Self::ReadPropertyMultiple => 14,
            Self::WriteProperty => 15,
        }
    }
}

/// 确认请求：头部 + 服务体。
pub fn confirmed_request(invoke_id: u8, service: Service, body: &[u8]) -> Vec<u8> {
    let mut apdu = Vec::with_capacity(body.len() + 4);
    apdu.push(PDU_CONFIRMED_REQUEST);
    apdu.push(MAX_APDU_1476);
    apdu.push(invoke_id);
    apdu.push(service.code());
    apdu.extend_from_slice(body);
    apdu
}

pub fn read_property(object: ObjectId, property: u32) -> Vec<u8> {
    let mut body = Vec::new();
    encode_context_object_id(&mut body, 0, object);
    encode_context_enumerated(&mut body, 1, property);
    body
}

/// 每个对象读取同一组属性。
pub fn read_property_multiple(objects: &[ObjectId], properties: &[u32]) -> Vec<u8> {
    let mut body = Vec::new();
    for object in objects {
        encode_context_object_id(&mut body, 0, *object);
        encode_opening(&mut body, 1);
        for property in properties {
            encode_context_enumerated(&mut body, 0, *property);
        }
        encode_closing(&mut body, 1);
    }
    body
}

pub fn write_property(
    object: ObjectId,
    property: u32,
    value: &BacnetValue,
    priority: Option<u8>,
) -> Vec<u8> {
    let mut body = Vec::new();
    encode_context_object_id(&mut body, 0, object);
    encode_context_enumerated(&mut body, 1, property);
    encode_opening(&mut body, 3);
    encode_application(&mut body, value);
    encode_closing(&mut body, 3);
    if let Some(priority) = priority.filter(|p| (1..=16).contains(p)) {
        encode_context_unsigned(&mut body, 4, u32::from(priority));
    }
    body
}

/// Who-Is；给出范围时只询问该实例区间。
pub fn who_is(range: Option<(u32, u32)>) -> Vec<u8> {
    let mut apdu = vec![PDU_UNCONFIRMED_REQUEST, UNCONFIRMED_WHO_IS];
    if let Some((low, high)) = range {
        encode_context_unsigned(&mut apdu, 0, low);
        encode_context_unsigned(&mut apdu, 1, high);
    }
    apdu
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IAm {
    pub device: ObjectId,
    pub max_apdu: u32,
    pub segmentation: u32,
    pub vendor_id: u32,
}

/// 解析后的应用层 PDU。
#[derive(Debug, Clone, PartialEq)]
pub enum Apdu {
    SimpleAck { invoke_id: u8 },
    ComplexAck { invoke_id: u8, service: u8, payload: Vec<u8> },
    Error { invoke_id: u8, class: u32, code: u32 },
    Reject { invoke_id: u8, reason: u8 },
    Abort { invoke_id: u8, reason: u8 },
    IAm(IAm),
    /// 本网关不处理的报文
    Ignored,
}

impl Apdu {
    pub fn invoke_id(&self) -> Option<u8> {
        match self {
            Self::SimpleAck { invoke_id }
            | Self::ComplexAck { invoke_id, .. }
            | Self::Error { invoke_id, .. }
            | Self::Reject { invoke_id, .. }
            | Self::Abort { invoke_id, .. } => Some(*invoke_id),
            Self::IAm(_) | Self::Ignored => None,
        }
    }
}

fn enumerated(reader: &mut Reader<'_>) -> Result<u32, ProtocolError> {
    match reader.application()? {
        BacnetValue::Enumerated(v) | BacnetValue::Unsigned(v) => Ok(v),
        other => Err(ProtocolError::Decode(format!("expected enumerated, got {other:?}"))),
    }
}

pub fn parse(buf: &[u8]) -> Result<Apdu, ProtocolError> {
    let mut reader = Reader::new(buf);
    let first = reader.u8()?;
    Ok(match first & 0xF0 {
        PDU_SIMPLE_ACK => {
            let invoke_id = reader.u8()?;
            Apdu::SimpleAck { invoke_id }
        }
        PDU_COMPLEX_ACK => {
            let invoke_id = reader.u8()?;
            if first & SEGMENTED_MESSAGE != 0 {
                return Err(ProtocolError::Bacnet(format!(
                    "segmented response for invoke {invoke_id} is not supported"
                )));
            }
            let service = reader.u8()?;
            Apdu::ComplexAck {
                invoke_id,
                service,
                payload: reader.remaining().to_vec(),
            }
        }
        PDU_ERROR => {
            let invoke_id = reader.u8()?;
            let _service = reader.u8()?;
            let class = enumerated(&mut reader)?;
            let code = enumerated(&mut reader)?;
            Apdu::Error {
                invoke_id,
                class,
                code,
            }
        }
        PDU_REJECT => Apdu::Reject {
            invoke_id: reader.u8()?,
            reason: reader.u8()?,
        },
        PDU_ABORT => Apdu::Abort {
            invoke_id: reader.u8()?,
            reason: reader.u8()?,
        },
        PDU_UNCONFIRMED_REQUEST => {
            if reader.u8()? != UNCONFIRMED_I_AM {
                return Ok(Apdu::Ignored);
            }
            let device = match reader.application()? {
                BacnetValue::ObjectId(id) => id,
                other => {
                    return Err(ProtocolError::Decode(format!("i-am without object id: {other:?}")));
                }
            };
            let max_apdu = enumerated(&mut reader)?;
            let segmentation = enumerated(&mut reader)?;
            let vendor_id = enumerated(&mut reader)?;
            Apdu::IAm(IAm {
                device,
                max_apdu,
                segmentation,
                vendor_id,
            })
        }
        _ => Apdu::Ignored,
    })
}

/// ReadPropertyMultiple 应答中的一条属性结果。
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyResult {
    pub object: ObjectId,
    pub property: u32,
    pub index: Option<u32>,
    /// 失败时为 `(error class, error code)`
    pub value: Result<Vec<BacnetValue>, (u32, u32)>,
}

/// ReadProperty 应答：返回属性值序列。
pub fn parse_read_property_ack(payload: &[u8]) -> Result<Vec<BacnetValue>, ProtocolError> {
    let mut reader = Reader::new(payload);
    reader.context_object_id(0)?;
    reader.context_unsigned(1)?;
    if reader.peek_tag()?.is_context(2) {
        reader.context_unsigned(2)?;
    }
    reader.expect_opening(3)?;
    let values = reader.application_values_until(3)?;
    reader.expect_closing(3)?;
    Ok(values)
}

pub fn parse_read_property_multiple_ack(
    payload: &[u8],
) -> Result<Vec<PropertyResult>, ProtocolError> {
    let mut reader = Reader::new(payload);
    let mut results = Vec::new();
    while !reader.is_empty() {
        let object = reader.context_object_id(0)?;
        reader.expect_opening(1)?;
        loop {
            if reader.peek_tag()?.is_closing(1) {
                reader.expect_closing(1)?;
                break;
            }
            let property = reader.context_unsigned(2)?;
            let index = if reader.peek_tag()?.is_context(3) {
                Some(reader.context_unsigned(3)?)
            } else {
                None
            };
            let next = reader.peek_tag()?;
            let value = if next.is_opening(4) {
                reader.expect_opening(4)?;
                let values = reader.application_values_until(4)?;
                reader.expect_closing(4)?;
                Ok(values)
            } else if next.is_opening(5) {
                reader.expect_opening(5)?;
                let class = enumerated(&mut reader)?;
                let code = enumerated(&mut reader)?;
                reader.expect_closing(5)?;
                Err((class, code))
            } else {
                return Err(ProtocolError::Decode(format!(
                    "unexpected tag {next:?} in read-property-multiple ack"
                )));
            };
            results.push(PropertyResult {
                object,
                property,
                index,
                value,
            });
        }
    }
    Ok(results)
}
