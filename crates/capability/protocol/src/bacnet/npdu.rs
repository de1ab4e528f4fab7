//! BACnet/IP 虚拟链路层（BVLC）与网络层（NPDU）。

use crate::bacnet::encoding::Reader;
use crate::error::ProtocolError;

pub const BVLC_TYPE: u8 = 0x81;
pub const BVLC_FORWARDED_NPDU: u8 = 0x04;
pub const BVLC_ORIGINAL_UNICAST: u8 = 0x0A;
pub const BVLC_ORIGINAL_BROADCAST: u8 = 0x0B;

const NPDU_VERSION: u8 = 0x01;
const CONTROL_NETWORK_MESSAGE: u8 = 0x80;
const CONTROL_DNET: u8 = 0x20;
const CONTROL_SNET: u8 = 0x08;
const CONTROL_EXPECTING_REPLY: u8 = 0x04;

/// 远端网络地址（经路由器访问 MS/TP 设备时使用）。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkAddress {
    pub network: u16,
    pub mac: Vec<u8>,
}

impl NetworkAddress {
    pub fn is_local(&self) -> bool {
        self.network == 0
    }
}

/// 封装 BVLC + NPDU。
pub fn encode_frame(
    broadcast: bool,
    destination: Option<&NetworkAddress>,
    expecting_reply: bool,
    apdu: &[u8],
) -> Vec<u8> {
    let mut npdu = vec![NPDU_VERSION, 0];
    if expecting_reply {
        npdu[1] |= CONTROL_EXPECTING_REPLY;
    }
    if let Some(dest) = destination.filter(|d| !d.is_local()) {
        npdu[1] |= CONTROL_DNET;
        npdu.extend_from_slice(&dest.network.to_be_bytes());
        npdu.push(dest.mac.len() as u8);
        npdu.extend_from_slice(&dest.mac);
        npdu.push(0xFF);
    }
    npdu.extend_from_slice(apdu);

    let function = if broadcast {
        BVLC_ORIGINAL_BROADCAST
    } else {
        BVLC_ORIGINAL_UNICAST
    };
    let len = (npdu.len() + 4) as u16;
    let mut frame = Vec::with_capacity(usize::from(len));
    frame.push(BVLC_TYPE);
    frame.push(function);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&npdu);
    frame
}

/// 解封装后的帧。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded<'a> {
    /// 经路由器转发时的源网络地址
    pub source: Option<NetworkAddress>,
    pub apdu: &'a [u8],
}

/// 剥离 BVLC 与 NPDU；网络层消息返回 `None`。
pub fn decode_frame(buf: &[u8]) -> Result<Option<Decoded<'_>>, ProtocolError> {
    let mut reader = Reader::new(buf);
    if reader.u8()? != BVLC_TYPE {
        return Err(ProtocolError::Decode("not a bacnet/ip frame".to_string()));
    }
    let function = reader.u8()?;
    let len = usize::from(reader.u16()?);
    if len != buf.len() {
        return Err(ProtocolError::LengthMismatch {
            expected: len,
            actual: buf.len(),
        });
    }
    match function {
        BVLC_ORIGINAL_UNICAST | BVLC_ORIGINAL_BROADCAST => {}
        BVLC_FORWARDED_NPDU => {
            reader.take(6)?;
        }
        _ => return Ok(None),
    }

    if reader.u8()? != NPDU_VERSION {
        return Err(ProtocolError::Decode("unsupported npdu version".to_string()));
    }
    let control = reader.u8()?;
    if control & CONTROL_DNET != 0 {
        reader.take(2)?;
        let dlen = usize::from(reader.u8()?);
        reader.take(dlen)?;
    }
    let source = if control & CONTROL_SNET != 0 {
        let network = reader.u16()?;
        let slen = usize::from(reader.u8()?);
        Some(NetworkAddress {
            network,
            mac: reader.take(slen)?.to_vec(),
        })
    } else {
        None
    };
    if control & CONTROL_DNET != 0 {
        reader.u8()?;
    }
    if control & CONTROL_NETWORK_MESSAGE != 0 {
        return Ok(None);
    }
    Ok(Some(Decoded {
        source,
        apdu: reader.remaining(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_unicast_frame() {
        let frame = encode_frame(false, None, true, &[0xAA, 0xBB]);
        assert_eq!(frame, vec![0x81, 0x0A, 0x00, 0x08, 0x01, 0x04, 0xAA, 0xBB]);
        let decoded = decode_frame(&frame).expect("decode").expect("apdu");
        assert_eq!(decoded.apdu, &[0xAA, 0xBB]);
        assert_eq!(decoded.source, None);
    }

    #[test]
    fn test_routed_frame() {
        let dest = NetworkAddress {
            network: 5,
            mac: vec![0x07],
        };
        let frame = encode_frame(false, Some(&dest), true, &[0x10]);
        assert_eq!(
            frame,
            vec![0x81, 0x0A, 0x00, 0x0C, 0x01, 0x24, 0x00, 0x05, 0x01, 0x07, 0xFF, 0x10]
        );
    }

    #[test]
    fn test_decode_source_network() {
        let frame = vec![0x81, 0x0A, 0x00, 0x0A, 0x01, 0x08, 0x00, 0x05, 0x01, 0x07, 0x30];
        let mut fixed = frame.clone();
        fixed[3] = fixed.len() as u8;
        let decoded = decode_frame(&fixed).expect("decode").expect("apdu");
        assert_eq!(
            decoded.source,
            Some(NetworkAddress {
                network: 5,
                mac: vec![0x07]
            })
        );
        assert_eq!(decoded.apdu, &[0x30]);
    }

    #[test]
    fn test_length_mismatch() {
        let frame = vec![0x81, 0x0A, 0x00, 0x09, 0x01, 0x00, 0x10];
        assert!(decode_frame(&frame).is_err());
    }
}
