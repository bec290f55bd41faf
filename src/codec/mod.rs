//! MQTT 3.1.1 frame codec
//!
//! Pure transformation between [`ControlPacket`] values and bytes. The
//! decoder works over a streaming buffer: [`decode`] returns `Ok(None)` when
//! fewer bytes than a full frame are available and consumes nothing, so the
//! caller can keep appending reads from the transport. A remaining-length
//! field inconsistent with the decoded content fails with
//! [`MqttError::MalformedFrame`].

mod packet;

pub use packet::{
    Connect, ConnectReturnCode, ControlPacket, LastWill, Publish, QoS, SubAckCode,
};

use crate::error::{MqttError, MqttResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Largest remaining-length value encodable in the 4-byte varint
const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Encode a control packet onto the end of `dst`.
pub fn encode(packet: &ControlPacket, dst: &mut BytesMut) -> MqttResult<()> {
    let mut body = BytesMut::with_capacity(64);
    let first_byte = encode_body(packet, &mut body)?;

    if body.len() > MAX_REMAINING_LENGTH {
        return Err(MqttError::malformed(format!(
            "packet body of {} bytes exceeds the protocol maximum",
            body.len()
        )));
    }

    dst.reserve(1 + 4 + body.len());
    dst.put_u8(first_byte);
    encode_remaining_length(body.len(), dst);
    dst.extend_from_slice(&body);
    Ok(())
}

/// Decode one control packet from the front of `src`.
///
/// Returns `Ok(None)` without consuming anything when the buffer does not
/// yet hold a complete frame.
pub fn decode(src: &mut BytesMut) -> MqttResult<Option<ControlPacket>> {
    if src.len() < 2 {
        return Ok(None);
    }

    let (remaining, header_len) = match decode_remaining_length(&src[1..])? {
        Some(parsed) => parsed,
        None => return Ok(None),
    };

    let total = 1 + header_len + remaining;
    if src.len() < total {
        return Ok(None);
    }

    let first_byte = src[0];
    let mut frame = src.split_to(total).freeze();
    frame.advance(1 + header_len);

    let packet = decode_body(first_byte, frame)?;
    Ok(Some(packet))
}

/// Variable-length remaining-length encoding: 7 bits per byte, continuation
/// bit 0x80, at most 4 bytes.
fn encode_remaining_length(mut len: usize, dst: &mut BytesMut) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

/// Returns `(remaining_length, bytes_consumed)`, or `None` when the varint
/// itself is still incomplete.
fn decode_remaining_length(buf: &[u8]) -> MqttResult<Option<(usize, usize)>> {
    let mut value: usize = 0;
    let mut multiplier: usize = 1;
    for (index, &byte) in buf.iter().enumerate() {
        if index >= 4 {
            return Err(MqttError::malformed(
                "remaining length exceeds 4 bytes",
            ));
        }
        value += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
        multiplier *= 128;
    }
    if buf.len() >= 4 {
        return Err(MqttError::malformed("remaining length exceeds 4 bytes"));
    }
    Ok(None)
}

fn encode_body(packet: &ControlPacket, body: &mut BytesMut) -> MqttResult<u8> {
    let first_byte = match packet {
        ControlPacket::Connect(connect) => {
            body.put_slice(b"\x00\x04MQTT");
            body.put_u8(0x04); // protocol level 3.1.1

            let mut flags = 0u8;
            if connect.clean_session {
                flags |= 0x02;
            }
            if let Some(will) = &connect.last_will {
                flags |= 0x04;
                flags |= will.qos.as_u8() << 3;
                if will.retain {
                    flags |= 0x20;
                }
            }
            if connect.password.is_some() {
                flags |= 0x40;
            }
            if connect.username.is_some() {
                flags |= 0x80;
            }
            body.put_u8(flags);
            body.put_u16(connect.keep_alive_secs);
            put_string(&connect.client_id, body);
            if let Some(will) = &connect.last_will {
                put_string(&will.topic, body);
                body.put_u16(will.payload.len() as u16);
                body.put_slice(&will.payload);
            }
            if let Some(username) = &connect.username {
                put_string(username, body);
            }
            if let Some(password) = &connect.password {
                put_string(password, body);
            }
            0x10
        }
        ControlPacket::ConnAck {
            session_present,
            code,
        } => {
            body.put_u8(u8::from(*session_present));
            body.put_u8(code.as_u8());
            0x20
        }
        ControlPacket::Publish(publish) => {
            put_string(&publish.topic, body);
            match (publish.qos, publish.packet_id) {
                (QoS::AtMostOnce, None) => {}
                (QoS::AtMostOnce, Some(_)) => {
                    return Err(MqttError::malformed(
                        "QoS 0 publish must not carry a packet identifier",
                    ));
                }
                (_, Some(packet_id)) => body.put_u16(packet_id),
                (_, None) => {
                    return Err(MqttError::malformed(
                        "QoS>0 publish requires a packet identifier",
                    ));
                }
            }
            body.put_slice(&publish.payload);

            let mut first = 0x30 | (publish.qos.as_u8() << 1);
            if publish.dup {
                first |= 0x08;
            }
            if publish.retain {
                first |= 0x01;
            }
            first
        }
        ControlPacket::PubAck { packet_id } => {
            body.put_u16(*packet_id);
            0x40
        }
        ControlPacket::PubRec { packet_id } => {
            body.put_u16(*packet_id);
            0x50
        }
        ControlPacket::PubRel { packet_id } => {
            body.put_u16(*packet_id);
            0x62
        }
        ControlPacket::PubComp { packet_id } => {
            body.put_u16(*packet_id);
            0x70
        }
        ControlPacket::Subscribe { packet_id, filters } => {
            body.put_u16(*packet_id);
            for (filter, qos) in filters {
                put_string(filter, body);
                body.put_u8(qos.as_u8());
            }
            0x82
        }
        ControlPacket::SubAck { packet_id, codes } => {
            body.put_u16(*packet_id);
            for code in codes {
                body.put_u8(code.as_u8());
            }
            0x90
        }
        ControlPacket::Unsubscribe { packet_id, filters } => {
            body.put_u16(*packet_id);
            for filter in filters {
                put_string(filter, body);
            }
            0xA2
        }
        ControlPacket::UnsubAck { packet_id } => {
            body.put_u16(*packet_id);
            0xB0
        }
        ControlPacket::PingReq => 0xC0,
        ControlPacket::PingResp => 0xD0,
        ControlPacket::Disconnect => 0xE0,
    };
    Ok(first_byte)
}

fn decode_body(first_byte: u8, mut frame: Bytes) -> MqttResult<ControlPacket> {
    let packet_type = first_byte >> 4;
    let flags = first_byte & 0x0F;

    let packet = match packet_type {
        1 => {
            let protocol = take_string(&mut frame)?;
            if protocol != "MQTT" {
                return Err(MqttError::malformed(format!(
                    "unknown protocol name {protocol:?}"
                )));
            }
            let level = take_u8(&mut frame)?;
            if level != 0x04 {
                return Err(MqttError::malformed(format!(
                    "unsupported protocol level {level}"
                )));
            }
            let connect_flags = take_u8(&mut frame)?;
            let keep_alive_secs = take_u16(&mut frame)?;
            let client_id = take_string(&mut frame)?;

            let last_will = if connect_flags & 0x04 != 0 {
                let qos = QoS::from_u8((connect_flags >> 3) & 0x03).ok_or_else(|| {
                    MqttError::malformed("invalid will QoS in connect flags")
                })?;
                let topic = take_string(&mut frame)?;
                let len = take_u16(&mut frame)? as usize;
                let payload = take_bytes(&mut frame, len)?;
                Some(LastWill {
                    topic,
                    payload,
                    qos,
                    retain: connect_flags & 0x20 != 0,
                })
            } else {
                None
            };
            let username = if connect_flags & 0x80 != 0 {
                Some(take_string(&mut frame)?)
            } else {
                None
            };
            let password = if connect_flags & 0x40 != 0 {
                Some(take_string(&mut frame)?)
            } else {
                None
            };

            ControlPacket::Connect(Connect {
                client_id,
                clean_session: connect_flags & 0x02 != 0,
                keep_alive_secs,
                last_will,
                username,
                password,
            })
        }
        2 => {
            let ack_flags = take_u8(&mut frame)?;
            let code_byte = take_u8(&mut frame)?;
            let code = ConnectReturnCode::from_u8(code_byte).ok_or_else(|| {
                MqttError::malformed(format!("unknown connect return code {code_byte}"))
            })?;
            ControlPacket::ConnAck {
                session_present: ack_flags & 0x01 != 0,
                code,
            }
        }
        3 => {
            let qos = QoS::from_u8((flags >> 1) & 0x03)
                .ok_or_else(|| MqttError::malformed("publish with invalid QoS bits"))?;
            let topic = take_string(&mut frame)?;
            let packet_id = if qos == QoS::AtMostOnce {
                None
            } else {
                Some(take_u16(&mut frame)?)
            };
            ControlPacket::Publish(Publish {
                dup: flags & 0x08 != 0,
                qos,
                retain: flags & 0x01 != 0,
                topic,
                packet_id,
                payload: frame.split_to(frame.len()),
            })
        }
        4 => ControlPacket::PubAck {
            packet_id: take_u16(&mut frame)?,
        },
        5 => ControlPacket::PubRec {
            packet_id: take_u16(&mut frame)?,
        },
        6 => {
            if flags != 0x02 {
                return Err(MqttError::malformed("PUBREL with invalid flags"));
            }
            ControlPacket::PubRel {
                packet_id: take_u16(&mut frame)?,
            }
        }
        7 => ControlPacket::PubComp {
            packet_id: take_u16(&mut frame)?,
        },
        8 => {
            if flags != 0x02 {
                return Err(MqttError::malformed("SUBSCRIBE with invalid flags"));
            }
            let packet_id = take_u16(&mut frame)?;
            let mut filters = Vec::new();
            while !frame.is_empty() {
                let filter = take_string(&mut frame)?;
                let qos_byte = take_u8(&mut frame)?;
                let qos = QoS::from_u8(qos_byte).ok_or_else(|| {
                    MqttError::malformed(format!("subscribe with invalid QoS {qos_byte}"))
                })?;
                filters.push((filter, qos));
            }
            if filters.is_empty() {
                return Err(MqttError::malformed("SUBSCRIBE with no topic filters"));
            }
            ControlPacket::Subscribe { packet_id, filters }
        }
        9 => {
            let packet_id = take_u16(&mut frame)?;
            let mut codes = Vec::new();
            while !frame.is_empty() {
                let code_byte = take_u8(&mut frame)?;
                let code = SubAckCode::from_u8(code_byte).ok_or_else(|| {
                    MqttError::malformed(format!("unknown SUBACK return code {code_byte:#x}"))
                })?;
                codes.push(code);
            }
            if codes.is_empty() {
                return Err(MqttError::malformed("SUBACK with no return codes"));
            }
            ControlPacket::SubAck { packet_id, codes }
        }
        10 => {
            if flags != 0x02 {
                return Err(MqttError::malformed("UNSUBSCRIBE with invalid flags"));
            }
            let packet_id = take_u16(&mut frame)?;
            let mut filters = Vec::new();
            while !frame.is_empty() {
                filters.push(take_string(&mut frame)?);
            }
            if filters.is_empty() {
                return Err(MqttError::malformed("UNSUBSCRIBE with no topic filters"));
            }
            ControlPacket::Unsubscribe { packet_id, filters }
        }
        11 => ControlPacket::UnsubAck {
            packet_id: take_u16(&mut frame)?,
        },
        12 => ControlPacket::PingReq,
        13 => ControlPacket::PingResp,
        14 => ControlPacket::Disconnect,
        other => {
            return Err(MqttError::malformed(format!(
                "unknown packet type {other}"
            )));
        }
    };

    // Anything left over means the declared remaining length disagrees
    // with the decoded content.
    if !frame.is_empty() {
        return Err(MqttError::malformed(format!(
            "{} bytes of trailing garbage after {}",
            frame.len(),
            packet.kind()
        )));
    }

    Ok(packet)
}

fn put_string(value: &str, dst: &mut BytesMut) {
    dst.put_u16(value.len() as u16);
    dst.put_slice(value.as_bytes());
}

fn take_u8(frame: &mut Bytes) -> MqttResult<u8> {
    if frame.is_empty() {
        return Err(MqttError::malformed("frame truncated reading u8"));
    }
    Ok(frame.get_u8())
}

fn take_u16(frame: &mut Bytes) -> MqttResult<u16> {
    if frame.len() < 2 {
        return Err(MqttError::malformed("frame truncated reading u16"));
    }
    Ok(frame.get_u16())
}

fn take_bytes(frame: &mut Bytes, len: usize) -> MqttResult<Bytes> {
    if frame.len() < len {
        return Err(MqttError::malformed(format!(
            "frame truncated reading {len} bytes"
        )));
    }
    Ok(frame.split_to(len))
}

fn take_string(frame: &mut Bytes) -> MqttResult<String> {
    let len = take_u16(frame)? as usize;
    let raw = take_bytes(frame, len)?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| MqttError::malformed("string field is not valid UTF-8"))
}
