//! Framing and (de)serialization of control messages.
//!
//! Every frame is a 20-byte little-endian header (magic, total length,
//! control code, parameter count, message id) followed by the message
//! parameters. Each parameter is a typed value with an attached label.

use crate::error::{FaultKind, WireError, WireResult};
use crate::value::{DataType, Datum, Value};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::io::Cursor;

/// Magic carried in the first header word of every frame.
pub const BUXTON_CONTROL_CODE: u32 = 0x672;

/// Size of the fixed frame header.
pub const BUXTON_MESSAGE_HEADER_LENGTH: usize = 20;

/// Hard cap on the total frame length.
pub const BUXTON_MESSAGE_MAX_LENGTH: usize = 4096;

/// Hard cap on the parameter count of a single frame.
pub const BUXTON_MESSAGE_MAX_PARAMS: usize = 16;

/// The request/response taxonomy of the protocol.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum ControlCode {
    Set = 1,
    SetLabel = 2,
    CreateGroup = 3,
    RemoveGroup = 4,
    Get = 5,
    Unset = 6,
    List = 7,
    Notify = 8,
    Unnotify = 9,
    Status = 10,
    Changed = 11,
}

impl ControlCode {
    #[inline]
    pub fn tag(self) -> u16 {
        self as u16
    }

    pub fn from_tag(tag: u16) -> WireResult<ControlCode> {
        Ok(match tag {
            1 => ControlCode::Set,
            2 => ControlCode::SetLabel,
            3 => ControlCode::CreateGroup,
            4 => ControlCode::RemoveGroup,
            5 => ControlCode::Get,
            6 => ControlCode::Unset,
            7 => ControlCode::List,
            8 => ControlCode::Notify,
            9 => ControlCode::Unnotify,
            10 => ControlCode::Status,
            11 => ControlCode::Changed,
            _ => return Err(WireError::Fatal(FaultKind::InvalidControl)),
        })
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub control: ControlCode,
    pub msgid: u64,
    pub params: Vec<Datum>,
}

impl Message {
    pub fn new(control: ControlCode, msgid: u64, params: Vec<Datum>) -> Message {
        Message {
            control,
            msgid,
            params,
        }
    }
}

/// Inspect a header prefix and return the declared total frame length.
/// Needs the first eight bytes; anything shorter is a `Wait`.
pub fn get_message_size(prefix: &[u8]) -> WireResult<usize> {
    if prefix.len() < 8 {
        return Err(WireError::Wait);
    }

    if LittleEndian::read_u32(&prefix[0..4]) != BUXTON_CONTROL_CODE {
        return Err(WireError::Fatal(FaultKind::Corrupt));
    }

    let size = LittleEndian::read_u32(&prefix[4..8]) as usize;
    if size < BUXTON_MESSAGE_HEADER_LENGTH {
        return Err(WireError::Fatal(FaultKind::Corrupt));
    }
    if size > BUXTON_MESSAGE_MAX_LENGTH {
        return Err(WireError::Fatal(FaultKind::OversizeFrame));
    }

    Ok(size)
}

/// Serialize a message into a complete frame.
pub fn serialize_message(message: &Message) -> WireResult<Vec<u8>> {
    if message.params.len() > BUXTON_MESSAGE_MAX_PARAMS {
        return Err(WireError::Fatal(FaultKind::MaxParamsExceeded));
    }

    let mut body = Vec::new();
    for datum in &message.params {
        write_datum(&mut body, datum)?;
    }

    let total = BUXTON_MESSAGE_HEADER_LENGTH + body.len();
    if total > BUXTON_MESSAGE_MAX_LENGTH {
        return Err(WireError::Fatal(FaultKind::OversizeFrame));
    }

    let mut frame = Vec::with_capacity(total);
    frame.write_u32::<LittleEndian>(BUXTON_CONTROL_CODE)?;
    frame.write_u32::<LittleEndian>(total as u32)?;
    frame.write_u16::<LittleEndian>(message.control.tag())?;
    frame.write_u16::<LittleEndian>(message.params.len() as u16)?;
    frame.write_u64::<LittleEndian>(message.msgid)?;
    frame.extend_from_slice(&body);

    Ok(frame)
}

/// Deserialize a complete frame. Any length field overrunning the frame,
/// an unknown type tag or control code, or an excessive parameter count
/// fails the whole message.
pub fn deserialize_message(data: &[u8]) -> WireResult<Message> {
    if data.len() < BUXTON_MESSAGE_HEADER_LENGTH {
        return Err(WireError::Fatal(FaultKind::Corrupt));
    }

    let declared = get_message_size(data)?;
    if declared != data.len() {
        return Err(WireError::Fatal(FaultKind::Corrupt));
    }

    let control = ControlCode::from_tag(LittleEndian::read_u16(&data[8..10]))?;
    let count = LittleEndian::read_u16(&data[10..12]) as usize;
    if count > BUXTON_MESSAGE_MAX_PARAMS {
        return Err(WireError::Fatal(FaultKind::MaxParamsExceeded));
    }
    let msgid = LittleEndian::read_u64(&data[12..20]);

    let mut cursor = Cursor::new(&data[BUXTON_MESSAGE_HEADER_LENGTH..]);
    let mut params = Vec::with_capacity(count);
    for _ in 0..count {
        params.push(read_datum(&mut cursor)?);
    }

    // Trailing bytes mean the declared count lied about the body.
    if (cursor.position() as usize) != data.len() - BUXTON_MESSAGE_HEADER_LENGTH {
        return Err(WireError::Fatal(FaultKind::Corrupt));
    }

    Ok(Message {
        control,
        msgid,
        params,
    })
}

/// Append the encoding of one datum: type tag, value length, label
/// length, value bytes, label bytes.
pub fn write_datum(out: &mut Vec<u8>, datum: &Datum) -> WireResult<()> {
    let value_bytes = encode_value(&datum.value);

    out.write_u32::<LittleEndian>(datum.value.data_type().tag())?;
    out.write_u32::<LittleEndian>(value_bytes.len() as u32)?;
    out.write_u32::<LittleEndian>(datum.label.len() as u32)?;
    out.extend_from_slice(&value_bytes);
    out.extend_from_slice(datum.label.as_bytes());

    Ok(())
}

/// Decode one datum from the cursor, validating every length against the
/// remaining input.
pub fn read_datum(cursor: &mut Cursor<&[u8]>) -> WireResult<Datum> {
    let tag = LittleEndian::read_u32(take(cursor, 4)?);
    let value_len = LittleEndian::read_u32(take(cursor, 4)?) as usize;
    let label_len = LittleEndian::read_u32(take(cursor, 4)?) as usize;

    let vtype = DataType::from_tag(tag)?;
    let value_bytes = take(cursor, value_len)?;
    let value = decode_value(vtype, value_bytes)?;

    let label_bytes = take(cursor, label_len)?;
    let label = String::from_utf8(label_bytes.to_vec())
        .map_err(|_| WireError::Fatal(FaultKind::Corrupt))?;

    Ok(Datum { value, label })
}

/// Encode a single datum standalone; the record body format used by the
/// table backend.
pub fn encode_datum(datum: &Datum) -> WireResult<Vec<u8>> {
    let mut out = Vec::new();
    write_datum(&mut out, datum)?;
    Ok(out)
}

/// Inverse of `encode_datum`; rejects trailing garbage.
pub fn decode_datum(data: &[u8]) -> WireResult<Datum> {
    let mut cursor = Cursor::new(data);
    let datum = read_datum(&mut cursor)?;
    if (cursor.position() as usize) != data.len() {
        return Err(WireError::Fatal(FaultKind::Corrupt));
    }
    Ok(datum)
}

fn encode_value(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    match value {
        Value::String(v) => out.extend_from_slice(v.as_bytes()),
        Value::Int32(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::UInt32(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::Int64(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::UInt64(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::Boolean(v) => out.push(*v as u8),
    }
    out
}

fn decode_value(vtype: DataType, bytes: &[u8]) -> WireResult<Value> {
    let fixed = |expected: usize| -> WireResult<()> {
        if bytes.len() == expected {
            Ok(())
        } else {
            Err(WireError::Fatal(FaultKind::Corrupt))
        }
    };

    Ok(match vtype {
        DataType::String => Value::String(
            String::from_utf8(bytes.to_vec()).map_err(|_| WireError::Fatal(FaultKind::Corrupt))?,
        ),
        DataType::Int32 => {
            fixed(4)?;
            Value::Int32(LittleEndian::read_i32(bytes))
        }
        DataType::UInt32 => {
            fixed(4)?;
            Value::UInt32(LittleEndian::read_u32(bytes))
        }
        DataType::Int64 => {
            fixed(8)?;
            Value::Int64(LittleEndian::read_i64(bytes))
        }
        DataType::UInt64 => {
            fixed(8)?;
            Value::UInt64(LittleEndian::read_u64(bytes))
        }
        DataType::Float => {
            fixed(4)?;
            Value::Float(LittleEndian::read_f32(bytes))
        }
        DataType::Double => {
            fixed(8)?;
            Value::Double(LittleEndian::read_f64(bytes))
        }
        DataType::Boolean => {
            fixed(1)?;
            Value::Boolean(bytes[0] != 0)
        }
    })
}

fn take<'a>(cursor: &mut Cursor<&'a [u8]>, len: usize) -> WireResult<&'a [u8]> {
    let pos = cursor.position() as usize;
    let buf = *cursor.get_ref();

    if buf.len() < pos + len {
        return Err(WireError::Fatal(FaultKind::Corrupt));
    }

    cursor.set_position((pos + len) as u64);
    Ok(&buf[pos..pos + len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::LittleEndian;

    fn sample_params() -> Vec<Datum> {
        vec![
            Datum::new("base", "_"),
            Datum::new(10i32, "_"),
            Datum::new(42u32, ""),
            Datum::new(-9i64, "system"),
            Datum::new(9u64, "_"),
            Datum::new(1.5f32, "_"),
            Datum::new(2.25f64, "_"),
            Datum::new(true, "_"),
        ]
    }

    #[test]
    fn test_message_roundtrip() {
        let message = Message::new(ControlCode::Set, 77, sample_params());

        let frame = serialize_message(&message).unwrap();
        let back = deserialize_message(&frame).unwrap();

        assert_eq!(back, message);
    }

    #[test]
    fn test_empty_params_roundtrip() {
        let message = Message::new(ControlCode::CreateGroup, 1, Vec::new());
        let frame = serialize_message(&message).unwrap();

        assert_eq!(frame.len(), BUXTON_MESSAGE_HEADER_LENGTH);
        assert_eq!(deserialize_message(&frame).unwrap(), message);
    }

    #[test]
    fn test_get_message_size_wait_on_short_prefix() {
        let frame = serialize_message(&Message::new(ControlCode::Get, 3, Vec::new())).unwrap();

        assert_eq!(get_message_size(&frame[..7]).unwrap_err(), WireError::Wait);
        assert_eq!(get_message_size(&frame[..8]).unwrap(), frame.len());
    }

    #[test]
    fn test_get_message_size_rejects_bad_magic() {
        let mut frame =
            serialize_message(&Message::new(ControlCode::Get, 3, Vec::new())).unwrap();
        frame[0] ^= 0xff;

        assert_eq!(
            get_message_size(&frame).unwrap_err(),
            WireError::Fatal(FaultKind::Corrupt)
        );
    }

    #[test]
    fn test_get_message_size_rejects_oversize() {
        let mut frame =
            serialize_message(&Message::new(ControlCode::Get, 3, Vec::new())).unwrap();
        LittleEndian::write_u32(&mut frame[4..8], 100_000);

        assert_eq!(
            get_message_size(&frame).unwrap_err(),
            WireError::Fatal(FaultKind::OversizeFrame)
        );
    }

    #[test]
    fn test_deserialize_rejects_truncated_datum() {
        let message = Message::new(ControlCode::Set, 5, vec![Datum::new("payload", "_")]);
        let mut frame = serialize_message(&message).unwrap();

        // Claim a longer value than the body holds.
        let value_len_at = BUXTON_MESSAGE_HEADER_LENGTH + 4;
        LittleEndian::write_u32(&mut frame[value_len_at..value_len_at + 4], 4096);

        assert_eq!(
            deserialize_message(&frame).unwrap_err(),
            WireError::Fatal(FaultKind::Corrupt)
        );
    }

    #[test]
    fn test_deserialize_rejects_unknown_type() {
        let message = Message::new(ControlCode::Set, 5, vec![Datum::new(1i32, "_")]);
        let mut frame = serialize_message(&message).unwrap();
        LittleEndian::write_u32(
            &mut frame[BUXTON_MESSAGE_HEADER_LENGTH..BUXTON_MESSAGE_HEADER_LENGTH + 4],
            99,
        );

        assert_eq!(
            deserialize_message(&frame).unwrap_err(),
            WireError::Fatal(FaultKind::InvalidType)
        );
    }

    #[test]
    fn test_deserialize_rejects_unknown_control() {
        let mut frame =
            serialize_message(&Message::new(ControlCode::Get, 3, Vec::new())).unwrap();
        LittleEndian::write_u16(&mut frame[8..10], 200);

        assert_eq!(
            deserialize_message(&frame).unwrap_err(),
            WireError::Fatal(FaultKind::InvalidControl)
        );
    }

    #[test]
    fn test_deserialize_rejects_excess_params() {
        let mut frame =
            serialize_message(&Message::new(ControlCode::Get, 3, Vec::new())).unwrap();
        LittleEndian::write_u16(&mut frame[10..12], (BUXTON_MESSAGE_MAX_PARAMS + 1) as u16);

        assert_eq!(
            deserialize_message(&frame).unwrap_err(),
            WireError::Fatal(FaultKind::MaxParamsExceeded)
        );
    }

    #[test]
    fn test_serialize_rejects_excess_params() {
        let params: Vec<_> = (0..BUXTON_MESSAGE_MAX_PARAMS as i32 + 1)
            .map(|i| Datum::new(i, "_"))
            .collect();

        assert_eq!(
            serialize_message(&Message::new(ControlCode::List, 1, params)).unwrap_err(),
            WireError::Fatal(FaultKind::MaxParamsExceeded)
        );
    }

    #[test]
    fn test_serialize_rejects_oversize_payload() {
        let big = "x".repeat(BUXTON_MESSAGE_MAX_LENGTH);
        let message = Message::new(ControlCode::Set, 1, vec![Datum::new(big.as_str(), "_")]);

        assert_eq!(
            serialize_message(&message).unwrap_err(),
            WireError::Fatal(FaultKind::OversizeFrame)
        );
    }

    #[test]
    fn test_deserialize_rejects_trailing_bytes() {
        let mut frame =
            serialize_message(&Message::new(ControlCode::Get, 3, vec![Datum::new(7i32, "_")]))
                .unwrap();

        // Shrink the declared count but keep the body.
        LittleEndian::write_u16(&mut frame[10..12], 0);

        assert_eq!(
            deserialize_message(&frame).unwrap_err(),
            WireError::Fatal(FaultKind::Corrupt)
        );
    }

    #[test]
    fn test_datum_roundtrip() {
        for datum in sample_params() {
            let bytes = encode_datum(&datum).unwrap();
            assert_eq!(decode_datum(&bytes).unwrap(), datum);
        }
    }
}
