//! Typed views over wire messages: request construction and parsing, and
//! the reply builders shared by the daemon and the tests.
//!
//! Optional key components travel as empty strings so every request kind
//! keeps a fixed parameter count.

use crate::error::{Status, WireError, WireResult};
use crate::key::Key;
use crate::value::{DataType, Datum, Value};
use crate::wire::{ControlCode, Message};

/// A decoded client request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// `key` carries layer, group and name; `value` carries the payload
    /// and the caller-supplied label.
    Set { key: Key, value: Datum },
    /// Sets the label on a group (no name) or value record.
    SetLabel { key: Key, label: String },
    CreateGroup { key: Key },
    RemoveGroup { key: Key },
    /// Layer and name are optional: no layer means layered resolution,
    /// no name means the group record.
    Get { key: Key },
    Unset { key: Key },
    List { layer: String },
    Notify { key: Key },
    /// `msgid` cites the original NOTIFY registration.
    Unnotify { key: Key, msgid: u64 },
}

impl Request {
    pub fn control(&self) -> ControlCode {
        match self {
            Request::Set { .. } => ControlCode::Set,
            Request::SetLabel { .. } => ControlCode::SetLabel,
            Request::CreateGroup { .. } => ControlCode::CreateGroup,
            Request::RemoveGroup { .. } => ControlCode::RemoveGroup,
            Request::Get { .. } => ControlCode::Get,
            Request::Unset { .. } => ControlCode::Unset,
            Request::List { .. } => ControlCode::List,
            Request::Notify { .. } => ControlCode::Notify,
            Request::Unnotify { .. } => ControlCode::Unnotify,
        }
    }

    /// Encode into a frame-ready message.
    pub fn to_message(&self, msgid: u64) -> Message {
        let params = match self {
            Request::Set { key, value } => vec![
                Datum::unlabeled(key.layer.as_deref().unwrap_or("")),
                Datum::unlabeled(&key.group),
                Datum::unlabeled(key.name.as_deref().unwrap_or("")),
                value.clone(),
            ],
            Request::SetLabel { key, label } => vec![
                Datum::unlabeled(key.layer.as_deref().unwrap_or("")),
                Datum::unlabeled(&key.group),
                Datum::unlabeled(key.name.as_deref().unwrap_or("")),
                Datum::unlabeled(label),
            ],
            Request::CreateGroup { key } | Request::RemoveGroup { key } => vec![
                Datum::unlabeled(key.layer.as_deref().unwrap_or("")),
                Datum::unlabeled(&key.group),
            ],
            Request::Get { key } => vec![
                Datum::unlabeled(key.layer.as_deref().unwrap_or("")),
                Datum::unlabeled(&key.group),
                Datum::unlabeled(key.name.as_deref().unwrap_or("")),
                Datum::from(Value::UInt32(key.vtype.tag())),
            ],
            Request::Unset { key } => vec![
                Datum::unlabeled(key.layer.as_deref().unwrap_or("")),
                Datum::unlabeled(&key.group),
                Datum::unlabeled(key.name.as_deref().unwrap_or("")),
            ],
            Request::List { layer } => vec![Datum::unlabeled(layer)],
            Request::Notify { key } => vec![
                Datum::unlabeled(&key.group),
                Datum::unlabeled(key.name.as_deref().unwrap_or("")),
            ],
            Request::Unnotify { key, msgid } => vec![
                Datum::unlabeled(&key.group),
                Datum::unlabeled(key.name.as_deref().unwrap_or("")),
                Datum::from(Value::UInt64(*msgid)),
            ],
        };

        Message::new(self.control(), msgid, params)
    }

    /// Decode a request message. Shape mismatches are the caller's fault
    /// and map to `BadArgs`.
    pub fn from_message(message: &Message) -> Result<Request, Status> {
        let p = &message.params;

        match message.control {
            ControlCode::Set => {
                if p.len() != 4 {
                    return Err(Status::BadArgs);
                }
                let key = request_key(p, true)?;
                Ok(Request::Set {
                    key,
                    value: p[3].clone(),
                })
            }
            ControlCode::SetLabel => {
                if p.len() != 4 {
                    return Err(Status::BadArgs);
                }
                let key = request_key(p, false)?;
                if key.layer.is_none() {
                    return Err(Status::BadArgs);
                }
                let label = string_param(p, 3)?.to_owned();
                Ok(Request::SetLabel { key, label })
            }
            ControlCode::CreateGroup | ControlCode::RemoveGroup => {
                if p.len() != 2 {
                    return Err(Status::BadArgs);
                }
                let layer = required(string_param(p, 0)?)?;
                let group = required(string_param(p, 1)?)?;
                let key = Key::group(Some(layer), group);
                Ok(match message.control {
                    ControlCode::CreateGroup => Request::CreateGroup { key },
                    _ => Request::RemoveGroup { key },
                })
            }
            ControlCode::Get => {
                if p.len() != 4 {
                    return Err(Status::BadArgs);
                }
                let mut key = request_key(p, false)?;
                key.vtype = match &p[3].value {
                    Value::UInt32(tag) => {
                        DataType::from_tag(*tag).map_err(|_| Status::InvalidType)?
                    }
                    _ => return Err(Status::BadArgs),
                };
                Ok(Request::Get { key })
            }
            ControlCode::Unset => {
                if p.len() != 3 {
                    return Err(Status::BadArgs);
                }
                let key = request_key(p, false)?;
                if key.layer.is_none() || key.name.is_none() {
                    return Err(Status::BadArgs);
                }
                Ok(Request::Unset { key })
            }
            ControlCode::List => {
                if p.len() != 1 {
                    return Err(Status::BadArgs);
                }
                let layer = required(string_param(p, 0)?)?.to_owned();
                Ok(Request::List { layer })
            }
            ControlCode::Notify => {
                if p.len() != 2 {
                    return Err(Status::BadArgs);
                }
                let key = notify_key(p)?;
                Ok(Request::Notify { key })
            }
            ControlCode::Unnotify => {
                if p.len() != 3 {
                    return Err(Status::BadArgs);
                }
                let key = notify_key(p)?;
                let msgid = match &p[2].value {
                    Value::UInt64(v) => *v,
                    _ => return Err(Status::BadArgs),
                };
                Ok(Request::Unnotify { key, msgid })
            }
            ControlCode::Status | ControlCode::Changed => Err(Status::BadArgs),
        }
    }

    /// The key a notification subscription is tracked under, where this
    /// request carries one.
    pub fn key(&self) -> Option<&Key> {
        match self {
            Request::Set { key, .. }
            | Request::SetLabel { key, .. }
            | Request::CreateGroup { key }
            | Request::RemoveGroup { key }
            | Request::Get { key }
            | Request::Unset { key }
            | Request::Notify { key }
            | Request::Unnotify { key, .. } => Some(key),
            Request::List { .. } => None,
        }
    }
}

/// Build a STATUS reply. The status code is always parameter 0; `extra`
/// carries the operation's return values.
pub fn status_reply(msgid: u64, status: Status, extra: Vec<Datum>) -> Message {
    let mut params = Vec::with_capacity(extra.len() + 1);
    params.push(Datum::from(Value::Int32(status.code())));
    params.extend(extra);

    Message::new(ControlCode::Status, msgid, params)
}

/// Build a CHANGED notification frame for one subscriber. `value` is
/// present for SET modifications and absent for UNSET/REMOVE_GROUP.
pub fn changed_notification(msgid: u64, key: &Key, value: Option<&Datum>) -> Message {
    let mut params = vec![Datum::unlabeled(&key.display_name())];
    if let Some(value) = value {
        params.push(value.clone());
    }

    Message::new(ControlCode::Changed, msgid, params)
}

/// Split a STATUS message into its code and return values. A reply whose
/// first parameter is not an INT32 status is corrupt.
pub fn parse_status(message: &Message) -> WireResult<(Status, Vec<Datum>)> {
    if message.control != ControlCode::Status {
        return Err(WireError::Fatal(crate::error::FaultKind::Corrupt));
    }

    match message.params.first().map(|d| &d.value) {
        Some(Value::Int32(code)) => Ok((
            Status::from_code(*code),
            message.params[1..].to_vec(),
        )),
        _ => Err(WireError::Fatal(crate::error::FaultKind::Corrupt)),
    }
}

fn string_param<'a>(params: &'a [Datum], index: usize) -> Result<&'a str, Status> {
    params
        .get(index)
        .and_then(Datum::as_str)
        .ok_or(Status::BadArgs)
}

fn required(value: &str) -> Result<&str, Status> {
    if value.is_empty() {
        Err(Status::BadArgs)
    } else {
        Ok(value)
    }
}

fn optional(value: &str) -> Option<&str> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Parse the common `[layer, group, name, ...]` prefix. `require_all`
/// rejects empty layer or name up front.
fn request_key(params: &[Datum], require_all: bool) -> Result<Key, Status> {
    let layer = string_param(params, 0)?;
    let group = required(string_param(params, 1)?)?;
    let name = string_param(params, 2)?;

    if require_all && (layer.is_empty() || name.is_empty()) {
        return Err(Status::BadArgs);
    }

    Ok(Key {
        layer: optional(layer).map(str::to_owned),
        group: group.to_owned(),
        name: optional(name).map(str::to_owned),
        vtype: DataType::String,
    })
}

fn notify_key(params: &[Datum]) -> Result<Key, Status> {
    let group = required(string_param(params, 0)?)?;
    let name = string_param(params, 1)?;

    Ok(Key {
        layer: None,
        group: group.to_owned(),
        name: optional(name).map(str::to_owned),
        vtype: DataType::String,
    })
}
