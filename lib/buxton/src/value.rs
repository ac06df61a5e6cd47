use crate::error::{FaultKind, WireError, WireResult};
use std::fmt;

/// The closed set of types a stored value may take. Keys carry a tag so
/// the requested type travels with lookups even before a value exists.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum DataType {
    String = 1,
    Int32 = 2,
    UInt32 = 3,
    Int64 = 4,
    UInt64 = 5,
    Float = 6,
    Double = 7,
    Boolean = 8,
}

impl DataType {
    #[inline]
    pub fn tag(self) -> u32 {
        self as u32
    }

    pub fn from_tag(tag: u32) -> WireResult<DataType> {
        Ok(match tag {
            1 => DataType::String,
            2 => DataType::Int32,
            3 => DataType::UInt32,
            4 => DataType::Int64,
            5 => DataType::UInt64,
            6 => DataType::Float,
            7 => DataType::Double,
            8 => DataType::Boolean,
            _ => return Err(WireError::Fatal(FaultKind::InvalidType)),
        })
    }

    /// Parse the CLI/config spelling of a type name.
    pub fn from_name(name: &str) -> Option<DataType> {
        Some(match name {
            "string" => DataType::String,
            "int32" => DataType::Int32,
            "uint32" => DataType::UInt32,
            "int64" => DataType::Int64,
            "uint64" => DataType::UInt64,
            "float" => DataType::Float,
            "double" => DataType::Double,
            "bool" => DataType::Boolean,
            _ => return None,
        })
    }
}

/// A typed value. The tagged union carried by SET requests, GET replies
/// and CHANGED notifications, and stored by the backends.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    Boolean(bool),
}

impl Value {
    #[inline]
    pub fn data_type(&self) -> DataType {
        match self {
            Value::String(_) => DataType::String,
            Value::Int32(_) => DataType::Int32,
            Value::UInt32(_) => DataType::UInt32,
            Value::Int64(_) => DataType::Int64,
            Value::UInt64(_) => DataType::UInt64,
            Value::Float(_) => DataType::Float,
            Value::Double(_) => DataType::Double,
            Value::Boolean(_) => DataType::Boolean,
        }
    }

    /// Parse a CLI-supplied string into a value of the requested type.
    pub fn parse(vtype: DataType, raw: &str) -> Option<Value> {
        Some(match vtype {
            DataType::String => Value::String(raw.to_owned()),
            DataType::Int32 => Value::Int32(raw.parse().ok()?),
            DataType::UInt32 => Value::UInt32(raw.parse().ok()?),
            DataType::Int64 => Value::Int64(raw.parse().ok()?),
            DataType::UInt64 => Value::UInt64(raw.parse().ok()?),
            DataType::Float => Value::Float(raw.parse().ok()?),
            DataType::Double => Value::Double(raw.parse().ok()?),
            DataType::Boolean => match raw {
                "true" | "1" | "on" => Value::Boolean(true),
                "false" | "0" | "off" => Value::Boolean(false),
                _ => return None,
            },
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(v) => f.write_str(v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::UInt32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::UInt64(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Boolean(v) => write!(f, "{}", v),
        }
    }
}

/// A value paired with its access label. The unit the backends store and
/// the wire codec moves as a single message parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Datum {
    pub value: Value,
    pub label: String,
}

impl Datum {
    #[inline]
    pub fn new<V: Into<Value>>(value: V, label: &str) -> Datum {
        Datum {
            value: value.into(),
            label: label.to_owned(),
        }
    }

    /// A bare string datum with an empty label, used for the key and
    /// layer parameters of requests where labels carry no meaning.
    #[inline]
    pub fn unlabeled(text: &str) -> Datum {
        Datum {
            value: Value::String(text.to_owned()),
            label: String::new(),
        }
    }

    /// The string payload, if this datum is a string.
    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl From<Value> for Datum {
    fn from(value: Value) -> Datum {
        Datum {
            value,
            label: String::new(),
        }
    }
}

macro_rules! value_from {
    ($($native:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$native> for Value {
                #[inline]
                fn from(v: $native) -> Value {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from! {
    String => String,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f32 => Float,
    f64 => Double,
    bool => Boolean,
}

impl From<&str> for Value {
    #[inline]
    fn from(v: &str) -> Value {
        Value::String(v.to_owned())
    }
}
