use crate::value::DataType;
use std::fmt;

/// Compound identifier for a group or a value. A key without a `name`
/// addresses the group record itself; a key with one addresses a value
/// inside that group. `layer` is optional on reads, where the layered
/// store resolves it.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Key {
    pub layer: Option<String>,
    pub group: String,
    pub name: Option<String>,
    pub vtype: DataType,
}

impl Key {
    pub fn group(layer: Option<&str>, group: &str) -> Key {
        Key {
            layer: layer.map(str::to_owned),
            group: group.to_owned(),
            name: None,
            vtype: DataType::String,
        }
    }

    pub fn value(layer: Option<&str>, group: &str, name: &str, vtype: DataType) -> Key {
        Key {
            layer: layer.map(str::to_owned),
            group: group.to_owned(),
            name: Some(name.to_owned()),
            vtype,
        }
    }

    /// True when this key addresses a group record.
    #[inline]
    pub fn is_group(&self) -> bool {
        self.name.is_none()
    }

    /// The same key with the name dropped, addressing the parent group.
    pub fn to_group(&self) -> Key {
        Key {
            layer: self.layer.clone(),
            group: self.group.clone(),
            name: None,
            vtype: DataType::String,
        }
    }

    /// The same key pinned to a specific layer.
    pub fn with_layer(&self, layer: &str) -> Key {
        Key {
            layer: Some(layer.to_owned()),
            ..self.clone()
        }
    }

    /// Backend record key: group bytes, with a NUL separator and name
    /// bytes for value records. Group and value records can never collide
    /// since group names cannot contain NUL.
    pub fn record_key(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            self.group.len() + self.name.as_ref().map_or(0, |n| n.len() + 1),
        );
        out.extend_from_slice(self.group.as_bytes());
        if let Some(name) = &self.name {
            out.push(0);
            out.extend_from_slice(name.as_bytes());
        }
        out
    }

    /// Inverse of `record_key`, used when listing a database.
    pub fn from_record_key(bytes: &[u8]) -> Option<Key> {
        let mut parts = bytes.splitn(2, |&b| b == 0);
        let group = String::from_utf8(parts.next()?.to_vec()).ok()?;
        let name = match parts.next() {
            Some(rest) => Some(String::from_utf8(rest.to_vec()).ok()?),
            None => None,
        };
        Some(Key {
            layer: None,
            group,
            name,
            vtype: DataType::String,
        })
    }

    /// Display form without the layer (`group` or `group:name`), used for
    /// notification subscriptions and LIST output.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => format!("{}:{}", self.group, name),
            None => self.group.clone(),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(layer) = &self.layer {
            write!(f, "{}:", layer)?;
        }
        f.write_str(&self.group)?;
        if let Some(name) = &self.name {
            write!(f, ":{}", name)?;
        }
        Ok(())
    }
}
