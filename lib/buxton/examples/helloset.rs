//! Minimal client walkthrough: create a group, store a value, read it
//! back. Expects a running daemon and enough privilege to write to the
//! `base` layer.

use buxton::client::Client;
use buxton::error::Status;
use buxton::key::Key;
use buxton::value::{DataType, Value};
use buxton::BUXTON_SOCKET;
use std::path::Path;

fn main() -> Result<(), Status> {
    let client = Client::open(Path::new(BUXTON_SOCKET), None)?;

    let group = Key::group(Some("base"), "hello");
    match client.create_group(&group) {
        Ok(()) | Err(Status::AlreadyExists) => (),
        Err(status) => return Err(status),
    }

    let key = Key::value(Some("base"), "hello", "test", DataType::String);
    client.set_value(&key, Value::from("hello world"))?;

    let (record, layer) = client.get_value(&Key::value(None, "hello", "test", DataType::String))?;
    println!(
        "[{}] {} = {}",
        layer.as_deref().unwrap_or("?"),
        key.display_name(),
        record.value
    );

    Ok(())
}
