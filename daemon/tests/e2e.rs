//! End-to-end scenarios: a real engine on a real socket, driven through
//! the client library.

use buxton::client::{Client, Response};
use buxton::error::Status;
use buxton::key::Key;
use buxton::layer::{BackendKind, Layer, LayerKind};
use buxton::store::Store;
use buxton::value::{DataType, Value};
use buxton::wire::ControlCode;
use buxtond::engine::Engine;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

struct TestDaemon {
    socket: PathBuf,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    _dir: tempfile::TempDir,
}

impl TestDaemon {
    fn start(layers: Vec<Layer>) -> TestDaemon {
        // The tests do not run as root; disable the privilege check so
        // SYSTEM-layer groups can be created.
        std::env::set_var("BUXTON_ROOT_CHECK", "0");

        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("buxton-test");
        let store = Store::new(dir.path(), layers, None);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut engine = Engine::new(store, &socket, Arc::clone(&shutdown), None).unwrap();
        let handle = thread::spawn(move || engine.run());

        TestDaemon {
            socket,
            shutdown,
            handle: Some(handle),
            _dir: dir,
        }
    }

    fn connect(&self) -> Client {
        Client::open(&self.socket, None).unwrap()
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn system_layer(name: &str, priority: u32) -> Layer {
    Layer {
        name: name.to_owned(),
        kind: LayerKind::System,
        backend: BackendKind::Memory,
        priority,
        description: None,
    }
}

fn user_layer(name: &str, priority: u32) -> Layer {
    Layer {
        name: name.to_owned(),
        kind: LayerKind::User,
        backend: BackendKind::Memory,
        priority,
        description: None,
    }
}

fn recorder() -> (Arc<Mutex<Vec<Response>>>, impl FnMut(&Response) + Send + 'static) {
    let seen: Arc<Mutex<Vec<Response>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |response: &Response| {
        sink.lock().unwrap().push(response.clone())
    })
}

fn changed_values(seen: &Arc<Mutex<Vec<Response>>>) -> Vec<Option<Value>> {
    seen.lock()
        .unwrap()
        .iter()
        .filter(|r| r.kind == ControlCode::Changed)
        .map(|r| r.value().map(|d| d.value.clone()))
        .collect()
}

#[test]
fn test_set_get_roundtrip() {
    let daemon = TestDaemon::start(vec![system_layer("base", 1)]);
    let client = daemon.connect();

    client.create_group(&Key::group(Some("base"), "hello")).unwrap();
    client
        .set_value(
            &Key::value(Some("base"), "hello", "test", DataType::Int32),
            Value::Int32(10),
        )
        .unwrap();

    // No layer given: the daemon resolves it.
    let (record, layer) = client
        .get_value(&Key::value(None, "hello", "test", DataType::Int32))
        .unwrap();

    assert_eq!(record.value, Value::Int32(10));
    assert_eq!(record.label, "_");
    assert_eq!(layer.as_deref(), Some("base"));
}

#[test]
fn test_system_layer_outranks_user_layer() {
    let daemon = TestDaemon::start(vec![system_layer("sys", 1), user_layer("usr", 99)]);
    let client = daemon.connect();

    for layer in ["sys", "usr"] {
        client.create_group(&Key::group(Some(layer), "g")).unwrap();
        client
            .set_value(
                &Key::value(Some(layer), "g", "k", DataType::String),
                Value::from(layer),
            )
            .unwrap();
    }

    let (record, layer) = client
        .get_value(&Key::value(None, "g", "k", DataType::String))
        .unwrap();

    assert_eq!(layer.as_deref(), Some("sys"));
    assert_eq!(record.value, Value::from("sys"));
}

#[test]
fn test_notification_fan_out() {
    let daemon = TestDaemon::start(vec![system_layer("base", 1)]);
    let watcher = daemon.connect();
    let writer = daemon.connect();

    let key = Key::value(Some("base"), "g", "k", DataType::String);
    writer.create_group(&Key::group(Some("base"), "g")).unwrap();

    let (seen, callback) = recorder();
    let registration = watcher
        .register_notification(&Key::value(None, "g", "k", DataType::String), callback)
        .unwrap();

    // Process the registration ack.
    watcher.wait_response().unwrap();
    assert_eq!(seen.lock().unwrap()[0].kind, ControlCode::Notify);
    assert_eq!(seen.lock().unwrap()[0].status, Status::Ok);

    // Each modification yields exactly one CHANGED carrying the value.
    writer.set_value(&key, Value::from("x")).unwrap();
    watcher.wait_response().unwrap();
    assert_eq!(changed_values(&seen), vec![Some(Value::from("x"))]);

    writer.set_value(&key, Value::from("y")).unwrap();
    watcher.wait_response().unwrap();
    assert_eq!(
        changed_values(&seen),
        vec![Some(Value::from("x")), Some(Value::from("y"))]
    );

    // After unregistering, further modifications stay silent.
    watcher
        .unregister_notification(&Key::value(None, "g", "k", DataType::String), registration)
        .unwrap();
    writer.set_value(&key, Value::from("z")).unwrap();

    thread::sleep(Duration::from_millis(200));
    watcher.handle_response().unwrap();
    assert_eq!(changed_values(&seen).len(), 2);
}

#[test]
fn test_unset_notifies_without_value() {
    let daemon = TestDaemon::start(vec![system_layer("base", 1)]);
    let watcher = daemon.connect();
    let writer = daemon.connect();

    let key = Key::value(Some("base"), "g", "k", DataType::String);
    writer.create_group(&Key::group(Some("base"), "g")).unwrap();
    writer.set_value(&key, Value::from("x")).unwrap();

    let (seen, callback) = recorder();
    watcher
        .register_notification(&Key::value(None, "g", "k", DataType::String), callback)
        .unwrap();
    watcher.wait_response().unwrap();

    writer.unset_value(&key).unwrap();
    watcher.wait_response().unwrap();

    assert_eq!(changed_values(&seen), vec![None]);
}

#[test]
fn test_notify_before_value_exists() {
    let daemon = TestDaemon::start(vec![system_layer("base", 1)]);
    let watcher = daemon.connect();
    let writer = daemon.connect();

    let (seen, callback) = recorder();
    watcher
        .register_notification(&Key::value(None, "g", "k", DataType::Int32), callback)
        .unwrap();
    watcher.wait_response().unwrap();
    assert_eq!(seen.lock().unwrap()[0].status, Status::Ok);

    // The first subsequent SET is delivered.
    writer.create_group(&Key::group(Some("base"), "g")).unwrap();
    writer
        .set_value(
            &Key::value(Some("base"), "g", "k", DataType::Int32),
            Value::Int32(7),
        )
        .unwrap();
    watcher.wait_response().unwrap();

    assert_eq!(changed_values(&seen), vec![Some(Value::Int32(7))]);
}

#[test]
fn test_set_into_unknown_group_fails() {
    let daemon = TestDaemon::start(vec![system_layer("base", 1)]);
    let client = daemon.connect();

    let key = Key::value(Some("base"), "nogroup", "k", DataType::Int32);

    assert_eq!(
        client.set_value(&key, Value::Int32(1)).unwrap_err(),
        Status::Failed
    );
    assert_eq!(
        client
            .get_value(&Key::value(None, "nogroup", "k", DataType::Int32))
            .unwrap_err(),
        Status::NotFound
    );
}

#[test]
fn test_unnotify_unknown_msgid_fails() {
    let daemon = TestDaemon::start(vec![system_layer("base", 1)]);
    let client = daemon.connect();

    assert_eq!(
        client
            .unregister_notification(&Key::group(None, "g"), 424242)
            .unwrap_err(),
        Status::Failed
    );
}

#[test]
fn test_list_keys() {
    let daemon = TestDaemon::start(vec![system_layer("base", 1)]);
    let client = daemon.connect();

    client.create_group(&Key::group(Some("base"), "g")).unwrap();
    client
        .set_value(
            &Key::value(Some("base"), "g", "a", DataType::Int32),
            Value::Int32(1),
        )
        .unwrap();
    client
        .set_value(
            &Key::value(Some("base"), "g", "b", DataType::Int32),
            Value::Int32(2),
        )
        .unwrap();

    let mut keys = client.list_keys("base").unwrap();
    keys.sort();

    assert_eq!(keys, vec!["g", "g:a", "g:b"]);
}

#[test]
fn test_oversize_frame_closes_connection() {
    let daemon = TestDaemon::start(vec![system_layer("base", 1)]);

    let mut raw = std::os::unix::net::UnixStream::connect(&daemon.socket).unwrap();
    raw.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let mut header = Vec::new();
    header.extend(&0x672u32.to_le_bytes());
    header.extend(&100_000u32.to_le_bytes());
    raw.write_all(&header).unwrap();

    // The daemon rejects the declared size and closes the connection.
    let mut buf = [0u8; 16];
    assert_eq!(raw.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_watcher_disconnect_cleans_up() {
    let daemon = TestDaemon::start(vec![system_layer("base", 1)]);
    let writer = daemon.connect();

    let key = Key::value(Some("base"), "g", "k", DataType::Int32);
    writer.create_group(&Key::group(Some("base"), "g")).unwrap();

    {
        let watcher = daemon.connect();
        let (_, callback) = recorder();
        watcher
            .register_notification(&Key::value(None, "g", "k", DataType::Int32), callback)
            .unwrap();
        watcher.wait_response().unwrap();
    }

    // The watcher is gone; modifications must not wedge the daemon.
    writer.set_value(&key, Value::Int32(1)).unwrap();
    writer.set_value(&key, Value::Int32(2)).unwrap();

    let (record, _) = writer
        .get_value(&Key::value(None, "g", "k", DataType::Int32))
        .unwrap();
    assert_eq!(record.value, Value::Int32(2));
}
