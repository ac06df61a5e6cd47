//! The layered store. Composes the configured layers into one logical
//! namespace, routes operations to the backend owning each layer, and
//! enforces the group and access rules.

use crate::backend::{Backend, BackendRegistry};
use crate::error::Status;
use crate::key::Key;
use crate::layer::{BackendKind, Layer, LayerKind};
use crate::logging::{self, Logger};
use crate::value::{Datum, Value};
use crate::{BUXTON_GROUP_VALUE, BUXTON_ROOT_CHECK_ENV, DEFAULT_LABEL};
use hashbrown::HashMap;
use std::env;
use std::path::Path;

/// The identity an operation runs as. `checked` is false for direct-mode
/// callers, which bypass the access hook (but never the privilege rule).
#[derive(Debug, Copy, Clone)]
pub struct Caller {
    pub uid: u32,
    pub pid: i32,
    pub checked: bool,
}

impl Caller {
    /// An in-process caller; access checks are skipped.
    pub fn direct(uid: u32) -> Caller {
        Caller {
            uid,
            pid: std::process::id() as i32,
            checked: false,
        }
    }

    /// A socket client identified by its peer credentials.
    pub fn remote(uid: u32, pid: i32) -> Caller {
        Caller {
            uid,
            pid,
            checked: true,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AccessMode {
    Read,
    Write,
}

/// Policy hook deciding whether a caller may touch an object carrying a
/// given label. Label semantics are opaque to the store.
pub trait AccessPolicy: Send {
    fn check(&self, caller: Caller, label: &str, mode: AccessMode) -> bool;
}

/// The default policy: everything is permitted. Real policy evaluation
/// lives outside the store.
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    #[inline]
    fn check(&self, _caller: Caller, _label: &str, _mode: AccessMode) -> bool {
        true
    }
}

pub type StoreResult<T> = Result<T, Status>;

pub struct Store {
    layers: HashMap<String, Layer>,
    backends: HashMap<BackendKind, Box<dyn Backend>>,
    registry: BackendRegistry,
    policy: Box<dyn AccessPolicy>,
    log: Logger,
}

impl Store {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        db_path: &Path,
        layers: Vec<Layer>,
        log: L,
    ) -> Store {
        let log = logging::child(log);

        Store {
            layers: layers.into_iter().map(|l| (l.name.clone(), l)).collect(),
            backends: HashMap::new(),
            registry: BackendRegistry::new(db_path, &log),
            policy: Box::new(AllowAll),
            log,
        }
    }

    /// Replace the access policy hook.
    pub fn set_policy(&mut self, policy: Box<dyn AccessPolicy>) {
        self.policy = policy;
    }

    /// The configured layers, unordered.
    pub fn layers(&self) -> impl Iterator<Item = &Layer> {
        self.layers.values()
    }

    /// Read a value or group record. Without an explicit layer the key is
    /// resolved across all layers: SYSTEM outranks USER, then priority,
    /// then the lexicographically smaller layer name. Returns the record
    /// and the name of the resolving layer.
    pub fn get(&mut self, key: &Key, caller: Caller) -> StoreResult<(Datum, String)> {
        if let Some(layer) = key.layer.clone() {
            let record = self.get_for_layer(key, caller, true)?;
            return Ok((record, layer));
        }

        let names: Vec<String> = self.layers.keys().cloned().collect();
        let mut best: Option<(Datum, Layer)> = None;

        for name in names {
            let candidate = key.with_layer(&name);
            let record = match self.get_for_layer(&candidate, caller, true) {
                Ok(record) => record,
                Err(_) => continue,
            };

            let layer = self.layers[&name].clone();
            let wins = match &best {
                Some((_, current)) => layer.outranks(current),
                None => true,
            };
            if wins {
                best = Some((record, layer));
            }
        }

        match best {
            Some((record, layer)) => Ok((record, layer.name)),
            None => Err(Status::NotFound),
        }
    }

    /// Read a record from one specific layer. `check_access` is false for
    /// direct callers and for the internal group lookup, which also keeps
    /// the group recursion finite: the recursive call carries a key with
    /// no name component.
    pub fn get_for_layer(
        &mut self,
        key: &Key,
        caller: Caller,
        check_access: bool,
    ) -> StoreResult<Datum> {
        let layer = self.layer(key)?;
        let check = check_access && caller.checked;

        // Values are only readable while their group record exists.
        if key.name.is_some() {
            let group_record = self.get_for_layer(&key.to_group(), caller, false)?;

            if check
                && !self
                    .policy
                    .check(caller, &group_record.label, AccessMode::Read)
            {
                return Err(Status::PermissionDenied);
            }
        }

        let record = self
            .backend(layer.backend)?
            .get(&layer, caller.uid, key)
            .map_err(|e| self.backend_failure("get", e))?
            .ok_or(Status::NotFound)?;

        if check && !self.policy.check(caller, &record.label, AccessMode::Read) {
            return Err(Status::PermissionDenied);
        }

        Ok(record)
    }

    /// Store a value. Requires an explicit layer and an existing group.
    /// A new record takes `wire_label` when non-empty (else the default
    /// label); an existing record keeps its label.
    pub fn set(
        &mut self,
        key: &Key,
        value: Value,
        wire_label: &str,
        caller: Caller,
    ) -> StoreResult<()> {
        if key.layer.is_none() || key.name.is_none() {
            return Err(Status::BadArgs);
        }

        let layer = self.layer(key)?;

        let group_record = self
            .get_for_layer(&key.to_group(), caller, false)
            .map_err(|_| Status::Failed)?;

        if caller.checked
            && !self
                .policy
                .check(caller, &group_record.label, AccessMode::Write)
        {
            return Err(Status::PermissionDenied);
        }

        let label = match self.get_for_layer(key, caller, false) {
            Ok(existing) => {
                if caller.checked
                    && !self.policy.check(caller, &existing.label, AccessMode::Write)
                {
                    return Err(Status::PermissionDenied);
                }
                existing.label
            }
            Err(Status::NotFound) => {
                if wire_label.is_empty() {
                    DEFAULT_LABEL.to_owned()
                } else {
                    wire_label.to_owned()
                }
            }
            Err(e) => return Err(e),
        };

        let record = Datum { value, label };
        self.backend(layer.backend)?
            .set(&layer, caller.uid, key, &record)
            .map_err(|e| self.backend_failure("set", e))
    }

    /// Replace the label on an existing group or value. SYSTEM layers
    /// only, privileged callers only.
    pub fn set_label(&mut self, key: &Key, label: &str, caller: Caller) -> StoreResult<()> {
        if key.layer.is_none() {
            return Err(Status::BadArgs);
        }

        let layer = self.layer(key)?;
        if layer.kind != LayerKind::System {
            logging::debug!(self.log, "label change rejected on user layer";
                            "context" => "set_label", "layer" => &layer.name);
            return Err(Status::Failed);
        }
        if !privileged(caller) {
            return Err(Status::PermissionDenied);
        }

        let existing = self.get_for_layer(key, caller, false)?;

        let record = Datum {
            value: existing.value,
            label: label.to_owned(),
        };
        self.backend(layer.backend)?
            .set(&layer, caller.uid, key, &record)
            .map_err(|e| self.backend_failure("set_label", e))
    }

    /// Create a group record. Privileged on SYSTEM layers; any caller may
    /// create groups in their own USER layer.
    pub fn create_group(
        &mut self,
        key: &Key,
        label: Option<&str>,
        caller: Caller,
    ) -> StoreResult<()> {
        if key.layer.is_none() || !key.is_group() {
            return Err(Status::BadArgs);
        }

        let layer = self.layer(key)?;
        if layer.kind == LayerKind::System && !privileged(caller) {
            logging::debug!(self.log, "not permitted to create group";
                            "context" => "create_group",
                            "group" => &key.group,
                            "uid" => caller.uid);
            return Err(Status::PermissionDenied);
        }

        match self.get_for_layer(key, caller, false) {
            Ok(_) => return Err(Status::AlreadyExists),
            Err(Status::NotFound) => (),
            Err(e) => return Err(e),
        }

        let record = Datum {
            value: Value::String(BUXTON_GROUP_VALUE.to_owned()),
            label: label.unwrap_or(DEFAULT_LABEL).to_owned(),
        };
        self.backend(layer.backend)?
            .set(&layer, caller.uid, key, &record)
            .map_err(|e| self.backend_failure("create_group", e))
    }

    /// Remove a group record. Values under the group become unreadable
    /// immediately since every value read re-checks its group. Privileged
    /// on SYSTEM layers; requires write access to the group label on USER
    /// layers.
    pub fn remove_group(&mut self, key: &Key, caller: Caller) -> StoreResult<()> {
        if key.layer.is_none() || !key.is_group() {
            return Err(Status::BadArgs);
        }

        let layer = self.layer(key)?;
        if layer.kind == LayerKind::System && !privileged(caller) {
            return Err(Status::PermissionDenied);
        }

        let group_record = self.get_for_layer(key, caller, false)?;

        if layer.kind == LayerKind::User
            && caller.checked
            && !self
                .policy
                .check(caller, &group_record.label, AccessMode::Write)
        {
            return Err(Status::PermissionDenied);
        }

        let removed = self
            .backend(layer.backend)?
            .unset(&layer, caller.uid, key)
            .map_err(|e| self.backend_failure("remove_group", e))?;

        if removed {
            Ok(())
        } else {
            Err(Status::NotFound)
        }
    }

    /// Remove a value record.
    pub fn unset(&mut self, key: &Key, caller: Caller) -> StoreResult<()> {
        if key.layer.is_none() || key.name.is_none() {
            return Err(Status::BadArgs);
        }

        let layer = self.layer(key)?;

        let group_record = self
            .get_for_layer(&key.to_group(), caller, false)
            .map_err(|_| Status::Failed)?;

        if caller.checked
            && !self
                .policy
                .check(caller, &group_record.label, AccessMode::Write)
        {
            return Err(Status::PermissionDenied);
        }

        match self.get_for_layer(key, caller, false) {
            Ok(existing) => {
                if caller.checked
                    && !self.policy.check(caller, &existing.label, AccessMode::Write)
                {
                    return Err(Status::PermissionDenied);
                }
            }
            Err(e) => return Err(e),
        }

        let removed = self
            .backend(layer.backend)?
            .unset(&layer, caller.uid, key)
            .map_err(|e| self.backend_failure("unset", e))?;

        if removed {
            Ok(())
        } else {
            Err(Status::NotFound)
        }
    }

    /// All keys stored in one layer, groups and values alike.
    pub fn list_keys(&mut self, layer_name: &str, caller: Caller) -> StoreResult<Vec<Key>> {
        let layer = self
            .layers
            .get(layer_name)
            .cloned()
            .ok_or(Status::Failed)?;

        self.backend(layer.backend)?
            .list_keys(&layer, caller.uid)
            .map_err(|e| self.backend_failure("list_keys", e))
    }

    fn layer(&self, key: &Key) -> StoreResult<Layer> {
        let name = key.layer.as_deref().ok_or(Status::BadArgs)?;
        self.layers.get(name).cloned().ok_or(Status::Failed)
    }

    fn backend(&mut self, kind: BackendKind) -> StoreResult<&mut Box<dyn Backend>> {
        if !self.backends.contains_key(&kind) {
            let backend = self.registry.open(kind).ok_or(Status::Failed)?;
            self.backends.insert(kind, backend);
        }

        Ok(self.backends.get_mut(&kind).expect("backend just opened"))
    }

    fn backend_failure(&self, op: &str, error: crate::backend::BackendError) -> Status {
        logging::warn!(self.log, "backend operation failed";
                       "context" => op,
                       "error" => %error);
        Status::Failed
    }
}

/// Privilege rule for SYSTEM-layer mutations. `BUXTON_ROOT_CHECK=0`
/// bypasses the check; test hook only.
fn privileged(caller: Caller) -> bool {
    if caller.uid == 0 {
        return true;
    }

    env::var(BUXTON_ROOT_CHECK_ENV).map_or(false, |v| v == "0")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::DataType;
    use std::path::PathBuf;

    fn layer(name: &str, kind: LayerKind, priority: u32) -> Layer {
        Layer {
            name: name.to_owned(),
            kind,
            backend: BackendKind::Memory,
            priority,
            description: None,
        }
    }

    fn store(layers: Vec<Layer>) -> Store {
        Store::new(&PathBuf::from("/nonexistent"), layers, None)
    }

    fn root() -> Caller {
        Caller::direct(0)
    }

    #[test]
    fn test_set_get_roundtrip() {
        let mut store = store(vec![layer("base", LayerKind::System, 1)]);
        let group = Key::group(Some("base"), "hello");
        let key = Key::value(Some("base"), "hello", "test", DataType::Int32);

        store.create_group(&group, None, root()).unwrap();
        store.set(&key, Value::Int32(10), "", root()).unwrap();

        // Layered resolution without an explicit layer.
        let unresolved = Key::value(None, "hello", "test", DataType::Int32);
        let (record, from) = store.get(&unresolved, root()).unwrap();

        assert_eq!(record.value, Value::Int32(10));
        assert_eq!(record.label, "_");
        assert_eq!(from, "base");
    }

    #[test]
    fn test_system_layer_wins_resolution() {
        let mut store = store(vec![
            layer("sys", LayerKind::System, 1),
            layer("usr", LayerKind::User, 99),
        ]);

        for name in ["sys", "usr"] {
            let group = Key::group(Some(name), "g");
            store.create_group(&group, None, root()).unwrap();
            let key = Key::value(Some(name), "g", "k", DataType::String);
            store.set(&key, Value::from(name), "", root()).unwrap();
        }

        let (record, from) = store
            .get(&Key::value(None, "g", "k", DataType::String), root())
            .unwrap();

        assert_eq!(from, "sys");
        assert_eq!(record.value, Value::from("sys"));
    }

    #[test]
    fn test_priority_and_name_tiebreak() {
        let mut store = store(vec![
            layer("alpha", LayerKind::User, 5),
            layer("beta", LayerKind::User, 5),
            layer("gamma", LayerKind::User, 1),
        ]);

        for name in ["alpha", "beta", "gamma"] {
            store
                .create_group(&Key::group(Some(name), "g"), None, root())
                .unwrap();
            store
                .set(
                    &Key::value(Some(name), "g", "k", DataType::String),
                    Value::from(name),
                    "",
                    root(),
                )
                .unwrap();
        }

        let (record, from) = store
            .get(&Key::value(None, "g", "k", DataType::String), root())
            .unwrap();

        assert_eq!(from, "alpha");
        assert_eq!(record.value, Value::from("alpha"));
    }

    #[test]
    fn test_set_requires_group() {
        let mut store = store(vec![layer("base", LayerKind::System, 1)]);
        let key = Key::value(Some("base"), "nogroup", "k", DataType::Int32);

        assert_eq!(
            store.set(&key, Value::Int32(1), "", root()).unwrap_err(),
            Status::Failed
        );
        assert_eq!(store.get(&key, root()).unwrap_err(), Status::NotFound);
    }

    #[test]
    fn test_set_requires_layer() {
        let mut store = store(vec![layer("base", LayerKind::System, 1)]);
        let key = Key::value(None, "g", "k", DataType::Int32);

        assert_eq!(
            store.set(&key, Value::Int32(1), "", root()).unwrap_err(),
            Status::BadArgs
        );
    }

    #[test]
    fn test_group_lifecycle() {
        let mut store = store(vec![layer("base", LayerKind::System, 1)]);
        let group = Key::group(Some("base"), "g");

        store.create_group(&group, None, root()).unwrap();

        // The group record carries the sentinel value.
        let (record, _) = store.get(&group, root()).unwrap();
        assert_eq!(record.value, Value::from(crate::BUXTON_GROUP_VALUE));

        assert_eq!(
            store.create_group(&group, None, root()).unwrap_err(),
            Status::AlreadyExists
        );

        let key = Key::value(Some("base"), "g", "k", DataType::Int32);
        store.set(&key, Value::Int32(5), "", root()).unwrap();

        store.remove_group(&group, root()).unwrap();

        // The stale value record must not be readable without its group.
        assert_eq!(store.get(&key, root()).unwrap_err(), Status::NotFound);
        assert_eq!(store.get(&group, root()).unwrap_err(), Status::NotFound);
        assert_eq!(
            store.remove_group(&group, root()).unwrap_err(),
            Status::NotFound
        );
    }

    #[test]
    fn test_unset() {
        let mut store = store(vec![layer("base", LayerKind::System, 1)]);
        let group = Key::group(Some("base"), "g");
        let key = Key::value(Some("base"), "g", "k", DataType::Int32);

        store.create_group(&group, None, root()).unwrap();

        assert_eq!(store.unset(&key, root()).unwrap_err(), Status::NotFound);

        store.set(&key, Value::Int32(5), "", root()).unwrap();
        store.unset(&key, root()).unwrap();

        assert_eq!(store.get(&key, root()).unwrap_err(), Status::NotFound);
    }

    #[test]
    fn test_label_inheritance() {
        let mut store = store(vec![layer("base", LayerKind::System, 1)]);
        let group = Key::group(Some("base"), "g");
        let key = Key::value(Some("base"), "g", "k", DataType::Int32);

        store.create_group(&group, None, root()).unwrap();

        // New value takes the supplied label.
        store.set(&key, Value::Int32(1), "audio", root()).unwrap();
        let (record, _) = store.get(&key, root()).unwrap();
        assert_eq!(record.label, "audio");

        // Overwrite keeps the existing label.
        store.set(&key, Value::Int32(2), "other", root()).unwrap();
        let (record, _) = store.get(&key, root()).unwrap();
        assert_eq!(record.label, "audio");
        assert_eq!(record.value, Value::Int32(2));
    }

    #[test]
    fn test_privilege_rules() {
        let mut store = store(vec![
            layer("sys", LayerKind::System, 1),
            layer("usr", LayerKind::User, 1),
        ]);
        let user = Caller::direct(1000);

        assert_eq!(
            store
                .create_group(&Key::group(Some("sys"), "g"), None, user)
                .unwrap_err(),
            Status::PermissionDenied
        );

        // Any caller may create groups in a USER layer.
        store
            .create_group(&Key::group(Some("usr"), "g"), None, user)
            .unwrap();

        assert_eq!(
            store
                .remove_group(&Key::group(Some("sys"), "g"), user)
                .unwrap_err(),
            Status::PermissionDenied
        );
    }

    #[test]
    fn test_set_label() {
        let mut store = store(vec![
            layer("sys", LayerKind::System, 1),
            layer("usr", LayerKind::User, 1),
        ]);
        let group = Key::group(Some("sys"), "g");

        store.create_group(&group, None, root()).unwrap();
        store.set_label(&group, "trusted", root()).unwrap();

        let (record, _) = store.get(&group, root()).unwrap();
        assert_eq!(record.label, "trusted");

        // User layers never accept label changes.
        let user_group = Key::group(Some("usr"), "g");
        store.create_group(&user_group, None, root()).unwrap();
        assert_eq!(
            store.set_label(&user_group, "x", root()).unwrap_err(),
            Status::Failed
        );

        // Unprivileged callers are rejected.
        assert_eq!(
            store
                .set_label(&group, "x", Caller::direct(1000))
                .unwrap_err(),
            Status::PermissionDenied
        );

        // Missing target.
        assert_eq!(
            store
                .set_label(&Key::group(Some("sys"), "missing"), "x", root())
                .unwrap_err(),
            Status::NotFound
        );
    }

    #[test]
    fn test_user_layers_scope_by_uid() {
        let mut store = store(vec![layer("usr", LayerKind::User, 1)]);
        let group = Key::group(Some("usr"), "g");

        store.create_group(&group, None, Caller::direct(1000)).unwrap();

        assert!(store.get(&group, Caller::direct(1000)).is_ok());
        assert_eq!(
            store.get(&group, Caller::direct(1001)).unwrap_err(),
            Status::NotFound
        );
    }

    #[test]
    fn test_access_policy_enforced_for_remote_callers() {
        struct DenyAll;
        impl AccessPolicy for DenyAll {
            fn check(&self, _caller: Caller, _label: &str, _mode: AccessMode) -> bool {
                false
            }
        }

        let mut store = store(vec![layer("base", LayerKind::System, 1)]);
        let group = Key::group(Some("base"), "g");
        let key = Key::value(Some("base"), "g", "k", DataType::Int32);

        store.create_group(&group, None, root()).unwrap();
        store.set(&key, Value::Int32(1), "", root()).unwrap();

        store.set_policy(Box::new(DenyAll));

        // Direct callers bypass the hook entirely.
        assert!(store.get(&key, root()).is_ok());

        // Remote callers do not.
        let remote = Caller::remote(0, 1);
        assert_eq!(store.get(&key, remote).unwrap_err(), Status::PermissionDenied);
        assert_eq!(
            store.set(&key, Value::Int32(2), "", remote).unwrap_err(),
            Status::PermissionDenied
        );
    }

    #[test]
    fn test_list_keys() {
        let mut store = store(vec![layer("base", LayerKind::System, 1)]);
        let group = Key::group(Some("base"), "g");

        store.create_group(&group, None, root()).unwrap();
        store
            .set(
                &Key::value(Some("base"), "g", "k", DataType::Int32),
                Value::Int32(1),
                "",
                root(),
            )
            .unwrap();

        let keys = store.list_keys("base", root()).unwrap();
        assert_eq!(keys.len(), 2);

        assert_eq!(store.list_keys("missing", root()).unwrap_err(), Status::Failed);
    }

    #[test]
    fn test_unknown_layer_fails() {
        let mut store = store(vec![layer("base", LayerKind::System, 1)]);
        let key = Key::group(Some("missing"), "g");

        assert_eq!(
            store.create_group(&key, None, root()).unwrap_err(),
            Status::Failed
        );
        assert_eq!(store.get(&key, root()).unwrap_err(), Status::Failed);
    }
}
