#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

//! Buxton is a layered configuration store. Values live in prioritized
//! layers, each persisted by a pluggable backend, and are reached either
//! over the daemon's unix socket or directly in-process for privileged
//! tooling.

/// Default path of the daemon's listening socket.
pub const BUXTON_SOCKET: &str = "/run/buxton-0";

/// Default path of the daemon configuration file.
pub const BUXTON_CONF_FILE: &str = "/etc/buxton.conf";

/// Environment variable overriding the configuration file path.
pub const BUXTON_CONF_FILE_ENV: &str = "BUXTON_CONF_FILE";

/// Environment variable disabling privileged-operation checks. Test hook
/// only; checks are skipped when set to `0`.
pub const BUXTON_ROOT_CHECK_ENV: &str = "BUXTON_ROOT_CHECK";

/// Sentinel value stored for group records, which exist to carry the
/// group's label rather than a payload.
pub const BUXTON_GROUP_VALUE: &str = "BUXTON_GROUP_VALUE";

/// Default label attached to records stored without an explicit one.
pub const DEFAULT_LABEL: &str = "_";

pub mod backend;
pub mod buffer;
pub mod client;
pub mod config;
pub mod error;
pub mod key;
pub mod layer;
pub mod logging;
pub mod message;
pub mod store;
pub mod value;
pub mod wire;
