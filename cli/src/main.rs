//! Command line front-end for buxton. Talks to the daemon over the
//! socket by default; `--direct` opens the store in-process, which needs
//! enough privilege to touch the database files.

use buxton::client::Client;
use buxton::config::Config;
use buxton::error::Status;
use buxton::key::Key;
use buxton::store::{Caller, Store};
use buxton::value::{DataType, Datum, Value};
use buxton::BUXTON_SOCKET;
use clap::{Arg, ArgAction, Command as ClapCommand};
use std::path::{Path, PathBuf};
use std::process;

struct Command {
    name: &'static str,
    description: &'static str,
    min_args: usize,
    max_args: usize,
    usage: &'static str,
}

const COMMANDS: &[Command] = &[
    Command { name: "get-string", description: "Get a string value by key", min_args: 2, max_args: 3, usage: "[layer] group name" },
    Command { name: "set-string", description: "Set a key with a string value", min_args: 4, max_args: 4, usage: "layer group name value" },
    Command { name: "get-int32", description: "Get an int32 value by key", min_args: 2, max_args: 3, usage: "[layer] group name" },
    Command { name: "set-int32", description: "Set a key with an int32 value", min_args: 4, max_args: 4, usage: "layer group name value" },
    Command { name: "get-uint32", description: "Get a uint32 value by key", min_args: 2, max_args: 3, usage: "[layer] group name" },
    Command { name: "set-uint32", description: "Set a key with a uint32 value", min_args: 4, max_args: 4, usage: "layer group name value" },
    Command { name: "get-int64", description: "Get an int64 value by key", min_args: 2, max_args: 3, usage: "[layer] group name" },
    Command { name: "set-int64", description: "Set a key with an int64 value", min_args: 4, max_args: 4, usage: "layer group name value" },
    Command { name: "get-uint64", description: "Get a uint64 value by key", min_args: 2, max_args: 3, usage: "[layer] group name" },
    Command { name: "set-uint64", description: "Set a key with a uint64 value", min_args: 4, max_args: 4, usage: "layer group name value" },
    Command { name: "get-float", description: "Get a floating point value by key", min_args: 2, max_args: 3, usage: "[layer] group name" },
    Command { name: "set-float", description: "Set a key with a floating point value", min_args: 4, max_args: 4, usage: "layer group name value" },
    Command { name: "get-double", description: "Get a double precision value by key", min_args: 2, max_args: 3, usage: "[layer] group name" },
    Command { name: "set-double", description: "Set a key with a double precision value", min_args: 4, max_args: 4, usage: "layer group name value" },
    Command { name: "get-bool", description: "Get a boolean value by key", min_args: 2, max_args: 3, usage: "[layer] group name" },
    Command { name: "set-bool", description: "Set a key with a boolean value", min_args: 4, max_args: 4, usage: "layer group name value" },
    Command { name: "unset-value", description: "Unset a value by key", min_args: 3, max_args: 3, usage: "layer group name" },
    Command { name: "create-group", description: "Create a group in a layer", min_args: 2, max_args: 2, usage: "layer group" },
    Command { name: "remove-group", description: "Remove a group from a layer", min_args: 2, max_args: 2, usage: "layer group" },
    Command { name: "get-label", description: "Get the label for a value", min_args: 2, max_args: 3, usage: "[layer] group name" },
    Command { name: "set-label", description: "Set the label on a group or value", min_args: 3, max_args: 4, usage: "layer group [name] label" },
    Command { name: "list-keys", description: "List the keys stored in a layer", min_args: 1, max_args: 1, usage: "layer" },
];

/// Either side of the store: the socket client or the in-process store.
enum Mode {
    Socket(Client),
    Direct(Box<Store>, Caller),
}

impl Mode {
    fn get(&mut self, key: &Key) -> Result<(Datum, Option<String>), Status> {
        match self {
            Mode::Socket(client) => client.get_value(key),
            Mode::Direct(store, caller) => store
                .get(key, *caller)
                .map(|(record, layer)| (record, Some(layer))),
        }
    }

    fn set(&mut self, key: &Key, value: Value) -> Result<(), Status> {
        match self {
            Mode::Socket(client) => client.set_value(key, value),
            Mode::Direct(store, caller) => store.set(key, value, "", *caller),
        }
    }

    fn unset(&mut self, key: &Key) -> Result<(), Status> {
        match self {
            Mode::Socket(client) => client.unset_value(key),
            Mode::Direct(store, caller) => store.unset(key, *caller),
        }
    }

    fn create_group(&mut self, key: &Key) -> Result<(), Status> {
        match self {
            Mode::Socket(client) => client.create_group(key),
            Mode::Direct(store, caller) => store.create_group(key, None, *caller),
        }
    }

    fn remove_group(&mut self, key: &Key) -> Result<(), Status> {
        match self {
            Mode::Socket(client) => client.remove_group(key),
            Mode::Direct(store, caller) => store.remove_group(key, *caller),
        }
    }

    fn set_label(&mut self, key: &Key, label: &str) -> Result<(), Status> {
        match self {
            Mode::Socket(client) => client.set_label(key, label),
            Mode::Direct(store, caller) => store.set_label(key, label, *caller),
        }
    }

    fn list_keys(&mut self, layer: &str) -> Result<Vec<String>, Status> {
        match self {
            Mode::Socket(client) => client.list_keys(layer),
            Mode::Direct(store, caller) => Ok(store
                .list_keys(layer, *caller)?
                .iter()
                .map(Key::display_name)
                .collect()),
        }
    }
}

fn print_help() {
    println!("buxtonctl: Usage\n");
    for command in COMMANDS {
        println!("\t{:>12} - {}", command.name, command.description);
    }
}

fn main() {
    let matches = ClapCommand::new("buxtonctl")
        .version("0.1.0")
        .about("Command line client for the buxton configuration daemon.")
        .arg(
            Arg::new("direct")
                .long("direct")
                .action(ArgAction::SetTrue)
                .help("Bypass the daemon and open the store directly"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .help("Path to the config file (direct mode)"),
        )
        .arg(Arg::new("command").required(true).help("Operation to run"))
        .arg(
            Arg::new("args")
                .num_args(0..)
                .trailing_var_arg(true)
                .allow_hyphen_values(true)
                .help("Operation arguments"),
        )
        .get_matches();

    let name = matches.get_one::<String>("command").expect("required");
    let args: Vec<&str> = matches
        .get_many::<String>("args")
        .map(|v| v.map(String::as_str).collect())
        .unwrap_or_default();

    if name == "help" {
        print_help();
        return;
    }

    let command = match COMMANDS.iter().find(|c| c.name == name) {
        Some(command) => command,
        None => {
            eprintln!("buxtonctl: unknown command '{}'", name);
            print_help();
            process::exit(1);
        }
    };

    if args.len() < command.min_args || args.len() > command.max_args {
        if command.min_args == command.max_args {
            eprintln!(
                "{} takes {} arguments - {}",
                command.name, command.min_args, command.usage
            );
        } else {
            eprintln!(
                "{} takes at least {} arguments - {}",
                command.name, command.min_args, command.usage
            );
        }
        process::exit(1);
    }

    let mut mode = match open_mode(
        matches.get_flag("direct"),
        matches.get_one::<String>("config").map(Path::new),
    ) {
        Ok(mode) => mode,
        Err(message) => {
            eprintln!("buxtonctl: {}", message);
            process::exit(1);
        }
    };

    match run(command, &args, &mut mode) {
        Ok(()) => (),
        Err(status) => {
            eprintln!("buxtonctl: {}: {}", command.name, status);
            process::exit(1);
        }
    }
}

fn open_mode(direct: bool, config_override: Option<&Path>) -> Result<Mode, String> {
    if direct {
        let config_path = Config::resolve_path(config_override);
        let config = Config::load(&config_path).map_err(|e| e.to_string())?;
        let store = Store::new(&config.db_path, config.layers, None);
        let caller = Caller::direct(nix::unistd::geteuid().as_raw());
        return Ok(Mode::Direct(Box::new(store), caller));
    }

    let client = Client::open(&PathBuf::from(BUXTON_SOCKET), None)
        .map_err(|status| status.to_string())?;
    Ok(Mode::Socket(client))
}

fn run(command: &Command, args: &[&str], mode: &mut Mode) -> Result<(), Status> {
    match command.name {
        "unset-value" => mode.unset(&Key::value(
            Some(args[0]),
            args[1],
            args[2],
            DataType::String,
        )),
        "create-group" => mode.create_group(&Key::group(Some(args[0]), args[1])),
        "remove-group" => mode.remove_group(&Key::group(Some(args[0]), args[1])),
        "list-keys" => {
            let keys = mode.list_keys(args[0])?;
            for key in keys {
                println!("{}", key);
            }
            Ok(())
        }
        "get-label" => {
            let key = optional_layer_key(args, DataType::String);
            let (record, _) = mode.get(&key)?;
            println!("[{}] {} - {}", key.group, key.name.as_deref().unwrap_or(""), record.label);
            Ok(())
        }
        "set-label" => {
            let key = match args.len() {
                3 => Key::group(Some(args[0]), args[1]),
                _ => Key::value(Some(args[0]), args[1], args[2], DataType::String),
            };
            let label = args[args.len() - 1];
            mode.set_label(&key, label)
        }
        name if name.starts_with("get-") => {
            let vtype = type_of(name)?;
            let key = optional_layer_key(args, vtype);
            let (record, layer) = mode.get(&key)?;
            match layer {
                Some(layer) => println!("[{}] {} = {}", layer, key.display_name(), record.value),
                None => println!("{} = {}", key.display_name(), record.value),
            }
            Ok(())
        }
        name if name.starts_with("set-") => {
            let vtype = type_of(name)?;
            let value = Value::parse(vtype, args[3]).ok_or_else(|| {
                eprintln!(
                    "buxtonctl: '{}' is not a valid {} value",
                    args[3],
                    name.trim_start_matches("set-")
                );
                Status::BadArgs
            })?;
            mode.set(&Key::value(Some(args[0]), args[1], args[2], vtype), value)
        }
        _ => Err(Status::BadArgs),
    }
}

/// `[layer] group name` argument shapes.
fn optional_layer_key(args: &[&str], vtype: DataType) -> Key {
    match args.len() {
        2 => Key::value(None, args[0], args[1], vtype),
        _ => Key::value(Some(args[0]), args[1], args[2], vtype),
    }
}

fn type_of(command: &str) -> Result<DataType, Status> {
    let suffix = command
        .splitn(2, '-')
        .nth(1)
        .unwrap_or_default();
    DataType::from_name(suffix).ok_or(Status::InvalidType)
}
