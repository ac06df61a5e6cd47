use buxtond::engine::Engine;
use buxton::config::Config;
use buxton::logging;
use buxton::store::Store;
use clap::{Arg, ArgAction, Command};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

fn main() {
    let matches = Command::new("buxtond")
        .version("0.1.0")
        .about("Runs the buxton configuration daemon.")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .help("Path to the config file"),
        )
        .arg(
            Arg::new("socket")
                .long("socket")
                .short('s')
                .value_name("PATH")
                .help("Listen on this socket path instead of the configured one"),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .action(ArgAction::SetTrue)
                .help("Enable debug logging"),
        )
        .get_matches();

    let level = if matches.get_flag("debug") { "debug" } else { "info" };
    let log = logging::init(level);

    let config_path = Config::resolve_path(matches.get_one::<String>("config").map(Path::new));
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            logging::crit!(log, "unable to load configuration";
                           "path" => %config_path.display(),
                           "error" => %e);
            process::exit(1);
        }
    };

    let socket_path = matches
        .get_one::<String>("socket")
        .map(PathBuf::from)
        .unwrap_or_else(|| config.socket_path());

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&shutdown)) {
            logging::crit!(log, "unable to install signal handler"; "error" => %e);
            process::exit(1);
        }
    }

    let store = Store::new(&config.db_path, config.layers.clone(), &log);
    logging::info!(log, "store initialised";
                   "db_path" => %config.db_path.display(),
                   "layers" => store.layers().count());

    let mut engine = match Engine::new(store, &socket_path, shutdown, &log) {
        Ok(engine) => engine,
        Err(e) => {
            logging::crit!(log, "unable to open listening socket";
                           "path" => %socket_path.display(),
                           "error" => %e);
            process::exit(1);
        }
    };

    engine.run();
}
