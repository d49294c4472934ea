use clap::{App, Arg};
use lodestone::logging;
use lodestone::{Config, Server};
use std::env;
use std::fs;
use std::process;

const PORT_ENV_VAR: &str = "LODESTONE_PORT";

fn main() {
    let matches = App::new("lodestone")
        .version("0.1.0")
        .about("Runs the lodestone key-value server.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .long("config")
                .takes_value(true)
                .help("Path to the JSON config file"),
        )
        .arg(
            Arg::with_name("PORT")
                .long("port")
                .short("p")
                .takes_value(true)
                .help("Listening port (overrides config file and environment)"),
        )
        .get_matches();

    let mut config: Config = match matches.value_of("CONFIG_FILE") {
        Some(path) => serde_json::from_reader(
            fs::File::open(path).expect("Error opening config file"),
        )
        .expect("Error parsing config file"),
        None => Config::default(),
    };

    if let Ok(port) = env::var(PORT_ENV_VAR) {
        config
            .addr
            .set_port(port.parse().expect("LODESTONE_PORT must be a port number"));
    }

    if let Some(port) = matches.value_of("PORT") {
        config
            .addr
            .set_port(port.parse().expect("PORT must be a port number"));
    }

    // Initialize logging
    let logger = logging::init();

    logging::info!(logger, "starting lodestone";
                   "addr" => %config.addr,
                   "workers" => config.workers);

    let server = match Server::bind(&config, &logger) {
        Ok(server) => server,
        Err(err) => {
            logging::crit!(logger, "startup failed"; "error" => %err);
            process::exit(1);
        }
    };

    // SIGINT flips the shutdown flag; the reactor notices and unwinds in
    // order: stop accepting, drain the pool, drop listener, store and arena.
    // SIGPIPE is already ignored by the runtime, so dead-peer writes come
    // back as errors on the affected connection only.
    let handle = server.shutdown_handle();
    ctrlc::set_handler(move || handle.shutdown()).expect("Error installing signal handler");

    if let Err(err) = server.run() {
        logging::crit!(logger, "server terminated abnormally"; "error" => %err);
        process::exit(1);
    }
}
