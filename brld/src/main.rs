mod config;

use crate::config::Config;
use brlcore::driver::NullDriver;
use brlcore::logging;
use brlcore::{Authenticator, Console, ScreenReader, Server};
use clap::{App, Arg};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;

/// Console probe for the Linux virtual terminals. The foreground console is
/// published by the kernel; a TCP peer's controlling terminal is not
/// discoverable from here, so the tty-0 sentinel resolves only for clients
/// that pass a concrete tty.
struct LinuxConsole {
    log: logging::Logger,
}

impl Console for LinuxConsole {
    fn foreground_tty(&self) -> Option<u32> {
        let active = fs::read_to_string("/sys/class/tty/tty0/active").ok()?;
        active.trim().strip_prefix("tty")?.parse().ok()
    }

    fn controlling_tty(&self, peer: SocketAddr) -> Option<u32> {
        logging::debug!(self.log, "controlling tty not resolvable"; "peer" => %peer);
        None
    }
}

/// Stand-in screen reader: the keys that fall through to it are only logged.
struct LogReader {
    log: logging::Logger,
}

impl ScreenReader for LogReader {
    fn deliver_key(&mut self, key: u32) {
        logging::debug!(self.log, "key for screen reader"; "key" => key);
    }
}

pub fn main() {
    let matches = App::new("Braille API Server")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Bridges a refreshable braille display to API clients.")
        .arg(Arg::with_name("CONFIG_FILE").help("Path to the config file"))
        .arg(
            Arg::with_name("listen")
                .long("listen")
                .takes_value(true)
                .help("Listen address override; `:PORT` means loopback"),
        )
        .arg(
            Arg::with_name("auth-file")
                .long("auth-file")
                .takes_value(true)
                .help("Authentication key file override"),
        )
        .arg(
            Arg::with_name("dump-config")
                .long("dump-config")
                .help("Print the default configuration and exit"),
        )
        .get_matches();

    if matches.is_present("dump-config") {
        println!(
            "{}",
            serde_json::to_string_pretty(&Config::default()).expect("Error encoding config")
        );
        return;
    }

    let mut config: Config = match matches.value_of("CONFIG_FILE") {
        Some(path) => serde_json::from_reader(
            fs::File::open(path).expect("Error opening config file"),
        )
        .expect("Error parsing config file"),
        None => Config::default(),
    };

    if let Some(listen) = matches.value_of("listen") {
        config.listen = listen.to_string();
    }
    if let Some(auth_file) = matches.value_of("auth-file") {
        config.auth_file = auth_file.to_string();
    }

    // Initialize logging
    let logger = {
        use sloggers::{Config as _, LoggerConfig};

        let logger_config: LoggerConfig =
            serdeconv::from_toml_str(&config.logging).expect("Error parsing logging config");
        logger_config.build_logger().expect("Error building logger")
    };

    let auth = Authenticator::from_file(Path::new(&config.auth_file), &logger)
        .expect("Error loading the authentication key file");

    let address = config::resolve_listen(&config.listen);

    let mut server = Server::new(
        &address,
        Box::new(NullDriver::new(&logger)),
        Box::new(LinuxConsole {
            log: logger.new(logging::o!()),
        }),
        Box::new(LogReader {
            log: logger.new(logging::o!()),
        }),
        auth,
        config.key_dir.map(PathBuf::from),
        &logger,
    )
    .expect("Error binding the API server");

    logging::info!(logger, "API server listening"; "address" => %address);

    if let Err(err) = server.run() {
        logging::crit!(logger, "server loop failed"; "error" => ?err);
        process::exit(1);
    }
}
