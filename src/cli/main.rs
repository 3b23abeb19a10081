//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Popsync.
//
// Popsync is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Popsync is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Popsync. If not, see <http://www.gnu.org/licenses/>.

use std::mem;
use std::path::{Path, PathBuf};

use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::config::{Appender, Config as LogConfig, Root};
use log4rs::encode::pattern::PatternEncoder;
use structopt::StructOpt;

use crate::support::signals;
use crate::support::sysexits::*;
use crate::support::system_config::Config;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
struct Options {
    /// Configure logging from this log4rs TOML file instead of writing
    /// to standard error.
    #[structopt(long, parse(from_os_str))]
    log_config: Option<PathBuf>,

    /// Log protocol traffic and other details to standard error.
    #[structopt(short, long)]
    verbose: bool,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt)]
enum Command {
    /// Connect to a POP server and print its greeting.
    ///
    /// With --tls or --starttls, the server's certificate goes through the
    /// same trust checks as a normal session, including the interactive
    /// prompt for certificates which cannot be verified.
    Probe(ProbeSubcommand),
    /// Inspect the certificates the user chose to always trust.
    Trust(TrustSubcommand),
}

impl Command {
    fn common_options(&mut self) -> CommonOptions {
        match *self {
            Command::Probe(ref mut c) => mem::take(&mut c.common),
            Command::Trust(TrustSubcommand::List(ref mut c)) => mem::take(c),
        }
    }
}

#[derive(StructOpt, Default)]
pub(super) struct CommonOptions {
    /// The configuration file [default: built-in defaults]
    #[structopt(long, short, parse(from_os_str))]
    pub(super) config: Option<PathBuf>,
}

#[derive(StructOpt)]
pub(super) struct ProbeSubcommand {
    #[structopt(flatten)]
    pub(super) common: CommonOptions,

    /// The host to connect to
    #[structopt(long, short)]
    pub(super) host: String,

    /// The port to connect to [default: 995 with --tls, otherwise 110]
    #[structopt(long, short)]
    pub(super) port: Option<u16>,

    /// The user name offered to the client certificate password prompt
    /// [default: current UNIX user name]
    #[structopt(long, short)]
    pub(super) user: Option<String>,

    /// Negotiate TLS immediately after connecting.
    #[structopt(long, conflicts_with = "starttls")]
    pub(super) tls: bool,

    /// Upgrade the connection with STLS after the greeting.
    #[structopt(long)]
    pub(super) starttls: bool,
}

#[derive(StructOpt)]
enum TrustSubcommand {
    /// List the certificates in the trust store, marking expired ones.
    List(CommonOptions),
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let options = Options::from_clap(&match Options::clap().get_matches_safe()
    {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        }
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        }
    });

    init_log(options.log_config.as_deref(), options.verbose);
    signals::init();

    let mut cmd = options.command;
    let config = load_config(cmd.common_options().config);

    match cmd {
        Command::Probe(cmd) => super::probe::main(config, cmd),
        Command::Trust(TrustSubcommand::List(_)) => super::trust::list(config),
    }
}

fn load_config(path: Option<PathBuf>) -> Config {
    match path {
        None => Config::default(),
        Some(path) => match Config::load(&path) {
            Ok(config) => config,
            Err(e) => die!(EX_CONFIG, "{}", e),
        },
    }
}

fn init_log(log_config: Option<&Path>, verbose: bool) {
    if let Some(path) = log_config {
        if let Err(e) =
            log4rs::init_file(path, log4rs::config::Deserializers::new())
        {
            die!(
                EX_CONFIG,
                "Failed to initialise logging from '{}': {}",
                path.display(),
                e
            );
        }
        return;
    }

    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new("{l}: {m}{n}")))
        .build();
    let level = if verbose {
        log::LevelFilter::Trace
    } else {
        log::LevelFilter::Warn
    };

    let result = LogConfig::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(level))
        .map_err(|e| e.to_string())
        .and_then(|config| {
            log4rs::init_config(config).map_err(|e| e.to_string())
        });
    if let Err(e) = result {
        eprintln!("Failed to initialise logging: {}", e);
    }
}
