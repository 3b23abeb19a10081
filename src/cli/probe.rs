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

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use log::debug;
use secstr::SecStr;

use super::main::ProbeSubcommand;
use crate::conn::trust::{CertPrompt, TrustChoice, TrustEngine, TrustPrompt};
use crate::conn::{tls, Account, Connection, PasswordSource};
use crate::support::error::Error;
use crate::support::sysexits::*;
use crate::support::system_config::Config;

/// Asks about certificates on the controlling terminal.
struct TerminalPrompt;

impl TerminalPrompt {
    fn show(prompt: &CertPrompt<'_>) -> io::Result<TrustChoice> {
        let stderr = io::stderr();
        let mut out = stderr.lock();

        writeln!(out, "{}", prompt.title())?;
        writeln!(out)?;
        for line in prompt.description() {
            writeln!(out, "{}", line)?;
        }
        writeln!(out)?;
        writeln!(out, "Warning: {}", prompt.reason)?;

        let mut choices = "(r)eject, accept (o)nce".to_owned();
        if prompt.allow_always {
            choices.push_str(", (a)ccept always");
        }
        if prompt.allow_skip {
            choices.push_str(", (s)kip");
        }

        let stdin = io::stdin();
        let mut answer = String::new();
        loop {
            write!(out, "{}? ", choices)?;
            out.flush()?;

            answer.clear();
            if 0 == stdin.lock().read_line(&mut answer)? {
                return Ok(TrustChoice::Reject);
            }

            match answer.trim() {
                "r" => return Ok(TrustChoice::Reject),
                "o" => return Ok(TrustChoice::AcceptOnce),
                "a" if prompt.allow_always => {
                    return Ok(TrustChoice::AcceptAlways)
                }
                "s" if prompt.allow_skip => return Ok(TrustChoice::Skip),
                _ => (),
            }
        }
    }
}

impl TrustPrompt for TerminalPrompt {
    fn ask(&self, prompt: &CertPrompt<'_>) -> TrustChoice {
        match TerminalPrompt::show(prompt) {
            Ok(choice) => choice,
            Err(e) => {
                eprintln!("Unable to ask about certificate: {}", e);
                TrustChoice::Reject
            }
        }
    }
}

struct TtyPassword;

impl PasswordSource for TtyPassword {
    fn password(&self, account: &Account) -> Result<SecStr, Error> {
        let prompt =
            format!("Password for {}@{}: ", account.user, account.host);
        let password =
            rpassword::read_password_from_tty(Some(prompt.as_str()))?;
        Ok(SecStr::new(password.into_bytes()))
    }
}

pub(super) fn main(config: Config, cmd: ProbeSubcommand) {
    if let Err(e) = probe(config, cmd) {
        die!(Sysexit::from(&e), "Error: {}", e);
    }
}

fn current_user() -> String {
    match nix::unistd::User::from_uid(nix::unistd::getuid()) {
        Ok(Some(u)) => u.name,
        Ok(None) => die!(EX_NOUSER, "No passwd entry for current user"),
        Err(e) => {
            die!(EX_OSFILE, "Failed to look up current UNIX user: {}", e)
        }
    }
}

fn expect_ok(line: String) -> Result<String, Error> {
    if line.starts_with("+OK") {
        Ok(line)
    } else {
        Err(Error::Protocol(line))
    }
}

fn probe(config: Config, cmd: ProbeSubcommand) -> Result<(), Error> {
    let user = cmd.user.unwrap_or_else(current_user);
    let port = cmd.port.unwrap_or(if cmd.tls { 995 } else { 110 });
    let engine = Arc::new(
        TrustEngine::new(config.tls.clone(), Box::new(TerminalPrompt))
            .with_password_source(Box::new(TtyPassword)),
    );

    let mut conn = Connection::new(Account::new(cmd.host, port, user));
    conn.open(&config)?;
    if cmd.tls {
        tls::secure(&mut conn, &engine)?;
    }

    let greeting = expect_ok(conn.read_line()?)?;
    if cmd.starttls {
        conn.write_all(b"STLS\r\n")?;
        expect_ok(conn.read_line()?)?;
        tls::starttls(&mut conn, &engine)?;
    }

    println!("{}", greeting);
    match conn.ssf() {
        0 => println!("Connection is not encrypted"),
        ssf => println!("Security strength factor: {}", ssf),
    }

    if let Err(e) = conn
        .write_all(b"QUIT\r\n")
        .and_then(|_| conn.read_line())
    {
        debug!("Error logging out: {}", e);
    }
    conn.close()?;
    engine.clear();
    Ok(())
}
