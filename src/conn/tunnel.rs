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

//! Connections over the standard IO of a subprocess, e.g. `ssh host nc ...`.

use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::Duration;

use log::{info, warn};

use super::socket::{poll_fd, RawSocket};
use super::Transport;
use crate::support::error::Error;

pub struct Tunnel {
    command: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
}

impl Tunnel {
    /// Start `command` under `/bin/sh`, talking to it over pipes.
    pub fn spawn(command: &str) -> Result<Self, Error> {
        info!("Connecting with \"{}\"...", command);

        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                Error::Tunnel(format!("Unable to start \"{}\": {}", command, e))
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        Ok(Tunnel {
            command: command.to_owned(),
            child,
            stdin,
            stdout,
        })
    }

    fn closed(&self) -> Error {
        Error::Tunnel(format!("Tunnel \"{}\" is closed", self.command))
    }
}

impl Transport for Tunnel {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let result = match self.stdout {
            Some(ref mut stdout) => stdout.read(buf),
            None => return Err(self.closed()),
        };
        result.map_err(|e| {
            warn!("Tunnel read error: {}", e);
            e.into()
        })
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        let result = match self.stdin {
            Some(ref mut stdin) => stdin.write(buf),
            None => return Err(self.closed()),
        };
        result.map_err(|e| {
            warn!("Tunnel write error: {}", e);
            e.into()
        })
    }

    fn poll(&mut self, timeout: Option<Duration>) -> Result<bool, Error> {
        match self.stdout {
            Some(ref stdout) => poll_fd(stdout.as_raw_fd(), timeout),
            None => Err(self.closed()),
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        self.stdin = None;
        self.stdout = None;
        let status = self.child.wait()?;
        if !status.success() {
            warn!("Tunnel to \"{}\" returned {}", self.command, status);
        }
        Ok(())
    }

    fn into_socket(self: Box<Self>) -> Result<RawSocket, Box<dyn Transport>> {
        Err(self)
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if self.stdout.is_some() {
            let _ = self.child.kill();
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::conn::{Account, Connection};
    use crate::support::system_config::Config;

    #[test]
    fn talk_to_tunnel() {
        crate::init_test_log();

        let mut config = Config::default();
        config.connection.tunnel = Some(
            "echo '+OK tunnel ready'; read line; echo \"got $line\""
                .to_owned(),
        );

        let mut conn = Connection::new(Account::new("tunnelled", 110, "user"));
        conn.open(&config).unwrap();
        assert!(conn.poll(Some(Duration::from_secs(5))).unwrap());
        assert_eq!("+OK tunnel ready", conn.read_line().unwrap());
        conn.write_all(b"hello\n").unwrap();
        assert_eq!("got hello", conn.read_line().unwrap());
        assert_matches!(Err(Error::ConnectionClosed(..)), conn.read_line());
        assert!(!conn.is_open());
    }

    #[test]
    fn failing_tunnel_is_reported_on_close() {
        let mut tunnel = Tunnel::spawn("exit 2").unwrap();
        tunnel.close().unwrap();
    }

    #[test]
    fn tunnel_cannot_be_upgraded() {
        let tunnel: Box<dyn Transport> =
            Box::new(Tunnel::spawn("cat").unwrap());
        let mut tunnel = match tunnel.into_socket() {
            Ok(_) => panic!("Tunnel turned into a socket"),
            Err(t) => t,
        };
        tunnel.close().unwrap();
    }
}
