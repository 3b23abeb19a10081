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

//! Synchronisation of a remote POP mailbox with the local caches.

pub mod cache;
pub mod header;
pub mod mailbox;
pub mod session;

use bitflags::bitflags;
use chrono::prelude::*;
use serde::{Deserialize, Serialize};

pub use self::header::{Envelope, Header};
pub use self::mailbox::Mailbox;
pub use self::session::Session;

/// Connection state of a mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Status {
    /// Never logged in.
    #[default]
    NotConnected,
    Connected,
    /// Logged out or lost the connection after having been connected.
    Disconnected,
}

/// Whether the server supports an optional command.
///
/// Starts out `Unknown` and is settled by the first use of the command. It
/// never changes again after that.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Capability {
    #[default]
    Unknown,
    Supported,
    Unsupported,
}

impl Capability {
    /// Record the outcome of using the command. Returns whether this changed
    /// the state.
    pub fn confirm(&mut self, supported: bool) -> bool {
        if Capability::Unknown != *self {
            return false;
        }

        *self = if supported {
            Capability::Supported
        } else {
            Capability::Unsupported
        };
        true
    }

    /// Whether the command is worth trying.
    pub fn usable(self) -> bool {
        Capability::Unsupported != self
    }
}

bitflags! {
    #[derive(Default)]
    pub struct MessageFlags: u32 {
        /// The body is in the persistent blob cache.
        const READ = 1 << 0;
        /// Seen in an earlier session but never read.
        const OLD = 1 << 1;
        /// To be removed from the server on the next sync.
        const DELETED = 1 << 2;
        /// Header data changed since it was cached.
        const CHANGED = 1 << 3;
        const FLAGGED = 1 << 4;
        const REPLIED = 1 << 5;
    }
}

impl Serialize for MessageFlags {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MessageFlags {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        u32::deserialize(deserializer).map(MessageFlags::from_bits_truncate)
    }
}

/// One message known to the mailbox.
#[derive(Clone, Debug)]
pub struct Message {
    /// The server's unique, session-independent identifier.
    pub uid: String,
    /// The message number in the current session, `None` until the server
    /// listed the message in this session.
    pub refno: Option<u32>,
    /// Position in the mailbox, `refno - 1`.
    pub index: usize,
    pub header: Header,
}

impl Message {
    pub fn new(uid: impl Into<String>, refno: u32) -> Self {
        Message {
            uid: uid.into(),
            refno: Some(refno),
            index: refno.saturating_sub(1) as usize,
            header: Header::default(),
        }
    }

    pub fn flags(&self) -> MessageFlags {
        self.header.flags
    }

    pub fn is_deleted(&self) -> bool {
        self.header.flags.contains(MessageFlags::DELETED)
    }

    /// Whether the message was unknown before this session.
    pub fn is_new(&self) -> bool {
        !self
            .header
            .flags
            .intersects(MessageFlags::READ | MessageFlags::OLD)
    }
}

/// Per-mailbox protocol state.
#[derive(Debug, Default)]
pub struct PopData {
    pub status: Status,
    pub cmd_uidl: Capability,
    pub cmd_top: Capability,
    /// Mailbox size in bytes as reported at login.
    pub size: u64,
    /// When the message list was last refreshed. `None` forces the next
    /// check to run.
    pub check_time: Option<DateTime<Utc>>,
    /// Set when message positions moved, so that the fallback cache must not
    /// be trusted any more.
    pub clear_cache: bool,
    /// The last message explaining why a command was given up on.
    pub err_msg: String,
}
