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

//! The mailbox: keeps the local message list in step with the server.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};

use chrono::prelude::*;
use log::{debug, error, info, warn};

use super::cache::{BlobCache, FallbackCache, HeaderCache};
use super::header::{count_lines, parse_header, Header};
use super::session::Session;
use super::{Capability, Message, MessageFlags, PopData, Status};
use crate::support::error::Error;
use crate::support::system_config::PopConfig;

/// Run `command` and write its reply into `out`, one line per line.
///
/// With `header_only`, everything after the first empty line is discarded.
fn fetch_into(
    session: &mut impl Session,
    command: &str,
    out: &mut File,
    header_only: bool,
) -> Result<(), Error> {
    let mut writer = BufWriter::new(out);
    let mut in_body = false;
    session.fetch(command, &mut |line| {
        if in_body {
            return Ok(());
        }

        writer
            .write_all(line.as_bytes())
            .and_then(|_| writer.write_all(b"\n"))
            .map_err(Error::TempFile)?;
        if header_only && line.is_empty() {
            in_body = true;
        }
        Ok(())
    })?;
    writer.flush().map_err(Error::TempFile)
}

/// Parse one line of a `UIDL` listing.
fn parse_uidl(line: &str) -> Option<(u32, &str)> {
    let line = line.trim_start();
    let split = line.find(' ')?;
    let refno = line[..split].parse::<u32>().ok().filter(|&r| r > 0)?;
    let uid = line[split..].trim_start_matches(' ');
    if uid.is_empty() {
        None
    } else {
        Some((refno, uid))
    }
}

/// A remote POP mailbox and its local state.
pub struct Mailbox<S: Session> {
    session: S,
    config: PopConfig,
    data: PopData,
    messages: Vec<Message>,
    /// Real subject to the identifiers of the messages bearing it.
    subjects: BTreeMap<String, BTreeSet<String>>,
    fallback: FallbackCache,
    blobs: Option<Box<dyn BlobCache>>,
    headers: Option<Box<dyn HeaderCache>>,
}

impl<S: Session> Mailbox<S> {
    pub fn new(session: S, config: PopConfig) -> Self {
        let fallback = FallbackCache::new(config.cache_len);
        Mailbox {
            session,
            config,
            data: PopData::default(),
            messages: Vec::new(),
            subjects: BTreeMap::new(),
            fallback,
            blobs: None,
            headers: None,
        }
    }

    pub fn with_blob_cache(mut self, blobs: Box<dyn BlobCache>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn with_header_cache(mut self, headers: Box<dyn HeaderCache>) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn data(&self) -> &PopData {
        &self.data
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message(&self, ix: usize) -> Option<&Message> {
        self.messages.get(ix)
    }

    /// The messages whose subject, without reply prefix, is `subject`.
    pub fn by_subject(&self, subject: &str) -> Vec<&Message> {
        match self.subjects.get(subject) {
            None => Vec::new(),
            Some(uids) => self
                .messages
                .iter()
                .filter(|m| uids.contains(&m.uid))
                .collect(),
        }
    }

    fn index_subject(&mut self, ix: usize) {
        let message = &self.messages[ix];
        if let Some(ref subject) = message.header.envelope.real_subject {
            self.subjects
                .entry(subject.clone())
                .or_default()
                .insert(message.uid.clone());
        }
    }

    fn unindex_subject(&mut self, ix: usize) {
        let message = &self.messages[ix];
        if let Some(ref subject) = message.header.envelope.real_subject {
            if let Some(uids) = self.subjects.get_mut(subject) {
                uids.remove(&message.uid);
                if uids.is_empty() {
                    self.subjects.remove(subject);
                }
            }
        }
    }

    fn reindex_subjects(&mut self) {
        self.subjects.clear();
        for ix in 0..self.messages.len() {
            self.index_subject(ix);
        }
    }

    /// Log in unless already connected.
    fn ensure_connected(&mut self) -> Result<(), Error> {
        if Status::Connected == self.data.status {
            return Ok(());
        }

        match self.session.open() {
            Ok(size) => {
                self.data.size = size;
                self.data.status = Status::Connected;
                Ok(())
            }
            Err(e) => {
                error!("Unable to log in: {}", e);
                self.session.close();
                Err(e)
            }
        }
    }

    fn connection_lost(&mut self) {
        warn!("Lost connection to POP server");
        self.data.status = Status::Disconnected;
        self.session.close();
    }

    /// Log in and list the mailbox.
    ///
    /// A connection lost while listing is re-established and the listing
    /// restarted; an unsuccessful login ends the attempt. Returns the number
    /// of messages found.
    pub fn open(&mut self) -> Result<usize, Error> {
        loop {
            self.ensure_connected()?;
            info!("Fetching list of messages...");

            match self.fetch_headers() {
                Ok(_) => return Ok(self.messages.len()),
                Err(e) if e.is_connection_lost() => self.connection_lost(),
                Err(e) => return Err(e),
            }
        }
    }

    /// Bring the message list in line with the server's `UIDL` listing,
    /// fetching headers for messages not seen before.
    ///
    /// Returns the number of new messages. If fetching a header fails, the
    /// messages handled up to that point are kept and the error returned.
    pub fn fetch_headers(&mut self) -> Result<usize, Error> {
        self.ensure_connected()?;
        self.data.check_time = Some(Utc::now());
        self.data.clear_cache = false;

        if !self.data.cmd_uidl.usable() {
            return Err(Error::Protocol(self.data.err_msg.clone()));
        }

        for message in &mut self.messages {
            message.refno = None;
        }

        let mut fresh = Vec::<Message>::new();
        let mut clear_cache = false;
        let messages = &mut self.messages;
        let result = self.session.fetch("UIDL", &mut |line| {
            let (refno, uid) = match parse_uidl(line) {
                Some(parsed) => parsed,
                None => {
                    warn!("Ignoring malformed UIDL line: {:?}", line);
                    return Ok(());
                }
            };

            match messages
                .iter_mut()
                .chain(fresh.iter_mut())
                .find(|m| m.uid == uid)
            {
                Some(message) => {
                    let index = refno as usize - 1;
                    if message.index != index {
                        clear_cache = true;
                    }
                    message.refno = Some(refno);
                    message.index = index;
                }
                None => {
                    debug!("New message {} {}", refno, uid);
                    fresh.push(Message::new(uid, refno));
                }
            }
            Ok(())
        });

        match result {
            Ok(()) => {
                if self.data.cmd_uidl.confirm(true) {
                    debug!("Server supports UIDL");
                }
            }
            Err(e)
                if e.is_protocol()
                    && Capability::Unknown == self.data.cmd_uidl =>
            {
                self.data.cmd_uidl.confirm(false);
                self.data.err_msg =
                    "Command UIDL is not supported by server.".to_owned();
                error!("{} ({})", self.data.err_msg, e);
                return Err(Error::Protocol(self.data.err_msg.clone()));
            }
            Err(e) => return Err(e),
        }

        if clear_cache {
            debug!("Message positions changed");
            self.data.clear_cache = true;
        }

        let mut lost = 0;
        for message in &mut self.messages {
            if message.refno.is_none() && !message.is_deleted() {
                message.header.flags.insert(MessageFlags::DELETED);
                lost += 1;
            }
        }
        if lost > 0 {
            warn!(
                "{} messages have been lost. Try reopening the mailbox.",
                lost
            );
        }

        let count = fresh.len();
        if count > 0 {
            info!("Fetching {} message headers...", count);
        }
        for mut message in fresh {
            self.materialize(&mut message)?;
            self.messages.push(message);
            self.index_subject(self.messages.len() - 1);
        }

        if self.config.message_cache_clean {
            self.sweep_blob_cache();
        }

        Ok(count)
    }

    /// Fill in the header and flags of a newly listed message.
    fn materialize(&mut self, message: &mut Message) -> Result<(), Error> {
        let cached = self
            .headers
            .as_ref()
            .and_then(|headers| headers.fetch(&message.uid));
        let hydrated = match cached {
            Some(mut header) => {
                // Session state is never taken from the cache.
                header.flags.remove(
                    MessageFlags::READ
                        | MessageFlags::OLD
                        | MessageFlags::CHANGED
                        | MessageFlags::DELETED,
                );
                message.header = header;
                true
            }
            None => {
                self.read_header(message)?;
                if let Some(ref mut headers) = self.headers {
                    if let Err(e) = headers.store(&message.uid, &message.header)
                    {
                        warn!(
                            "Unable to cache header of {}: {}",
                            message.uid, e
                        );
                    }
                }
                false
            }
        };

        let bcached = self
            .blobs
            .as_ref()
            .map_or(false, |blobs| blobs.exists(&message.uid));
        message
            .header
            .flags
            .remove(MessageFlags::READ | MessageFlags::OLD);
        if bcached {
            message.header.flags.insert(MessageFlags::READ);
        } else if hydrated && self.config.mark_old {
            message.header.flags.insert(MessageFlags::OLD);
        }

        Ok(())
    }

    /// Fetch and parse the header of `message` from the server.
    fn read_header(&mut self, message: &mut Message) -> Result<(), Error> {
        let refno = message.refno.ok_or(Error::StaleIndex)?;

        let list = self.session.query(&format!("LIST {}", refno))?;
        let size = list
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        let mut tmp = tempfile::tempfile().map_err(Error::TempFile)?;

        if self.data.cmd_top.usable() {
            match fetch_into(
                &mut self.session,
                &format!("TOP {} 0", refno),
                &mut tmp,
                false,
            ) {
                Ok(()) => {
                    if self.data.cmd_top.confirm(true) {
                        debug!("Server supports TOP");
                    }
                }
                Err(e)
                    if e.is_protocol()
                        && Capability::Unknown == self.data.cmd_top =>
                {
                    self.data.cmd_top.confirm(false);
                    self.data.err_msg =
                        "Command TOP is not supported by server.".to_owned();
                    warn!("{} ({})", self.data.err_msg, e);
                }
                Err(e) => return Err(e),
            }
        }

        if !self.data.cmd_top.usable() {
            tmp.set_len(0).map_err(Error::TempFile)?;
            tmp.seek(SeekFrom::Start(0)).map_err(Error::TempFile)?;
            fetch_into(
                &mut self.session,
                &format!("RETR {}", refno),
                &mut tmp,
                true,
            )?;
        }

        tmp.seek(SeekFrom::Start(0)).map_err(Error::TempFile)?;
        let mut reader = BufReader::new(&mut tmp);
        let parsed = parse_header(&mut reader).map_err(Error::TempFile)?;
        let lines =
            parsed.lines + count_lines(&mut reader).map_err(Error::TempFile)?;

        // The server counts CRLF line endings while the file has bare LFs.
        message.header.length =
            size.saturating_sub(parsed.offset + u64::from(lines));
        message.header.offset = parsed.offset;
        message.header.envelope = parsed.envelope;
        Ok(())
    }

    fn sweep_blob_cache(&mut self) {
        let shared = self
            .headers
            .as_ref()
            .and_then(|headers| headers.shared_name())
            .map(str::to_owned);
        let messages = &self.messages;

        if let Some(ref mut blobs) = self.blobs {
            if let Err(e) = blobs.list(&mut |id| {
                shared.as_deref() == Some(id)
                    || messages.iter().any(|m| m.uid == id)
            }) {
                warn!("Unable to clean message cache: {}", e);
            }
        }
    }

    /// Open the body of the message at `ix`, retrieving it from the server
    /// if it is not cached.
    ///
    /// The returned file is positioned at the start.
    pub fn fetch_message(&mut self, ix: usize) -> Result<File, Error> {
        let (uid, index) = match self.messages.get(ix) {
            Some(message) => (message.uid.clone(), message.index),
            None => return Err(Error::NoSuchMessage(ix)),
        };

        if let Some(ref blobs) = self.blobs {
            if let Some(file) = blobs.get(&uid) {
                return Ok(file);
            }
        }

        if let Some(file) = self.fallback.lookup(index)? {
            return Ok(file);
        }

        let (mut file, temp_path) = loop {
            self.ensure_connected()?;

            let refno = match self.messages[ix].refno {
                Some(refno) => refno,
                None => {
                    error!("{}", Error::StaleIndex);
                    return Err(Error::StaleIndex);
                }
            };

            let put = match self.blobs {
                Some(ref mut blobs) => match blobs.put(&uid) {
                    Ok(file) => Some(file),
                    Err(e) => {
                        warn!("{}", e);
                        None
                    }
                },
                None => None,
            };
            let (mut file, temp_path) = match put {
                Some(file) => (file, None),
                None => {
                    let (file, path) = tempfile::NamedTempFile::new()
                        .map_err(Error::TempFile)?
                        .into_parts();
                    (file, Some(path))
                }
            };

            info!("Fetching message...");
            match fetch_into(
                &mut self.session,
                &format!("RETR {}", refno),
                &mut file,
                false,
            ) {
                Ok(()) => break (file, temp_path),
                // Dropping `temp_path` removes the partial file.
                Err(e) if e.is_connection_lost() => self.connection_lost(),
                Err(e) => {
                    error!("{}", e);
                    return Err(e);
                }
            }
        };

        match temp_path {
            None => {
                if let Some(ref mut blobs) = self.blobs {
                    if let Err(e) = blobs.commit(&uid) {
                        warn!("{}", e);
                    }
                }
            }
            Some(path) => self.fallback.store(index, path),
        }

        // The full message may reveal more of the header than TOP did.
        file.seek(SeekFrom::Start(0)).map_err(Error::TempFile)?;
        let (parsed, lines, total) = {
            let mut reader = BufReader::new(&mut file);
            let parsed = parse_header(&mut reader).map_err(Error::TempFile)?;
            let lines = count_lines(&mut reader).map_err(Error::TempFile)?;
            let total = reader.stream_position().map_err(Error::TempFile)?;
            (parsed, lines, total)
        };

        self.unindex_subject(ix);
        {
            let header = &mut self.messages[ix].header;
            header.envelope = parsed.envelope;
            header.offset = parsed.offset;
            header.lines = lines;
            header.length = total.saturating_sub(parsed.offset);
        }
        self.index_subject(ix);

        file.seek(SeekFrom::Start(0)).map_err(Error::TempFile)?;
        Ok(file)
    }

    /// Set or clear `flags` on the message at `ix`.
    ///
    /// Changing anything other than `DELETED` marks the header for saving
    /// on the next sync.
    pub fn set_flags(
        &mut self,
        ix: usize,
        flags: MessageFlags,
        on: bool,
    ) -> Result<(), Error> {
        let message = self
            .messages
            .get_mut(ix)
            .ok_or(Error::NoSuchMessage(ix))?;
        let before = message.header.flags;
        message.header.flags.set(flags, on);

        let changed = (before ^ message.header.flags) - MessageFlags::DELETED;
        if !changed.is_empty() {
            message.header.flags.insert(MessageFlags::CHANGED);
        }
        Ok(())
    }

    pub fn mark_deleted(
        &mut self,
        ix: usize,
        deleted: bool,
    ) -> Result<(), Error> {
        self.set_flags(ix, MessageFlags::DELETED, deleted)
    }

    fn sync_pass(&mut self) -> Result<(), Error> {
        for message in &self.messages {
            if let (true, Some(refno)) = (message.is_deleted(), message.refno) {
                self.session.query(&format!("DELE {}", refno))?;

                if let Some(ref mut blobs) = self.blobs {
                    if let Err(e) = blobs.delete(&message.uid) {
                        warn!("{}", e);
                    }
                }
                if let Some(ref mut headers) = self.headers {
                    if let Err(e) = headers.delete(&message.uid) {
                        warn!("{}", e);
                    }
                }
            } else if message.header.flags.contains(MessageFlags::CHANGED)
                && !message.is_deleted()
            {
                if let Some(ref mut headers) = self.headers {
                    let mut header: Header = message.header.clone();
                    header.flags.remove(MessageFlags::CHANGED);
                    if let Err(e) = headers.store(&message.uid, &header) {
                        warn!(
                            "Unable to cache header of {}: {}",
                            message.uid, e
                        );
                    }
                }
            }
        }

        self.session.query("QUIT")?;
        Ok(())
    }

    /// Delete the messages marked deleted from the server and save changed
    /// headers, then log out.
    ///
    /// Deleted messages are dropped from the message list afterwards.
    pub fn sync(&mut self) -> Result<(), Error> {
        self.data.check_time = None;

        loop {
            self.ensure_connected()?;
            info!("Marking messages deleted...");

            match self.sync_pass() {
                Ok(()) => break,
                Err(e) if e.is_connection_lost() => self.connection_lost(),
                Err(e) => {
                    error!("{}", e);
                    return Err(e);
                }
            }
        }

        self.data.clear_cache = true;
        self.clear_fallback();
        self.data.status = Status::Disconnected;
        self.session.close();

        self.messages.retain(|m| !m.is_deleted());
        for message in &mut self.messages {
            message.header.flags.remove(MessageFlags::CHANGED);
        }
        self.reindex_subjects();
        Ok(())
    }

    /// Check for new mail if the check interval has passed since the last
    /// listing. Returns whether new messages arrived.
    pub fn check(&mut self) -> Result<bool, Error> {
        self.check_at(Utc::now())
    }

    pub fn check_at(&mut self, now: DateTime<Utc>) -> Result<bool, Error> {
        if let Some(last) = self.data.check_time {
            let due = last
                + chrono::Duration::seconds(self.config.check_interval.into());
            if due > now {
                return Ok(false);
            }
        }

        self.logout();
        self.ensure_connected()?;

        info!("Checking for new messages...");
        let result = self.fetch_headers();
        self.clear_fallback();

        match result {
            Ok(n) => Ok(n > 0),
            Err(e) => {
                if e.is_connection_lost() {
                    self.connection_lost();
                }
                Err(e)
            }
        }
    }

    fn clear_fallback(&mut self) {
        if self.data.clear_cache {
            self.fallback.purge();
        }
    }

    /// Send `QUIT` if connected, then close the session.
    pub fn logout(&mut self) {
        if Status::Connected == self.data.status {
            info!("Closing connection to POP server...");
            if let Err(e) = self.session.query("QUIT") {
                debug!("Error logging out: {}", e);
            }
            self.data.status = Status::Disconnected;
        }
        self.session.close();
    }

    /// Log out, disconnect and discard the fallback cache.
    pub fn close(&mut self) {
        self.logout();
        self.data.status = Status::NotConnected;
        self.data.clear_cache = true;
        self.clear_fallback();
    }
}
