//! Per-connection command dispatch.
//!
//! A session belongs to one client connection. It owns the connection's
//! selected database index and turns decoded commands into encoded
//! replies. Command handlers compute first and encode last, so a handler
//! that fails never leaves a partial reply in the buffer; dispatch turns
//! the error into a single `-ERR` line instead.

use crate::db::Keyspace;
use bytes::Bytes;
use marlin_common::{MarlinError, Result, ServerConfig};
use marlin_resp::ReplyEncoder;
use marlin_stream::{parse_entry_id, Delivery, Entry, EntryId, Stream};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;

pub struct Session {
    keyspace: Arc<Keyspace>,
    config: Arc<ServerConfig>,
    /// Database selected with SELECT; 0 on a fresh connection.
    db_index: usize,
}

/// One stream named in an XREAD command, resolved against the keyspace.
struct ReadTarget {
    name: String,
    stream: Option<Arc<Stream>>,
    /// The id the caller has already seen.
    seen: EntryId,
    /// First id to report, when one can exist.
    from: Option<EntryId>,
}

/// Unsubscribes its channel from every stream when dropped, so a blocked
/// XREAD cleans up on delivery, timeout, and connection teardown alike.
struct SubscriptionGuard {
    subs: Vec<(Arc<Stream>, mpsc::Sender<Delivery>)>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        for (stream, tx) in &self.subs {
            stream.unsubscribe(tx);
        }
    }
}

impl Session {
    pub fn new(keyspace: Arc<Keyspace>, config: Arc<ServerConfig>) -> Self {
        Self {
            keyspace,
            config,
            db_index: 0,
        }
    }

    /// Executes one command and returns the encoded reply.
    pub async fn dispatch(&mut self, cmd: Vec<String>) -> Bytes {
        let mut enc = ReplyEncoder::new();
        match self.execute(&cmd, &mut enc).await {
            Ok(()) => enc.into_bytes(),
            Err(err) => {
                let mut enc = ReplyEncoder::new();
                enc.write_error(&format!("ERR {err}"));
                enc.into_bytes()
            }
        }
    }

    async fn execute(&mut self, cmd: &[String], enc: &mut ReplyEncoder) -> Result<()> {
        let name = cmd
            .first()
            .ok_or_else(|| MarlinError::Protocol("empty command".to_string()))?
            .to_ascii_lowercase();

        match name.as_str() {
            "ping" => {
                enc.write_simple("PONG");
                Ok(())
            }
            "echo" => self.cmd_echo(cmd, enc),
            "set" => self.cmd_set(cmd, enc),
            "get" => self.cmd_get(cmd, enc),
            "config" => self.cmd_config(cmd, enc),
            "keys" => self.cmd_keys(cmd, enc),
            "type" => self.cmd_type(cmd, enc),
            "select" => self.cmd_select(cmd, enc),
            "xadd" => self.cmd_xadd(cmd, enc),
            "xrange" => self.cmd_xrange(cmd, enc),
            "xread" => self.cmd_xread(cmd, enc).await,
            other => Err(MarlinError::UnknownCommand(other.to_string())),
        }
    }

    fn db(&self) -> &crate::db::Database {
        self.keyspace
            .db(self.db_index)
            .expect("selected database index was validated by SELECT")
    }

    fn cmd_echo(&self, cmd: &[String], enc: &mut ReplyEncoder) -> Result<()> {
        if cmd.len() != 2 {
            return Err(MarlinError::WrongArity("echo".to_string()));
        }
        enc.write_bulk(&cmd[1]);
        Ok(())
    }

    fn cmd_set(&self, cmd: &[String], enc: &mut ReplyEncoder) -> Result<()> {
        if cmd.len() < 3 {
            return Err(MarlinError::WrongArity("set".to_string()));
        }

        let expires_at = match cmd.get(3) {
            None => None,
            Some(opt) if opt.eq_ignore_ascii_case("px") => {
                let millis: u64 = cmd
                    .get(4)
                    .ok_or(MarlinError::Syntax)?
                    .parse()
                    .map_err(|_| MarlinError::NotAnInteger)?;
                Some(SystemTime::now() + Duration::from_millis(millis))
            }
            Some(_) => return Err(MarlinError::Syntax),
        };

        self.db().set_string(&cmd[1], cmd[2].clone(), expires_at);
        enc.write_simple("OK");
        Ok(())
    }

    fn cmd_get(&self, cmd: &[String], enc: &mut ReplyEncoder) -> Result<()> {
        if cmd.len() != 2 {
            return Err(MarlinError::WrongArity("get".to_string()));
        }
        match self.db().get_string(&cmd[1])? {
            Some(value) => enc.write_bulk(&value),
            None => enc.write_null(),
        }
        Ok(())
    }

    fn cmd_config(&self, cmd: &[String], enc: &mut ReplyEncoder) -> Result<()> {
        if cmd.len() != 3 {
            return Err(MarlinError::WrongArity("config".to_string()));
        }
        if !cmd[1].eq_ignore_ascii_case("get") {
            return Err(MarlinError::Syntax);
        }

        let snapshot = &self.config.snapshot;
        match cmd[2].to_ascii_lowercase().as_str() {
            "dir" => enc.write_string_array(&["dir".to_string(), snapshot.dir_str()]),
            "dbfilename" => {
                enc.write_string_array(&["dbfilename".to_string(), snapshot.dbfilename_str()])
            }
            _ => enc.write_array_header(0),
        }
        Ok(())
    }

    fn cmd_keys(&self, cmd: &[String], enc: &mut ReplyEncoder) -> Result<()> {
        if cmd.len() != 2 {
            return Err(MarlinError::WrongArity("keys".to_string()));
        }
        // Only the match-everything pattern is supported.
        if cmd[1] != "*" {
            return Err(MarlinError::Syntax);
        }
        enc.write_string_array(&self.db().keys());
        Ok(())
    }

    fn cmd_type(&self, cmd: &[String], enc: &mut ReplyEncoder) -> Result<()> {
        if cmd.len() != 2 {
            return Err(MarlinError::WrongArity("type".to_string()));
        }
        enc.write_simple(self.db().type_name(&cmd[1]));
        Ok(())
    }

    fn cmd_select(&mut self, cmd: &[String], enc: &mut ReplyEncoder) -> Result<()> {
        if cmd.len() != 2 {
            return Err(MarlinError::WrongArity("select".to_string()));
        }
        let index: usize = cmd[1].parse().map_err(|_| MarlinError::NotAnInteger)?;
        if index >= self.keyspace.database_count() {
            return Err(MarlinError::NoSuchDatabase(index));
        }
        self.db_index = index;
        enc.write_simple("OK");
        Ok(())
    }

    fn cmd_xadd(&self, cmd: &[String], enc: &mut ReplyEncoder) -> Result<()> {
        if cmd.len() < 5 {
            return Err(MarlinError::WrongArity("xadd".to_string()));
        }

        let stream = self.db().get_or_create_stream(&cmd[1])?;
        let id = parse_entry_id(&cmd[2], stream.last_id())?;

        let tokens = &cmd[3..];
        if tokens.len() < 2 {
            return Err(MarlinError::MissingEntryFields);
        }
        if tokens.len() % 2 != 0 {
            return Err(MarlinError::UnpairedEntryField);
        }
        let fields: Vec<(String, String)> = tokens
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();

        stream.put(id, fields)?;
        enc.write_bulk(&id.to_string());
        Ok(())
    }

    fn cmd_xrange(&self, cmd: &[String], enc: &mut ReplyEncoder) -> Result<()> {
        if cmd.len() != 4 {
            return Err(MarlinError::WrongArity("xrange".to_string()));
        }

        let stream = match self.db().get_stream(&cmd[1])? {
            Some(stream) => stream,
            None => {
                enc.write_array_header(0);
                return Ok(());
            }
        };

        let last = stream.last_id();
        let from = parse_entry_id(&cmd[2], last)?;
        let to = parse_entry_id(&cmd[3], last)?;

        write_entries(enc, &stream.range(from, to));
        Ok(())
    }

    async fn cmd_xread(&self, cmd: &[String], enc: &mut ReplyEncoder) -> Result<()> {
        let (block, targets) = self.parse_xread(cmd)?;

        // Anything already appended past a requested id is returned
        // immediately, for every named stream at once.
        if targets.iter().any(target_has_backlog) {
            write_backlog(enc, &targets);
            return Ok(());
        }

        let block_millis = match block {
            Some(millis) => millis,
            None => {
                enc.write_array_header(0);
                return Ok(());
            }
        };

        // One shared capacity-1 channel: the first append to any of the
        // named streams wins, later wake-ups are dropped.
        let (tx, mut rx) = mpsc::channel::<Delivery>(1);
        let mut guard = SubscriptionGuard { subs: Vec::new() };
        for (index, target) in targets.iter().enumerate() {
            if let Some(stream) = &target.stream {
                stream.subscribe(tx.clone(), index as u64);
                guard.subs.push((Arc::clone(stream), tx.clone()));
            }
        }

        // An append may have raced the subscriptions; check once more
        // before sleeping so it is not missed entirely.
        if targets.iter().any(target_has_backlog) {
            write_backlog(enc, &targets);
            return Ok(());
        }

        let delivery = if block_millis == 0 {
            rx.recv().await
        } else {
            match tokio::time::timeout(Duration::from_millis(block_millis), rx.recv()).await {
                Ok(delivery) => delivery,
                Err(_) => None, // timer won the race
            }
        };
        drop(guard);

        match delivery {
            Some(delivery) => {
                let target = &targets[delivery.subscription_id as usize];
                enc.write_array_header(1);
                enc.write_array_header(2);
                enc.write_bulk(&target.name);
                write_entries(enc, &[delivery.entry]);
            }
            // Timed out with nothing to report.
            None => enc.write_null(),
        }
        Ok(())
    }

    /// Parses `XREAD [BLOCK ms] STREAMS name... id...` and resolves each
    /// stream. Streams are created on demand only when the command can
    /// block, since a subscription needs a stream object to attach to.
    fn parse_xread(&self, cmd: &[String]) -> Result<(Option<u64>, Vec<ReadTarget>)> {
        let mut at = 1;

        let block = match cmd.get(at) {
            Some(opt) if opt.eq_ignore_ascii_case("block") => {
                let millis: u64 = cmd
                    .get(at + 1)
                    .ok_or(MarlinError::Syntax)?
                    .parse()
                    .map_err(|_| MarlinError::NotAnInteger)?;
                at += 2;
                Some(millis)
            }
            _ => None,
        };

        match cmd.get(at) {
            Some(opt) if opt.eq_ignore_ascii_case("streams") => at += 1,
            _ => return Err(MarlinError::Syntax),
        }

        let rest = &cmd[at..];
        if rest.is_empty() || rest.len() % 2 != 0 {
            return Err(MarlinError::WrongArity("xread".to_string()));
        }
        let count = rest.len() / 2;

        let mut targets = Vec::with_capacity(count);
        for i in 0..count {
            let name = rest[i].clone();
            let id_text = &rest[count + i];

            let stream = if block.is_some() {
                Some(self.db().get_or_create_stream(&name)?)
            } else {
                self.db().get_stream(&name)?
            };
            let last = stream.as_ref().map(|s| s.last_id()).unwrap_or(EntryId::MIN);

            // "$" means "whatever the stream holds now"; an explicit id
            // means "everything after this one".
            let (seen, from) = if id_text == "$" {
                (last, Some(last))
            } else {
                let parsed = parse_entry_id(id_text, last)?;
                let (next, overflow) = parsed.next();
                (parsed, (!overflow).then_some(next))
            };

            targets.push(ReadTarget {
                name,
                stream,
                seen,
                from,
            });
        }

        Ok((block, targets))
    }
}

/// Returns true when the stream has entries past the id the caller has
/// seen.
fn target_has_backlog(target: &ReadTarget) -> bool {
    target
        .stream
        .as_ref()
        .is_some_and(|stream| stream.last_id() > target.seen)
}

/// Encodes the per-stream result sets for an immediate XREAD reply,
/// skipping streams with nothing to report.
fn write_backlog(enc: &mut ReplyEncoder, targets: &[ReadTarget]) {
    let mut results: Vec<(&str, Vec<Entry>)> = Vec::new();
    for target in targets {
        let (Some(stream), Some(from)) = (&target.stream, target.from) else {
            continue;
        };
        let entries = stream.range(from, EntryId::MAX);
        if !entries.is_empty() {
            results.push((target.name.as_str(), entries));
        }
    }

    enc.write_array_header(results.len());
    for (name, entries) in results {
        enc.write_array_header(2);
        enc.write_bulk(name);
        write_entries(enc, &entries);
    }
}

/// Encodes entries as `[id, [field, value, ...]]` pairs.
fn write_entries(enc: &mut ReplyEncoder, entries: &[Entry]) {
    enc.write_array_header(entries.len());
    for entry in entries {
        enc.write_array_header(2);
        enc.write_bulk(&entry.id.to_string());
        enc.write_array_header(entry.fields.len() * 2);
        for (field, value) in &entry.fields {
            enc.write_bulk(field);
            enc.write_bulk(value);
        }
    }
}
