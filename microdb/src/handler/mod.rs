use std::io::{self, BufRead, BufReader, Write};
use std::net::TcpStream;
use std::path::Path;

use tracing::{info, warn};

use crate::lock::LockFile;
use crate::protocol::{self, Command};
use crate::store::{Store, HEADER};
use crate::ServiceError;

/// Per-client command state: the store, this client's own lock handle and
/// the transaction flag. Kept separate from the socket so the command
/// semantics are testable without a connection.
pub struct Session {
    store: Store,
    lock: LockFile,
    transaction_active: bool,
}

fn reply(text: impl Into<String>) -> String {
    let mut text = text.into();
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

impl Session {
    pub fn open(record_path: &Path) -> io::Result<Session> {
        let lock = LockFile::open(record_path)?;
        Ok(Session {
            store: Store::new(record_path),
            lock,
            transaction_active: false,
        })
    }

    pub fn transaction_active(&self) -> bool {
        self.transaction_active
    }

    /// Produces the single textual response for one request line.
    pub fn respond(&mut self, line: &str) -> String {
        match protocol::parse(line) {
            Command::Query { term } => self.query(&term),
            Command::Begin => self.begin(),
            Command::Commit => self.commit(),
            Command::Add { record } => self.add(&record),
            Command::Modify { id, record } => self.modify(&id, &record),
            Command::Delete { id } => self.delete(&id),
            Command::Unknown { token } => reply(protocol::unknown_command(&token)),
        }
    }

    /// Releases the lock if the connection ends inside a transaction.
    pub fn release(&mut self) {
        if self.transaction_active {
            let _ = self.lock.unlock();
            self.transaction_active = false;
        }
    }

    fn query(&self, term: &str) -> String {
        let lines = match self.store.load() {
            Ok(lines) => lines,
            Err(e) => return reply(format!("ERROR: Failed to read record file: {}", e)),
        };
        let header = lines.first().map(String::as_str).unwrap_or(HEADER);
        let mut out = String::from(header);
        out.push('\n');
        let mut matched = 0usize;
        for line in lines.iter().skip(1) {
            if line.contains(term) {
                out.push_str(line);
                out.push('\n');
                matched += 1;
            }
        }
        if matched == 0 {
            return reply(protocol::no_records(term));
        }
        out
    }

    fn begin(&mut self) -> String {
        if self.transaction_active {
            return reply(protocol::TX_ALREADY_ACTIVE);
        }
        match self.lock.try_exclusive() {
            Ok(true) => {
                self.transaction_active = true;
                reply(protocol::TX_STARTED)
            }
            Ok(false) => reply(protocol::TX_BUSY),
            Err(e) => reply(format!("ERROR: Could not acquire file lock: {}", e)),
        }
    }

    fn commit(&mut self) -> String {
        if !self.transaction_active {
            return reply(protocol::TX_NONE);
        }
        self.transaction_active = false;
        match self.lock.unlock() {
            Ok(()) => reply(protocol::TX_COMMITTED),
            Err(e) => reply(format!("ERROR: Could not release file lock: {}", e)),
        }
    }

    fn add(&mut self, record: &str) -> String {
        if !self.transaction_active {
            return reply(protocol::requires_transaction("ADD"));
        }
        if record.is_empty() {
            return reply("ERROR: ADD command requires record data.");
        }
        let mut lines = match self.store.load() {
            Ok(lines) => lines,
            Err(e) => return reply(format!("ERROR: Failed to read record file: {}", e)),
        };
        if lines.is_empty() {
            lines.push(HEADER.to_string());
        }
        lines.push(record.to_string());
        match self.store.save(&lines) {
            Ok(()) => reply(protocol::record_added(record)),
            Err(_) => reply("ERROR: Failed to write to record file."),
        }
    }

    fn modify(&mut self, id: &str, record: &str) -> String {
        if !self.transaction_active {
            return reply(protocol::requires_transaction("MODIFY"));
        }
        if id.is_empty() || record.is_empty() {
            return reply("ERROR: MODIFY command requires an ID and new record data.");
        }
        let target: i64 = match id.parse() {
            Ok(v) => v,
            Err(_) => return reply(protocol::INVALID_ID),
        };
        let mut lines = match self.store.load() {
            Ok(lines) => lines,
            Err(e) => return reply(format!("ERROR: Failed to read record file: {}", e)),
        };
        let found = lines
            .iter()
            .skip(1)
            .position(|line| record_id(line) == Some(target));
        match found {
            Some(offset) => {
                lines[offset + 1] = record.to_string();
                match self.store.save(&lines) {
                    Ok(()) => reply(protocol::record_modified(id, record)),
                    Err(_) => reply("ERROR: Failed to write to record file."),
                }
            }
            None => reply(protocol::record_not_found(id)),
        }
    }

    fn delete(&mut self, id: &str) -> String {
        if !self.transaction_active {
            return reply(protocol::requires_transaction("DELETE"));
        }
        if id.is_empty() {
            return reply("ERROR: DELETE command requires an ID.");
        }
        let target: i64 = match id.parse() {
            Ok(v) => v,
            Err(_) => return reply(protocol::INVALID_ID),
        };
        let lines = match self.store.load() {
            Ok(lines) => lines,
            Err(e) => return reply(format!("ERROR: Failed to read record file: {}", e)),
        };
        let mut kept: Vec<String> = Vec::with_capacity(lines.len());
        let mut found = false;
        for (index, line) in lines.iter().enumerate() {
            if index > 0 && !found && record_id(line) == Some(target) {
                found = true;
                continue;
            }
            kept.push(line.clone());
        }
        if !found {
            return reply(protocol::record_not_found(id));
        }
        match self.store.save(&kept) {
            Ok(()) => reply(protocol::record_deleted(id)),
            Err(_) => reply("ERROR: Failed to write to record file."),
        }
    }
}

/// Integer identifier of a record line, `None` when the first
/// comma-delimited field does not parse.
fn record_id(line: &str) -> Option<i64> {
    line.split(',').next()?.trim().parse().ok()
}

/// One admitted client: a [`Session`] attached to its connection.
pub struct Handler {
    stream: TcpStream,
    session: Session,
}

impl Handler {
    /// Opens the session for an admitted connection. An open failure is
    /// reported to the client before the error is returned.
    pub fn start(mut stream: TcpStream, record_path: &Path) -> Result<Handler, ServiceError> {
        match Session::open(record_path) {
            Ok(session) => Ok(Handler { stream, session }),
            Err(e) => {
                let _ = stream.write_all(b"ERROR: Server internal error opening record file.\n");
                Err(e.into())
            }
        }
    }

    /// The command loop. Runs until the client disconnects; a read error
    /// counts as a disconnect, a response write failure is fatal.
    pub fn run(mut self) -> Result<(), ServiceError> {
        let peer = self.stream.peer_addr().ok();
        info!(?peer, "handler serving client");
        let mut reader = BufReader::new(self.stream.try_clone()?);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let response = self.session.respond(&line);
                    self.stream.write_all(response.as_bytes())?;
                }
                Err(e) => {
                    warn!(?peer, error = %e, "read failed, treating as disconnect");
                    break;
                }
            }
        }
        if self.session.transaction_active() {
            warn!(?peer, "client disconnected during an active transaction, lock released");
        }
        self.session.release();
        info!(?peer, "client disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn seeded(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("data.csv");
        std::fs::write(&path, format!("{}\n1,Ana,25,Cordoba,Gen1\n", HEADER)).expect("seed");
        path
    }

    #[test]
    fn mutations_require_a_transaction() {
        let dir = tempdir().expect("tempdir");
        let mut session = Session::open(&seeded(&dir)).expect("open");
        assert_eq!(
            session.respond("ADD 2,Luis,40,Rosario,Gen2"),
            "ERROR: ADD requires an active transaction.\n"
        );
        assert_eq!(
            session.respond("MODIFY 1 1,Ana,26,Cordoba,Gen1"),
            "ERROR: MODIFY requires an active transaction.\n"
        );
        assert_eq!(
            session.respond("DELETE 1"),
            "ERROR: DELETE requires an active transaction.\n"
        );
    }

    #[test]
    fn begin_commit_toggle_and_reject_when_misused() {
        let dir = tempdir().expect("tempdir");
        let mut session = Session::open(&seeded(&dir)).expect("open");
        assert_eq!(session.respond("COMMIT_TRANSACTION"), format!("{}\n", protocol::TX_NONE));
        assert_eq!(session.respond("BEGIN_TRANSACTION"), format!("{}\n", protocol::TX_STARTED));
        assert_eq!(
            session.respond("BEGIN_TRANSACTION"),
            format!("{}\n", protocol::TX_ALREADY_ACTIVE)
        );
        assert_eq!(
            session.respond("COMMIT_TRANSACTION"),
            format!("{}\n", protocol::TX_COMMITTED)
        );
    }

    #[test]
    fn concurrent_sessions_conflict_on_begin() {
        let dir = tempdir().expect("tempdir");
        let path = seeded(&dir);
        let mut first = Session::open(&path).expect("open first");
        let mut second = Session::open(&path).expect("open second");

        assert_eq!(first.respond("BEGIN_TRANSACTION"), format!("{}\n", protocol::TX_STARTED));
        assert_eq!(second.respond("BEGIN_TRANSACTION"), format!("{}\n", protocol::TX_BUSY));
        first.respond("COMMIT_TRANSACTION");
        assert_eq!(second.respond("BEGIN_TRANSACTION"), format!("{}\n", protocol::TX_STARTED));
    }

    #[test]
    fn modify_then_query_reflects_the_change() {
        let dir = tempdir().expect("tempdir");
        let mut session = Session::open(&seeded(&dir)).expect("open");
        session.respond("BEGIN_TRANSACTION");
        assert_eq!(
            session.respond("MODIFY 1 1,Ana,26,Cordoba,Gen1"),
            "Record ID 1 modified to: 1,Ana,26,Cordoba,Gen1\n"
        );
        session.respond("COMMIT_TRANSACTION");
        let response = session.respond("QUERY Ana");
        assert_eq!(
            response,
            format!("{}\n1,Ana,26,Cordoba,Gen1\n", HEADER)
        );
    }

    #[test]
    fn delete_then_query_reports_no_records() {
        let dir = tempdir().expect("tempdir");
        let mut session = Session::open(&seeded(&dir)).expect("open");
        session.respond("BEGIN_TRANSACTION");
        assert_eq!(session.respond("DELETE 1"), "Record ID 1 deleted.\n");
        session.respond("COMMIT_TRANSACTION");
        assert_eq!(session.respond("QUERY Ana"), "No records found for 'Ana'.\n");
    }

    #[test]
    fn invalid_and_missing_identifiers() {
        let dir = tempdir().expect("tempdir");
        let mut session = Session::open(&seeded(&dir)).expect("open");
        session.respond("BEGIN_TRANSACTION");
        assert_eq!(
            session.respond("MODIFY abc 9,Ana,30,Salta,Gen1"),
            format!("{}\n", protocol::INVALID_ID)
        );
        assert_eq!(
            session.respond("DELETE abc"),
            format!("{}\n", protocol::INVALID_ID)
        );
        assert_eq!(
            session.respond("DELETE 42"),
            "ERROR: Record with ID 42 not found.\n"
        );
    }

    #[test]
    fn add_to_an_empty_file_prepends_the_header() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("fresh.csv");
        let mut session = Session::open(&path).expect("open");
        session.respond("BEGIN_TRANSACTION");
        assert_eq!(
            session.respond("ADD 5,Pedro,35,Mendoza,Gen3"),
            "Record added: 5,Pedro,35,Mendoza,Gen3\n"
        );
        session.respond("COMMIT_TRANSACTION");
        let contents = std::fs::read_to_string(&path).expect("read");
        assert_eq!(contents, format!("{}\n5,Pedro,35,Mendoza,Gen3\n", HEADER));
    }

    #[test]
    fn query_matches_the_raw_line_including_the_id() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data.csv");
        std::fs::write(
            &path,
            format!("{}\n1,Ana,25,Cordoba,Gen1\n21,Luis,31,Rosario,Gen2\n", HEADER),
        )
        .expect("seed");
        let mut session = Session::open(&path).expect("open");
        let response = session.respond("QUERY 1");
        // Substring match runs over the whole line, so both records hit.
        assert!(response.contains("1,Ana,25,Cordoba,Gen1"));
        assert!(response.contains("21,Luis,31,Rosario,Gen2"));
    }

    #[test]
    fn unknown_commands_list_the_vocabulary() {
        let dir = tempdir().expect("tempdir");
        let mut session = Session::open(&seeded(&dir)).expect("open");
        let response = session.respond("PING");
        assert!(response.starts_with("ERROR: Unknown command 'PING'."));
        assert!(response.contains("Available commands:"));
    }
}
