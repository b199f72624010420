//! Wire grammar and canned messages.
//!
//! Requests are newline-framed lines whose first whitespace-delimited
//! token selects the command. Responses are plain text and always end in
//! a newline. Clients recognize admission state by substring: the ready
//! and your-turn messages switch them into command mode, a message
//! containing `Connection refused` terminates them, anything else keeps
//! them waiting.

pub static READY: &str = "Connected and ready to process commands";
pub static YOUR_TURN: &str = "Your turn! Processing your request now";
pub static REFUSED: &str = "Connection refused: the server is at full capacity. Try again later.";
static REFUSAL_MARK: &str = "Connection refused";

pub static TX_STARTED: &str = "Transaction started. File locked.";
pub static TX_BUSY: &str = "ERROR: Another transaction is active. Please reattempt later.";
pub static TX_ALREADY_ACTIVE: &str = "ERROR: A transaction is already active for this client.";
pub static TX_COMMITTED: &str = "Transaction committed. File unlocked.";
pub static TX_NONE: &str = "ERROR: No active transaction to commit.";
pub static INVALID_ID: &str = "ERROR: Invalid ID format.";

pub fn queued_notice(position: usize) -> String {
    format!("Server busy. You are in the waiting queue at position {}.", position)
}

pub fn requires_transaction(command: &str) -> String {
    format!("ERROR: {} requires an active transaction.", command)
}

pub fn record_added(record: &str) -> String {
    format!("Record added: {}", record)
}

pub fn record_modified(id: &str, record: &str) -> String {
    format!("Record ID {} modified to: {}", id, record)
}

pub fn record_deleted(id: &str) -> String {
    format!("Record ID {} deleted.", id)
}

pub fn record_not_found(id: &str) -> String {
    format!("ERROR: Record with ID {} not found.", id)
}

pub fn no_records(term: &str) -> String {
    format!("No records found for '{}'.", term)
}

pub fn unknown_command(token: &str) -> String {
    format!(
        "ERROR: Unknown command '{}'.\nAvailable commands: QUERY <term>, BEGIN_TRANSACTION, \
         COMMIT_TRANSACTION, ADD <data>, MODIFY <id> <data>, DELETE <id>, EXIT.",
        token
    )
}

/// True when `message` admits the client into command mode.
pub fn is_ready_message(message: &str) -> bool {
    message.contains(READY) || message.contains(YOUR_TURN)
}

/// True when `message` tells the client to give up.
pub fn is_refusal(message: &str) -> bool {
    message.contains(REFUSAL_MARK)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Query { term: String },
    Begin,
    Commit,
    Add { record: String },
    Modify { id: String, record: String },
    Delete { id: String },
    Unknown { token: String },
}

/// Splits one request line into a command. Argument validation is left to
/// the handler so rejects carry the command-specific message.
pub fn parse(line: &str) -> Command {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut parts = line.trim_start().splitn(2, char::is_whitespace);
    let token = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim_start();

    match token {
        "QUERY" => Command::Query {
            term: rest.to_string(),
        },
        "BEGIN_TRANSACTION" => Command::Begin,
        "COMMIT_TRANSACTION" => Command::Commit,
        "ADD" => Command::Add {
            record: rest.to_string(),
        },
        "MODIFY" => {
            let mut args = rest.splitn(2, char::is_whitespace);
            let id = args.next().unwrap_or("").to_string();
            let record = args.next().unwrap_or("").trim_start().to_string();
            Command::Modify { id, record }
        }
        "DELETE" => {
            let id = rest
                .split_whitespace()
                .next()
                .unwrap_or("")
                .to_string();
            Command::Delete { id }
        }
        other => Command::Unknown {
            token: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_command() {
        assert_eq!(
            parse("QUERY Ana\n"),
            Command::Query {
                term: "Ana".to_string()
            }
        );
        assert_eq!(parse("BEGIN_TRANSACTION"), Command::Begin);
        assert_eq!(parse("COMMIT_TRANSACTION\r\n"), Command::Commit);
        assert_eq!(
            parse("ADD 5,Pedro,35,Mendoza,Gen3"),
            Command::Add {
                record: "5,Pedro,35,Mendoza,Gen3".to_string()
            }
        );
        assert_eq!(
            parse("MODIFY 1 1,Ana,26,Cordoba,Gen1"),
            Command::Modify {
                id: "1".to_string(),
                record: "1,Ana,26,Cordoba,Gen1".to_string()
            }
        );
        assert_eq!(
            parse("DELETE 2"),
            Command::Delete {
                id: "2".to_string()
            }
        );
    }

    #[test]
    fn unknown_and_empty_tokens() {
        assert_eq!(
            parse("PING"),
            Command::Unknown {
                token: "PING".to_string()
            }
        );
        assert_eq!(
            parse("\n"),
            Command::Unknown {
                token: "".to_string()
            }
        );
    }

    #[test]
    fn arguments_may_be_missing() {
        assert_eq!(parse("ADD"), Command::Add { record: String::new() });
        assert_eq!(
            parse("MODIFY 3"),
            Command::Modify {
                id: "3".to_string(),
                record: String::new()
            }
        );
        assert_eq!(parse("DELETE"), Command::Delete { id: String::new() });
    }

    #[test]
    fn admission_substrings() {
        assert!(is_ready_message("Welcome! Connected and ready to process commands\n"));
        assert!(is_ready_message(YOUR_TURN));
        assert!(!is_ready_message(&queued_notice(1)));
        assert!(is_refusal(REFUSED));
        assert!(!is_refusal(READY));
    }
}
