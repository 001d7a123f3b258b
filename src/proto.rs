//! Protocol line parser.
//!
//! One command per newline-terminated line.  The grammar has two
//! delimiter levels: the verb is the text before the first space, the
//! remainder (if non-empty) is argument slot 1, and slot 1 is then split
//! on `/` at most two further times to fill slots 2 and 3.  The split
//! always runs, so user names and messages must not contain the
//! delimiter active at their position; nothing is escaped.
//!
//! Record ids are kept as raw text here: the session layer parses them
//! and needs the original spelling for its replies.

/// A parsed protocol request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `USER <name>` -- register a user name for this session.
    User(String),
    /// `READ <id>` -- look up a record.
    Read(String),
    /// `WRITE <message>` -- append a record through the coordinator.
    Write(String),
    /// `REPLACE <id>/<message>` -- overwrite a record through the
    /// coordinator.
    Replace { id: String, message: String },
    /// `QUIT` -- end the session.
    Quit,
    /// `SYNC_ON` -- peer-only: open a synchronization transaction.
    SyncOn,
    /// `SYNC_OFF` -- peer-only: commit and close the transaction.
    SyncOff,
    /// `SYNC_ABORT` -- peer-only: revert, close the transaction, end the
    /// session.
    SyncAbort,
    /// `SYNC_WRITE <user>/<message>` -- peer-only: apply an append.
    SyncWrite { user: String, message: String },
    /// `SYNC_REPLACE <id>/<user>/<message>` -- peer-only: apply a
    /// replace.
    SyncReplace {
        id: String,
        user: String,
        message: String,
    },
}

/// Why a line failed to parse.  Both variants carry the verb so the
/// session can pick the right reply sequence (`SYNC_`-prefixed verbs
/// additionally answer `NACK`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Known verb, wrong number of argument slots.
    BadArity { verb: String },
    /// Verb is not part of the protocol.
    UnknownVerb { verb: String },
}

impl ParseError {
    /// The verb the failing line started with.
    pub fn verb(&self) -> &str {
        match self {
            ParseError::BadArity { verb } => verb,
            ParseError::UnknownVerb { verb } => verb,
        }
    }

    /// Whether the verb belongs to the internal replication vocabulary.
    pub fn is_sync(&self) -> bool {
        self.verb().starts_with("SYNC_")
    }
}

/// Parse one protocol line into a typed [`Request`].
///
/// Splits exactly like the wire grammar: verb at the first space, then
/// up to two `/` splits inside the remainder.  A fourth `/` is not a
/// delimiter; it stays inside the last slot.
pub fn parse(line: &str) -> Result<Request, ParseError> {
    let (verb, rest) = match line.split_once(' ') {
        Some((verb, rest)) => (verb, rest),
        None => (line, ""),
    };

    let mut args: Vec<&str> = Vec::new();
    if !rest.is_empty() {
        args.extend(rest.splitn(3, '/'));
    }

    match (verb, args.as_slice()) {
        ("USER", [name]) => Ok(Request::User((*name).to_string())),
        ("READ", [id]) => Ok(Request::Read((*id).to_string())),
        ("WRITE", [message]) => Ok(Request::Write((*message).to_string())),
        ("REPLACE", [id, message]) => Ok(Request::Replace {
            id: (*id).to_string(),
            message: (*message).to_string(),
        }),
        ("QUIT", []) => Ok(Request::Quit),
        ("SYNC_ON", []) => Ok(Request::SyncOn),
        ("SYNC_OFF", []) => Ok(Request::SyncOff),
        ("SYNC_ABORT", []) => Ok(Request::SyncAbort),
        ("SYNC_WRITE", [user, message]) => Ok(Request::SyncWrite {
            user: (*user).to_string(),
            message: (*message).to_string(),
        }),
        ("SYNC_REPLACE", [id, user, message]) => Ok(Request::SyncReplace {
            id: (*id).to_string(),
            user: (*user).to_string(),
            message: (*message).to_string(),
        }),
        (
            "USER" | "READ" | "WRITE" | "REPLACE" | "QUIT" | "SYNC_ON" | "SYNC_OFF"
            | "SYNC_ABORT" | "SYNC_WRITE" | "SYNC_REPLACE",
            _,
        ) => Err(ParseError::BadArity {
            verb: verb.to_string(),
        }),
        _ => Err(ParseError::UnknownVerb {
            verb: verb.to_string(),
        }),
    }
}
