//! Journal codec.
//!
//! The journal is a UTF-8 text file with a five-line header followed by body records, one per
//! line, each terminated by `\n`:
//!
//!   disk-cache-journal
//!   1
//!   100
//!   2
//!
//!   DIRTY 3400330d1dfc7b3d7891d14bf6f36e7c
//!   CLEAN 3400330d1dfc7b3d7891d14bf6f36e7c 832 21054
//!   READ 3400330d1dfc7b3d7891d14bf6f36e7c
//!   REMOVE 3400330d1dfc7b3d7891d14bf6f36e7c
//!
//! The third header line is the application's own version number and the fourth is the number of
//! value slots per entry; both are opaque to the codec but compared for equality when an existing
//! journal is opened. The body records mean:
//!
//! - `DIRTY` lines track that an entry is actively being created or updated. Every successful
//!   `DIRTY` action should be followed by a `CLEAN` or `REMOVE` action. `DIRTY` lines without a
//!   matching `CLEAN` or `REMOVE` indicate that temporary files may need to be deleted.
//! - `CLEAN` lines track that an entry has been successfully published and may be read. A publish
//!   line is followed by the lengths of each of its values.
//! - `READ` lines track accesses for LRU.
//! - `REMOVE` lines track entries that have been deleted.
//!
//! The codec is purely in-memory: it parses and formats header and record lines, while the engine
//! owns reading, appending, replaying, and compacting the journal file itself.

use snafu::Snafu;

/// File name of the current journal, relative to the cache directory.
pub const JOURNAL_FILE: &str = "journal";

/// File name the journal is rebuilt under before atomically replacing [`JOURNAL_FILE`].
pub const JOURNAL_FILE_BACKUP: &str = "journal.bkp";

/// Magic string identifying the journal format.
pub const MAGIC: &str = "disk-cache-journal";

/// Version of the journal format itself, as distinct from the application version.
pub const VERSION: &str = "1";

const RECORD_CLEAN: &str = "CLEAN";
const RECORD_DIRTY: &str = "DIRTY";
const RECORD_REMOVE: &str = "REMOVE";
const RECORD_READ: &str = "READ";

/// Error that occurred when validating the journal header.
///
/// Any header error is unrecoverable as far as the journal is concerned: the on-disk state was
/// written by a different format, a different application version, or a cache configured with a
/// different number of value slots, and the engine responds by purging the directory and starting
/// fresh.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum JournalHeaderError {
    /// The header was missing lines, or the fifth line was not empty.
    #[snafu(display("journal header is malformed"))]
    Malformed,

    /// The magic string or journal format version did not match.
    #[snafu(display("unexpected journal magic/version: [{magic:?}, {version:?}]"))]
    FormatMismatch { magic: String, version: String },

    /// The application version or value count did not match this cache's configuration.
    #[snafu(display("unexpected journal parameters: [{app_version:?}, {value_count:?}]"))]
    ParameterMismatch {
        app_version: String,
        value_count: String,
    },
}

/// Error that occurred when parsing a journal body line.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum JournalLineError {
    /// The line did not start with a known record kind.
    #[snafu(display("unexpected journal line: {line:?}"))]
    UnknownRecord { line: String },

    /// The line had the wrong number of tokens for its record kind.
    #[snafu(display("malformed journal line: {line:?}"))]
    MalformedRecord { line: String },

    /// A `CLEAN` record carried a length that was not a decimal integer.
    #[snafu(display("unexpected value length in journal line: {line:?}"))]
    InvalidLength { line: String },
}

/// A single journal body record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JournalRecord {
    /// An edit has begun for the entry.
    Dirty { key: String },
    /// An edit has been committed, with the resulting length of each value slot.
    Clean { key: String, lengths: Vec<u64> },
    /// The entry has been removed.
    Remove { key: String },
    /// A snapshot of the entry was taken.
    Read { key: String },
}

impl JournalRecord {
    /// Formats this record as a journal line, including the trailing newline.
    pub fn encode(&self) -> String {
        match self {
            JournalRecord::Dirty { key } => format!("{RECORD_DIRTY} {key}\n"),
            JournalRecord::Clean { key, lengths } => {
                let mut line = format!("{RECORD_CLEAN} {key}");
                for length in lengths {
                    line.push(' ');
                    line.push_str(&length.to_string());
                }
                line.push('\n');
                line
            }
            JournalRecord::Remove { key } => format!("{RECORD_REMOVE} {key}\n"),
            JournalRecord::Read { key } => format!("{RECORD_READ} {key}\n"),
        }
    }

    /// Gets the key this record applies to.
    pub fn key(&self) -> &str {
        match self {
            JournalRecord::Dirty { key }
            | JournalRecord::Clean { key, .. }
            | JournalRecord::Remove { key }
            | JournalRecord::Read { key } => key,
        }
    }
}

/// Formats the five-line journal header.
pub fn encode_header(app_version: u32, value_count: usize) -> String {
    format!("{MAGIC}\n{VERSION}\n{app_version}\n{value_count}\n\n")
}

/// Validates the five header lines of an existing journal against this cache's configuration.
///
/// # Errors
///
/// If the header is missing lines, carries a different magic or format version, or was written
/// for a different application version or value count, an error variant will be returned
/// describing the mismatch.
pub fn validate_header(
    lines: &mut impl Iterator<Item = impl AsRef<str>>,
    app_version: u32,
    value_count: usize,
) -> Result<(), JournalHeaderError> {
    let mut next = || {
        lines
            .next()
            .map(|line| line.as_ref().to_string())
            .ok_or(JournalHeaderError::Malformed)
    };

    let magic = next()?;
    let version = next()?;
    let header_app_version = next()?;
    let header_value_count = next()?;
    let blank = next()?;

    if magic != MAGIC || version != VERSION {
        return Err(JournalHeaderError::FormatMismatch { magic, version });
    }

    if header_app_version != app_version.to_string()
        || header_value_count != value_count.to_string()
        || !blank.is_empty()
    {
        return Err(JournalHeaderError::ParameterMismatch {
            app_version: header_app_version,
            value_count: header_value_count,
        });
    }

    Ok(())
}

/// Parses a single journal body line.
///
/// `value_count` is the number of value slots configured for the cache, which fixes the number of
/// lengths a `CLEAN` record must carry.
///
/// # Errors
///
/// If the line does not conform to the record grammar, an error variant will be returned
/// describing the problem. The engine treats any such error as the effective end of the journal:
/// the line, and everything after it, is discarded.
pub fn parse_line(line: &str, value_count: usize) -> Result<JournalRecord, JournalLineError> {
    let mut tokens = line.split(' ');
    let kind = tokens.next().unwrap_or_default();
    let key = tokens
        .next()
        .filter(|key| !key.is_empty())
        .ok_or_else(|| JournalLineError::MalformedRecord {
            line: line.to_string(),
        })?
        .to_string();

    match kind {
        RECORD_CLEAN => {
            let lengths = tokens
                .map(|token| {
                    token
                        .parse::<u64>()
                        .map_err(|_| JournalLineError::InvalidLength {
                            line: line.to_string(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            if lengths.len() != value_count {
                return Err(JournalLineError::MalformedRecord {
                    line: line.to_string(),
                });
            }
            Ok(JournalRecord::Clean { key, lengths })
        }
        RECORD_DIRTY | RECORD_REMOVE | RECORD_READ => {
            if tokens.next().is_some() {
                return Err(JournalLineError::MalformedRecord {
                    line: line.to_string(),
                });
            }
            Ok(match kind {
                RECORD_DIRTY => JournalRecord::Dirty { key },
                RECORD_REMOVE => JournalRecord::Remove { key },
                _ => JournalRecord::Read { key },
            })
        }
        _ => Err(JournalLineError::UnknownRecord {
            line: line.to_string(),
        }),
    }
}

/// The body of a journal after parsing.
#[derive(Debug, Default)]
pub struct JournalBody {
    /// Records parsed from well-formed lines, in journal order.
    pub records: Vec<JournalRecord>,
    /// Whether parsing stopped early at a malformed or unterminated line.
    ///
    /// A truncated journal is replayed up to the point of truncation and then compacted, so the
    /// malformed tail is dropped durably.
    pub truncated: bool,
}

/// Parses the body of a journal, given the contents that follow the header.
///
/// Parsing is as tolerant as the grammar allows: well-formed lines before the first malformed or
/// unterminated line are kept, and everything from that point on is discarded and reported via
/// [`JournalBody::truncated`].
pub fn parse_body(contents: &str, value_count: usize) -> JournalBody {
    let mut body = JournalBody::default();
    let mut remaining = contents;

    while !remaining.is_empty() {
        let Some((line, rest)) = remaining.split_once('\n') else {
            // The final line was not newline-terminated, which happens when the process died
            // mid-append. The partial record cannot be trusted.
            body.truncated = true;
            break;
        };
        remaining = rest;

        match parse_line(line, value_count) {
            Ok(record) => body.records.push(record),
            Err(error) => {
                warn!(%error, "Journal body malformed; truncating at bad line.");
                body.truncated = true;
                break;
            }
        }
    }

    body
}
