use bytes::{BufMut, BytesMut};
use std::fmt;
use tracing::debug;

use crate::decode::{decode_object, read_string, Cursor};
use crate::encode::{encode_object, put_string};
use crate::framing::LENGTH_SIZE;
use crate::value::Value;
use crate::DecodeError;

/// Identifier given to replies that carry no id
pub const MISC_ID: &str = "misc";

/// Request id attached to the buffer list query
pub const BUFFER_LIST_ID: &str = "buffer_list";

const COMPRESSION_OFF: u8 = 0;

/// A decoded relay frame
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub objects: Vec<Value>,
}

impl Message {
    pub fn new(id: &str, objects: Vec<Value>) -> Self {
        Self {
            id: id.to_string(),
            objects,
        }
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::from_id(&self.id)
    }

    /// Unsolicited events are prefixed with an underscore
    pub fn is_event(&self) -> bool {
        self.id.starts_with('_')
    }
}

/// Decodes one complete frame as produced by [`crate::RelayCodec`]
pub fn decode_message(frame: &[u8]) -> std::result::Result<Message, DecodeError> {
    let mut cursor = Cursor::new(frame);

    let declared = cursor.read_u32()?;
    if declared as usize != frame.len() {
        return Err(DecodeError::LengthMismatch {
            declared,
            actual: frame.len(),
        });
    }

    let compression = cursor.read_u8()?;
    if compression != COMPRESSION_OFF {
        return Err(DecodeError::UnsupportedCompression(compression));
    }

    let id = match read_string(&mut cursor)? {
        Some(id) if !id.is_empty() => id,
        _ => MISC_ID.to_string(),
    };

    let mut objects = Vec::new();
    while !cursor.is_empty() {
        if cursor.remaining() < 3 {
            return Err(DecodeError::TrailingBytes(cursor.remaining()));
        }
        objects.push(decode_object(&mut cursor)?);
    }

    debug!("Decoded message {} with {} objects", id, objects.len());
    Ok(Message { id, objects })
}

/// Builds a complete uncompressed frame. The misc id is written as absent.
pub fn encode_message(message: &Message) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u8(COMPRESSION_OFF);
    if message.id == MISC_ID {
        put_string(None, &mut body);
    } else {
        put_string(Some(&message.id), &mut body);
    }
    for object in &message.objects {
        encode_object(object, &mut body);
    }

    let mut frame = BytesMut::with_capacity(LENGTH_SIZE + body.len());
    frame.put_u32((LENGTH_SIZE + body.len()) as u32);
    frame.put_slice(&body);
    frame
}

/// Message identifiers the client reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    BufferList,
    BufferOpened,
    BufferClosing,
    LineAdded,
    Pong,
    Misc,
    Upgrade,
    UpgradeEnded,
    Nicklist,
    NicklistDiff,
    LocalvarAdded,
    LocalvarChanged,
    LocalvarRemoved,
    TitleChanged,
    Renamed,
    Moved,
    Merged,
    Unmerged,
    TypeChanged,
    Hidden,
    Unhidden,
    Cleared,
    Unknown,
}

impl MessageKind {
    pub fn from_id(id: &str) -> Self {
        match id {
            BUFFER_LIST_ID => MessageKind::BufferList,
            MISC_ID => MessageKind::Misc,
            "_buffer_opened" => MessageKind::BufferOpened,
            "_buffer_closing" => MessageKind::BufferClosing,
            "_buffer_line_added" => MessageKind::LineAdded,
            "_pong" => MessageKind::Pong,
            "_upgrade" => MessageKind::Upgrade,
            "_upgrade_ended" => MessageKind::UpgradeEnded,
            "_nicklist" => MessageKind::Nicklist,
            "_nicklist_diff" => MessageKind::NicklistDiff,
            "_buffer_localvar_added" => MessageKind::LocalvarAdded,
            "_buffer_localvar_changed" => MessageKind::LocalvarChanged,
            "_buffer_localvar_removed" => MessageKind::LocalvarRemoved,
            "_buffer_title_changed" => MessageKind::TitleChanged,
            "_buffer_renamed" => MessageKind::Renamed,
            "_buffer_moved" => MessageKind::Moved,
            "_buffer_merged" => MessageKind::Merged,
            "_buffer_unmerged" => MessageKind::Unmerged,
            "_buffer_type_changed" => MessageKind::TypeChanged,
            "_buffer_hidden" => MessageKind::Hidden,
            "_buffer_unhidden" => MessageKind::Unhidden,
            "_buffer_cleared" => MessageKind::Cleared,
            _ => MessageKind::Unknown,
        }
    }
}

/// Outbound text commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Init { password: String },
    BufferList,
    Sync,
    SyncBuffer(String),
    Desync(String),
    InfoVersion,
    Ping,
    Test,
    Quit,
}

impl Command {
    /// Rendering safe for logs
    pub fn redacted(&self) -> String {
        match self {
            Command::Init { .. } => "init password=***,compression=off".to_string(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Init { password } => {
                write!(f, "init password={},compression=off", password)
            }
            Command::BufferList => {
                write!(f, "({}) hdata buffer:gui_buffers(*) name", BUFFER_LIST_ID)
            }
            Command::Sync => f.write_str("sync"),
            Command::SyncBuffer(pointer) => write!(f, "sync {} *", pointer),
            Command::Desync(pointer) => write!(f, "desync {} *", pointer),
            Command::InfoVersion => f.write_str("info version"),
            Command::Ping => f.write_str("ping"),
            Command::Test => f.write_str("test"),
            Command::Quit => f.write_str("quit"),
        }
    }
}
