use crate::notify::{format_line, Notifier};
use crate::registry::{BufferRegistry, RegistryError};
use page_proto::{strip_formatting, Command, HDataRecord, Message, MessageKind, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Tag set on lines of private conversations
pub const TAG_NOTIFY_PRIVATE: &str = "notify_private";
/// Tag set on lines carrying a chat message
pub const TAG_PRIVMSG: &str = "irc_privmsg";

/// First relay version answering `ping` with `_pong`
const PING_SINCE: [u32; 3] = [0, 4, 2];

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Buffer tracking error: {0}")]
    Registry(#[from] RegistryError),
}

/// Side effects requested by a handled message
#[derive(Debug, Default, PartialEq)]
pub struct Effects {
    pub commands: Vec<Command>,
    pub heartbeat_acked: bool,
    pub synced: bool,
}

/// Relay version with any pre-release suffix removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteVersion {
    pub version: String,
    numbers: Vec<u32>,
}

impl RemoteVersion {
    pub fn parse(raw: &str) -> Self {
        let end = raw
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(raw.len());
        let version = raw[..end].trim_end_matches('.').to_string();
        let numbers = version
            .split('.')
            .filter_map(|part| part.parse().ok())
            .collect();
        Self { version, numbers }
    }

    pub fn supports_ping(&self) -> bool {
        self.numbers.as_slice() >= &PING_SINCE[..]
    }
}

type Handler = fn(&mut MessageHandler, &Message, &mut Effects) -> Result<(), HandlerError>;

/// Maps each message kind to the function handling it
fn handler_for(kind: MessageKind) -> Handler {
    match kind {
        MessageKind::BufferList => MessageHandler::on_buffer_list,
        MessageKind::BufferOpened => MessageHandler::on_buffer_opened,
        MessageKind::BufferClosing => MessageHandler::on_buffer_closing,
        MessageKind::LineAdded => MessageHandler::on_line_added,
        MessageKind::Pong => MessageHandler::on_pong,
        MessageKind::Misc => MessageHandler::on_misc,
        MessageKind::UpgradeEnded => MessageHandler::on_upgrade_ended,
        MessageKind::Upgrade
        | MessageKind::Nicklist
        | MessageKind::NicklistDiff
        | MessageKind::LocalvarAdded
        | MessageKind::LocalvarChanged
        | MessageKind::LocalvarRemoved
        | MessageKind::TitleChanged
        | MessageKind::Renamed
        | MessageKind::Moved
        | MessageKind::Merged
        | MessageKind::Unmerged
        | MessageKind::TypeChanged
        | MessageKind::Hidden
        | MessageKind::Unhidden
        | MessageKind::Cleared => MessageHandler::on_ignored,
        MessageKind::Unknown => MessageHandler::on_unknown,
    }
}

/// Per-session message state: known buffers and the relay version
pub struct MessageHandler {
    registry: BufferRegistry,
    version: Option<RemoteVersion>,
    notifier: Arc<dyn Notifier>,
}

impl MessageHandler {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            registry: BufferRegistry::new(),
            version: None,
            notifier,
        }
    }

    pub fn registry(&self) -> &BufferRegistry {
        &self.registry
    }

    pub fn version(&self) -> Option<&RemoteVersion> {
        self.version.as_ref()
    }

    /// `ping` once the relay is known to support it, `test` otherwise
    pub fn heartbeat_probe(&self) -> Command {
        match &self.version {
            Some(version) if version.supports_ping() => Command::Ping,
            _ => Command::Test,
        }
    }

    pub fn handle(&mut self, message: &Message) -> Result<Effects, HandlerError> {
        let mut effects = Effects::default();
        handler_for(message.kind())(self, message, &mut effects)?;
        Ok(effects)
    }

    fn on_buffer_list(&mut self, message: &Message, effects: &mut Effects) -> Result<(), HandlerError> {
        for record in hdata_records(message) {
            self.register_buffer(record);
        }
        info!("Tracking {} buffers", self.registry.len());
        effects.synced = true;
        Ok(())
    }

    fn on_buffer_opened(&mut self, message: &Message, effects: &mut Effects) -> Result<(), HandlerError> {
        for record in hdata_records(message) {
            if let Some(pointer) = self.register_buffer(record) {
                effects.commands.push(Command::SyncBuffer(pointer));
            }
        }
        Ok(())
    }

    fn on_buffer_closing(&mut self, message: &Message, effects: &mut Effects) -> Result<(), HandlerError> {
        for record in hdata_records(message) {
            let Some(pointer) = record.root_pointer() else {
                warn!("Closed buffer record without pointer");
                continue;
            };
            effects.commands.push(Command::Desync(pointer.to_string()));
            self.registry.unregister(pointer);
        }
        Ok(())
    }

    /// Every line is evaluated on its own. A line for an unknown buffer does
    /// not stop the rest of the batch; the first such miss is returned.
    fn on_line_added(&mut self, message: &Message, _effects: &mut Effects) -> Result<(), HandlerError> {
        let mut first_miss = None;

        for record in hdata_records(message) {
            if !should_notify(record) {
                continue;
            }

            let Some(pointer) = record.get("buffer").and_then(Value::as_pointer) else {
                warn!("Line record without buffer pointer, not notifying");
                continue;
            };
            let buffer = match self.registry.lookup(pointer) {
                Ok(buffer) => buffer,
                Err(e) => {
                    error!("Dropping notification for line: {}", e);
                    first_miss.get_or_insert(e);
                    continue;
                }
            };

            let prefix = clean_text(record.get("prefix"));
            let text = clean_text(record.get("message"));
            self.notifier.notify(&format_line(buffer, &prefix, &text));
        }

        match first_miss {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn on_pong(&mut self, _message: &Message, effects: &mut Effects) -> Result<(), HandlerError> {
        debug!("Heartbeat acknowledged");
        effects.heartbeat_acked = true;
        Ok(())
    }

    fn on_misc(&mut self, message: &Message, effects: &mut Effects) -> Result<(), HandlerError> {
        if is_test_echo(&message.objects) {
            debug!("Legacy heartbeat acknowledged");
            effects.heartbeat_acked = true;
            return Ok(());
        }

        for object in &message.objects {
            if let Value::Info(info) = object {
                if let (Some("version"), Some(raw)) = (info.name.as_deref(), info.value.as_deref()) {
                    let version = RemoteVersion::parse(raw);
                    info!("Relay version {} (ping supported: {})", version.version, version.supports_ping());
                    self.version = Some(version);
                    continue;
                }
            }
            debug!("Ignoring misc reply object: {:?}", object.type_tag());
        }
        Ok(())
    }

    fn on_upgrade_ended(&mut self, _message: &Message, effects: &mut Effects) -> Result<(), HandlerError> {
        info!("Relay upgrade finished, resyncing buffers");
        effects.commands.push(Command::BufferList);
        effects.commands.push(Command::Sync);
        Ok(())
    }

    fn on_ignored(&mut self, message: &Message, _effects: &mut Effects) -> Result<(), HandlerError> {
        debug!("No action for {}", message.id);
        Ok(())
    }

    fn on_unknown(&mut self, message: &Message, _effects: &mut Effects) -> Result<(), HandlerError> {
        warn!("Unknown message id: {}", message.id);
        Ok(())
    }

    /// Registers a buffer record and returns its pointer
    fn register_buffer(&mut self, record: &HDataRecord) -> Option<String> {
        let Some(pointer) = record.root_pointer() else {
            warn!("Buffer record without pointer");
            return None;
        };

        let direct = record.get("name").and_then(Value::as_str).filter(|n| !n.is_empty());
        let name = direct.or_else(|| {
            record
                .get("local_variables")
                .and_then(Value::as_hashtable)
                .and_then(|vars| vars.get_str("name"))
                .and_then(Value::as_str)
        });

        match name {
            Some(name) => {
                self.registry.register(pointer, name);
                Some(pointer.to_string())
            }
            None => {
                warn!("Buffer {} has no name, not tracking it", pointer);
                None
            }
        }
    }
}

fn hdata_records(message: &Message) -> impl Iterator<Item = &HDataRecord> {
    message
        .objects
        .iter()
        .filter_map(Value::as_hdata)
        .flat_map(|hdata| hdata.records.iter())
}

/// Displayed lines that highlight the user or belong to a private
/// conversation, restricted to actual chat messages. Missing fields mean no.
pub fn should_notify(record: &HDataRecord) -> bool {
    let flag = |name: &str| record.get(name).and_then(Value::as_flag).unwrap_or(false);

    let tags: Vec<&str> = record
        .get("tags_array")
        .and_then(Value::as_array)
        .map(|tags| tags.items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    flag("displayed")
        && (flag("highlight") || tags.contains(&TAG_NOTIFY_PRIVATE))
        && tags.contains(&TAG_PRIVMSG)
}

/// Shape of the reply to the `test` command
fn is_test_echo(objects: &[Value]) -> bool {
    matches!(objects, [Value::Char(b'A'), Value::Int(123456), ..])
}

fn clean_text(value: Option<&Value>) -> String {
    let raw = value.and_then(Value::as_str).unwrap_or_default();
    let stripped = strip_formatting(raw);
    if !stripped.is_clean() {
        warn!("Unknown format characters {:?} in {:?}", stripped.unknown, stripped.text);
    }
    stripped.text
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::notify::testing::RecordingNotifier;
    use page_proto::{Info, MISC_ID};

    fn handler() -> (MessageHandler, RecordingNotifier) {
        let notifier = RecordingNotifier::default();
        (MessageHandler::new(Arc::new(notifier.clone())), notifier)
    }

    const HIGHLIGHT_TAGS: &[&str] = &["irc_privmsg", "notify_message", "nick_alice"];

    #[test]
    fn test_buffer_list_registers_and_syncs() {
        let (mut handler, _) = handler();
        let effects = handler
            .handle(&buffers("buffer_list", &[("0x12345", Some("weechat")), ("0x6789a", Some("#rust"))]))
            .unwrap();

        assert!(effects.synced);
        assert!(effects.commands.is_empty());
        assert_eq!(handler.registry().lookup("0x6789a").unwrap(), "#rust");
    }

    #[test]
    fn test_opened_buffer_resolves_for_lines() {
        let (mut handler, notifier) = handler();

        let effects = handler.handle(&buffers("_buffer_opened", &[("0xabc", Some("#rust"))])).unwrap();
        assert_eq!(effects.commands, vec![Command::SyncBuffer("0xabc".to_string())]);

        let line = line("0xabc", true, true, HIGHLIGHT_TAGS, "\x1905alice", "hey \x19F12you!");
        handler.handle(&lines(vec![line])).unwrap();

        assert_eq!(notifier.messages(), vec!["#rust: alice hey you!"]);
    }

    #[test]
    fn test_opened_buffer_falls_back_to_localvar_name() {
        let (mut handler, _) = handler();
        handler.handle(&opened_with_localvar("0xdef", "bob")).unwrap();
        assert_eq!(handler.registry().lookup("0xdef").unwrap(), "bob");
    }

    #[test]
    fn test_closing_buffer_desyncs_and_forgets() {
        let (mut handler, _) = handler();
        handler.handle(&buffers("_buffer_opened", &[("0xabc", Some("#rust"))])).unwrap();

        let effects = handler.handle(&buffers("_buffer_closing", &[("0xabc", None)])).unwrap();
        assert_eq!(effects.commands, vec![Command::Desync("0xabc".to_string())]);
        assert!(handler.registry().lookup("0xabc").is_err());
    }

    #[test]
    fn test_line_for_unregistered_buffer_is_an_error() {
        let (mut handler, notifier) = handler();
        let line = line("0xfeed", true, true, HIGHLIGHT_TAGS, "alice", "hi");

        let result = handler.handle(&lines(vec![line]));
        assert!(matches!(result, Err(HandlerError::Registry(RegistryError::NotFound(p))) if p == "0xfeed"));
        assert!(notifier.messages().is_empty());
    }

    #[test]
    fn test_unregistered_line_does_not_drop_the_rest_of_the_batch() {
        let (mut handler, notifier) = handler();
        handler.handle(&buffers("buffer_list", &[("0x1", Some("#a"))])).unwrap();

        let stray = line("0xdead", true, true, HIGHLIGHT_TAGS, "eve", "lost");
        let good = line("0x1", true, true, HIGHLIGHT_TAGS, "bob", "hello");
        let result = handler.handle(&lines(vec![stray, good]));

        assert!(matches!(result, Err(HandlerError::Registry(RegistryError::NotFound(p))) if p == "0xdead"));
        assert_eq!(notifier.messages(), vec!["#a: bob hello"]);
    }

    #[test]
    fn test_notify_predicate() {
        assert!(should_notify(&line("0x1", true, true, HIGHLIGHT_TAGS, "a", "b")));
        assert!(should_notify(&line("0x1", true, false, &["irc_privmsg", "notify_private"], "a", "b")));

        // not displayed
        assert!(!should_notify(&line("0x1", false, true, HIGHLIGHT_TAGS, "a", "b")));
        // plain channel chatter
        assert!(!should_notify(&line("0x1", true, false, HIGHLIGHT_TAGS, "a", "b")));
        // highlight on something that is not a chat message
        assert!(!should_notify(&line("0x1", true, true, &["irc_join"], "a", "b")));
        // malformed record
        assert!(!should_notify(&HDataRecord::default()));
    }

    #[test]
    fn test_lines_not_matching_are_skipped() {
        let (mut handler, notifier) = handler();
        handler.handle(&buffers("buffer_list", &[("0x1", Some("#a"))])).unwrap();

        let quiet = line("0x1", true, false, HIGHLIGHT_TAGS, "bob", "nothing");
        let loud = line("0x1", true, true, HIGHLIGHT_TAGS, "bob", "alice: ping");
        handler.handle(&lines(vec![quiet, loud])).unwrap();

        assert_eq!(notifier.messages(), vec!["#a: bob alice: ping"]);
    }

    #[test]
    fn test_version_selects_heartbeat_probe() {
        let (mut handler, _) = handler();
        assert_eq!(handler.heartbeat_probe(), Command::Test);

        let reply = |v: &str| {
            Message::new(
                MISC_ID,
                vec![Value::Info(Info {
                    name: Some("version".to_string()),
                    value: Some(v.to_string()),
                })],
            )
        };

        handler.handle(&reply("0.4.1")).unwrap();
        assert_eq!(handler.heartbeat_probe(), Command::Test);

        handler.handle(&reply("0.4.2-dev")).unwrap();
        assert_eq!(handler.version().unwrap().version, "0.4.2");
        assert_eq!(handler.heartbeat_probe(), Command::Ping);
    }

    #[test]
    fn test_version_parsing() {
        assert!(RemoteVersion::parse("4.1.2").supports_ping());
        assert!(RemoteVersion::parse("0.4.3-rc1").supports_ping());
        assert!(!RemoteVersion::parse("0.4").supports_ping());
        assert!(!RemoteVersion::parse("0.3.9").supports_ping());
        assert_eq!(RemoteVersion::parse("1.0-dev").version, "1.0");
    }

    #[test]
    fn test_heartbeat_replies() {
        let (mut handler, _) = handler();
        assert!(handler.handle(&Message::new("_pong", vec![])).unwrap().heartbeat_acked);

        let echo = Message::new(MISC_ID, vec![Value::Char(b'A'), Value::Int(123456), Value::Long(1i64.into())]);
        assert!(handler.handle(&echo).unwrap().heartbeat_acked);
    }

    #[test]
    fn test_unknown_and_noop_messages() {
        let (mut handler, _) = handler();
        assert_eq!(handler.handle(&Message::new("_brand_new", vec![])).unwrap(), Effects::default());
        assert_eq!(handler.handle(&Message::new("_nicklist", vec![])).unwrap(), Effects::default());
    }

    #[test]
    fn test_upgrade_ended_resyncs() {
        let (mut handler, _) = handler();
        let effects = handler.handle(&Message::new("_upgrade_ended", vec![])).unwrap();
        assert_eq!(effects.commands, vec![Command::BufferList, Command::Sync]);
    }
}
