
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::event::{Event, EventDb};
use crate::filter::{Filter, Item};
use crate::instance::Instance;

/// Sort token for the per-bucket hit counter, present on every
/// histogram without being declared as a key or value.
pub const HITCOUNT: &str = "hitcount";

const ASCENDING: &str = ".ascending";
const DESCENDING: &str = ".descending";

/// Key format modifiers understood by the histogram trigger parser.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyType {
    Normal,
    Hex,
    Sym,
    SymOffset,
    Syscall,
    Execname,
    Log2,
    Usecs,
}

impl KeyType {
    fn suffix(self) -> Option<&'static str> {
        match self {
            KeyType::Normal => None,
            KeyType::Hex => Some("hex"),
            KeyType::Sym => Some("sym"),
            KeyType::SymOffset => Some("sym-offset"),
            KeyType::Syscall => Some("syscall"),
            KeyType::Execname => Some("execname"),
            KeyType::Log2 => Some("log2"),
            KeyType::Usecs => Some("usecs"),
        }
    }
}

const KEY_SUFFIXES: &[&str] = &[
    ".hex",
    ".sym-offset",
    ".sym",
    ".syscall",
    ".execname",
    ".log2",
    ".usecs",
];

// "common_pid.hex" sorts as "common_pid".
fn strip_key_suffix(key: &str) -> &str {
    for suffix in KEY_SUFFIXES {
        if let Some(stripped) = key.strip_suffix(suffix) {
            return stripped;
        }
    }
    key
}

fn strip_direction(sort_key: &str) -> &str {
    sort_key
        .strip_suffix(ASCENDING)
        .or_else(|| sort_key.strip_suffix(DESCENDING))
        .unwrap_or(sort_key)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// The command verb a serialized trigger line performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistCommand {
    /// Install and start the histogram.
    Start,
    Pause,
    Continue,
    Clear,
    /// Remove the histogram. The line is the start line prefixed with `!`.
    Destroy,
}

/// An event histogram descriptor.
///
/// Accumulates keys, values, sort order and a filter for one event,
/// then serializes to the trigger line the kernel's histogram parser
/// accepts. Building the descriptor does not touch the system; that is
/// what [`install`][Hist::install] and the verb conveniences are for.
///
/// # Examples
///
/// ```rust
/// use tracefs_hist::event::{Event, EventDb, Field};
/// use tracefs_hist::hist::{Hist, HistCommand, KeyType};
///
/// let mut db = EventDb::new();
/// db.add(Event::new(
///     "sched",
///     "sched_switch",
///     vec![Field {
///         name: "prev_prio".into(),
///         size: 4,
///         signed: true,
///         array: false,
///         dynamic: false,
///     }],
/// ));
///
/// let hist = Hist::new(&db, "sched", "sched_switch", "prev_prio", KeyType::Normal).unwrap();
/// assert_eq!(hist.command_line(HistCommand::Start), "hist:keys=prev_prio");
/// ```
#[derive(Debug)]
pub struct Hist {
    pub(crate) event: Arc<Event>,
    pub(crate) keys: Vec<String>,
    pub(crate) values: Vec<String>,
    pub(crate) sort: Vec<String>,
    pub(crate) size: u32,
    pub(crate) name: Option<String>,
    pub(crate) filter: Filter,
}

impl Hist {
    /// Creates a histogram descriptor on `system`/`event` with one
    /// primary key. More keys, values and sort order can be added
    /// before installing.
    pub fn new(
        db: &EventDb,
        system: &str,
        event: &str,
        key: &str,
        key_type: KeyType,
    ) -> Result<Self> {
        if system.is_empty() || event.is_empty() || key.is_empty() {
            return Err(Error::InvalidArgument("system, event and key are required"));
        }
        let event = db
            .find_event(Some(system), event)
            .ok_or_else(|| Error::NoSuchEvent(format!("{system}/{event}")))?;
        Ok(Self::from_event(event, key, key_type))
    }

    pub(crate) fn from_event(event: Arc<Event>, key: &str, key_type: KeyType) -> Self {
        let mut hist = Self {
            event,
            keys: vec![],
            values: vec![],
            sort: vec![],
            size: 0,
            name: None,
            filter: Filter::default(),
        };
        hist.add_key(key, key_type);
        hist
    }

    pub fn system(&self) -> &str {
        &self.event.system
    }

    pub fn event_name(&self) -> &str {
        &self.event.name
    }

    /// Adds a secondary key, formatted per `key_type`.
    pub fn add_key(&mut self, key: &str, key_type: KeyType) {
        self.keys.push(match key_type.suffix() {
            Some(suffix) => format!("{key}.{suffix}"),
            None => key.to_string(),
        });
    }

    /// Adds a value field to aggregate per bucket.
    pub fn add_value(&mut self, value: &str) {
        self.values.push(value.to_string());
    }

    /// Names the histogram. Histograms with the same name share their
    /// data across events. Naming twice fails.
    pub fn set_name(&mut self, name: &str) -> Result<()> {
        if self.name.is_some() {
            return Err(Error::InvalidArgument("histogram already has a name"));
        }
        self.name = Some(name.to_string());
        Ok(())
    }

    /// Hints the number of buckets. Zero clears the hint.
    pub fn set_size(&mut self, size: u32) {
        self.size = size;
    }

    /// Replaces the sort order. Every entry must be a current key
    /// (type suffix not withstanding), a value, or [`HITCOUNT`]; on
    /// error the previous sort order is kept.
    pub fn add_sort_keys(&mut self, sort_keys: &[&str]) -> Result<()> {
        if sort_keys.is_empty() {
            return Err(Error::InvalidArgument("at least one sort key is required"));
        }
        let mut list = Vec::with_capacity(sort_keys.len());
        for key in sort_keys {
            if !self.is_sortable(key) {
                return Err(Error::NoSuchField((*key).to_string()));
            }
            list.push((*key).to_string());
        }
        self.sort = list;
        Ok(())
    }

    fn is_sortable(&self, sort_key: &str) -> bool {
        sort_key == HITCOUNT
            || self
                .keys
                .iter()
                .any(|k| k == sort_key || strip_key_suffix(k) == sort_key)
            || self.values.iter().any(|v| v == sort_key)
    }

    /// Sets the direction of one sort key. Idempotent; fails when
    /// `sort_key` is not part of the current sort order.
    pub fn set_sort_direction(&mut self, sort_key: &str, dir: SortDirection) -> Result<()> {
        let i = self
            .sort
            .iter()
            .position(|s| s == sort_key || strip_direction(s) == sort_key)
            .ok_or_else(|| Error::NoSuchField(sort_key.to_string()))?;
        let suffix = match dir {
            SortDirection::Ascending => ASCENDING,
            SortDirection::Descending => DESCENDING,
        };
        self.sort[i] = format!("{}{suffix}", strip_direction(&self.sort[i]));
        Ok(())
    }

    /// Appends one token to the filter, validated against the bound
    /// event. See [`Item`] for the grammar.
    pub fn append_filter(&mut self, item: Item<'_>) -> Result<()> {
        self.filter.append(&self.event, item)
    }

    /// The trigger line performing `command`.
    pub fn command_line(&self, command: HistCommand) -> String {
        let mut line = String::new();
        if command == HistCommand::Destroy {
            line.push('!');
        }
        line.push_str("hist:keys=");
        line.push_str(&self.keys.join(","));
        if !self.values.is_empty() {
            line.push_str(":vals=");
            line.push_str(&self.values.join(","));
        }
        if !self.sort.is_empty() {
            line.push_str(":sort=");
            line.push_str(&self.sort.join(","));
        }
        if self.size != 0 {
            line.push_str(&format!(":size={}", self.size));
        }
        match command {
            HistCommand::Pause => line.push_str(":pause"),
            HistCommand::Continue => line.push_str(":cont"),
            HistCommand::Clear => line.push_str(":clear"),
            HistCommand::Start | HistCommand::Destroy => {}
        }
        if let Some(name) = &self.name {
            line.push_str(&format!(":name={name}"));
        }
        if !self.filter.is_empty() {
            line.push_str(&format!(" if {}", self.filter.as_str()));
        }
        line
    }

    /// Writes the trigger line for `command` into the event's
    /// `trigger` file under `instance`. The event must support
    /// histograms (its `hist` file must exist).
    pub fn install(&self, instance: &Instance, command: HistCommand) -> Result<()> {
        let (system, event) = (self.system(), self.event_name());
        if !instance.event_file_exists(system, event, "hist") {
            return Err(Error::NoSuchEvent(format!("{system}/{event} has no hist file")));
        }
        let line = self.command_line(command) + "\n";
        instance.append_event_file(system, event, "trigger", &line)
    }

    pub fn start(&self, instance: &Instance) -> Result<()> {
        self.install(instance, HistCommand::Start)
    }

    pub fn pause(&self, instance: &Instance) -> Result<()> {
        self.install(instance, HistCommand::Pause)
    }

    pub fn resume(&self, instance: &Instance) -> Result<()> {
        self.install(instance, HistCommand::Continue)
    }

    pub fn clear(&self, instance: &Instance) -> Result<()> {
        self.install(instance, HistCommand::Clear)
    }

    pub fn destroy(&self, instance: &Instance) -> Result<()> {
        self.install(instance, HistCommand::Destroy)
    }

    /// The shell command equivalent to [`install`][Hist::install],
    /// without touching the filesystem.
    pub fn show(&self, instance: &Instance, command: HistCommand) -> String {
        let path = instance.event_file(self.system(), self.event_name(), "trigger");
        format!(
            "echo '{}' > {}\n",
            self.command_line(command),
            path.display()
        )
    }
}
