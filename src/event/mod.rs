
use std::fs;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use log::debug;

use crate::error::{Error, Result};

/// Timestamp pseudo-field, synthesized by the kernel for every event
/// taking part in a histogram.
pub const TIMESTAMP: &str = "common_timestamp";
/// [`TIMESTAMP`] scaled to microseconds.
pub const TIMESTAMP_USECS: &str = "common_timestamp.usecs";

static TIMESTAMP_FIELD: LazyLock<Field> = LazyLock::new(|| Field {
    name: TIMESTAMP.into(),
    size: 8,
    signed: false,
    array: false,
    dynamic: false,
});

static TIMESTAMP_USECS_FIELD: LazyLock<Field> = LazyLock::new(|| Field {
    name: TIMESTAMP_USECS.into(),
    size: 8,
    signed: false,
    array: false,
    dynamic: false,
});

/// One field of an event's record format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    /// Size in bytes. For fixed arrays this is the whole array,
    /// for dynamic arrays the 4-byte location word.
    pub size: u32,
    pub signed: bool,
    pub array: bool,
    /// `__data_loc` array whose length is only known per record.
    pub dynamic: bool,
}

impl Field {
    /// Whether two fields may be matched or compared across events:
    /// all flags and the size must agree.
    pub fn compatible(&self, other: &Field) -> bool {
        self.signed == other.signed
            && self.array == other.array
            && self.dynamic == other.dynamic
            && self.size == other.size
    }

    // Parses one `field:<decl>; offset:N; size:N; signed:N;` line of a
    // format file. Returns None for lines that carry no field.
    fn from_format_line(line: &str) -> Option<Field> {
        let rest = line.trim_start().strip_prefix("field:")?;
        let (decl, attrs) = rest.split_once(';')?;
        let decl = decl.trim();

        let mut size = None;
        let mut signed = None;
        for attr in attrs.split(';') {
            if let Some((key, val)) = attr.split_once(':') {
                match key.trim() {
                    "size" => size = val.trim().parse::<u32>().ok(),
                    "signed" => signed = Some(val.trim() != "0"),
                    _ => {}
                }
            }
        }

        let last = decl.split_whitespace().last()?;
        let (name, array) = match last.split_once('[') {
            Some((name, _)) => (name, true),
            None => (last, decl.contains('[')),
        };
        if name.is_empty() {
            return None;
        }

        Some(Field {
            name: name.into(),
            size: size?,
            signed: signed?,
            array,
            dynamic: decl.starts_with("__data_loc"),
        })
    }
}

/// A kernel trace event and its record format.
#[derive(Clone, Debug)]
pub struct Event {
    pub system: String,
    pub name: String,
    pub fields: Vec<Field>,
}

impl Event {
    pub fn new(system: impl Into<String>, name: impl Into<String>, fields: Vec<Field>) -> Self {
        Self {
            system: system.into(),
            name: name.into(),
            fields,
        }
    }

    /// Parse the contents of an event `format` file.
    ///
    /// The event name is taken from the `name:` line; every `field:`
    /// line becomes one [`Field`].
    pub fn from_format(system: impl Into<String>, text: &str) -> Result<Self> {
        let mut name = None;
        let mut fields = vec![];

        for line in text.lines() {
            if let Some(n) = line.strip_prefix("name:") {
                name = Some(n.trim().to_string());
            } else if let Some(field) = Field::from_format_line(line) {
                fields.push(field);
            }
        }

        let Some(name) = name else {
            return Err(Error::InvalidArgument("format text has no name line"));
        };

        Ok(Self::new(system, name, fields))
    }

    /// Look up a field by name.
    ///
    /// The histogram pseudo-fields [`TIMESTAMP`] and [`TIMESTAMP_USECS`]
    /// resolve on every event.
    pub fn field(&self, name: &str) -> Option<&Field> {
        if let Some(field) = self.fields.iter().find(|f| f.name == name) {
            return Some(field);
        }
        match name {
            TIMESTAMP => Some(&TIMESTAMP_FIELD),
            TIMESTAMP_USECS => Some(&TIMESTAMP_USECS_FIELD),
            _ => None,
        }
    }
}

// Field lookup with the error the builders report.
pub(crate) fn verify_field<'a>(event: &'a Event, name: &str) -> Result<&'a Field> {
    event
        .field(name)
        .ok_or_else(|| Error::NoSuchField(format!("{}/{}: {name}", event.system, event.name)))
}

/// Event metadata database.
///
/// Descriptors resolve events here at construction and keep an
/// [`Arc<Event>`] for their whole life, so the database itself may be
/// dropped once all descriptors are built.
#[derive(Clone, Debug, Default)]
pub struct EventDb {
    events: Vec<Arc<Event>>,
}

impl EventDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, event: Event) {
        self.events.push(Arc::new(event));
    }

    /// Find an event by name. With `system` absent, the first event
    /// carrying `name` wins.
    pub fn find_event(&self, system: Option<&str>, name: &str) -> Option<Arc<Event>> {
        self.events
            .iter()
            .find(|ev| ev.name == name && system.map_or(true, |s| ev.system == s))
            .cloned()
    }

    pub fn events(&self) -> &[Arc<Event>] {
        &self.events
    }

    /// Populate a database from the `events/` tree of a tracing
    /// directory, reading every `events/<system>/<event>/format` file.
    ///
    /// Formats that fail to parse are skipped.
    pub fn load(tracing_dir: impl AsRef<Path>) -> Result<Self> {
        let mut db = Self::new();
        let events_dir = tracing_dir.as_ref().join("events");

        for system in fs::read_dir(&events_dir)? {
            let system = system?.path();
            if !system.is_dir() {
                continue;
            }
            let system_name = match system.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            for event in fs::read_dir(&system)? {
                let format = event?.path().join("format");
                let Ok(text) = fs::read_to_string(&format) else {
                    continue;
                };
                match Event::from_format(system_name.as_str(), &text) {
                    Ok(event) => db.add(event),
                    Err(_) => debug!("skipping unparsable format {}", format.display()),
                }
            }
        }

        Ok(db)
    }
}
