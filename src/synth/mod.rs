#[cfg(test)]
mod test;

use std::sync::Arc;

use log::warn;
use rand::Rng;

use crate::error::{Error, Result};
use crate::event::{verify_field, Event, EventDb, Field};
use crate::filter::{Filter, Item};
use crate::hist::{Hist, KeyType};
use crate::instance::Instance;

const SYNTHETIC_EVENTS: &str = "synthetic_events";

/// When an action fires on the end event's histogram.
///
/// `Max` and `Change` carry the end-side variable they watch; the
/// variable must have been bound by one of the field builders.
#[derive(Clone, Copy, Debug)]
pub enum Handler<'a> {
    /// The start and end keys matched.
    Match,
    /// The variable hit a new maximum.
    Max(&'a str),
    /// The variable changed.
    Change(&'a str),
}

/// How a compared pair of fields is combined into one synthetic value.
#[derive(Clone, Copy, Debug)]
pub enum Calc {
    /// `name = end - start`
    DeltaEnd,
    /// `name = start - end`
    DeltaStart,
    /// `name = end + start`
    Add,
}

/// How a selected start field is used when the start-side histogram is
/// built by [`Synth::start_hist`].
#[derive(Clone, Copy, Debug)]
pub enum Selection {
    /// A histogram key of the given format.
    Key(KeyType),
    /// A histogram value, aggregated instead of bucketing.
    Counter,
}

#[derive(Clone, Debug)]
enum ActionHandler {
    Match,
    Max(String),
    Change(String),
}

#[derive(Clone, Debug)]
enum ActionKind {
    Trace,
    Snapshot,
    Save(Vec<String>),
}

#[derive(Clone, Debug)]
struct Action {
    handler: ActionHandler,
    kind: ActionKind,
}

/// A synthetic event descriptor.
///
/// Pairs a *start* event with an *end* event: when an end event's match
/// keys equal those of an earlier start event, the kernel fires the
/// synthetic event with the fields collected by the builders below.
/// Nothing touches the system until [`create`][Synth::create].
///
/// # Examples
///
/// Wakeup latency, from `sched_waking` to `sched_switch`:
///
/// ```no_run
/// use tracefs_hist::event::EventDb;
/// use tracefs_hist::instance::{tracing_dir, Instance};
/// use tracefs_hist::synth::{Calc, Handler, Synth};
///
/// # fn main() -> tracefs_hist::error::Result<()> {
/// let db = EventDb::load(tracing_dir()?)?;
/// let mut synth = Synth::new(
///     &db,
///     "wakeup_lat",
///     Some("sched"),
///     "sched_waking",
///     Some("sched"),
///     "sched_switch",
///     "pid",
///     "next_pid",
///     Some("pid"),
/// )?;
/// synth.add_compare_field(
///     "common_timestamp.usecs",
///     "common_timestamp.usecs",
///     Calc::DeltaEnd,
///     "delta",
/// )?;
/// synth.trace(Handler::Match)?;
/// synth.create(&Instance::top()?)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Synth {
    name: String,
    start_event: Arc<Event>,
    end_event: Option<Arc<Event>>,
    synthetic_fields: Vec<String>,
    synthetic_args: Vec<String>,
    start_selection: Vec<String>,
    start_type: Vec<Selection>,
    start_keys: Vec<String>,
    end_keys: Vec<String>,
    start_vars: Vec<String>,
    end_vars: Vec<String>,
    start_filter: Filter,
    end_filter: Filter,
    actions: Vec<Action>,
    arg_name: String,
    arg_cnt: u32,
}

impl Synth {
    /// Creates a descriptor with the minimum needed for a synthetic
    /// event: both events and one match-field pair. Passing a system
    /// as `None` picks the first event of that name.
    ///
    /// With `match_name` set, the matched value also becomes a field
    /// of the synthetic event under that name.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: &EventDb,
        name: &str,
        start_system: Option<&str>,
        start_event: &str,
        end_system: Option<&str>,
        end_event: &str,
        start_match: &str,
        end_match: &str,
        match_name: Option<&str>,
    ) -> Result<Self> {
        if start_match.is_empty() || end_match.is_empty() {
            return Err(Error::InvalidArgument("match fields are required"));
        }
        let mut synth = Self::start_only(db, name, start_system, start_event)?;
        synth.set_end_event(db, end_system, end_event)?;
        synth.add_match_field(start_match, end_match, match_name)?;
        Ok(synth)
    }

    /// Creates a descriptor bound to a start event only. It cannot be
    /// [`create`][Synth::create]d until [`set_end_event`][Synth::set_end_event]
    /// completes it, but [`start_hist`][Synth::start_hist] already works.
    pub fn start_only(
        db: &EventDb,
        name: &str,
        system: Option<&str>,
        event: &str,
    ) -> Result<Self> {
        if name.is_empty() || event.is_empty() {
            return Err(Error::InvalidArgument("a name and a start event are required"));
        }
        let start_event = db
            .find_event(system, event)
            .ok_or_else(|| Error::NoSuchEvent(event.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            start_event,
            end_event: None,
            synthetic_fields: vec![],
            synthetic_args: vec![],
            start_selection: vec![],
            start_type: vec![],
            start_keys: vec![],
            end_keys: vec![],
            start_vars: vec![],
            end_vars: vec![],
            start_filter: Filter::default(),
            end_filter: Filter::default(),
            actions: vec![],
            arg_name: String::new(),
            arg_cnt: 0,
        })
    }

    /// Binds the end event of a descriptor built with
    /// [`start_only`][Synth::start_only]. Fails if one is already bound.
    pub fn set_end_event(
        &mut self,
        db: &EventDb,
        system: Option<&str>,
        event: &str,
    ) -> Result<()> {
        if self.end_event.is_some() {
            return Err(Error::InvalidArgument("end event is already bound"));
        }
        if event.is_empty() {
            return Err(Error::InvalidArgument("an end event name is required"));
        }
        self.end_event = Some(
            db.find_event(system, event)
                .ok_or_else(|| Error::NoSuchEvent(event.to_string()))?,
        );
        Ok(())
    }

    /// The synthetic event's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether both events are bound.
    pub fn complete(&self) -> bool {
        self.end_event.is_some()
    }

    fn end_event(&self) -> Result<&Arc<Event>> {
        self.end_event.as_ref().ok_or(Error::NotConfigured)
    }

    // Install and teardown serialize both triggers, which is only
    // meaningful once an end event and a match pair exist.
    fn installable(&self) -> Result<&Arc<Event>> {
        if self.start_keys.is_empty() {
            return Err(Error::NotConfigured);
        }
        self.end_event()
    }

    // Both fields must exist and carry equal flags and size. Returns
    // the start field; the end-event check is skipped while the
    // descriptor is start-only.
    fn verify_pair(&self, start_field: &str, end_field: &str) -> Result<Field> {
        let start = verify_field(&self.start_event, start_field)?;
        if let Some(end_event) = &self.end_event {
            let end = verify_field(end_event, end_field)?;
            if !start.compatible(end) {
                return Err(Error::IncompatibleFields(
                    start_field.to_string(),
                    end_field.to_string(),
                ));
            }
        }
        Ok(start.clone())
    }

    fn new_arg(&mut self) -> String {
        // The random prefix keeps coexisting descriptors from
        // colliding on variable names inside the kernel.
        if self.arg_name.is_empty() {
            let r = rand::thread_rng().gen_range(0..32768u32);
            self.arg_name = format!("__arg_{r}_");
        }
        self.arg_cnt += 1;
        format!("{}{}", self.arg_name, self.arg_cnt)
    }

    fn push_synth_field(&mut self, decl: String, arg: &str) {
        self.synthetic_fields.push(decl);
        self.synthetic_args.push(format!("${arg}"));
    }

    /// Adds another key pair matching start events to end events.
    /// The fields must be compatible. With `name` set, the matched
    /// value also becomes a synthetic field.
    pub fn add_match_field(
        &mut self,
        start_match: &str,
        end_match: &str,
        name: Option<&str>,
    ) -> Result<()> {
        if start_match.is_empty() || end_match.is_empty() {
            return Err(Error::InvalidArgument("match fields are required"));
        }
        let key_field = self.verify_pair(start_match, end_match)?;
        let decl = name.map(|n| synth_field_decl(&key_field, n)).transpose()?;

        self.start_keys.push(start_match.to_string());
        self.end_keys.push(end_match.to_string());
        if let (Some(name), Some(decl)) = (name, decl) {
            self.end_vars.push(binding(name, end_match, false));
            self.push_synth_field(decl, name);
        }
        Ok(())
    }

    /// Stashes a start field in a histogram variable and combines it
    /// with an end field per `calc`; the result becomes the synthetic
    /// field `name`. Strings cannot be compared this way.
    pub fn add_compare_field(
        &mut self,
        start_field: &str,
        end_field: &str,
        calc: Calc,
        name: &str,
    ) -> Result<()> {
        if name.is_empty() || start_field.is_empty() || end_field.is_empty() {
            return Err(Error::InvalidArgument(
                "compare fields and their name are required",
            ));
        }
        let field = self.verify_pair(start_field, end_field)?;
        if field.array || field.dynamic {
            return Err(Error::InvalidArgument(
                "calculations are not allowed on strings",
            ));
        }
        let decl = synth_field_decl(&field, name)?;

        let arg = self.new_arg();
        self.start_vars.push(binding(&arg, start_field, false));
        let compare = match calc {
            Calc::DeltaEnd => format!("{end_field}-${arg}"),
            Calc::DeltaStart => format!("${arg}-{end_field}"),
            Calc::Add => format!("{end_field}+${arg}"),
        };
        self.end_vars.push(binding(name, &compare, false));
        self.push_synth_field(decl, name);
        Ok(())
    }

    /// Records a start-event field in the synthetic event, named
    /// `name` or after the field itself.
    pub fn add_start_field(&mut self, start_field: &str, name: Option<&str>) -> Result<()> {
        self.add_start_selection(start_field, name, Selection::Key(KeyType::Normal))
    }

    /// Like [`add_start_field`][Synth::add_start_field], but also
    /// chooses how the field appears in the stand-alone start
    /// histogram of [`start_hist`][Synth::start_hist]: as a typed key,
    /// or as a counted value.
    pub fn add_start_selection(
        &mut self,
        start_field: &str,
        name: Option<&str>,
        selection: Selection,
    ) -> Result<()> {
        if start_field.is_empty() {
            return Err(Error::InvalidArgument("a start field is required"));
        }
        let field = verify_field(&self.start_event, start_field)?.clone();
        let name = name.unwrap_or(start_field);
        let decl = synth_field_decl(&field, name)?;

        let arg = self.new_arg();
        self.start_vars.push(binding(&arg, start_field, false));
        self.end_vars.push(binding(name, &arg, true));
        self.push_synth_field(decl, name);
        self.start_selection.push(start_field.to_string());
        self.start_type.push(selection);
        Ok(())
    }

    /// Records an end-event field in the synthetic event. Without a
    /// `name`, the synthetic field keeps the raw field name while the
    /// backing variable gets a generated one.
    pub fn add_end_field(&mut self, end_field: &str, name: Option<&str>) -> Result<()> {
        if end_field.is_empty() {
            return Err(Error::InvalidArgument("an end field is required"));
        }
        let end_event = self.end_event()?;
        let field = verify_field(end_event, end_field)?.clone();
        let decl = synth_field_decl(&field, name.unwrap_or(&field.name))?;

        let var = match name {
            Some(name) => name.to_string(),
            None => self.new_arg(),
        };
        self.end_vars.push(binding(&var, end_field, false));
        self.push_synth_field(decl, &var);
        Ok(())
    }

    /// Appends one token to the start event's filter.
    pub fn append_start_filter(&mut self, item: Item<'_>) -> Result<()> {
        let event = self.start_event.clone();
        self.start_filter.append(&event, item)
    }

    /// Appends one token to the end event's filter.
    pub fn append_end_filter(&mut self, item: Item<'_>) -> Result<()> {
        let event = self.end_event()?.clone();
        self.end_filter.append(&event, item)
    }

    fn checked_handler(&self, handler: Handler<'_>) -> Result<ActionHandler> {
        match handler {
            Handler::Match => Ok(ActionHandler::Match),
            Handler::Max(var) | Handler::Change(var) => {
                // The watched variable must be bound on the end event.
                let defined = self
                    .end_vars
                    .iter()
                    .any(|v| v.split_once('=').map(|(lhs, _)| lhs) == Some(var));
                if !defined {
                    return Err(Error::NoSuchField(var.to_string()));
                }
                Ok(match handler {
                    Handler::Max(_) => ActionHandler::Max(var.to_string()),
                    _ => ActionHandler::Change(var.to_string()),
                })
            }
        }
    }

    /// Adds a `trace` action: fire the synthetic event when `handler`
    /// triggers. This is also the default when no action is added.
    pub fn trace(&mut self, handler: Handler<'_>) -> Result<()> {
        let handler = self.checked_handler(handler)?;
        self.actions.push(Action {
            handler,
            kind: ActionKind::Trace,
        });
        Ok(())
    }

    /// Adds a `snapshot` action: snapshot the trace buffer when
    /// `handler` triggers. [`Handler::Match`] is not accepted.
    pub fn snapshot(&mut self, handler: Handler<'_>) -> Result<()> {
        if matches!(handler, Handler::Match) {
            return Err(Error::InvalidArgument(
                "snapshot requires an onmax or onchange handler",
            ));
        }
        let handler = self.checked_handler(handler)?;
        self.actions.push(Action {
            handler,
            kind: ActionKind::Snapshot,
        });
        Ok(())
    }

    /// Adds a `save` action: record the given end-event fields when
    /// `handler` triggers. [`Handler::Match`] is not accepted.
    pub fn save(&mut self, handler: Handler<'_>, fields: &[&str]) -> Result<()> {
        if matches!(handler, Handler::Match) {
            return Err(Error::InvalidArgument(
                "save requires an onmax or onchange handler",
            ));
        }
        let end_event = self.end_event()?;
        for field in fields {
            verify_field(end_event, field)?;
        }
        let handler = self.checked_handler(handler)?;
        self.actions.push(Action {
            handler,
            kind: ActionKind::Save(fields.iter().map(|f| f.to_string()).collect()),
        });
        Ok(())
    }

    /// Builds the histogram the start-side trigger amounts to: match
    /// keys (or the selected start fields while no match pair exists)
    /// become histogram keys, `Counter` selections become values, and
    /// the start filter is carried over. The returned descriptor is
    /// independent of this one.
    pub fn start_hist(&self) -> Result<Hist> {
        let keys = if self.start_keys.is_empty() {
            &self.start_selection
        } else {
            &self.start_keys
        };

        let mut hist: Option<Hist> = None;
        for (i, key) in keys.iter().enumerate() {
            let selection = self
                .start_type
                .get(i)
                .copied()
                .unwrap_or(Selection::Key(KeyType::Normal));
            let Selection::Key(key_type) = selection else {
                continue;
            };
            match &mut hist {
                None => hist = Some(Hist::from_event(self.start_event.clone(), key, key_type)),
                Some(hist) => hist.add_key(key, key_type),
            }
        }
        let mut hist = hist.ok_or(Error::NotConfigured)?;

        for (i, key) in keys.iter().enumerate() {
            if matches!(self.start_type.get(i), Some(Selection::Counter)) {
                hist.add_value(key);
            }
        }

        if !self.start_filter.is_empty() {
            hist.filter = self.start_filter.clone();
        }
        Ok(hist)
    }

    // `<name> <decl> <decl> …` for the synthetic_events file.
    fn synthetic_event_line(&self) -> String {
        let mut line = self.name.clone();
        for field in &self.synthetic_fields {
            line.push(' ');
            line.push_str(field);
        }
        line
    }

    fn start_trigger(&self) -> String {
        with_filter(
            hist_line(&self.start_keys, &self.start_vars),
            &self.start_filter,
        )
    }

    fn end_trigger(&self) -> String {
        let mut line = hist_line(&self.end_keys, &self.end_vars);
        self.push_actions(&mut line);
        with_filter(line, &self.end_filter)
    }

    fn push_actions(&self, line: &mut String) {
        if self.actions.is_empty() {
            // Default is onmatch + trace.
            self.push_onmatch(line);
            self.push_trace(line);
            return;
        }
        for action in &self.actions {
            match &action.handler {
                ActionHandler::Match => self.push_onmatch(line),
                ActionHandler::Max(var) => line.push_str(&format!(":onmax(${var})")),
                ActionHandler::Change(var) => line.push_str(&format!(":onchange(${var})")),
            }
            match &action.kind {
                ActionKind::Trace => self.push_trace(line),
                ActionKind::Snapshot => line.push_str(".snapshot()"),
                ActionKind::Save(fields) => {
                    line.push_str(&format!(".save({})", fields.join(",")));
                }
            }
        }
    }

    fn push_onmatch(&self, line: &mut String) {
        line.push_str(&format!(
            ":onmatch({}.{})",
            self.start_event.system, self.start_event.name
        ));
    }

    fn push_trace(&self, line: &mut String) {
        line.push_str(&format!(".trace({}", self.name));
        for arg in &self.synthetic_args {
            line.push(',');
            line.push_str(arg);
        }
        line.push(')');
    }

    /// Creates the synthetic event on the system: declares it in the
    /// top-level `synthetic_events` file, then installs the start and
    /// end triggers under `instance`. A failed step removes what the
    /// earlier steps installed.
    pub fn create(&self, instance: &Instance) -> Result<()> {
        let end_event = self.installable()?;
        if !self.start_filter.well_formed() || !self.end_filter.well_formed() {
            return Err(Error::InvalidArgument("filter ends in a dangling operator"));
        }

        let synthetic = self.synthetic_event_line();
        instance.append_tracing_file(SYNTHETIC_EVENTS, &synthetic)?;

        let start_trigger = self.start_trigger();
        if let Err(err) = instance.append_event_file(
            &self.start_event.system,
            &self.start_event.name,
            "trigger",
            &start_trigger,
        ) {
            self.undo_synthetic(instance);
            return Err(err);
        }

        if let Err(err) = instance.append_event_file(
            &end_event.system,
            &end_event.name,
            "trigger",
            &self.end_trigger(),
        ) {
            self.undo_trigger(instance, &self.start_event, &start_trigger);
            self.undo_synthetic(instance);
            return Err(err);
        }
        Ok(())
    }

    fn undo_synthetic(&self, instance: &Instance) {
        let line = format!("!{}", self.synthetic_event_line());
        if let Err(err) = instance.append_tracing_file(SYNTHETIC_EVENTS, &line) {
            warn!("failed to remove synthetic event {}: {err}", self.name);
        }
    }

    fn undo_trigger(&self, instance: &Instance, event: &Event, trigger: &str) {
        let line = format!("!{trigger}");
        if let Err(err) =
            instance.append_event_file(&event.system, &event.name, "trigger", &line)
        {
            warn!(
                "failed to remove trigger from {}/{}: {err}",
                event.system, event.name
            );
        }
    }

    /// Removes a synthetic event created with [`create`][Synth::create]:
    /// end trigger, start trigger, then the event declaration, each as
    /// a `!`-prefixed append. Teardown is best-effort; every step is
    /// attempted and the first failure is reported.
    pub fn destroy(&self, instance: &Instance) -> Result<()> {
        let end_event = self.installable()?.clone();

        // An enabled event cannot be torn down; other instances may
        // keep it enabled, in which case the removals below fail too.
        if let Err(err) = instance.disable_event("synthetic", &self.name) {
            warn!("could not disable synthetic event {}: {err}", self.name);
        }

        let mut first_err = None;
        let mut attempt = |result: crate::error::Result<()>| {
            if let Err(err) = result {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        };

        attempt(instance.append_event_file(
            &end_event.system,
            &end_event.name,
            "trigger",
            &format!("!{}", self.end_trigger()),
        ));
        attempt(instance.append_event_file(
            &self.start_event.system,
            &self.start_event.name,
            "trigger",
            &format!("!{}", self.start_trigger()),
        ));
        attempt(
            instance
                .append_tracing_file(SYNTHETIC_EVENTS, &format!("!{}", self.synthetic_event_line())),
        );

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// The shell commands equivalent to [`create`][Synth::create],
    /// without touching the filesystem.
    pub fn show(&self, instance: &Instance) -> Result<String> {
        let end_event = self.installable()?;
        let mut out = String::new();
        out.push_str(&format!(
            "echo '{}' > {}/{SYNTHETIC_EVENTS}\n",
            self.synthetic_event_line(),
            instance.tracing_dir().display()
        ));
        out.push_str(&format!(
            "echo '{}' > {}\n",
            self.start_trigger(),
            instance
                .event_file(&self.start_event.system, &self.start_event.name, "trigger")
                .display()
        ));
        out.push_str(&format!(
            "echo '{}' > {}\n",
            self.end_trigger(),
            instance
                .event_file(&end_event.system, &end_event.name, "trigger")
                .display()
        ));
        Ok(out)
    }
}

fn binding(name: &str, value: &str, is_var: bool) -> String {
    if is_var {
        format!("{name}=${value}")
    } else {
        format!("{name}={value}")
    }
}

fn hist_line(keys: &[String], vars: &[String]) -> String {
    let mut line = format!("hist:keys={}", keys.join(","));
    if !vars.is_empty() {
        line.push(':');
        line.push_str(&vars.join(","));
    }
    line
}

fn with_filter(mut line: String, filter: &Filter) -> String {
    if filter.is_empty() {
        return line;
    }
    line.push_str(" if ");
    line.push_str(filter.as_str());
    for _ in 0..filter.parens() {
        line.push(')');
    }
    line
}

// Maps field metadata to a synthetic-event field declaration.
fn synth_field_decl(field: &Field, name: &str) -> Result<String> {
    if field.array {
        return Ok(if field.dynamic {
            format!("char {name}[];")
        } else {
            format!("char {name}[{}];", field.size)
        });
    }
    let ty = match (field.size, field.signed) {
        (1, false) => "unsigned char",
        (1, true) => "char",
        (2, false) => "u16",
        (2, true) => "s16",
        (4, false) => "u32",
        (4, true) => "s32",
        (8, false) => "u64",
        (8, true) => "s64",
        (size, _) => return Err(Error::BadFormat(size)),
    };
    Ok(format!("{ty} {name};"))
}
