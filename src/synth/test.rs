use std::fs;
use std::path::Path;

use pretty_assertions::assert_eq;

use super::{Calc, Handler, Selection, Synth};
use crate::error::Error;
use crate::event::{Event, EventDb, Field, TIMESTAMP_USECS};
use crate::filter::{Compare, Item};
use crate::hist::HistCommand;
use crate::instance::Instance;

fn field(name: &str, size: u32, signed: bool) -> Field {
    Field {
        name: name.into(),
        size,
        signed,
        array: false,
        dynamic: false,
    }
}

fn sched_db() -> EventDb {
    let mut db = EventDb::new();
    db.add(Event::new(
        "sched",
        "sched_waking",
        vec![
            field("common_pid", 4, true),
            field("pid", 4, true),
            field("prio", 4, true),
            Field {
                array: true,
                ..field("comm", 16, false)
            },
        ],
    ));
    db.add(Event::new(
        "sched",
        "sched_switch",
        vec![
            field("common_pid", 4, true),
            field("prev_pid", 4, true),
            field("prev_prio", 4, true),
            field("next_pid", 4, true),
            field("next_prio", 4, true),
        ],
    ));
    db
}

// Wakeup-latency shaped descriptor with a pinned argument prefix so
// generated variable names are predictable.
fn wakeup_synth() -> Synth {
    let mut synth = Synth::new(
        &sched_db(),
        "wakeup_lat",
        Some("sched"),
        "sched_waking",
        Some("sched"),
        "sched_switch",
        "pid",
        "next_pid",
        Some("pid"),
    )
    .unwrap();
    synth.arg_name = "__arg_1_".to_string();
    synth
}

#[test]
fn test_minimal_synthetic() {
    let synth = wakeup_synth();

    assert_eq!(synth.synthetic_event_line(), "wakeup_lat s32 pid;");
    assert_eq!(synth.start_trigger(), "hist:keys=pid");
    assert_eq!(
        synth.end_trigger(),
        "hist:keys=next_pid:pid=next_pid:onmatch(sched.sched_waking).trace(wakeup_lat,$pid)",
    );
    assert!(synth.complete());
}

#[test]
fn test_constructor_errors() {
    let db = sched_db();

    let err = Synth::new(
        &db, "lat", None, "nope", None, "sched_switch", "pid", "next_pid", None,
    )
    .unwrap_err();
    assert!(matches!(err, Error::NoSuchEvent(_)));

    let err = Synth::new(
        &db, "lat", None, "sched_waking", None, "sched_switch", "bogus", "next_pid", None,
    )
    .unwrap_err();
    assert!(matches!(err, Error::NoSuchField(_)));

    // comm is a string, next_pid a number.
    let err = Synth::new(
        &db, "lat", None, "sched_waking", None, "sched_switch", "comm", "next_pid", None,
    )
    .unwrap_err();
    assert!(matches!(err, Error::IncompatibleFields(_, _)));
}

#[test]
fn test_match_without_name_only_adds_keys() {
    let mut synth = wakeup_synth();
    synth
        .add_match_field("common_pid", "common_pid", None)
        .unwrap();

    assert_eq!(synth.start_trigger(), "hist:keys=pid,common_pid");
    assert_eq!(synth.synthetic_event_line(), "wakeup_lat s32 pid;");
    assert_eq!(
        synth.end_trigger(),
        "hist:keys=next_pid,common_pid:pid=next_pid\
         :onmatch(sched.sched_waking).trace(wakeup_lat,$pid)",
    );
}

#[test]
fn test_failed_match_leaves_descriptor_unchanged() {
    let mut synth = wakeup_synth();
    let before = synth.end_trigger();

    assert!(synth.add_match_field("pid", "bogus", None).is_err());
    assert!(synth.add_match_field("comm", "next_pid", None).is_err());

    assert_eq!(synth.start_keys, vec!["pid"]);
    assert_eq!(synth.end_keys, vec!["next_pid"]);
    assert_eq!(synth.end_trigger(), before);
}

#[test]
fn test_compare_field_delta() {
    let mut synth = wakeup_synth();
    synth
        .add_compare_field(TIMESTAMP_USECS, TIMESTAMP_USECS, Calc::DeltaEnd, "delta")
        .unwrap();
    synth.trace(Handler::Match).unwrap();

    assert_eq!(synth.synthetic_event_line(), "wakeup_lat s32 pid; u64 delta;");
    assert_eq!(
        synth.start_trigger(),
        "hist:keys=pid:__arg_1_1=common_timestamp.usecs",
    );
    assert_eq!(
        synth.end_trigger(),
        "hist:keys=next_pid:pid=next_pid,delta=common_timestamp.usecs-$__arg_1_1\
         :onmatch(sched.sched_waking).trace(wakeup_lat,$pid,$delta)",
    );
}

#[test]
fn test_compare_calcs() {
    let mut synth = wakeup_synth();
    synth
        .add_compare_field("prio", "next_prio", Calc::DeltaStart, "dropped")
        .unwrap();
    synth
        .add_compare_field("prio", "next_prio", Calc::Add, "both")
        .unwrap();

    assert_eq!(
        synth.end_vars,
        vec![
            "pid=next_pid",
            "dropped=$__arg_1_1-next_prio",
            "both=next_prio+$__arg_1_2",
        ],
    );
    assert_eq!(
        synth.start_vars,
        vec!["__arg_1_1=prio", "__arg_1_2=prio"],
    );
}

#[test]
fn test_compare_rejects_strings() {
    let mut synth = wakeup_synth();

    // No field on the end event is string-compatible with comm, so
    // pair comm with itself via a start-only descriptor instead.
    let db = sched_db();
    let mut start_only =
        Synth::start_only(&db, "lat", Some("sched"), "sched_waking").unwrap();
    let err = start_only
        .add_compare_field("comm", "comm", Calc::DeltaEnd, "c")
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let err = synth
        .add_compare_field("pid", "next_pid", Calc::DeltaEnd, "")
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn test_add_start_field() {
    let mut synth = wakeup_synth();
    synth.add_start_field("prio", Some("wprio")).unwrap();

    assert_eq!(synth.synthetic_event_line(), "wakeup_lat s32 pid; s32 wprio;");
    assert_eq!(synth.start_trigger(), "hist:keys=pid:__arg_1_1=prio");
    assert_eq!(
        synth.end_trigger(),
        "hist:keys=next_pid:pid=next_pid,wprio=$__arg_1_1\
         :onmatch(sched.sched_waking).trace(wakeup_lat,$pid,$wprio)",
    );
}

#[test]
fn test_add_end_field() {
    let mut synth = wakeup_synth();
    synth.add_end_field("next_prio", Some("nprio")).unwrap();

    assert_eq!(synth.synthetic_event_line(), "wakeup_lat s32 pid; s32 nprio;");
    assert_eq!(
        synth.end_trigger(),
        "hist:keys=next_pid:pid=next_pid,nprio=next_prio\
         :onmatch(sched.sched_waking).trace(wakeup_lat,$pid,$nprio)",
    );
}

#[test]
fn test_add_end_field_unnamed_keeps_field_name() {
    let mut synth = wakeup_synth();
    synth.add_end_field("prev_pid", None).unwrap();

    // The declaration keeps the raw field name, the variable slot is
    // generated.
    assert_eq!(
        synth.synthetic_event_line(),
        "wakeup_lat s32 pid; s32 prev_pid;",
    );
    assert_eq!(synth.end_vars, vec!["pid=next_pid", "__arg_1_1=prev_pid"]);
    assert_eq!(synth.synthetic_args, vec!["$pid", "$__arg_1_1"]);
}

#[test]
fn test_generated_args_are_unique() {
    let mut synth = wakeup_synth();
    synth.add_start_field("prio", None).unwrap();
    synth.add_end_field("prev_pid", None).unwrap();

    assert_eq!(
        synth.start_vars,
        vec!["__arg_1_1=prio"],
    );
    assert_eq!(
        synth.end_vars,
        vec!["pid=next_pid", "prio=$__arg_1_1", "__arg_1_2=prev_pid"],
    );
}

#[test]
fn test_onmax_requires_known_end_var() {
    let mut synth = wakeup_synth();
    synth
        .add_compare_field(TIMESTAMP_USECS, TIMESTAMP_USECS, Calc::DeltaEnd, "delta")
        .unwrap();
    let before = synth.end_trigger();

    let err = synth.trace(Handler::Max("nonexistent_var")).unwrap_err();
    assert!(matches!(err, Error::NoSuchField(_)));
    assert_eq!(synth.end_trigger(), before);

    synth.trace(Handler::Max("delta")).unwrap();
    assert_eq!(
        synth.end_trigger(),
        "hist:keys=next_pid:pid=next_pid,delta=common_timestamp.usecs-$__arg_1_1\
         :onmax($delta).trace(wakeup_lat,$pid,$delta)",
    );
}

#[test]
fn test_snapshot_and_save() {
    let mut synth = wakeup_synth();
    synth
        .add_compare_field(TIMESTAMP_USECS, TIMESTAMP_USECS, Calc::DeltaEnd, "delta")
        .unwrap();

    assert!(matches!(
        synth.snapshot(Handler::Match),
        Err(Error::InvalidArgument(_)),
    ));
    assert!(matches!(
        synth.save(Handler::Match, &["prev_pid"]),
        Err(Error::InvalidArgument(_)),
    ));
    assert!(matches!(
        synth.save(Handler::Max("delta"), &["bogus"]),
        Err(Error::NoSuchField(_)),
    ));

    synth.snapshot(Handler::Change("delta")).unwrap();
    synth
        .save(Handler::Max("delta"), &["prev_pid", "next_prio"])
        .unwrap();

    assert_eq!(
        synth.end_trigger(),
        "hist:keys=next_pid:pid=next_pid,delta=common_timestamp.usecs-$__arg_1_1\
         :onchange($delta).snapshot():onmax($delta).save(prev_pid,next_prio)",
    );
}

#[test]
fn test_actions_keep_insertion_order() {
    let mut synth = wakeup_synth();
    synth
        .add_compare_field(TIMESTAMP_USECS, TIMESTAMP_USECS, Calc::DeltaEnd, "delta")
        .unwrap();
    synth.trace(Handler::Match).unwrap();
    synth.snapshot(Handler::Max("delta")).unwrap();

    assert_eq!(
        synth.end_trigger(),
        "hist:keys=next_pid:pid=next_pid,delta=common_timestamp.usecs-$__arg_1_1\
         :onmatch(sched.sched_waking).trace(wakeup_lat,$pid,$delta)\
         :onmax($delta).snapshot()",
    );
}

#[test]
fn test_filters() {
    let mut synth = wakeup_synth();
    synth
        .append_start_filter(Item::OpenParen)
        .unwrap();
    synth
        .append_start_filter(Item::Compare {
            field: "prio",
            op: Compare::Lt,
            val: "100",
        })
        .unwrap();
    synth
        .append_end_filter(Item::Compare {
            field: "next_prio",
            op: Compare::Ge,
            val: "0",
        })
        .unwrap();

    // Parens left open by the builder are closed by the serializer.
    assert_eq!(synth.start_trigger(), "hist:keys=pid if (prio < 100)");
    assert_eq!(
        synth.end_trigger(),
        "hist:keys=next_pid:pid=next_pid\
         :onmatch(sched.sched_waking).trace(wakeup_lat,$pid) if next_prio >= 0",
    );

    // Filter fields resolve against the owning side.
    assert!(synth
        .append_start_filter(Item::And)
        .and_then(|_| synth.append_start_filter(Item::Compare {
            field: "next_prio",
            op: Compare::Eq,
            val: "0",
        }))
        .is_err());
}

#[test]
fn test_create_requires_well_formed_filters() {
    let dir = tempfile::tempdir().unwrap();
    let mut synth = wakeup_synth();
    synth
        .append_end_filter(Item::Compare {
            field: "next_prio",
            op: Compare::Ge,
            val: "0",
        })
        .unwrap();
    synth.append_end_filter(Item::And).unwrap();

    let err = synth.create(&Instance::from_dir(dir.path())).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn test_start_hist_from_match_keys() {
    let synth = wakeup_synth();
    let hist = synth.start_hist().unwrap();

    assert_eq!(hist.system(), "sched");
    assert_eq!(hist.event_name(), "sched_waking");
    assert_eq!(hist.command_line(HistCommand::Start), "hist:keys=pid");
}

#[test]
fn test_start_hist_from_selection() {
    let db = sched_db();
    let mut synth = Synth::start_only(&db, "wakeups", Some("sched"), "sched_waking").unwrap();
    synth.arg_name = "__arg_1_".to_string();
    synth.add_start_field("pid", None).unwrap();
    synth
        .add_start_selection("prio", None, Selection::Counter)
        .unwrap();
    synth
        .append_start_filter(Item::Compare {
            field: "prio",
            op: Compare::Lt,
            val: "100",
        })
        .unwrap();

    let hist = synth.start_hist().unwrap();
    assert_eq!(
        hist.command_line(HistCommand::Start),
        "hist:keys=pid:vals=prio if prio < 100",
    );

    // All counters leaves no key to build a histogram on.
    let mut counters = Synth::start_only(&db, "c", Some("sched"), "sched_waking").unwrap();
    counters
        .add_start_selection("prio", None, Selection::Counter)
        .unwrap();
    assert!(counters.start_hist().is_err());
}

#[test]
fn test_start_only_lifecycle() {
    let db = sched_db();
    let mut synth = Synth::start_only(&db, "lat", Some("sched"), "sched_waking").unwrap();
    assert!(!synth.complete());

    let dir = tempfile::tempdir().unwrap();
    let instance = Instance::from_dir(dir.path());
    assert!(matches!(synth.create(&instance), Err(Error::NotConfigured)));
    assert!(matches!(synth.show(&instance), Err(Error::NotConfigured)));

    synth.set_end_event(&db, Some("sched"), "sched_switch").unwrap();
    assert!(synth.complete());
    assert!(matches!(
        synth.set_end_event(&db, Some("sched"), "sched_switch"),
        Err(Error::InvalidArgument(_)),
    ));

    // Still no match pair, still not installable.
    assert!(matches!(synth.create(&instance), Err(Error::NotConfigured)));

    synth.add_match_field("pid", "next_pid", None).unwrap();
    assert!(synth.show(&instance).is_ok());
}

fn fake_tracing_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("synthetic_events"), "").unwrap();
    for event in ["sched/sched_waking", "sched/sched_switch"] {
        let event_dir = dir.path().join("events").join(event);
        fs::create_dir_all(&event_dir).unwrap();
        fs::write(event_dir.join("trigger"), "").unwrap();
    }
    let enable_dir = dir.path().join("events/synthetic/wakeup_lat");
    fs::create_dir_all(&enable_dir).unwrap();
    fs::write(enable_dir.join("enable"), "1").unwrap();
    dir
}

fn read(dir: &Path, rel: &str) -> String {
    fs::read_to_string(dir.join(rel)).unwrap()
}

#[test]
fn test_create_writes_all_three_files() {
    let dir = fake_tracing_dir();
    let instance = Instance::from_dir(dir.path());

    wakeup_synth().create(&instance).unwrap();

    assert_eq!(read(dir.path(), "synthetic_events"), "wakeup_lat s32 pid;");
    assert_eq!(
        read(dir.path(), "events/sched/sched_waking/trigger"),
        "hist:keys=pid",
    );
    assert_eq!(
        read(dir.path(), "events/sched/sched_switch/trigger"),
        "hist:keys=next_pid:pid=next_pid:onmatch(sched.sched_waking).trace(wakeup_lat,$pid)",
    );
}

#[test]
fn test_create_rolls_back_on_failure() {
    let dir = fake_tracing_dir();
    // No trigger file on the end event: the last create step fails.
    fs::remove_file(dir.path().join("events/sched/sched_switch/trigger")).unwrap();
    let instance = Instance::from_dir(dir.path());

    let err = wakeup_synth().create(&instance).unwrap_err();
    assert!(matches!(err, Error::Io(_)));

    // The first two steps were undone with ! appends.
    assert_eq!(
        read(dir.path(), "synthetic_events"),
        "wakeup_lat s32 pid;!wakeup_lat s32 pid;",
    );
    assert_eq!(
        read(dir.path(), "events/sched/sched_waking/trigger"),
        "hist:keys=pid!hist:keys=pid",
    );
}

#[test]
fn test_destroy_reverses_create() {
    let dir = fake_tracing_dir();
    let instance = Instance::from_dir(dir.path());
    let synth = wakeup_synth();

    synth.create(&instance).unwrap();
    synth.destroy(&instance).unwrap();

    assert_eq!(read(dir.path(), "events/synthetic/wakeup_lat/enable"), "0");
    assert_eq!(
        read(dir.path(), "synthetic_events"),
        "wakeup_lat s32 pid;!wakeup_lat s32 pid;",
    );
    assert_eq!(
        read(dir.path(), "events/sched/sched_waking/trigger"),
        "hist:keys=pid!hist:keys=pid",
    );
    assert_eq!(
        read(dir.path(), "events/sched/sched_switch/trigger"),
        "hist:keys=next_pid:pid=next_pid:onmatch(sched.sched_waking).trace(wakeup_lat,$pid)\
         !hist:keys=next_pid:pid=next_pid:onmatch(sched.sched_waking).trace(wakeup_lat,$pid)",
    );
}

#[test]
fn test_destroy_is_best_effort() {
    let dir = fake_tracing_dir();
    // Start trigger gone: that step fails but the others still run.
    fs::remove_file(dir.path().join("events/sched/sched_waking/trigger")).unwrap();
    let instance = Instance::from_dir(dir.path());

    let err = wakeup_synth().destroy(&instance).unwrap_err();
    assert!(matches!(err, Error::Io(_)));

    assert_eq!(read(dir.path(), "synthetic_events"), "!wakeup_lat s32 pid;");
    assert!(read(dir.path(), "events/sched/sched_switch/trigger").starts_with("!hist:keys="));
}

#[test]
fn test_show_lists_create_commands() {
    let instance = Instance::from_dir("/t");
    let synth = wakeup_synth();

    let out = synth.show(&instance).unwrap();
    assert_eq!(
        out,
        "echo 'wakeup_lat s32 pid;' > /t/synthetic_events\n\
         echo 'hist:keys=pid' > /t/events/sched/sched_waking/trigger\n\
         echo 'hist:keys=next_pid:pid=next_pid:onmatch(sched.sched_waking).trace(wakeup_lat,$pid)' \
         > /t/events/sched/sched_switch/trigger\n",
    );

    // Pure function of descriptor state.
    assert_eq!(out, synth.show(&instance).unwrap());
}
