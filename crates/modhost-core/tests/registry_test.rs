//! Registry behaviour across extension lifecycles.
//!
//! Tests the single-winner handover on reload, batch-wide slot checks,
//! official-only efunctions, shared hook types and version flags, command
//! override chains and timed events.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use modhost_core::extension::{ModuleInfo, ModuleReturn, StaticBinary};
use modhost_core::registry::{CommandCall, OverrideLink, SlotState};
use modhost_core::{Error, Loader, ModuleError, Registries, Runtime, RuntimeConfig};

type Greeter = fn() -> &'static str;

fn ok(_: &mut ModuleInfo<'_>) -> ModuleReturn {
    ModuleReturn::Success
}

fn basic(name: &str) -> modhost_core::extension::StaticBinaryBuilder {
    StaticBinary::builder(name)
        .description("registry test extension")
        .init(ok)
        .load(ok)
        .unload(ok)
}

fn runtime(dir: &tempfile::TempDir, load: &[&str]) -> Runtime {
    let config = RuntimeConfig {
        module_dir: dir.path().join("modules"),
        tmp_dir: dir.path().join("tmp"),
        load: load.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    };
    Runtime::new(config)
}

fn hello() -> &'static str {
    "hello"
}

fn register_greeter(info: &mut ModuleInfo<'_>) -> ModuleReturn {
    info.callback_add(3, hello as Greeter);
    ModuleReturn::Success
}

#[test]
fn test_reload_hands_over_callback() {
    let config = RuntimeConfig {
        module_dir: std::env::temp_dir().join("modhost-registry-test"),
        ..Default::default()
    };
    let mut loader = Loader::new(&config);
    loader.register_builtin(basic("m_greeter").init(register_greeter).build());
    let mut regs = Registries::new();

    let first = loader.load("m_greeter", &mut regs).unwrap().unwrap();
    assert!(loader.init_all_testing(&mut regs).is_empty());
    regs.check(false).unwrap();
    regs.switchover(|_| false);
    loader.load_all(&mut regs);
    let first_handle = match regs.callbacks.state(3) {
        SlotState::Active(h) => h,
        other => panic!("unexpected state {:?}", other),
    };
    assert_eq!(regs.callbacks.active_fn::<Greeter>(3).map(|f| f()), Some("hello"));

    // A second generation registers while the first is still published.
    let second = loader.load("m_greeter", &mut regs).unwrap().unwrap();
    assert!(loader.init_all_testing(&mut regs).is_empty());
    let candidate = match regs.callbacks.state(3) {
        SlotState::Handover { active, candidate } => {
            assert_eq!(active, first_handle);
            candidate
        }
        other => panic!("unexpected state {:?}", other),
    };
    regs.check(true).unwrap();
    regs.switchover(|_| false);
    assert_eq!(regs.callbacks.active(3).unwrap().owner, Some(second));

    loader.unload_all_loaded(&mut regs);
    assert!(loader.get(first).is_none());
    assert_eq!(regs.callbacks.state(3), SlotState::Active(candidate));
    assert_eq!(regs.callbacks.entries(3).len(), 1);
}

fn bye() -> &'static str {
    "bye"
}

fn claim_slot_seven(info: &mut ModuleInfo<'_>) -> ModuleReturn {
    info.callback_add(7, hello as Greeter);
    ModuleReturn::Success
}

fn also_claim_slot_seven(info: &mut ModuleInfo<'_>) -> ModuleReturn {
    info.callback_add(7, bye as Greeter);
    ModuleReturn::Success
}

#[test]
fn test_duplicate_callback_blocks_switchover() {
    let dir = tempfile::tempdir().unwrap();
    let mut rt = runtime(&dir, &["m_cb_one", "m_cb_two"]);
    rt.register_builtin(basic("m_cb_one").init(claim_slot_seven).build());
    rt.register_builtin(basic("m_cb_two").init(also_claim_slot_seven).build());

    let err = rt.start().unwrap_err();
    match &err {
        Error::SlotCheck(problems) => {
            assert_eq!(problems.len(), 1);
            assert!(problems[0].contains("type 7"));
            assert!(problems[0].contains("2 registrants"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(rt.loader().is_empty());
    assert!(rt.registries().callbacks.is_empty());
    assert_eq!(rt.registries().callbacks.state(7), SlotState::Empty);
}

fn join_impl() -> &'static str {
    "joined"
}

fn provide_join(info: &mut ModuleInfo<'_>) -> ModuleReturn {
    info.mark_official();
    info.efunction_add(20, join_impl as Greeter);
    ModuleReturn::Success
}

static THIRD_PARTY_REFUSED: AtomicBool = AtomicBool::new(false);

fn third_party_join(info: &mut ModuleInfo<'_>) -> ModuleReturn {
    let refused = info.efunction_add(20, join_impl as Greeter).is_none();
    THIRD_PARTY_REFUSED.store(refused && info.error() == ModuleError::Invalid, Ordering::Release);
    ModuleReturn::Success
}

#[test]
fn test_required_efunction_must_be_provided() {
    let dir = tempfile::tempdir().unwrap();
    let mut rt = runtime(&dir, &[]);
    rt.declare_efunction(20, "do_join");
    let err = rt.start().unwrap_err();
    assert!(err.to_string().contains("efunction 'do_join' not found"));
}

#[test]
fn test_only_official_extensions_provide_efunctions() {
    let dir = tempfile::tempdir().unwrap();
    let mut rt = runtime(&dir, &["m_thirdjoin"]);
    rt.register_builtin(basic("m_thirdjoin").init(third_party_join).build());
    rt.declare_efunction(20, "do_join");
    assert!(rt.start().is_err());
    assert!(THIRD_PARTY_REFUSED.load(Ordering::Acquire));

    let mut rt = runtime(&dir, &["m_join"]);
    rt.register_builtin(basic("m_join").init(provide_join).build());
    rt.declare_efunction(20, "do_join");
    assert!(rt.start().unwrap().is_empty());
    assert_eq!(
        rt.registries().efunctions.active_fn::<Greeter>(20).map(|f| f()),
        Some("joined")
    );

    rt.unload("m_join").unwrap();
    assert_eq!(rt.registries().efunctions.state(20), SlotState::Empty);
}

static FIRST_TYPE: AtomicU32 = AtomicU32::new(0);
static SECOND_TYPE: AtomicU32 = AtomicU32::new(0);

fn join_can_join(info: &mut ModuleInfo<'_>) -> ModuleReturn {
    let id = info.hooktype_add("can_join").unwrap_or_default();
    FIRST_TYPE.store(id, Ordering::Release);
    info.versionflag_add('S');
    ModuleReturn::Success
}

fn join_can_join_upper(info: &mut ModuleInfo<'_>) -> ModuleReturn {
    let id = info.hooktype_add("CAN_JOIN").unwrap_or_default();
    SECOND_TYPE.store(id, Ordering::Release);
    info.versionflag_add('S');
    ModuleReturn::Success
}

#[test]
fn test_hooktypes_and_versionflags_are_shared() {
    let dir = tempfile::tempdir().unwrap();
    let mut rt = runtime(&dir, &["m_gate_a", "m_gate_b"]);
    rt.register_builtin(basic("m_gate_a").init(join_can_join).build());
    rt.register_builtin(basic("m_gate_b").init(join_can_join_upper).build());
    rt.start().unwrap();

    let id = FIRST_TYPE.load(Ordering::Acquire);
    assert_eq!(id, modhost_core::registry::FIRST_HOOKTYPE_ID);
    assert_eq!(SECOND_TYPE.load(Ordering::Acquire), id);
    let hooktype = rt.registries().hooktypes.find("Can_Join").unwrap();
    assert_eq!(hooktype.parents.len(), 2);
    assert_eq!(rt.registries().versionflags.flags(), "S");

    rt.unload("m_gate_a").unwrap();
    assert_eq!(rt.registries().hooktypes.find("can_join").unwrap().parents.len(), 1);
    assert!(rt.registries().versionflags.find('S').is_some());

    rt.unload("m_gate_b").unwrap();
    assert!(rt.registries().hooktypes.find("can_join").is_none());
    assert!(rt.registries().versionflags.is_empty());
}

fn base_privmsg(call: &mut CommandCall) -> i32 {
    call.reply("base");
    0
}

fn outer_override(link: &OverrideLink<'_>, call: &mut CommandCall) -> i32 {
    call.reply("outer");
    link.call_next(call)
}

fn inner_override(link: &OverrideLink<'_>, call: &mut CommandCall) -> i32 {
    call.reply(format!("inner:{}", link.command_name()));
    link.call_next(call)
}

fn install_inner(info: &mut ModuleInfo<'_>) -> ModuleReturn {
    info.cmdoverride_add("privmsg", inner_override);
    ModuleReturn::Success
}

fn install_outer(info: &mut ModuleInfo<'_>) -> ModuleReturn {
    info.cmdoverride_add("PRIVMSG", outer_override);
    ModuleReturn::Success
}

#[test]
fn test_override_chain_runs_newest_first() {
    let dir = tempfile::tempdir().unwrap();
    let mut rt = runtime(&dir, &["m_inner", "m_outer"]);
    rt.registries_mut()
        .commands
        .add("PRIVMSG", base_privmsg, None)
        .unwrap();
    rt.register_builtin(basic("m_inner").init(install_inner).build());
    rt.register_builtin(basic("m_outer").init(install_outer).build());
    rt.start().unwrap();

    let mut call = CommandCall::new("alice", vec!["#rust".into(), "hi".into()]);
    assert_eq!(rt.registries().commands.dispatch("privmsg", &mut call), Some(0));
    assert_eq!(call.replies, vec!["outer", "inner:PRIVMSG", "base"]);
    assert!(rt
        .listing(true)
        .iter()
        .any(|l| l == "Override: PRIVMSG "));

    rt.unload("m_outer").unwrap();
    let mut call = CommandCall::new("alice", vec![]);
    rt.registries().commands.dispatch("PRIVMSG", &mut call);
    assert_eq!(call.replies, vec!["inner:PRIVMSG", "base"]);

    rt.unload("m_inner").unwrap();
    assert!(!rt.registries().commands.find("privmsg").unwrap().is_overridden());
    assert!(rt.registries().commands.dispatch("NOTICE", &mut call).is_none());
}

fn register_kick(info: &mut ModuleInfo<'_>) -> ModuleReturn {
    info.command_add("KICK", base_privmsg);
    ModuleReturn::Success
}

#[test]
fn test_extension_commands_go_with_their_owner() {
    let dir = tempfile::tempdir().unwrap();
    let mut rt = runtime(&dir, &["m_kick"]);
    rt.register_builtin(basic("m_kick").init(register_kick).build());
    rt.start().unwrap();
    assert!(rt.registries().commands.find("kick").is_some());

    rt.unload("m_kick").unwrap();
    assert!(rt.registries().commands.is_empty());
}

static TICKS: AtomicUsize = AtomicUsize::new(0);
static FOREVER_TICKS: AtomicUsize = AtomicUsize::new(0);

fn count_tick(_: &mut Registries) {
    TICKS.fetch_add(1, Ordering::AcqRel);
}

fn count_forever(_: &mut Registries) {
    FOREVER_TICKS.fetch_add(1, Ordering::AcqRel);
}

fn schedule_events(info: &mut ModuleInfo<'_>) -> ModuleReturn {
    info.event_add("twice", Duration::from_secs(1), Some(2), count_tick);
    info.event_add("forever", Duration::from_secs(1), None, count_forever);
    ModuleReturn::Success
}

#[test]
fn test_events_run_on_tick_and_die_with_owner() {
    let dir = tempfile::tempdir().unwrap();
    let mut rt = runtime(&dir, &["m_timer"]);
    rt.register_builtin(basic("m_timer").load(schedule_events).build());
    rt.start().unwrap();
    assert_eq!(rt.registries().events.len(), 2);

    let start = Instant::now();
    assert_eq!(rt.tick(start + Duration::from_secs(2)), 2);
    assert_eq!(rt.tick(start + Duration::from_secs(4)), 2);
    assert_eq!(TICKS.load(Ordering::Acquire), 2);
    assert_eq!(rt.registries().events.len(), 1);

    // Held lock: nothing runs.
    {
        let _guard = rt.registries().event_lock.acquire();
        assert_eq!(rt.tick(start + Duration::from_secs(6)), 0);
    }
    assert_eq!(FOREVER_TICKS.load(Ordering::Acquire), 2);

    rt.unload("m_timer").unwrap();
    assert!(rt.registries().events.is_empty());
}
