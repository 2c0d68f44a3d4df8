//! End-to-end scenarios: broker topics in, bus frames and publishes out.
//!
//! The full service stack runs against the mock HAL: MockMqtt for the
//! broker, MockFrameSink for the bus, MockClock for time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use luxbus::hal::{MockClock, MockFrameSink, MockMqtt, MockRetained};
use luxbus::services::{Api, MqttRunner, OutboundQueue, Publisher};
use luxbus::{ConfigStore, FixedConfig, Lights, LightsSink, Scheduler};

struct Stack {
    config: Arc<ConfigStore>,
    lights: Arc<Lights>,
    clock: MockClock,
    scheduler: Scheduler<MockFrameSink>,
    runner: MqttRunner<MockMqtt>,
}

fn stack() -> Stack {
    static SEQ: AtomicUsize = AtomicUsize::new(0);
    let seq = SEQ.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir();
    let base = format!("luxbus-scenario-{}-{}", std::process::id(), seq);
    let config = Arc::new(ConfigStore::with_paths(
        dir.join(format!("{}.cbor", base)),
        dir.join(format!("{}.cbor~", base)),
    ));

    let fixed = FixedConfig::default().with_topic("lights");
    let outbound = Arc::new(OutboundQueue::with_fixed(&fixed));
    config.attach_outbound(Arc::clone(&outbound));

    let clock = MockClock::new();
    let lights = Arc::new(Lights::with_clock(
        Arc::clone(&config),
        Arc::clone(&outbound),
        Box::new(MockRetained::new()),
        Arc::new(clock.clone()),
    ));

    let scheduler = Scheduler::new(Arc::clone(&lights), MockFrameSink::new());

    let api = Arc::new(Api::new_local(
        fixed.clone(),
        Arc::clone(&config),
        Arc::clone(&lights),
        Arc::clone(&outbound),
        Arc::new(clock.clone()),
        0xCAFE,
    ));
    let publisher = Publisher::new(
        Arc::clone(&lights),
        Arc::clone(&outbound),
        Arc::new(clock.clone()),
        &fixed,
    );
    let runner = MqttRunner::new(MockMqtt::new(), api, outbound, Some(publisher));

    Stack {
        config,
        lights,
        clock,
        scheduler,
        runner,
    }
}

fn publish(stack: &mut Stack, topic: &str, payload: &str) {
    stack.runner.client_mut().inject(topic, payload);
    stack.runner.poll();
}

fn frames(stack: &Stack) -> Vec<(u8, u8, bool)> {
    stack
        .scheduler
        .sink()
        .frames
        .iter()
        .map(|f| (f.address_byte, f.data_byte, f.repeat))
        .collect()
}

// ============================================================================
// S1: preset select
// ============================================================================

#[test]
fn preset_select_end_to_end() {
    let mut stack = stack();
    stack.runner.poll();
    publish(&mut stack, "lights/addresses", "000102");
    publish(&mut stack, "lights/preset/evening/0", "200");
    publish(&mut stack, "lights/preset/evening/1", "150");
    publish(&mut stack, "lights/preset/evening/2", "100");

    publish(&mut stack, "lights/preset/evening", "all");

    let state = stack.lights.snapshot();
    assert_eq!(state.levels[0], 200);
    assert_eq!(state.levels[1], 150);
    assert_eq!(state.levels[2], 100);
    assert_eq!(state.levels[3], luxbus::LEVEL_UNSET);
    assert_eq!(stack.lights.active_preset(0), "evening");
    assert_eq!(stack.lights.active_preset(2), "evening");

    // One scheduler pass emits exactly the three unrepeated level frames
    stack.scheduler.pass();
    assert_eq!(
        frames(&stack),
        vec![(0x00, 200, false), (0x02, 150, false), (0x04, 100, false)]
    );
}

// ============================================================================
// S2: group dim in group mode
// ============================================================================

#[test]
fn group_dim_end_to_end() {
    let mut stack = stack();
    stack.runner.poll();
    publish(&mut stack, "lights/addresses", "0506");
    publish(&mut stack, "lights/group/kitchen", "0506");
    publish(&mut stack, "lights/dimmer/0/mode", "group");
    publish(&mut stack, "lights/dimmer/0/groups", "kitchen");
    publish(&mut stack, "lights/dimmer/0/encoder_steps", "4");
    publish(&mut stack, "lights/dimmer/0/level_steps", "10");

    stack.lights.set_level("5", 100);
    stack.lights.set_level("6", 120);
    stack.scheduler.pass();
    stack.scheduler.sink_mut().clear();

    // +8 encoder counts = 2 steps of 10
    stack.lights.dim_adjust(0, 20);

    let id = stack.config.get_group("kitchen").unwrap().id;
    let state = stack.lights.snapshot();
    assert_eq!(state.group_levels[id as usize], 130);
    assert_eq!(state.levels[5], 130);
    assert_eq!(state.levels[6], 130);

    stack.scheduler.pass();
    let sent = frames(&stack);
    // One unrepeated group frame, no per-address frames
    let group_frames: Vec<_> = sent.iter().filter(|f| f.0 & 0x80 != 0).collect();
    assert_eq!(group_frames, vec![&(0x80 | (id << 1), 130, false)]);
    assert!(!sent.iter().any(|f| f.0 & 0x80 == 0));
}

// ============================================================================
// S3: power-cycle force refresh
// ============================================================================

#[test]
fn power_cycle_force_refresh_end_to_end() {
    let mut stack = stack();
    stack.runner.poll();
    publish(&mut stack, "lights/addresses", "0A0B");
    publish(&mut stack, "lights/group/hall", "0A0B");
    publish(&mut stack, "lights/set/all", "180");
    stack.scheduler.pass();
    stack.scheduler.sink_mut().clear();

    let members = stack.config.get_group_addresses("hall");
    stack.lights.set_power(members, false);
    // Cached match: the off transition re-sends nothing but refresh
    assert_eq!(stack.scheduler.pass(), 1);
    stack.scheduler.sink_mut().clear();

    stack.lights.set_power(members, true);
    stack.scheduler.pass();

    let sent = frames(&stack);
    assert_eq!(
        sent.iter().filter(|f| **f == (0x14, 180, false)).count(),
        2
    );
    assert_eq!(
        sent.iter().filter(|f| **f == (0x16, 180, false)).count(),
        2
    );

    // Spent: the next pass is refresh-only
    stack.scheduler.sink_mut().clear();
    assert_eq!(stack.scheduler.pass(), 1);
}

// ============================================================================
// S5: reconnect and subscription replay
// ============================================================================

#[test]
fn reconnect_and_startup_round_trip() {
    let mut stack = stack();
    stack.runner.poll();
    publish(&mut stack, "lights/addresses", "0001");

    // Simulate a broker drop and reconnect
    stack.runner.client_mut().connected = false;
    stack.runner.poll();
    stack.runner.client_mut().reconnect();
    stack.runner.client_mut().published.clear();
    stack.runner.poll();

    let client = stack.runner.client();
    assert!(client.subscriptions.iter().any(|s| s == "lights/preset/+/+"));
    assert!(client
        .published
        .iter()
        .any(|(t, _, _)| t == "meta/mqtt-agents/announce"));
    assert!(client
        .published
        .iter()
        .any(|(t, _, _)| t == "lights/startup_complete"));

    // The echoed ping completes startup and publishes the retained config
    // echo exactly once
    publish(&mut stack, "lights/startup_complete", "");
    let echoes = stack
        .runner
        .client()
        .published
        .iter()
        .filter(|(t, p, _)| t == "lights/addresses" && p == b"0001")
        .count();
    assert_eq!(echoes, 1);

    publish(&mut stack, "lights/startup_complete", "");
    let echoes_after = stack
        .runner
        .client()
        .published
        .iter()
        .filter(|(t, p, _)| t == "lights/addresses" && p == b"0001")
        .count();
    assert_eq!(echoes_after, 1);
}

// ============================================================================
// S6: idle-only preset
// ============================================================================

#[test]
fn idle_only_preset_end_to_end() {
    let mut stack = stack();
    stack.runner.poll();
    publish(&mut stack, "lights/addresses", "00");
    publish(&mut stack, "lights/preset/nightlight/all", "5");

    // Mark activity, then try an idle-only select
    stack.clock.advance_us(30_000_000);
    publish(&mut stack, "lights/set/all", "100");
    publish(&mut stack, "lights/preset/nightlight", "idle,all");
    assert_eq!(stack.lights.snapshot().levels[0], 100);

    // Past the idle window it applies
    stack.clock.advance_us(10_000_000);
    publish(&mut stack, "lights/preset/nightlight", "idle,all");
    assert_eq!(stack.lights.snapshot().levels[0], 5);

    // Idle-only application did not count as activity
    publish(&mut stack, "lights/preset/nightlight", "idle,all");
    assert_eq!(stack.lights.snapshot().levels[0], 5);
}

// ============================================================================
// Levels topic shape
// ============================================================================

#[test]
fn levels_topic_published_after_startup() {
    let mut stack = stack();
    stack.runner.poll();
    publish(&mut stack, "lights/addresses", "00");
    publish(&mut stack, "lights/startup_complete", "");
    publish(&mut stack, "lights/set/all", "100");
    stack.runner.poll();

    let payload = stack
        .runner
        .client()
        .last_payload("lights/levels")
        .expect("levels published");
    assert_eq!(payload.len(), 3 * 64);
    // Address 0: present flag + level 0x64
    assert_eq!(&payload[0..3], b"164");
}
