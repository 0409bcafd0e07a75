use super::*;

fn config(min_ms: u64, max_ms: u64) -> ConnectionConfig {
    ConnectionConfig::new("127.0.0.1", 1).with_backoff(Duration::from_millis(min_ms), Duration::from_millis(max_ms))
}

fn scheduled(actions: &[Action]) -> Option<Duration> {
    actions.iter().find_map(|a| match a {
        Action::Schedule(d) => Some(*d),
        _ => None,
    })
}

fn has_dial(actions: &[Action]) -> bool {
    actions.iter().any(|a| matches!(a, Action::Dial))
}

fn events(actions: &[Action]) -> Vec<String> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::Emit(event) => Some(match event {
                ConnectionEvent::Connected => "connected".to_owned(),
                ConnectionEvent::Reconnected(n) => format!("reconnected({n})"),
                ConnectionEvent::Closed { had_error } => format!("closed({had_error})"),
                ConnectionEvent::Error(_) => "error".to_owned(),
                ConnectionEvent::ReconnectScheduled { delay } => format!("scheduled({})", delay.as_millis()),
            }),
            _ => None,
        })
        .collect()
}

/// Drive one fail-fast cycle: timer fires, dial succeeds, link dies at once.
fn bounce(machine: &mut Machine, now: Instant) -> Vec<Action> {
    assert!(has_dial(&machine.handle(Input::TimerFired, now)));
    machine.handle(Input::Established, now);
    machine.handle(Input::Closed { had_error: false }, now)
}

#[test]
fn starts_idle() {
    let machine = Machine::new(&config(200, 1_000));
    assert_eq!(machine.state(), ConnectionState::Idle);
    assert!(!machine.auto_reconnect());
    assert_eq!(machine.reconnects(), 0);
}

#[test]
fn connect_once_does_not_retry() {
    let now = Instant::now();
    let mut machine = Machine::new(&config(200, 1_000));

    assert!(has_dial(&machine.handle(Input::ConnectOnce, now)));
    assert_eq!(machine.state(), ConnectionState::Connecting);

    let actions = machine.handle(Input::Established, now);
    assert_eq!(events(&actions), vec!["connected"]);
    assert_eq!(machine.state(), ConnectionState::Open);

    let actions = machine.handle(Input::Closed { had_error: true }, now);
    assert_eq!(events(&actions), vec!["closed(true)"]);
    assert!(scheduled(&actions).is_none());
    assert_eq!(machine.state(), ConnectionState::Closed);
}

#[test]
fn fail_fast_closes_escalate_backoff() {
    let now = Instant::now();
    let mut machine = Machine::new(&config(300, 10_000));
    machine.handle(Input::Maintain, now);
    machine.handle(Input::Established, now);

    let mut delays = vec![scheduled(&machine.handle(Input::Closed { had_error: false }, now)).expect("delay")];
    for _ in 0..4 {
        delays.push(scheduled(&bounce(&mut machine, now)).expect("delay"));
    }

    let millis: Vec<u128> = delays.iter().map(Duration::as_millis).collect();
    assert_eq!(millis, vec![300, 360, 432, 518, 621]);
    assert_eq!(machine.state(), ConnectionState::ReconnectPending);
}

#[test]
fn backoff_caps_at_max() {
    let now = Instant::now();
    let mut machine = Machine::new(&config(300, 500));
    machine.handle(Input::Maintain, now);
    machine.handle(Input::Established, now);
    machine.handle(Input::Closed { had_error: false }, now);

    let mut last = Duration::ZERO;
    for _ in 0..10 {
        last = scheduled(&bounce(&mut machine, now)).expect("delay");
        assert!(last <= Duration::from_millis(500));
    }
    assert_eq!(last, Duration::from_millis(500));
}

#[test]
fn long_lived_link_resets_backoff() {
    let start = Instant::now();
    let mut machine = Machine::new(&config(300, 10_000));
    machine.handle(Input::Maintain, start);
    machine.handle(Input::Established, start);
    machine.handle(Input::Closed { had_error: false }, start);
    bounce(&mut machine, start);
    assert_eq!(machine.next_delay(), Duration::from_millis(432));

    machine.handle(Input::TimerFired, start);
    machine.handle(Input::Established, start);
    let later = start + Duration::from_millis(301);
    let delay = scheduled(&machine.handle(Input::Closed { had_error: false }, later)).expect("delay");
    assert_eq!(delay, Duration::from_millis(300));
}

#[test]
fn failed_dials_escalate_too() {
    let now = Instant::now();
    let mut machine = Machine::new(&config(200, 10_000));
    machine.handle(Input::Maintain, now);

    let first = machine.handle(Input::Closed { had_error: true }, now);
    assert_eq!(scheduled(&first), Some(Duration::from_millis(200)));
    machine.handle(Input::TimerFired, now);
    let second = machine.handle(Input::Closed { had_error: true }, now);
    assert_eq!(scheduled(&second), Some(Duration::from_millis(240)));
}

#[test]
fn reconnected_fires_only_after_a_close() {
    let now = Instant::now();
    let mut machine = Machine::new(&config(200, 1_000));
    machine.handle(Input::Maintain, now);
    assert_eq!(events(&machine.handle(Input::Established, now)), vec!["connected"]);

    let closed = machine.handle(Input::Closed { had_error: false }, now);
    assert_eq!(events(&closed), vec!["closed(false)", "scheduled(200)"]);

    machine.handle(Input::TimerFired, now);
    assert_eq!(events(&machine.handle(Input::Established, now)), vec!["connected", "reconnected(1)"]);
    machine.handle(Input::Closed { had_error: false }, now);
    machine.handle(Input::TimerFired, now);
    assert_eq!(events(&machine.handle(Input::Established, now)), vec!["connected", "reconnected(2)"]);
    assert_eq!(machine.reconnects(), 2);
}

#[test]
fn disconnect_cancels_pending_retry() {
    let now = Instant::now();
    let mut machine = Machine::new(&config(200, 1_000));
    machine.handle(Input::Maintain, now);
    machine.handle(Input::Established, now);
    machine.handle(Input::Closed { had_error: false }, now);
    assert_eq!(machine.state(), ConnectionState::ReconnectPending);

    let actions = machine.handle(Input::Disconnect, now);
    assert!(matches!(actions.as_slice(), [Action::CancelTimer, Action::Disconnected]));
    assert_eq!(machine.state(), ConnectionState::Closed);

    assert!(machine.handle(Input::TimerFired, now).is_empty(), "stale timer must not dial");
    assert_eq!(machine.state(), ConnectionState::Closed);
}

#[test]
fn disconnect_from_open_waits_for_close() {
    let now = Instant::now();
    let mut machine = Machine::new(&config(200, 1_000));
    machine.handle(Input::Maintain, now);
    machine.handle(Input::Established, now);

    assert!(matches!(machine.handle(Input::Disconnect, now).as_slice(), [Action::Shutdown]));
    assert_eq!(machine.state(), ConnectionState::Open);
    assert!(machine.handle(Input::Disconnect, now).is_empty(), "second disconnect joins the first");

    let actions = machine.handle(Input::Closed { had_error: false }, now);
    assert!(actions.iter().any(|a| matches!(a, Action::Disconnected)));
    assert!(scheduled(&actions).is_none());
    assert_eq!(machine.state(), ConnectionState::Closed);
}

#[test]
fn disconnect_is_noop_when_idle_or_closed() {
    let now = Instant::now();
    let mut machine = Machine::new(&config(200, 1_000));
    assert!(matches!(machine.handle(Input::Disconnect, now).as_slice(), [Action::Disconnected]));
    assert_eq!(machine.state(), ConnectionState::Idle);

    machine.handle(Input::ConnectOnce, now);
    machine.handle(Input::Closed { had_error: true }, now);
    assert_eq!(machine.state(), ConnectionState::Closed);
    assert!(matches!(machine.handle(Input::Disconnect, now).as_slice(), [Action::Disconnected]));
}

#[test]
fn maintain_while_pending_dials_now() {
    let now = Instant::now();
    let mut machine = Machine::new(&config(200, 1_000));
    machine.handle(Input::Maintain, now);
    machine.handle(Input::Closed { had_error: true }, now);

    let actions = machine.handle(Input::Maintain, now);
    assert!(matches!(actions.as_slice(), [Action::CancelTimer, Action::Dial]));
    assert_eq!(machine.state(), ConnectionState::Connecting);
}

#[test]
fn maintain_while_open_does_not_dial_twice() {
    let now = Instant::now();
    let mut machine = Machine::new(&config(200, 1_000));
    machine.handle(Input::Maintain, now);
    assert!(machine.handle(Input::Maintain, now).is_empty());
    machine.handle(Input::Established, now);
    assert!(machine.handle(Input::ConnectOnce, now).is_empty());
    assert_eq!(machine.state(), ConnectionState::Open);
}

#[test]
fn maintain_during_disconnect_redials_after_close() {
    let now = Instant::now();
    let mut machine = Machine::new(&config(200, 1_000));
    machine.handle(Input::Maintain, now);
    machine.handle(Input::Established, now);
    machine.handle(Input::Disconnect, now);
    assert!(machine.handle(Input::Maintain, now).is_empty());

    let actions = machine.handle(Input::Closed { had_error: false }, now);
    assert!(actions.iter().any(|a| matches!(a, Action::Disconnected)));
    assert!(has_dial(&actions));
    assert_eq!(machine.state(), ConnectionState::Connecting);
    assert!(machine.auto_reconnect());
}

#[test]
fn faults_are_reported_without_state_change() {
    let now = Instant::now();
    let mut machine = Machine::new(&config(200, 1_000));
    machine.handle(Input::Maintain, now);
    machine.handle(Input::Established, now);

    let err = Arc::new(TransportError::Aborted("boom".into()));
    assert_eq!(events(&machine.handle(Input::Fault(err), now)), vec!["error"]);
    assert_eq!(machine.state(), ConnectionState::Open);
}

#[test]
fn stale_inputs_are_ignored() {
    let now = Instant::now();
    let mut machine = Machine::new(&config(200, 1_000));
    assert!(machine.handle(Input::Established, now).is_empty());
    assert!(machine.handle(Input::Closed { had_error: false }, now).is_empty());
    assert!(machine.handle(Input::TimerFired, now).is_empty());
    assert_eq!(machine.state(), ConnectionState::Idle);
}

#[test]
fn close_records_instant() {
    let now = Instant::now();
    let mut machine = Machine::new(&config(200, 1_000));
    machine.handle(Input::ConnectOnce, now);
    machine.handle(Input::Established, now);
    assert!(machine.closed_at().is_none());
    let later = now + Duration::from_secs(1);
    machine.handle(Input::Closed { had_error: false }, later);
    assert_eq!(machine.closed_at(), Some(later));
}
