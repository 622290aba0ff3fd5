use ice_core::{
    LinuxProcessTable, Notification, NotificationEvent, PortResolver, ProcessSupervisor,
    SpawnRequest, SupervisorConfig, SupervisorError, SupervisorRegistry, WaitOutcome,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const EXIT_DEADLINE: Duration = Duration::from_secs(10);

fn config() -> SupervisorConfig {
    SupervisorConfig::capture()
        .expect("capture config")
        .with_scan_interval(Duration::from_millis(100))
}

fn resolver() -> PortResolver {
    PortResolver::new(Arc::new(LinuxProcessTable::new()))
}

fn sh(script: &str) -> SpawnRequest {
    SpawnRequest::command("sh", &["-c", script])
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + EXIT_DEADLINE;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn recorder() -> (Arc<Mutex<Vec<Notification>>>, impl Fn(&Notification) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |notification: &Notification| {
        sink.lock().unwrap().push(notification.clone())
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_process_starts_with_empty_snapshot() {
    let (seen, observer) = recorder();
    let supervisor = ProcessSupervisor::builder(
        &SpawnRequest::command("sleep", &["5"]),
        &config(),
        resolver(),
    )
    .observer(observer)
    .spawn()
    .expect("spawn sleep");

    let started = seen.lock().unwrap()[0].clone();
    match started.event {
        NotificationEvent::ProcessStarted(snapshot) => {
            assert_eq!(snapshot.pid, supervisor.pid());
            assert_eq!(snapshot.name, "sleep");
            assert_eq!(snapshot.args, vec!["5".to_string()]);
            assert!(snapshot.ports.is_empty());
            assert!(snapshot.children.is_empty());
        }
        other => panic!("expected PROCESS_STARTED first, got {other:?}"),
    }

    supervisor.dispose();
    supervisor.dispose();
    assert!(supervisor.is_disposed());
    let outcome = supervisor.wait(Some(EXIT_DEADLINE)).await;
    assert!(outcome.exit_info().is_some(), "disposed process must die");
}

#[tokio::test(flavor = "multi_thread")]
async fn exit_code_and_single_exit_notification() {
    let (seen, observer) = recorder();
    let supervisor = ProcessSupervisor::builder(&sh("exit 3"), &config(), resolver())
        .observer(observer)
        .spawn()
        .expect("spawn sh");

    let outcome = supervisor.wait(None).await;
    let info = outcome.exit_info().expect("exited").clone();
    assert_eq!(info.exit_code, 3);
    assert_eq!(info.signal, None);
    assert!(supervisor.has_exited());

    // later waiters resolve immediately with the same payload
    let again = supervisor.wait(Some(Duration::from_millis(10))).await;
    assert_eq!(again.exit_info(), Some(&info));

    let exits = seen
        .lock()
        .unwrap()
        .iter()
        .filter(|notification| notification.kind() == "PROCESS_EXITED")
        .count();
    assert_eq!(exits, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn wait_timeout_leaves_process_running() {
    let supervisor = ProcessSupervisor::spawn(
        &SpawnRequest::command("sleep", &["5"]),
        &config(),
        resolver(),
    )
    .expect("spawn sleep");

    let outcome = supervisor.wait(Some(Duration::from_millis(50))).await;
    assert_eq!(outcome, WaitOutcome::timeout());
    assert!(!supervisor.has_exited());

    supervisor.kill(None).expect("kill");
    let info = supervisor
        .wait(Some(EXIT_DEADLINE))
        .await
        .exit_info()
        .cloned()
        .expect("exit after SIGTERM");
    assert!(info.signal.is_some(), "SIGTERM exit must report a signal: {info:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn sigkill_exit_reports_signal() {
    let supervisor = ProcessSupervisor::spawn(
        &SpawnRequest::command("sleep", &["5"]),
        &config(),
        resolver(),
    )
    .expect("spawn sleep");

    supervisor.kill(Some("SIGKILL")).expect("kill");
    supervisor.wait(Some(EXIT_DEADLINE)).await;
    let info = supervisor.exit_info().expect("exit recorded");
    assert!(info.signal.is_some(), "SIGKILL exit must report a signal: {info:?}");
    assert_ne!(info.exit_code, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn trailing_output_arrives_before_exit_resolves() {
    for _ in 0..10 {
        let supervisor = ProcessSupervisor::builder(
            &sh("sleep 0.1; printf trailing-output"),
            &config(),
            resolver(),
        )
        .paused(true)
        .spawn()
        .expect("spawn sh");
        let output = Arc::new(Mutex::new(Vec::<u8>::new()));
        let sink = output.clone();
        supervisor.on_data(move |chunk| sink.lock().unwrap().extend_from_slice(chunk));
        supervisor.resume();

        supervisor.wait(Some(EXIT_DEADLINE)).await;
        let seen = String::from_utf8_lossy(&output.lock().unwrap()).to_string();
        assert!(seen.contains("trailing-output"), "output missing at exit: {seen:?}");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_waiters_all_resolve() {
    let supervisor = ProcessSupervisor::spawn(&sh("sleep 0.3"), &config(), resolver())
        .expect("spawn sh");

    let short = supervisor.wait(Some(Duration::from_millis(20)));
    let long = supervisor.wait(Some(EXIT_DEADLINE));
    let unbounded = supervisor.wait(None);
    let (short, long, unbounded) = tokio::join!(short, long, unbounded);

    assert_eq!(short, WaitOutcome::timeout());
    assert_eq!(long.exit_info().map(|info| info.exit_code), Some(0));
    assert_eq!(long, unbounded);
}

#[tokio::test(flavor = "multi_thread")]
async fn operations_after_exit_are_noops() {
    let supervisor = ProcessSupervisor::spawn(&sh("exit 0"), &config(), resolver())
        .expect("spawn sh");
    supervisor.wait(Some(EXIT_DEADLINE)).await;

    supervisor.write(b"hello\n");
    supervisor.resize(120, 40);
    supervisor.clear();
    supervisor.pause();
    supervisor.resume();
    supervisor.kill(Some("SIGKILL")).expect("kill after exit is a no-op");
    supervisor.dispose();
}

#[tokio::test(flavor = "multi_thread")]
async fn terminal_input_is_echoed_to_data_subscribers() {
    let cat = SpawnRequest::command("cat", &[]);
    let supervisor = ProcessSupervisor::spawn(&cat, &config(), resolver()).expect("spawn cat");
    let output = Arc::new(Mutex::new(Vec::<u8>::new()));
    let sink = output.clone();
    supervisor.on_data(move |chunk| sink.lock().unwrap().extend_from_slice(chunk));

    supervisor.write(b"ping\n");
    eventually("echoed input", || {
        String::from_utf8_lossy(&output.lock().unwrap()).contains("ping")
    })
    .await;

    supervisor.kill(Some("KILL")).expect("kill cat");
    supervisor.wait(Some(EXIT_DEADLINE)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn paused_output_is_delivered_after_resume() {
    let supervisor = ProcessSupervisor::builder(&sh("echo ready"), &config(), resolver())
        .paused(true)
        .spawn()
        .expect("spawn sh");
    assert!(supervisor.is_paused());

    let output = Arc::new(Mutex::new(Vec::<u8>::new()));
    let sink = output.clone();
    let subscription =
        supervisor.on_data(move |chunk| sink.lock().unwrap().extend_from_slice(chunk));
    supervisor.resume();

    eventually("buffered output", || {
        String::from_utf8_lossy(&output.lock().unwrap()).contains("ready")
    })
    .await;
    assert!(supervisor.off_data(subscription));
    assert!(!supervisor.off_data(subscription));
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_signal_is_rejected_without_killing() {
    let supervisor = ProcessSupervisor::spawn(
        &SpawnRequest::command("sleep", &["5"]),
        &config(),
        resolver(),
    )
    .expect("spawn sleep");

    let err = supervisor.kill(Some("SIGBOGUS")).unwrap_err();
    assert!(matches!(err, SupervisorError::InvalidSignal(_)));
    assert!(err.is_client_error());
    assert_eq!(
        supervisor.wait(Some(Duration::from_millis(50))).await,
        WaitOutcome::timeout()
    );
    supervisor.dispose();
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_command_fails_to_spawn() {
    let result = ProcessSupervisor::spawn(
        &SpawnRequest::command("ice-core-no-such-binary", &[]),
        &config(),
        resolver(),
    );
    assert!(matches!(result, Err(SupervisorError::Spawn { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn registry_relays_and_evicts_exited_processes() {
    let registry = SupervisorRegistry::new(config(), Arc::new(LinuxProcessTable::new()));
    let (seen, observer) = recorder();
    registry.notifications().subscribe(observer);

    let supervisor = registry.create(&sh("exit 0")).expect("create");
    let pid = supervisor.pid();
    supervisor.wait(Some(EXIT_DEADLINE)).await;

    eventually("eviction", || registry.get(pid).is_err()).await;
    assert!(!registry.list().contains_key(&pid));

    let kinds: Vec<&str> = seen
        .lock()
        .unwrap()
        .iter()
        .filter(|notification| notification.pid == Some(pid))
        .map(Notification::kind)
        .collect();
    assert_eq!(kinds.first(), Some(&"PROCESS_STARTED"));
    assert_eq!(kinds.last(), Some(&"PROCESS_EXITED"));
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_pid_is_not_found_and_silent() {
    let registry = SupervisorRegistry::new(config(), Arc::new(LinuxProcessTable::new()));
    let (seen, observer) = recorder();
    registry.notifications().subscribe(observer);

    let err = registry.get(999_999).err().expect("unknown pid");
    assert!(matches!(err, SupervisorError::NotFound(999_999)));
    assert_eq!(err.to_string(), "Not found 999999");
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_disposes_every_process() {
    let registry = SupervisorRegistry::new(config(), Arc::new(LinuxProcessTable::new()));
    let first = registry
        .create(&SpawnRequest::command("sleep", &["5"]))
        .expect("create first");
    let second = registry
        .create(&SpawnRequest::command("sleep", &["5"]))
        .expect("create second");
    assert_eq!(registry.len(), 2);

    registry.shutdown();
    assert!(registry.is_empty());
    for supervisor in [first, second] {
        assert!(supervisor.is_disposed());
        assert!(supervisor.wait(Some(EXIT_DEADLINE)).await.exit_info().is_some());
    }
}
