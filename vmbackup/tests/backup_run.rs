//! End-to-end runs against the mock hypervisor and a temporary backup tree.

use std::fs;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use vmbackup::config::{BackupConfig, CompareMode};
use vmbackup::copy::{self, CopyError, PARTIAL_SUFFIX};
use vmbackup::error::FailureKind;
use vmbackup::report::{RunSummary, EXIT_RESTART_FAILURE, EXIT_SUCCESS};
use vmbackup::runner;
use vmbackup::types::{Outcome, VmBackupResult};
use vmbackup_hypervisor::{GuestState, MockBackend, MockCall, MockFaults, MockGuestSpec};

struct Host {
    backend: MockBackend,
    images: tempfile::TempDir,
    dest: tempfile::TempDir,
}

impl Host {
    fn new() -> Self {
        Self {
            backend: MockBackend::new(),
            images: tempfile::tempdir().unwrap(),
            dest: tempfile::tempdir().unwrap(),
        }
    }

    fn config(&self) -> BackupConfig {
        let mut config = BackupConfig::default();
        config.destination = self.dest.path().to_path_buf();
        config.timeout_seconds = 5;
        config.poll_interval_ms = 50;
        config
    }

    fn image(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.images.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn backed_up(&self, guest: &str, file: &str) -> PathBuf {
        self.dest.path().join(guest).join(file)
    }

    async fn run(&self, config: &BackupConfig) -> Vec<VmBackupResult> {
        runner::run_backup(&self.backend, config, &CancellationToken::new(), false)
            .await
            .unwrap()
    }
}

fn result<'a>(results: &'a [VmBackupResult], name: &str) -> &'a VmBackupResult {
    results.iter().find(|r| r.name == name).unwrap()
}

fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_exclude_and_skip_storage_scenario() {
    let host = Host::new();
    let test_disk = host.image("test_vm.qcow2", b"test");
    let simple_disk = host.image("simple_vm.qcow2", b"simple");
    let db_disk = host.image("db_vm.qcow2", b"database pages");

    let test_vm = host
        .backend
        .add_guest(MockGuestSpec::new("test_vm").running().with_volume(&test_disk));
    let simple_vm = host
        .backend
        .add_guest(MockGuestSpec::new("simple_vm").running().with_volume(&simple_disk));
    let db_vm = host
        .backend
        .add_guest(MockGuestSpec::new("db_vm").running().with_volume(&db_disk));

    let config = BackupConfig::from_toml_str(&format!(
        "destination = \"{}\"\nexclude = [\"test_vm\"]\nskip_storage = [\"simple_vm\"]\npoll_interval_ms = 50\n",
        host.dest.path().display()
    ))
    .unwrap();

    let results = host.run(&config).await;
    assert_eq!(results.len(), 3);

    let test = result(&results, "test_vm");
    assert_eq!(test.outcome, Outcome::Skipped("excluded".to_string()));
    assert!(host.backend.calls_for(&test_vm).is_empty());
    assert!(!host.dest.path().join("test_vm").exists());

    let simple = result(&results, "simple_vm");
    assert_eq!(simple.outcome, Outcome::Success);
    assert!(simple.restarted);
    assert!(simple.copies.is_empty());
    assert_eq!(dir_entries(&host.dest.path().join("simple_vm")), vec!["simple_vm.xml"]);
    assert_eq!(host.backend.peek_state(&simple_vm), Some(GuestState::Running));

    let db = result(&results, "db_vm");
    assert_eq!(db.outcome, Outcome::Success);
    assert!(db.restarted);
    assert_eq!(
        dir_entries(&host.dest.path().join("db_vm")),
        vec!["db_vm.qcow2", "db_vm.xml"]
    );
    assert_eq!(fs::read(host.backed_up("db_vm", "db_vm.qcow2")).unwrap(), b"database pages");
    assert_eq!(host.backend.peek_state(&db_vm), Some(GuestState::Running));
}

#[tokio::test(start_paused = true)]
async fn test_guest_that_never_stops() {
    let host = Host::new();
    let disk = host.image("stuck.qcow2", b"in use");
    let id = host.backend.add_guest(
        MockGuestSpec::new("stuck")
            .running()
            .with_volume(&disk)
            .with_faults(MockFaults {
                ignore_shutdown: true,
                ..Default::default()
            }),
    );

    let results = host.run(&host.config()).await;
    let stuck = result(&results, "stuck");

    assert_eq!(
        stuck.outcome,
        Outcome::PartialFailure("shutdown-timeout".to_string())
    );
    assert!(stuck.copies.is_empty());
    assert!(!host.backed_up("stuck", "stuck.qcow2").exists());
    assert_eq!(host.backend.start_calls(&id), 1);
    assert!(stuck.restarted);
}

#[tokio::test(start_paused = true)]
async fn test_running_guests_get_exactly_one_start() {
    let host = Host::new();
    let disk = host.image("shared.qcow2", b"shared");
    let missing = host.images.path().join("gone.qcow2");

    let fault_plans = [
        MockFaults::default(),
        MockFaults {
            ignore_shutdown: true,
            ..Default::default()
        },
        MockFaults {
            reject_shutdown: true,
            ..Default::default()
        },
        MockFaults {
            fail_start: true,
            ..Default::default()
        },
        MockFaults {
            shutdown_delay_polls: 3,
            ..Default::default()
        },
        MockFaults {
            fail_export: true,
            ..Default::default()
        },
        MockFaults {
            shutdown_delay_polls: 150,
            ..Default::default()
        },
    ];

    let mut ids = Vec::new();
    for (index, faults) in fault_plans.into_iter().enumerate() {
        let spec = MockGuestSpec::new(format!("guest{}", index))
            .running()
            .with_volume(&disk)
            .with_volume(&missing)
            .with_faults(faults);
        ids.push(host.backend.add_guest(spec));
    }

    let results = host.run(&host.config()).await;
    assert_eq!(results.len(), ids.len());

    for id in &ids {
        assert_eq!(host.backend.start_calls(id), 1, "guest {}", id);
    }
    // Every guest had a missing disk or worse
    assert!(results.iter().all(|r| r.outcome.is_failure()));
    assert!(result(&results, "guest3").restart_failed());
    assert_eq!(
        result(&results, "guest5").failures[0].kind,
        FailureKind::Export
    );
    // Slow to stop, but up again once the shutdown finished
    let slow = result(&results, "guest6");
    assert_eq!(
        slow.outcome,
        Outcome::PartialFailure("shutdown-timeout".to_string())
    );
    assert!(slow.restarted);
    assert_eq!(host.backend.peek_state(&ids[6]), Some(GuestState::Running));
}

#[tokio::test]
async fn test_stopped_guests_are_never_started() {
    let host = Host::new();
    let disk = host.image("cold.qcow2", b"cold");
    let ok = host
        .backend
        .add_guest(MockGuestSpec::new("cold").with_volume(&disk));
    let broken = host.backend.add_guest(
        MockGuestSpec::new("cold-broken").with_volume(host.images.path().join("missing.qcow2")),
    );

    let results = host.run(&host.config()).await;

    assert_eq!(result(&results, "cold").outcome, Outcome::Success);
    assert!(result(&results, "cold-broken").outcome.is_failure());
    for id in [&ok, &broken] {
        assert!(!host
            .backend
            .calls_for(id)
            .iter()
            .any(|c| matches!(c, MockCall::StartGuest(_) | MockCall::RequestShutdown(_))));
    }
}

#[tokio::test]
async fn test_second_run_copies_nothing() {
    let host = Host::new();
    let disk = host.image("web.qcow2", &vec![7u8; 3 * 1024 * 1024 + 11]);
    host.backend
        .add_guest(MockGuestSpec::new("web").running().with_volume(&disk));

    for compare in [CompareMode::Metadata, CompareMode::Checksum] {
        let mut config = host.config();
        config.compare = compare;

        let first = host.run(&config).await;
        let first_bytes = fs::read(host.backed_up("web", "web.qcow2")).unwrap();

        let second = host.run(&config).await;
        let web = result(&second, "web");
        assert_eq!(web.outcome, Outcome::Success);
        assert_eq!(web.bytes_copied(), 0, "compare mode {:?}", compare);
        assert_eq!(fs::read(host.backed_up("web", "web.qcow2")).unwrap(), first_bytes);
        assert_eq!(result(&first, "web").outcome, Outcome::Success);
    }

    assert_eq!(
        fs::read(host.backed_up("web", "web.qcow2")).unwrap(),
        fs::read(&disk).unwrap()
    );
}

#[tokio::test]
async fn test_interrupted_copy_leaves_no_final_file() {
    let host = Host::new();
    let source = host.image("big.raw", &vec![1u8; 2 * 1024 * 1024 + 5]);
    let dest_dir = host.dest.path().join("big");
    fs::create_dir_all(&dest_dir).unwrap();
    let dest = dest_dir.join("big.raw");

    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = copy::plan_and_copy(&source, &dest, true, CompareMode::Metadata, &cancel).unwrap_err();

    assert!(matches!(err, CopyError::Cancelled));
    assert!(!dest.exists());
    assert!(dir_entries(&dest_dir)
        .iter()
        .all(|name| name != "big.raw" && !name.ends_with(PARTIAL_SUFFIX)));
}

#[tokio::test]
async fn test_execute_releases_connection() {
    let host = Host::new();
    host.backend.add_guest(MockGuestSpec::new("web").running());

    let results = runner::execute(
        Box::new(host.backend.clone()),
        &host.config(),
        &CancellationToken::new(),
        false,
    )
    .await
    .unwrap();

    assert_eq!(results.len(), 1);
    assert!(host.backend.is_closed());
}

#[tokio::test]
async fn test_paused_guest_counts_as_running() {
    let host = Host::new();
    let disk = host.image("paused.qcow2", b"paused");
    let id = host
        .backend
        .add_guest(MockGuestSpec::new("paused").running().with_volume(&disk));
    host.backend.set_state(&id, GuestState::Paused).unwrap();

    let results = host.run(&host.config()).await;

    assert_eq!(result(&results, "paused").outcome, Outcome::Success);
    assert_eq!(host.backend.shutdown_calls(&id), 1);
    assert_eq!(host.backend.start_calls(&id), 1);
    assert_eq!(host.backend.peek_state(&id), Some(GuestState::Running));
}

#[tokio::test]
async fn test_restart_failure_sets_exit_code() {
    let host = Host::new();
    let id = host.backend.add_guest(MockGuestSpec::new("web").running());

    let first = host.run(&host.config()).await;
    assert_eq!(
        RunSummary::from_results(first, chrono::Utc::now()).exit_code(),
        EXIT_SUCCESS
    );

    host.backend
        .set_faults(
            &id,
            MockFaults {
                fail_start: true,
                ..Default::default()
            },
        )
        .unwrap();

    let second = host.run(&host.config()).await;
    let summary = RunSummary::from_results(second, chrono::Utc::now());
    assert_eq!(summary.exit_code(), EXIT_RESTART_FAILURE);
    assert_eq!(host.backend.peek_state(&id), Some(GuestState::Stopped));
    assert_eq!(host.backend.start_calls(&id), 2);
}
