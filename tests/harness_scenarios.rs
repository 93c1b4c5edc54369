//! End-to-end runs of the harness against a stand-in generator and mock tools.

#![cfg(unix)]

mod common;

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use common::{
    BROKEN_POOL, DANGLING_ROOT, HANGING_POOL, ONE_POOL_ACTIVE, SILENT_POOL, TWO_POOLS, Workspace,
};
use zfs_bootmenu_harness::invoke::Phase;
use zfs_bootmenu_harness::orchestrate::{PhaseSelection, Release, RunOptions, Verdict};

fn all_phases() -> RunOptions {
    RunOptions::default()
}

fn record(ws: &Workspace) {
    let mut config = ws.config();
    config.run.update = true;
    let summary = ws.harness(config).run(&all_phases()).unwrap();
    assert_eq!(summary.failed, 0, "update run failed: {summary:#?}");
}

#[test]
fn scenario_single_active_root_lists_one_entry() {
    let ws = Workspace::new();
    ws.add_case("enabled", "one_pool", ONE_POOL_ACTIVE);
    record(&ws);

    let bootlist = ws.reference("enabled/one_pool", "bootlist");
    let lines: Vec<&str> = bootlist.lines().collect();
    assert_eq!(lines.len(), 1, "bootlist: {bootlist}");
    let fields: Vec<&str> = lines[0].split('\t').collect();
    assert_eq!(fields[0], "rpool-enabled_one_pool/ROOT/ubuntu_1234");
    assert_eq!(fields[1], "@SANDBOX@/pools/rpool-enabled_one_pool/ROOT/ubuntu_1234");
    assert_eq!(fields[3], "current");

    let menumeta = ws.reference("enabled/one_pool", "menumeta");
    assert!(menumeta.starts_with("entries 1\n"), "menumeta: {menumeta}");
}

#[test]
fn scenario_two_pools_secure_boot_marks_every_entry() {
    let ws = Workspace::new();
    ws.add_case("enabled", "two_pools", TWO_POOLS);
    record(&ws);

    let bootlist = ws.reference("enabled/two_pools", "bootlist");
    let lines: Vec<&str> = bootlist.lines().collect();
    assert_eq!(lines.len(), 2, "bootlist: {bootlist}");
    assert!(lines[0].starts_with("rpool-enabled_two_pools/ROOT/ubuntu_1234\t"));
    assert!(lines[1].starts_with("rpool2-enabled_two_pools/ROOT/debian_5678\t"));
    for line in lines {
        let fields: Vec<&str> = line.split('\t').collect();
        assert_eq!(fields[2], "secureboot");
        assert_eq!(fields[3], "-");
    }
}

#[test]
fn disabled_secure_boot_has_no_marker() {
    let ws = Workspace::new();
    ws.add_case("disabled", "two_pools", TWO_POOLS);
    record(&ws);
    let bootlist = ws.reference("disabled/two_pools", "bootlist");
    assert!(bootlist.lines().all(|l| l.split('\t').nth(2) == Some("-")));
}

/// A bootlist recorded on a machine where dangerous runs were allowed.
const RECORDED_NO_MOKUTIL: &str =
    "rpool-no-mokutil_one_pool/ROOT/ubuntu_1234\t@SANDBOX@/pools/x\tno-mokutil\tcurrent\t1555555555\n";

#[test]
fn scenario_dangerous_without_opt_in_is_skipped() {
    let ws = Workspace::new();
    ws.add_case("no-mokutil", "one_pool", ONE_POOL_ACTIVE);
    ws.add_case("enabled", "one_pool", ONE_POOL_ACTIVE);
    ws.write_reference("no-mokutil/one_pool", "bootlist", RECORDED_NO_MOKUTIL);
    record(&ws);

    let summary = ws.harness(ws.config()).run(&all_phases()).unwrap();
    assert!(summary.is_success(), "{summary:#?}");
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.passed, 3);
    let bootlist = summary.find("no-mokutil/one_pool", Phase::Bootlist).unwrap();
    match &bootlist.verdict {
        Verdict::Skipped(reason) => assert!(reason.contains("dangerous is not set")),
        other => panic!("unexpected verdict {other:?}"),
    }
    // The menu phase never consults the secure-boot tool, so it always runs.
    let metamenu = summary.find("no-mokutil/one_pool", Phase::Metamenu).unwrap();
    assert_eq!(metamenu.verdict, Verdict::Passed);
    assert_eq!(
        ws.reference("no-mokutil/one_pool", "menumeta"),
        "entries 1\nmenuentry rpool-no-mokutil_one_pool/ROOT/ubuntu_1234\n"
    );
}

#[test]
fn metamenu_phase_never_hides_host_binary() {
    let ws = Workspace::new();
    ws.add_case("no-mokutil", "one_pool", ONE_POOL_ACTIVE);
    ws.write_reference("no-mokutil/one_pool", "bootlist", RECORDED_NO_MOKUTIL);
    let host_binary = ws.path().join("host-bin/mokutil");
    common::write_script(&host_binary, "#!/bin/sh\necho real\n");

    let mut config = ws.config();
    config.run.dangerous = true;
    config.run.update = true;
    let summary = ws
        .harness(config)
        .with_root_privileges(true)
        .run(&RunOptions {
            phases: PhaseSelection::Metamenu,
            ..RunOptions::default()
        })
        .unwrap();
    let report = summary.find("no-mokutil/one_pool", Phase::Metamenu).unwrap();
    assert!(matches!(report.verdict, Verdict::Updated(_)), "{report:?}");
    assert!(host_binary.exists());
    assert!(
        !ws.log_events()
            .iter()
            .any(|e| e["event"] == "binary_renamed")
    );
}

#[test]
fn update_then_verify_passes() {
    let ws = Workspace::new();
    ws.add_case("enabled", "one_pool", ONE_POOL_ACTIVE);
    ws.add_case("enabled", "two_pools", TWO_POOLS);
    ws.add_case("disabled", "two_pools", TWO_POOLS);

    let mut config = ws.config();
    config.run.update = true;
    let updated = ws.harness(config).run(&all_phases()).unwrap();
    assert_eq!(updated.updated, 6);
    assert!(
        updated
            .reports
            .iter()
            .all(|r| matches!(r.verdict, Verdict::Updated(_)))
    );

    let verified = ws.harness(ws.config()).run(&all_phases()).unwrap();
    assert_eq!(verified.passed, 6, "{verified:#?}");
    assert!(verified.is_success());
    assert_eq!(verified.barrier, Some(Release::AfterBootlist));
}

#[test]
fn repeated_runs_produce_identical_references() {
    let ws = Workspace::new();
    ws.add_case("enabled", "two_pools", TWO_POOLS);
    record(&ws);
    let first = ws.reference("enabled/two_pools", "bootlist");
    record(&ws);
    let second = ws.reference("enabled/two_pools", "bootlist");
    assert_eq!(first, second);
    assert!(!first.contains("zbh-sandbox-"));
}

#[test]
fn metamenu_alone_proceeds_after_grace_period() {
    let ws = Workspace::new();
    ws.add_case("enabled", "one_pool", ONE_POOL_ACTIVE);
    record(&ws);

    let options = RunOptions {
        phases: PhaseSelection::Metamenu,
        ..RunOptions::default()
    };
    let start = Instant::now();
    let summary = ws.harness(ws.config()).run(&options).unwrap();
    assert!(start.elapsed() < Duration::from_secs(8));
    assert_eq!(summary.barrier, Some(Release::GraceElapsed));
    assert_eq!(summary.total(), 1);
    assert_eq!(summary.passed, 1, "{summary:#?}");
}

#[test]
fn filter_narrows_both_groups() {
    let ws = Workspace::new();
    ws.add_case("enabled", "one_pool", ONE_POOL_ACTIVE);
    ws.add_case("enabled", "two_pools", TWO_POOLS);
    record(&ws);

    let options = RunOptions {
        filter: Some("two_pools".to_string()),
        ..RunOptions::default()
    };
    let summary = ws.harness(ws.config()).run(&options).unwrap();
    assert_eq!(summary.total(), 2);
    assert!(summary.reports.iter().all(|r| r.case == "enabled/two_pools"));
}

#[test]
fn mismatch_fails_with_diff_and_both_contents() {
    let ws = Workspace::new();
    ws.add_case("enabled", "one_pool", ONE_POOL_ACTIVE);
    record(&ws);
    let original = ws.reference("enabled/one_pool", "bootlist");
    ws.write_reference("enabled/one_pool", "bootlist", &original.replace("current", "stale"));

    let options = RunOptions {
        phases: PhaseSelection::Bootlist,
        ..RunOptions::default()
    };
    let summary = ws.harness(ws.config()).run(&options).unwrap();
    assert!(!summary.is_success());
    let report = summary.find("enabled/one_pool", Phase::Bootlist).unwrap();
    let Verdict::Failed(details) = &report.verdict else {
        panic!("expected failure, got {:?}", report.verdict);
    };
    assert!(details.contains("diff (-reference +actual)"));
    assert!(details.contains("stale"));
    assert!(details.contains("current"));
    assert!(details.contains("sha256"));
}

#[test]
fn missing_reference_fails_and_suggests_update() {
    let ws = Workspace::new();
    ws.add_case("enabled", "fresh", ONE_POOL_ACTIVE);
    let options = RunOptions {
        phases: PhaseSelection::Bootlist,
        ..RunOptions::default()
    };
    let summary = ws.harness(ws.config()).run(&options).unwrap();
    let report = summary.find("enabled/fresh", Phase::Bootlist).unwrap();
    let Verdict::Failed(details) = &report.verdict else {
        panic!("expected failure, got {:?}", report.verdict);
    };
    assert!(details.contains("--update"));
}

#[test]
fn generator_failure_is_local_and_carries_streams() {
    let ws = Workspace::new();
    ws.add_case("enabled", "broken", BROKEN_POOL);
    ws.add_case("enabled", "one_pool", ONE_POOL_ACTIVE);
    record_ignoring_failures(&ws);

    let summary = ws.harness(ws.config()).run(&all_phases()).unwrap();
    let broken = summary.find("enabled/broken", Phase::Bootlist).unwrap();
    assert_eq!(broken.error_code.as_deref(), Some("ZBH-3001"));
    let Verdict::Failed(details) = &broken.verdict else {
        panic!("expected failure, got {:?}", broken.verdict);
    };
    assert!(details.contains("cannot parse pool broken"));
    assert!(details.contains("partial output"));

    let healthy = summary.find("enabled/one_pool", Phase::Bootlist).unwrap();
    assert_eq!(healthy.verdict, Verdict::Passed);
}

fn record_ignoring_failures(ws: &Workspace) {
    let mut config = ws.config();
    config.run.update = true;
    ws.harness(config).run(&all_phases()).unwrap();
}

#[test]
fn hung_generator_is_killed_at_deadline() {
    let ws = Workspace::new();
    ws.add_case("enabled", "hang", HANGING_POOL);
    let mut config = ws.config();
    config.generator.deadline_secs = 1;
    let options = RunOptions {
        phases: PhaseSelection::Bootlist,
        ..RunOptions::default()
    };

    let start = Instant::now();
    let summary = ws.harness(config).run(&options).unwrap();
    assert!(start.elapsed() < Duration::from_secs(15));
    let report = summary.find("enabled/hang", Phase::Bootlist).unwrap();
    assert_eq!(report.error_code.as_deref(), Some("ZBH-3002"));
}

#[test]
fn malformed_declaration_fails_only_that_case() {
    let ws = Workspace::new();
    ws.add_case("enabled", "bad", "pools: [ {name: rpool, datasets: nope} ]\n");
    ws.add_case("enabled", "one_pool", ONE_POOL_ACTIVE);
    record_ignoring_failures(&ws);

    let summary = ws.harness(ws.config()).run(&all_phases()).unwrap();
    let bad = summary.find("enabled/bad", Phase::Bootlist).unwrap();
    assert_eq!(bad.error_code.as_deref(), Some("ZBH-2002"));
    assert!(matches!(&bad.verdict, Verdict::Failed(d) if d.starts_with("setup error")));
    assert_eq!(
        summary.find("enabled/one_pool", Phase::Metamenu).unwrap().verdict,
        Verdict::Passed
    );
}

#[test]
fn unknown_mode_is_a_setup_failure() {
    let ws = Workspace::new();
    ws.add_case("sometimes", "one_pool", ONE_POOL_ACTIVE);
    let options = RunOptions {
        phases: PhaseSelection::Bootlist,
        ..RunOptions::default()
    };
    let summary = ws.harness(ws.config()).run(&options).unwrap();
    let report = summary.find("sometimes/one_pool", Phase::Bootlist).unwrap();
    assert_eq!(report.error_code.as_deref(), Some("ZBH-2003"));
}

#[test]
fn dangerous_mode_hides_and_restores_host_binary() {
    let ws = Workspace::new();
    ws.add_case("no-mokutil", "one_pool", ONE_POOL_ACTIVE);
    ws.add_case("no-mokutil", "broken", BROKEN_POOL);
    let host_binary = ws.path().join("host-bin/mokutil");
    common::write_script(&host_binary, "#!/bin/sh\necho real\n");

    let mut config = ws.config();
    config.run.dangerous = true;
    config.run.update = true;
    let host_env: Vec<(std::ffi::OsString, std::ffi::OsString)> = std::env::vars_os()
        .chain([(
            "ZBH_TEST_HOST_MOKUTIL".into(),
            host_binary.clone().into_os_string(),
        )])
        .collect();
    let summary = ws
        .harness(config)
        .with_root_privileges(true)
        .with_host_env(host_env)
        .run(&RunOptions {
            phases: PhaseSelection::Bootlist,
            ..RunOptions::default()
        })
        .unwrap();

    // The generator saw the binary gone; the failing case restored it too.
    let bootlist = ws.reference("no-mokutil/one_pool", "bootlist");
    assert!(bootlist.contains("host-mokutil hidden"), "bootlist: {bootlist}");
    assert!(
        summary
            .find("no-mokutil/broken", Phase::Bootlist)
            .unwrap()
            .verdict
            .is_failure()
    );
    assert_eq!(fs::read_to_string(&host_binary).unwrap(), "#!/bin/sh\necho real\n");
    assert!(!ws.path().join("host-bin/mokutil.bak").exists());

    let events = ws.log_events();
    let renamed = events.iter().filter(|e| e["event"] == "binary_renamed").count();
    let restored = events.iter().filter(|e| e["event"] == "binary_restored").count();
    assert_eq!(renamed, 2);
    assert_eq!(restored, 2);
}

#[test]
fn dangerous_mode_requires_root() {
    let ws = Workspace::new();
    ws.add_case("no-mokutil", "one_pool", ONE_POOL_ACTIVE);
    let mut config = ws.config();
    config.run.dangerous = true;
    let summary = ws
        .harness(config)
        .with_root_privileges(false)
        .run(&RunOptions {
            phases: PhaseSelection::Bootlist,
            ..RunOptions::default()
        })
        .unwrap();
    assert_eq!(summary.skipped, 1);
    assert!(summary.is_success());
}

#[test]
fn leftover_backup_is_restored_before_running() {
    let ws = Workspace::new();
    ws.add_case("enabled", "one_pool", ONE_POOL_ACTIVE);
    let host_binary = ws.path().join("host-bin/mokutil");
    common::write_script(&ws.path().join("host-bin/mokutil.bak"), "#!/bin/sh\n");

    let mut config = ws.config();
    config.run.dangerous = true;
    ws.harness(config)
        .with_root_privileges(true)
        .run(&RunOptions {
            phases: PhaseSelection::Bootlist,
            ..RunOptions::default()
        })
        .unwrap();
    assert!(host_binary.exists());
    assert!(
        ws.log_events()
            .iter()
            .any(|e| e["event"] == "binary_restored" && e["details"] == "leftover backup")
    );
}

#[test]
fn missing_generator_skips_every_case() {
    let ws = Workspace::new();
    ws.add_case("enabled", "one_pool", ONE_POOL_ACTIVE);
    let mut config = ws.config();
    config.generator.binary = ws.path().join("bin/absent");
    let summary = ws.harness(config).run(&all_phases()).unwrap();
    assert_eq!(summary.skipped, 2);
    assert!(summary.is_success());
}

#[test]
fn run_log_records_lifecycle() {
    let ws = Workspace::new();
    ws.add_case("enabled", "one_pool", ONE_POOL_ACTIVE);
    record(&ws);
    let events = ws.log_events();
    assert_eq!(events.first().unwrap()["event"], "run_start");
    assert_eq!(events.last().unwrap()["event"], "run_complete");
    assert!(events.iter().any(|e| e["event"] == "barrier_released"));
    assert_eq!(
        events
            .iter()
            .filter(|e| e["event"] == "reference_updated")
            .count(),
        2
    );
}

#[test]
fn generator_that_writes_nothing_is_a_generator_failure() {
    let ws = Workspace::new();
    ws.add_case("enabled", "silent", SILENT_POOL);
    let summary = ws
        .harness(ws.config())
        .run(&RunOptions {
            phases: PhaseSelection::Bootlist,
            ..RunOptions::default()
        })
        .unwrap();
    let report = summary.find("enabled/silent", Phase::Bootlist).unwrap();
    assert_eq!(report.error_code.as_deref(), Some("ZBH-3001"));
    let Verdict::Failed(details) = &report.verdict else {
        panic!("expected failure, got {:?}", report.verdict);
    };
    assert!(details.starts_with("generator error"), "{details}");
    assert!(details.contains("without writing"), "{details}");
}

#[test]
fn undeclared_active_root_logs_a_topology_warning() {
    let ws = Workspace::new();
    ws.add_case("enabled", "dangling", DANGLING_ROOT);
    record(&ws);

    let bootlist = ws.reference("enabled/dangling", "bootlist");
    assert_eq!(bootlist.split('\t').nth(3), Some("-"));

    let events = ws.log_events();
    let warnings: Vec<_> = events
        .iter()
        .filter(|e| e["event"] == "topology_warning")
        .collect();
    assert_eq!(warnings.len(), 2, "one per phase");
    assert!(warnings.iter().all(|e| e["case"] == "enabled/dangling"
        && e["severity"] == "warning"
        && e["details"].as_str().unwrap().contains("rpool/ROOT/gone")));
    assert!(
        events
            .iter()
            .filter(|e| e["event"] == "case_start")
            .all(|e| e["severity"] == "info")
    );
    assert!(events.iter().any(|e| e["event"] == "topology_materialized"
        && e["details"]
            .as_str()
            .unwrap()
            .contains("pools=rpool-enabled_dangling datasets=1")));
}

#[test]
fn cancellation_skips_pending_cases_and_restores_binary() {
    let ws = Workspace::new();
    ws.add_case("no-mokutil", "a_hang", HANGING_POOL);
    ws.add_case("no-mokutil", "b_one_pool", ONE_POOL_ACTIVE);
    ws.add_case("no-mokutil", "c_two_pools", TWO_POOLS);
    let host_binary = ws.path().join("host-bin/mokutil");
    common::write_script(&host_binary, "#!/bin/sh\necho real\n");
    let started = ws.path().join("generator-started");

    let mut config = ws.config();
    config.run.dangerous = true;
    config.run.parallelism = 1;
    config.generator.deadline_secs = 60;
    let cancel = Arc::new(AtomicBool::new(false));
    let harness = ws
        .harness(config)
        .with_root_privileges(true)
        .with_host_env(ws.host_env_with(&[("ZBH_TEST_STARTED", &started)]))
        .with_cancel_flag(Arc::clone(&cancel));
    let options = RunOptions {
        phases: PhaseSelection::Bootlist,
        ..RunOptions::default()
    };

    let start = Instant::now();
    let summary = thread::scope(|scope| {
        let run = scope.spawn(|| harness.run(&options));
        common::wait_for_file(&started, Duration::from_secs(10));
        assert!(!host_binary.exists(), "binary is hidden while the generator runs");
        cancel.store(true, Ordering::Relaxed);
        run.join().unwrap()
    })
    .unwrap();

    assert!(start.elapsed() < Duration::from_secs(20));
    assert!(summary.cancelled);
    assert!(!summary.is_success());
    let hung = summary.find("no-mokutil/a_hang", Phase::Bootlist).unwrap();
    assert_eq!(hung.error_code.as_deref(), Some("ZBH-3004"));
    for case in ["no-mokutil/b_one_pool", "no-mokutil/c_two_pools"] {
        match &summary.find(case, Phase::Bootlist).unwrap().verdict {
            Verdict::Skipped(reason) => assert!(reason.contains("cancelled"), "{reason}"),
            other => panic!("unexpected verdict for {case}: {other:?}"),
        }
    }
    assert_eq!(fs::read_to_string(&host_binary).unwrap(), "#!/bin/sh\necho real\n");
    assert!(!ws.path().join("host-bin/mokutil.bak").exists());
}
