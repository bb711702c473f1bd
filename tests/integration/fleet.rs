use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use keyfleet::fleet::READ_AUTHORIZED_KEYS;
use keyfleet::ssh::Target;
use keyfleet::{Action, Config, FleetReport, HostOutcome, KeyManager};
use tempfile::{tempdir, TempDir};
use test_utils::keys::{three_entry_file, ALICE, BOB, CAROL, DAVE};
use test_utils::{FakeFleet, FakeHost};

fn key_file(dir: &Path, name: &str, line: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("{line}\n")).unwrap();
    path
}

fn targets(servers: &[&str]) -> Vec<Target> {
    let servers = servers.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    let config = Config::default();
    config.targets(&servers, "deploy", None).unwrap()
}

/// A fleet made of the single host `h1`
fn one_host(host: FakeHost) -> FakeFleet {
    FakeFleet::new().with_host("h1", host)
}

fn outcomes(report: &FleetReport) -> Vec<HostOutcome> {
    report.hosts.iter().map(|h| h.outcome.clone()).collect()
}

fn failed_with(outcome: &HostOutcome, message: &str) -> bool {
    matches!(outcome, HostOutcome::Failed(reason) if reason.contains(message))
}

/// `ssh-ed25519 <base64>` of a fixture key, without its comment
fn key_material(line: &str) -> String {
    line.split(' ').take(2).collect::<Vec<_>>().join(" ")
}

struct Setup {
    dir: TempDir,
    fleet: FakeFleet,
}

impl Setup {
    fn new(fleet: FakeFleet) -> Self {
        Self {
            dir: tempdir().unwrap(),
            fleet,
        }
    }

    fn key(&self, name: &str, line: &str) -> PathBuf {
        key_file(self.dir.path(), name, line)
    }

    fn manager(&self) -> KeyManager<FakeFleet> {
        KeyManager::new(self.fleet.clone())
    }

    /// authorized_keys of `hostname`, which must be valid UTF-8
    fn keys_of(&self, hostname: &str) -> String {
        let content = self.fleet.authorized_keys(hostname).unwrap();
        String::from_utf8(content).unwrap()
    }
}

#[test]
fn test_distribute_visits_every_server_in_order() -> Result<()> {
    let setup = Setup::new(
        FakeFleet::new()
            .with_host("h1", FakeHost::with_keys(format!("{BOB}\n")))
            .with_host("h2", FakeHost::unreachable())
            .with_host("h3", FakeHost::default()),
    );
    let key = setup.key("alice.pub", ALICE);

    let report = setup
        .manager()
        .distribute(&targets(&["h1", "h2", "h3"]), &key, false)?;

    assert_eq!(setup.fleet.connection_attempts(), ["h1", "h2", "h3"]);
    assert_eq!(report.action, Action::Distribute);
    let outcomes = outcomes(&report);
    assert_eq!(outcomes[0], HostOutcome::Changed);
    assert!(failed_with(&outcomes[1], "Connection refused"));
    assert_eq!(outcomes[2], HostOutcome::Changed);
    assert_eq!(report.failed(), 1);
    assert!(!report.is_success());

    assert_eq!(setup.keys_of("h1"), format!("{BOB}\n{ALICE}\n"));
    // a missing authorized_keys file gets created
    assert_eq!(setup.keys_of("h3"), format!("{ALICE}\n"));
    Ok(())
}

#[test]
fn test_distribute_twice_appends_second_copy() -> Result<()> {
    let setup = Setup::new(one_host(FakeHost::default()));
    let key = setup.key("alice.pub", ALICE);
    let manager = setup.manager();

    manager.distribute(&targets(&["h1"]), &key, false)?;
    let report = manager.distribute(&targets(&["h1"]), &key, false)?;

    assert!(report.is_success());
    assert_eq!(setup.keys_of("h1"), format!("{ALICE}\n{ALICE}\n"));
    Ok(())
}

#[test]
fn test_distribute_skip_present() -> Result<()> {
    let setup = Setup::new(
        FakeFleet::new()
            .with_host("h1", FakeHost::with_keys(three_entry_file()))
            .with_host("h2", FakeHost::with_keys(format!("{BOB}\n"))),
    );
    let key = setup.key("alice.pub", ALICE);

    let report = setup
        .manager()
        .distribute(&targets(&["h1", "h2"]), &key, true)?;

    assert!(matches!(outcomes(&report)[0], HostOutcome::Unchanged(_)));
    assert_eq!(outcomes(&report)[1], HostOutcome::Changed);
    assert_eq!(setup.fleet.writes_to("h1"), 0);
    assert_eq!(setup.keys_of("h1"), three_entry_file());
    assert_eq!(setup.keys_of("h2"), format!("{BOB}\n{ALICE}\n"));
    Ok(())
}

#[test]
fn test_distribute_keeps_non_utf8_lines_byte_for_byte() -> Result<()> {
    let mut content = format!("{} jos", key_material(BOB)).into_bytes();
    content.extend_from_slice(b"\xe9@host\n# caf\xe9\n");
    let setup = Setup::new(one_host(FakeHost::with_keys(&content)));
    let alice = setup.key("alice.pub", ALICE);
    let bob = setup.key("bob.pub", BOB);

    let report = setup
        .manager()
        .distribute(&targets(&["h1"]), &alice, false)?;
    assert!(report.is_success());
    let mut expected = content.clone();
    expected.extend_from_slice(format!("{ALICE}\n").as_bytes());
    assert_eq!(setup.fleet.authorized_keys("h1"), Some(expected));

    // the entry with the non UTF-8 comment is still recognised as bob's key
    setup.manager().revoke(&targets(&["h1"]), &bob)?;
    let mut expected = b"# caf\xe9\n".to_vec();
    expected.extend_from_slice(format!("{ALICE}\n").as_bytes());
    assert_eq!(setup.fleet.authorized_keys("h1"), Some(expected));
    Ok(())
}

#[test]
fn test_crlf_file_keeps_its_line_endings() -> Result<()> {
    let content = format!("# fleet\r\n{ALICE}\r\n{BOB}\r\n{CAROL}\r\n");
    let setup = Setup::new(one_host(FakeHost::with_keys(&content)));
    let bob = setup.key("bob.pub", BOB);
    let dave = setup.key("dave.pub", DAVE);

    setup.manager().revoke(&targets(&["h1"]), &bob)?;
    assert_eq!(
        setup.keys_of("h1"),
        format!("# fleet\r\n{ALICE}\r\n{CAROL}\r\n")
    );

    setup
        .manager()
        .distribute(&targets(&["h1"]), &dave, false)?;
    assert_eq!(
        setup.keys_of("h1"),
        format!("# fleet\r\n{ALICE}\r\n{CAROL}\r\n{DAVE}\r\n")
    );
    Ok(())
}

#[test]
fn test_rotate_replaces_old_key() -> Result<()> {
    let setup = Setup::new(one_host(FakeHost::with_keys(three_entry_file())));
    let old = setup.key("bob.pub", BOB);
    let new = setup.key("dave.pub", DAVE);

    let report = setup.manager().rotate(&targets(&["h1"]), &old, &new)?;

    assert_eq!(outcomes(&report), [HostOutcome::Changed]);
    assert_eq!(setup.keys_of("h1"), format!("{ALICE}\n{DAVE}\n{CAROL}\n"));
    Ok(())
}

#[test]
fn test_rotate_without_old_key_leaves_file_alone() -> Result<()> {
    let setup = Setup::new(one_host(FakeHost::with_keys(three_entry_file())));
    let old = setup.key("dave.pub", DAVE);
    let new = setup.key("bob.pub", BOB);

    let report = setup.manager().rotate(&targets(&["h1"]), &old, &new)?;

    assert!(report.is_success());
    assert_eq!(
        outcomes(&report),
        [HostOutcome::Unchanged("old key not present".to_string())]
    );
    assert_eq!(
        setup.fleet.commands(),
        [("h1".to_string(), READ_AUTHORIZED_KEYS.to_string())]
    );
    assert_eq!(setup.keys_of("h1"), three_entry_file());
    Ok(())
}

#[test]
fn test_revoke_removes_only_matching_entry() -> Result<()> {
    let setup = Setup::new(one_host(FakeHost::with_keys(three_entry_file())));
    let key = setup.key("carol.pub", CAROL);

    let report = setup.manager().revoke(&targets(&["h1"]), &key)?;

    assert_eq!(outcomes(&report), [HostOutcome::Changed]);
    assert_eq!(setup.keys_of("h1"), format!("{ALICE}\n{BOB}\n"));
    Ok(())
}

#[test]
fn test_revoke_matches_key_with_other_comment_and_options() -> Result<()> {
    let bob = key_material(BOB);
    let content = format!("{ALICE}\nrestrict {bob} bob@laptop\n# keep me\n{CAROL}\n");
    let setup = Setup::new(one_host(FakeHost::with_keys(content)));
    let key = setup.key("bob.pub", BOB);

    setup.manager().revoke(&targets(&["h1"]), &key)?;

    assert_eq!(setup.keys_of("h1"), format!("{ALICE}\n# keep me\n{CAROL}\n"));
    Ok(())
}

#[test]
fn test_missing_key_file_aborts_before_connecting() {
    let setup = Setup::new(
        FakeFleet::new()
            .with_host("h1", FakeHost::default())
            .with_host("h2", FakeHost::default()),
    );
    let missing = setup.dir.path().join("missing.pub");
    let present = setup.key("alice.pub", ALICE);
    let servers = targets(&["h1", "h2"]);
    let manager = setup.manager();

    assert!(manager.distribute(&servers, &missing, false).is_err());
    assert!(manager.rotate(&servers, &missing, &present).is_err());
    assert!(manager.rotate(&servers, &present, &missing).is_err());
    assert!(manager.revoke(&servers, &missing).is_err());
    assert!(setup.fleet.connection_attempts().is_empty());
}

#[test]
fn test_malformed_key_file_aborts_before_connecting() {
    let setup = Setup::new(one_host(FakeHost::default()));
    let partial = setup.key("partial.pub", "ssh-ed25519");

    assert!(setup.manager().revoke(&targets(&["h1"]), &partial).is_err());
    assert!(setup.fleet.connection_attempts().is_empty());
}

#[test]
fn test_second_host_connection_error_does_not_stop_run() -> Result<()> {
    let setup = Setup::new(
        FakeFleet::new()
            .with_host("h1", FakeHost::with_keys(three_entry_file()))
            .with_host("h2", FakeHost::unreachable()),
    );
    let key = setup.key("alice.pub", ALICE);

    let report = setup.manager().revoke(&targets(&["h1", "h2"]), &key)?;

    assert_eq!(report.hosts[0].name, "h1");
    assert_eq!(report.hosts[0].outcome, HostOutcome::Changed);
    assert_eq!(report.hosts[1].name, "h2");
    assert!(matches!(report.hosts[1].outcome, HostOutcome::Failed(_)));
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.failed(), 1);
    Ok(())
}

#[test]
fn test_one_connection_at_a_time_and_always_released() -> Result<()> {
    let read_only = FakeHost {
        read_only: true,
        ..Default::default()
    };
    let setup = Setup::new(
        FakeFleet::new()
            .with_host("h1", FakeHost::default())
            .with_host("h2", read_only)
            .with_host("h3", FakeHost::unreachable())
            .with_host("h4", FakeHost::default()),
    );
    let key = setup.key("alice.pub", ALICE);

    let report = setup
        .manager()
        .distribute(&targets(&["h1", "h2", "h3", "h4"]), &key, false)?;

    assert!(failed_with(&report.hosts[1].outcome, "Permission denied"));
    assert_eq!(setup.fleet.max_open_sessions(), 1);
    assert_eq!(setup.fleet.open_sessions(), 0);
    // h3 never connected, the other three were closed
    assert_eq!(setup.fleet.closed_sessions(), 3);
    assert_eq!(setup.keys_of("h4"), format!("{ALICE}\n"));
    Ok(())
}

#[test]
fn test_password_is_passed_to_connector() -> Result<()> {
    let host = FakeHost {
        password: Some("hunter2".to_string()),
        ..Default::default()
    };
    let setup = Setup::new(one_host(host));
    let key = setup.key("alice.pub", ALICE);
    let servers = vec!["h1".to_string()];

    let config = Config::default();

    let wrong = config.targets(&servers, "deploy", Some("letmein"))?;
    let report = setup.manager().distribute(&wrong, &key, false)?;
    assert!(failed_with(&report.hosts[0].outcome, "Permission denied"));

    let right = config.targets(&servers, "deploy", Some("hunter2"))?;
    let report = setup.manager().distribute(&right, &key, false)?;
    assert!(report.is_success());
    Ok(())
}
