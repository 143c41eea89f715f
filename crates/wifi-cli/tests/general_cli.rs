//! General CLI tests covering help, version and argument validation
//!
//! None of these reach a testbed host: they fail in argument parsing or in
//! the checks that run before the first remote command.

use assert_cmd::Command;
use predicates::prelude::*;

/// Helper function to create a command instance for the wifi-cli binary
fn cli_command() -> Command {
    Command::cargo_bin("wifi-cli").expect("Failed to find wifi-cli binary")
}

#[test]
fn test_cli_help_and_version() {
    let mut cmd = cli_command();
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains(
            "CLI tool for provisioning Wi-Fi testbed nodes",
        ))
        .stdout(predicate::str::contains("Commands:"));

    let mut cmd = cli_command();
    cmd.arg("--version");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("wifi-cli"));
}

#[test]
fn test_cli_invalid_command() {
    let mut cmd = cli_command();
    cmd.arg("invalid-command");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("error: unrecognized subcommand"));
}

#[test]
fn test_subcommand_help() {
    let subcommands = vec![
        ("ap", "Start an access point"),
        ("connect", "Connect stations to an access point"),
        ("scan", "Scan for networks"),
        ("teardown", "Remove interfaces and daemons"),
        ("speed-test", "Measure throughput"),
        ("kernel", "List installed kernels"),
    ];

    for (cmd, description) in subcommands {
        let mut command = cli_command();
        command.args([cmd, "--help"]);
        command
            .assert()
            .success()
            .stdout(predicate::str::contains(description));
    }
}

#[test]
fn test_phy_and_interface_conflict() {
    let mut cmd = cli_command();
    cmd.args(["ap", "-H", "nuc4", "--phy", "phy0", "--interface", "phy0_ap"]);

    cmd.assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn test_target_is_required() {
    let mut cmd = cli_command();
    cmd.args(["connect", "-H", "nuc5"]);

    cmd.assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("required arguments were not provided"));
}

#[test]
fn test_teardown_radio_cannot_reload_driver() {
    let mut cmd = cli_command();
    cmd.args(["teardown", "-H", "nuc4", "--phy", "phy0", "--reload-driver"]);

    cmd.assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn test_invalid_traffic_type() {
    let mut cmd = cli_command();
    cmd.args(["speed-test", "--ap", "nuc4", "--sta", "nuc5", "--traffic", "quic"]);

    cmd.assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("unknown traffic type 'quic'"));
}

#[test]
fn test_speed_test_duration_must_fit_command_timeout() {
    let mut cmd = cli_command();
    cmd.args(["speed-test", "--ap", "nuc4", "--sta", "nuc5", "-t", "90", "--no-setup"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("must be shorter than the command timeout"));
}

#[test]
fn test_connect_fixed_ip_needs_single_host() {
    let mut cmd = cli_command();
    cmd.args([
        "connect", "-H", "nuc5,nuc6", "--interface", "wlan0", "--ip", "10.1.1.20",
    ]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("--ip can only be used with a single host"));
}

#[test]
fn test_sweep_validation() {
    let mut cmd = cli_command();
    cmd.args(["sweep", "-H", "nuc4"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("at least two hosts"));

    let mut cmd = cli_command();
    cmd.args(["sweep", "-H", "nuc4,nuc5", "--presets", "2.4ghz,60ghz"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Unknown radio preset: 60ghz"));
}
