//! Command-line surface tests.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn vpnmupd() -> Command {
    let mut cmd = Command::cargo_bin("vpnmupd").unwrap();
    cmd.env_remove("VPNMUPD_CONFIG").env_remove("RUST_LOG");
    cmd
}

#[test]
fn help_lists_modes() {
    vpnmupd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--update"))
        .stdout(predicate::str::contains("--uninstall"))
        .stdout(predicate::str::contains("--config"));
}

#[test]
fn update_and_uninstall_conflict() {
    vpnmupd()
        .args(["--update", "--uninstall"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn invalid_config_is_reported() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("config.toml");
    std::fs::write(&config, "install_dir = [").unwrap();

    vpnmupd()
        .arg("--uninstall")
        .arg("--config")
        .arg(&config)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("error"));
}

#[test]
fn uninstall_with_nothing_installed() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("config.toml");
    std::fs::write(
        &config,
        format!(
            "install_dir = {:?}\nunit_dir = {:?}\nstaging_dir = {:?}\n",
            temp.path().join("bin").display().to_string(),
            temp.path().join("units").display().to_string(),
            temp.path().display().to_string(),
        ),
    )
    .unwrap();

    vpnmupd()
        .arg("--uninstall")
        .env("VPNMUPD_CONFIG", &config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Nothing to uninstall"));
}
