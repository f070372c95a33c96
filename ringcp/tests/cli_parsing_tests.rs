//! CLI Argument Parsing Tests
//!
//! These tests verify that command-line arguments are parsed correctly and that the accepted
//! value formats stay stable across versions.

use assert_cmd::Command;

#[test]
fn test_help_runs() {
    Command::cargo_bin("ringcp")
        .unwrap()
        .arg("--help")
        .assert()
        .success();
}

#[test]
fn test_version_runs() {
    Command::cargo_bin("ringcp")
        .unwrap()
        .arg("--version")
        .assert()
        .success();
}

#[test]
fn test_missing_destination_is_rejected() {
    Command::cargo_bin("ringcp")
        .unwrap()
        .arg("/dev/null")
        .assert()
        .failure();
}

// ============================================================================
// ProgressType Argument Parsing Tests
// ============================================================================

#[test]
fn test_progress_type_accepts_all_spellings() {
    for value in [
        "auto",
        "Auto",
        "progress-bar",
        "ProgressBar",
        "text-updates",
        "TextUpdates",
    ] {
        Command::cargo_bin("ringcp")
            .unwrap()
            .args(["--progress-type", value, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_progress_type_rejects_unknown_value() {
    Command::cargo_bin("ringcp")
        .unwrap()
        .args(["--progress-type", "fancy", "a", "b"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("invalid value"));
}

// ============================================================================
// Size Argument Parsing Tests
// ============================================================================

#[test]
fn test_block_size_accepts_units() {
    for value in ["4096", "4KiB", "1MiB", "128KB"] {
        Command::cargo_bin("ringcp")
            .unwrap()
            .args(["--block-size", value, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_block_size_rejects_garbage() {
    Command::cargo_bin("ringcp")
        .unwrap()
        .args(["--block-size", "lots", "a", "b"])
        .assert()
        .failure();
}

// ============================================================================
// Overwrite Argument Parsing Tests
// ============================================================================

#[test]
fn test_no_clobber_accepts_both_spellings() {
    for value in ["-n", "--no-clobber"] {
        Command::cargo_bin("ringcp")
            .unwrap()
            .args([value, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_overwrite_flag_is_gone() {
    Command::cargo_bin("ringcp")
        .unwrap()
        .args(["--overwrite", "a", "b"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("unexpected argument"));
}
