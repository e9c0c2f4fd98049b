//! Validation and precedence coverage for the layered configuration.

use transient::{RunConfig, RunOverrides, StoreConfig, config::expand_tilde};

#[test]
fn run_defaults_match_documented_values() {
    let config = RunConfig::defaults();
    assert_eq!(config.ssh_user, "vagrant");
    assert_eq!(config.ssh_timeout_secs, 90);
    assert_eq!(config.shutdown_timeout_secs, 20);
    assert_eq!(config.qemu_bin, "qemu-system-x86_64");
    assert_eq!(config.ssh_port, None);
    assert!(config.validate().is_ok());
}

#[test]
fn empty_required_field_names_its_sources() {
    let config = RunConfig {
        ssh_user: String::from("   "),
        ..RunConfig::defaults()
    };
    let err = config
        .validate()
        .expect_err("blank ssh_user should be rejected");
    let message = err.to_string();
    assert!(
        message.contains("TRANSIENT_RUN_SSH_USER"),
        "message should name the environment variable: {message}"
    );
    assert!(
        message.contains("[run]"),
        "message should name the TOML section: {message}"
    );
}

#[test]
fn blank_identity_file_is_rejected_but_absent_is_fine() {
    let absent = RunConfig::defaults();
    assert!(absent.validate().is_ok());

    let blank = RunConfig {
        ssh_identity_file: Some(String::from("  ")),
        ..RunConfig::defaults()
    };
    assert!(blank.validate().is_err());
}

#[test]
fn cli_overrides_win_over_layered_values() {
    let config = RunConfig::defaults().merge_overrides(RunOverrides {
        ssh_user: Some(String::from("root")),
        ssh_port: Some(2222),
        ssh_timeout_secs: Some(10),
        shutdown_timeout_secs: None,
        copy_timeout_secs: None,
    });

    assert_eq!(config.ssh_user, "root");
    assert_eq!(config.ssh_port, Some(2222));
    assert_eq!(config.ssh_timeout_secs, 10);
    // Untouched overrides keep the layered value.
    assert_eq!(config.shutdown_timeout_secs, 20);
    assert_eq!(config.copy_timeout_secs, 30);
}

#[test]
fn empty_overrides_change_nothing() {
    let config = RunConfig::defaults().merge_overrides(RunOverrides::default());
    assert_eq!(config, RunConfig::defaults());
}

#[test]
fn store_paths_expand_the_home_prefix() {
    let config = StoreConfig {
        backend_dir: String::from("~/images/backend"),
        ..StoreConfig::defaults()
    };

    match std::env::var("HOME") {
        Ok(home) => {
            assert_eq!(
                config.backend_path().as_str(),
                format!("{home}/images/backend")
            );
        }
        Err(_) => {
            // Without HOME the tilde is passed through untouched.
            assert_eq!(config.backend_path().as_str(), "~/images/backend");
        }
    }
}

#[test]
fn expand_tilde_only_touches_the_leading_prefix() {
    assert_eq!(expand_tilde("/absolute/path"), "/absolute/path");
    assert_eq!(expand_tilde("relative/~/path"), "relative/~/path");
}

#[test]
fn store_defaults_validate() {
    assert!(StoreConfig::defaults().validate().is_ok());
}
