//! Tests for configuration loading and validation.

use rstest::*;
use stacktester::config::ConfigError;
use stacktester::test_support::{EnvGuard, fake_suite_config};
use stacktester::{KnownIssue, SuiteConfig};
use tempfile::TempDir;

#[fixture]
fn valid_config() -> SuiteConfig {
    fake_suite_config()
}

#[rstest]
fn fake_configuration_is_valid(valid_config: SuiteConfig) {
    assert_eq!(valid_config.validate(), Ok(()));
}

#[rstest]
#[case::host(|cfg: &mut SuiteConfig| cfg.compute.host.clear(), "STACKTESTER_COMPUTE_HOST", "host", "[compute]")]
#[case::token(
    |cfg: &mut SuiteConfig| cfg.compute.auth_token.clear(),
    "STACKTESTER_COMPUTE_AUTH_TOKEN",
    "auth_token",
    "[compute]"
)]
#[case::image(
    |cfg: &mut SuiteConfig| cfg.environment.image_ref.clear(),
    "STACKTESTER_ENV_IMAGE_REF",
    "image_ref",
    "[env]"
)]
#[case::image_alt(
    |cfg: &mut SuiteConfig| cfg.environment.image_ref_alt = String::from("  "),
    "STACKTESTER_ENV_IMAGE_REF_ALT",
    "image_ref_alt",
    "[env]"
)]
#[case::flavor(
    |cfg: &mut SuiteConfig| cfg.environment.flavor_ref.clear(),
    "STACKTESTER_ENV_FLAVOR_REF",
    "flavor_ref",
    "[env]"
)]
#[case::flavor_alt(
    |cfg: &mut SuiteConfig| cfg.environment.flavor_ref_alt.clear(),
    "STACKTESTER_ENV_FLAVOR_REF_ALT",
    "flavor_ref_alt",
    "[env]"
)]
#[case::login(|cfg: &mut SuiteConfig| cfg.ssh.login.clear(), "STACKTESTER_SSH_LOGIN", "login", "[ssh]")]
fn missing_fields_produce_actionable_errors(
    valid_config: SuiteConfig,
    #[case] mutate: fn(&mut SuiteConfig),
    #[case] env_var: &str,
    #[case] toml_key: &str,
    #[case] section: &str,
) {
    let mut cfg = valid_config;
    mutate(&mut cfg);

    let error = cfg.validate().expect_err("validation should fail");
    let ConfigError::MissingField(ref message) = error else {
        panic!("expected MissingField error, got {error:?}");
    };
    assert!(
        message.contains(env_var),
        "error should mention env var {env_var}: {message}"
    );
    assert!(
        message.contains(toml_key),
        "error should mention TOML key {toml_key}: {message}"
    );
    assert!(
        message.contains(section),
        "error should mention section {section}: {message}"
    );
    assert!(
        message.contains("stacktester.toml"),
        "error should mention config file: {message}"
    );
}

#[rstest]
#[case::poll(|cfg: &mut SuiteConfig| cfg.compute.poll_interval_secs = 0, "STACKTESTER_COMPUTE_POLL_INTERVAL_SECS")]
#[case::build(|cfg: &mut SuiteConfig| cfg.compute.build_timeout_secs = 0, "STACKTESTER_COMPUTE_BUILD_TIMEOUT_SECS")]
#[case::cycle(|cfg: &mut SuiteConfig| cfg.ssh.cycle_timeout_secs = 0, "STACKTESTER_SSH_CYCLE_TIMEOUT_SECS")]
fn zero_durations_are_rejected(
    valid_config: SuiteConfig,
    #[case] mutate: fn(&mut SuiteConfig),
    #[case] env_var: &str,
) {
    let mut cfg = valid_config;
    mutate(&mut cfg);

    let error = cfg.validate().expect_err("zero is invalid");
    let ConfigError::Invalid(ref message) = error else {
        panic!("expected Invalid error, got {error:?}");
    };
    assert!(message.contains("at least one second"), "{message}");
    assert!(message.contains(env_var), "{message}");
}

#[rstest]
fn unknown_fixed_issue_is_rejected(valid_config: SuiteConfig) {
    let mut cfg = valid_config;
    cfg.environment.fixed_issues = String::from("lp803505, lp999999");

    let error = cfg.validate().expect_err("unknown issue");

    assert!(matches!(error, ConfigError::UnknownIssue(_)), "{error:?}");
    assert!(error.to_string().contains("lp999999"), "{error}");
}

#[rstest]
fn fixed_issues_are_parsed(valid_config: SuiteConfig) {
    let mut cfg = valid_config;
    cfg.environment.fixed_issues = String::from("lp803505,create-image-status");

    let issues = cfg
        .environment
        .known_issues()
        .unwrap_or_else(|err| panic!("known issues should parse: {err}"));

    assert!(issues.is_fixed(KnownIssue::ImageLinks));
    assert!(issues.is_fixed(KnownIssue::CreateImageStatus));
    assert!(!issues.is_fixed(KnownIssue::RebootStatus));
}

#[test]
fn api_root_includes_the_version_prefix() {
    let cfg = fake_suite_config();

    assert_eq!(cfg.compute.bookmark_root(), "http://nova.test:8774");
    assert_eq!(cfg.compute.api_root(), "http://nova.test:8774/v1.1");
}

const LOADED_VARS: [&str; 9] = [
    "STACKTESTER_CONFIG_PATH",
    "STACKTESTER_COMPUTE_HOST",
    "STACKTESTER_COMPUTE_AUTH_TOKEN",
    "STACKTESTER_ENV_IMAGE_REF",
    "STACKTESTER_ENV_IMAGE_REF_ALT",
    "STACKTESTER_ENV_FLAVOR_REF",
    "STACKTESTER_ENV_FLAVOR_REF_ALT",
    "STACKTESTER_ENV_MULTI_NODE",
    "STACKTESTER_ENV_FIXED_ISSUES",
];

fn isolated_home() -> (TempDir, String) {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let home = tmp.path().to_string_lossy().to_string();
    (tmp, home)
}

#[tokio::test]
async fn configuration_loads_from_environment_variables() {
    let (_tmp, home) = isolated_home();
    let values = [
        None,
        Some("nova.example"),
        Some("secret-token"),
        Some("3"),
        Some("4"),
        Some("1"),
        Some("2"),
        Some("true"),
        Some("lp803505"),
    ];
    let mut pairs: Vec<(&str, Option<&str>)> = LOADED_VARS.into_iter().zip(values).collect();
    pairs.push(("HOME", Some(home.as_str())));
    pairs.push(("XDG_CONFIG_HOME", Some(home.as_str())));
    let _guard = EnvGuard::set_vars(&pairs).await;

    let cfg = SuiteConfig::load_without_cli_args()
        .unwrap_or_else(|err| panic!("configuration should load: {err}"));

    assert_eq!(cfg.compute.host, "nova.example");
    assert_eq!(cfg.compute.auth_token, "secret-token");
    assert_eq!(cfg.compute.port, 8774);
    assert_eq!(cfg.environment.image_ref, "3");
    assert_eq!(cfg.environment.image_ref_alt, "4");
    assert!(cfg.environment.multi_node);
    assert_eq!(cfg.ssh.login, "root");
}

#[tokio::test]
async fn loading_without_a_host_names_the_variable_to_set() {
    let (_tmp, home) = isolated_home();
    let mut pairs: Vec<(&str, Option<&str>)> =
        LOADED_VARS.into_iter().map(|key| (key, None)).collect();
    pairs.push(("HOME", Some(home.as_str())));
    pairs.push(("XDG_CONFIG_HOME", Some(home.as_str())));
    let _guard = EnvGuard::set_vars(&pairs).await;

    let error = SuiteConfig::load_without_cli_args().expect_err("host is required");

    assert!(
        error.to_string().contains("STACKTESTER_COMPUTE_HOST"),
        "{error}"
    );
}
