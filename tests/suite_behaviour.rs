//! Behavioural tests running the whole suite against the in-memory cloud.
//!
//! Every test pauses the tokio clock, so the multi-second waits of reboots
//! and status polls complete instantly.

use rstest::*;
use stacktester::test_support::{FakeCloud, FakeHosts, fake_suite_config};
use stacktester::{
    KnownIssue, ScenarioOutcome, SuiteConfig, SuiteContext, SuiteReport, SuiteRunner,
    all_scenarios,
};

#[fixture]
fn cloud() -> FakeCloud {
    FakeCloud::new()
}

fn runner(cloud: &FakeCloud, config: SuiteConfig) -> SuiteRunner<FakeCloud, FakeHosts> {
    let context = SuiteContext::new(cloud.clone(), cloud.hosts(), config)
        .unwrap_or_else(|err| panic!("context should build: {err}"));
    SuiteRunner::new(context, all_scenarios())
}

fn multi_node_config() -> SuiteConfig {
    let mut config = fake_suite_config();
    config.environment.multi_node = true;
    config
}

fn outcome_of<'a>(report: &'a SuiteReport, name: &str) -> &'a ScenarioOutcome {
    report
        .results()
        .iter()
        .find(|result| result.name == name)
        .map(|result| &result.outcome)
        .unwrap_or_else(|| panic!("{name} should have run:\n{report}"))
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn conforming_cloud_passes_every_scenario(cloud: FakeCloud) {
    let report = runner(&cloud, multi_node_config()).run().await;

    assert_eq!(report.passed(), 11, "{report}");
    assert_eq!(report.exit_code(), 0, "{report}");
    assert_eq!(cloud.server_count(), 0);
    assert_eq!(cloud.snapshot_count(), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn strict_checks_pass_once_every_issue_is_fixed(cloud: FakeCloud) {
    let mut config = multi_node_config();
    config.environment.fixed_issues = KnownIssue::ALL
        .iter()
        .map(|issue| issue.id())
        .collect::<Vec<_>>()
        .join(",");
    for issue in KnownIssue::ALL {
        cloud.fix(issue);
    }

    let report = runner(&cloud, config).run().await;

    assert_eq!(report.passed(), 11, "{report}");
    assert_eq!(cloud.server_count(), 0);
    assert_eq!(cloud.snapshot_count(), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn resize_is_skipped_on_a_single_node(cloud: FakeCloud) {
    let report = runner(&cloud, fake_suite_config()).run().await;

    assert_eq!(report.skipped(), 2, "{report}");
    assert_eq!(report.passed(), 9, "{report}");
    assert_eq!(
        outcome_of(&report, "servers::resize_revert"),
        &ScenarioOutcome::Skipped(String::from("multiple compute nodes required"))
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn skipped_scenarios_never_touch_the_api(cloud: FakeCloud) {
    let report = runner(&cloud, fake_suite_config())
        .with_filter("resize")
        .run()
        .await;

    assert_eq!(report.skipped(), 2, "{report}");
    assert_eq!(cloud.requests(), Vec::<String>::new());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn rejected_action_fails_the_scenario_and_still_cleans_up(cloud: FakeCloud) {
    cloud.fail_next_action("changePassword", 500);

    let report = runner(&cloud, fake_suite_config())
        .with_filter("change_password")
        .run()
        .await;

    assert_eq!(report.results().len(), 1, "{report}");
    let ScenarioOutcome::Failed(message) =
        outcome_of(&report, "servers::change_password_and_reboot")
    else {
        panic!("expected a failure:\n{report}");
    };
    assert!(message.contains("changePassword"), "{message}");
    assert!(message.contains("500"), "{message}");
    assert_eq!(cloud.server_count(), 0);
    assert_eq!(report.exit_code(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failed_teardown_marks_a_passing_scenario_as_errored(cloud: FakeCloud) {
    cloud.fail_deletes(true);

    let report = runner(&cloud, fake_suite_config())
        .with_filter("servers::change_password")
        .run()
        .await;

    let ScenarioOutcome::Errored(message) =
        outcome_of(&report, "servers::change_password_and_reboot")
    else {
        panic!("expected an error:\n{report}");
    };
    assert!(message.starts_with("teardown failed"), "{message}");
    assert_eq!(cloud.server_count(), 1);
}

#[rstest]
#[case::tolerated(false, false, true)]
#[case::declared_and_fixed(true, true, true)]
#[case::declared_but_broken(true, false, false)]
#[tokio::test(start_paused = true)]
async fn image_links_are_checked_only_when_declared_fixed(
    cloud: FakeCloud,
    #[case] declared: bool,
    #[case] fixed: bool,
    #[case] passes: bool,
) {
    let mut config = fake_suite_config();
    if declared {
        config.environment.fixed_issues = String::from("lp803505");
    }
    if fixed {
        cloud.fix(KnownIssue::ImageLinks);
    }

    let report = runner(&cloud, config).with_filter("images::index").run().await;

    let outcome = outcome_of(&report, "images::index");
    if passes {
        assert_eq!(outcome, &ScenarioOutcome::Passed, "{report}");
    } else {
        let ScenarioOutcome::Failed(message) = outcome else {
            panic!("expected a failure:\n{report}");
        };
        assert!(message.contains("links of image"), "{message}");
    }
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn strict_snapshot_check_rejects_a_cloud_that_snapshots_building_servers(
    cloud: FakeCloud,
) {
    let mut config = fake_suite_config();
    config.environment.fixed_issues = String::from("snapshot-building-server");

    let report = runner(&cloud, config)
        .with_filter("snapshot_server_not_active")
        .run()
        .await;

    assert!(
        matches!(
            outcome_of(&report, "images::snapshot_server_not_active"),
            ScenarioOutcome::Failed(_)
        ),
        "{report}"
    );
    assert_eq!(cloud.server_count(), 0);
    assert_eq!(cloud.snapshot_count(), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failed_snapshot_fetch_is_a_failure(cloud: FakeCloud) {
    cloud.fail_next_image_fetch(500);

    let report = runner(&cloud, fake_suite_config())
        .with_filter("snapshots::snapshot_server_active")
        .run()
        .await;

    let ScenarioOutcome::Failed(message) =
        outcome_of(&report, "snapshots::snapshot_server_active")
    else {
        panic!("expected a failure:\n{report}");
    };
    assert!(message.contains("get snapshot: expected HTTP 200, got 500"), "{message}");
    assert_eq!(cloud.server_count(), 0);
    assert_eq!(cloud.snapshot_count(), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn accepted_snapshot_of_a_building_server_needs_a_location(cloud: FakeCloud) {
    cloud.omit_snapshot_locations(true);

    let report = runner(&cloud, fake_suite_config())
        .with_filter("snapshots::snapshot_server_inactive")
        .run()
        .await;

    let ScenarioOutcome::Failed(message) =
        outcome_of(&report, "snapshots::snapshot_server_inactive")
    else {
        panic!("expected a failure:\n{report}");
    };
    assert!(message.contains("without a Location"), "{message}");
    assert_eq!(cloud.server_count(), 0);
}

#[rstest]
fn filter_selects_matching_scenarios(cloud: FakeCloud) {
    let suite = runner(&cloud, fake_suite_config()).with_filter("snapshot");

    let names: Vec<&str> = suite.selected().map(|case| case.name).collect();

    assert_eq!(
        names,
        vec![
            "snapshots::snapshot_server_active",
            "snapshots::snapshot_server_inactive",
            "images::snapshot_active_server",
            "images::snapshot_server_not_active",
        ]
    );
}
