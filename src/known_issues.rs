//! Upstream defects the suite tolerates until they are declared fixed.
//!
//! Each scenario that touches a known defect asserts the tolerated
//! behaviour by default. Listing the issue id in
//! `STACKTESTER_ENV_FIXED_ISSUES` switches it to the strict assertion.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A defect in the compute API with a tolerated and a correct behaviour.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum KnownIssue {
    /// `changePassword` never passes through the `PASSWORD` status.
    PasswordStatus,
    /// Soft reboot never passes through the `REBOOT` status.
    RebootStatus,
    /// Hard reboot never passes through the `HARD_REBOOT` status.
    HardRebootStatus,
    /// Rebuild reports `BUILD` rather than `REBUILD`.
    RebuildStatus,
    /// Resize reports `RESIZE-CONFIRM` rather than `VERIFY_RESIZE`.
    VerifyResizeStatus,
    /// A server still in `BUILD` can be snapshotted.
    SnapshotBuildingServer,
    /// Image links are missing or malformed (launchpad bug 803505).
    ImageLinks,
    /// `POST /images` answers 200 instead of 202.
    CreateImageStatus,
    /// `POST /images` does not echo `serverRef` back as `server`.
    SnapshotServerRef,
}

impl KnownIssue {
    /// Every issue, in table order.
    pub const ALL: [Self; 9] = [
        Self::PasswordStatus,
        Self::RebootStatus,
        Self::HardRebootStatus,
        Self::RebuildStatus,
        Self::VerifyResizeStatus,
        Self::SnapshotBuildingServer,
        Self::ImageLinks,
        Self::CreateImageStatus,
        Self::SnapshotServerRef,
    ];

    /// Stable id used in configuration.
    #[must_use]
    pub const fn id(self) -> &'static str {
        match self {
            Self::PasswordStatus => "password-status",
            Self::RebootStatus => "reboot-status",
            Self::HardRebootStatus => "hard-reboot-status",
            Self::RebuildStatus => "rebuild-status",
            Self::VerifyResizeStatus => "verify-resize-status",
            Self::SnapshotBuildingServer => "snapshot-building-server",
            Self::ImageLinks => "lp803505",
            Self::CreateImageStatus => "create-image-status",
            Self::SnapshotServerRef => "snapshot-server-ref",
        }
    }

    /// One-line description for listings.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::PasswordStatus => "password change skips the PASSWORD status",
            Self::RebootStatus => "soft reboot skips the REBOOT status",
            Self::HardRebootStatus => "hard reboot skips the HARD_REBOOT status",
            Self::RebuildStatus => "rebuild reports BUILD instead of REBUILD",
            Self::VerifyResizeStatus => "resize reports RESIZE-CONFIRM instead of VERIFY_RESIZE",
            Self::SnapshotBuildingServer => "servers in BUILD can be snapshotted",
            Self::ImageLinks => "image self and bookmark links are wrong",
            Self::CreateImageStatus => "POST /images answers 200 instead of 202",
            Self::SnapshotServerRef => "snapshot response omits the source server",
        }
    }
}

impl fmt::Display for KnownIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Raised when a configured issue id is not in the table.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown issue id `{0}` in fixed_issues")]
pub struct UnknownIssue(pub String);

impl FromStr for KnownIssue {
    type Err = UnknownIssue;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|issue| issue.id() == value)
            .ok_or_else(|| UnknownIssue(value.to_owned()))
    }
}

/// Set of issues declared fixed in the deployment under test.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct KnownIssues {
    fixed: BTreeSet<KnownIssue>,
}

impl KnownIssues {
    /// No issue fixed; every scenario asserts tolerated behaviour.
    #[must_use]
    pub const fn none_fixed() -> Self {
        Self {
            fixed: BTreeSet::new(),
        }
    }

    /// Parses a comma-separated list of ids. Blank entries are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownIssue`] for the first unrecognised id.
    pub fn parse_fixed(list: &str) -> Result<Self, UnknownIssue> {
        let fixed = list
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::parse::<KnownIssue>)
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(Self { fixed })
    }

    /// Marks `issue` fixed.
    #[must_use]
    pub fn with_fixed(mut self, issue: KnownIssue) -> Self {
        self.fixed.insert(issue);
        self
    }

    /// Returns `true` when the strict behaviour should be asserted.
    #[must_use]
    pub fn is_fixed(&self, issue: KnownIssue) -> bool {
        self.fixed.contains(&issue)
    }

    /// Picks the value for the current state of `issue`.
    #[must_use]
    pub fn pick<T>(&self, issue: KnownIssue, tolerated: T, fixed: T) -> T {
        if self.is_fixed(issue) { fixed } else { tolerated }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn ids_round_trip_through_parse() {
        for issue in KnownIssue::ALL {
            assert_eq!(issue.id().parse::<KnownIssue>(), Ok(issue));
        }
    }

    #[rstest]
    #[case::empty("", &[])]
    #[case::single("lp803505", &[KnownIssue::ImageLinks])]
    #[case::spaced(
        " password-status , create-image-status ,",
        &[KnownIssue::PasswordStatus, KnownIssue::CreateImageStatus]
    )]
    fn parses_fixed_lists(#[case] list: &str, #[case] expected: &[KnownIssue]) {
        let issues = KnownIssues::parse_fixed(list).expect("valid list");

        for issue in KnownIssue::ALL {
            assert_eq!(issues.is_fixed(issue), expected.contains(&issue), "{issue}");
        }
    }

    #[test]
    fn rejects_unknown_ids() {
        let err = KnownIssues::parse_fixed("lp803505,lp000000").expect_err("unknown id");

        assert_eq!(err, UnknownIssue(String::from("lp000000")));
    }

    #[test]
    fn pick_defaults_to_tolerated() {
        let issues = KnownIssues::none_fixed();
        let fixed = issues.clone().with_fixed(KnownIssue::CreateImageStatus);

        assert_eq!(issues.pick(KnownIssue::CreateImageStatus, 200, 202), 200);
        assert_eq!(fixed.pick(KnownIssue::CreateImageStatus, 200, 202), 202);
    }
}
