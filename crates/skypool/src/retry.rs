//! Retry window policy.
//!
//! The window is anchored at the run's original submission time, not at the
//! first failed attempt, and resubmissions do not restart it. Retry is only
//! ever evaluated at the scheduling step: once a job is running, execution
//! failures are final at the scheduler level (spot interruptions re-enter
//! scheduling through `PENDING` and get re-evaluated there).

use chrono::{DateTime, Utc};

use crate::models::job::{JobErrorCode, JobStatus};
use crate::models::profile::Profile;

/// Whether the run's retry window is still open at `now`.
pub fn retry_active(profile: &Profile, submitted_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    let Some(window) = profile.retry.window() else {
        return false;
    };
    let Ok(window) = chrono::Duration::from_std(window) else {
        return false;
    };
    now < submitted_at + window
}

/// Where a job goes after a provisioning attempt found no capacity:
/// `PENDING` while the window holds, else `FAILED` with the given code.
pub fn no_capacity_outcome(
    profile: &Profile,
    submitted_at: DateTime<Utc>,
    now: DateTime<Utc>,
    code: JobErrorCode,
) -> (JobStatus, Option<JobErrorCode>) {
    if retry_active(profile, submitted_at, now) {
        (JobStatus::Pending, None)
    } else {
        (JobStatus::Failed, Some(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::profile::{RetryPolicy, DEFAULT_RETRY_WINDOW};
    use std::time::Duration;

    fn profile(retry: RetryPolicy) -> Profile {
        Profile {
            retry,
            ..Default::default()
        }
    }

    #[test]
    fn retry_off_is_never_active() {
        let now = Utc::now();
        assert!(!retry_active(&profile(RetryPolicy::Flag(false)), now, now));
    }

    #[test]
    fn retry_true_uses_default_window() {
        let submitted = Utc::now();
        let p = profile(RetryPolicy::Flag(true));
        let inside = submitted + chrono::Duration::from_std(DEFAULT_RETRY_WINDOW / 2).unwrap();
        let outside = submitted + chrono::Duration::from_std(DEFAULT_RETRY_WINDOW * 2).unwrap();
        assert!(retry_active(&p, submitted, inside));
        assert!(!retry_active(&p, submitted, outside));
    }

    #[test]
    fn window_boundary_is_exclusive() {
        let submitted = Utc::now();
        let p = profile(RetryPolicy::Window(Duration::from_secs(3600)));
        let at_boundary = submitted + chrono::Duration::seconds(3600);
        assert!(!retry_active(&p, submitted, at_boundary));
        let just_inside = submitted + chrono::Duration::seconds(3599);
        assert!(retry_active(&p, submitted, just_inside));
    }

    #[test]
    fn window_is_anchored_at_submission() {
        // 2h window, 30 minutes elapsed: still active regardless of how many
        // attempts already failed.
        let submitted = Utc::now() - chrono::Duration::minutes(30);
        let p = profile(RetryPolicy::Window(Duration::from_secs(2 * 3600)));
        assert!(retry_active(&p, submitted, Utc::now()));
    }

    #[test]
    fn no_capacity_goes_pending_inside_window() {
        let submitted = Utc::now();
        let p = profile(RetryPolicy::Window(Duration::from_secs(3600)));
        let (status, code) = no_capacity_outcome(
            &p,
            submitted,
            submitted + chrono::Duration::minutes(10),
            JobErrorCode::FailedToStartDueToNoCapacity,
        );
        assert_eq!(status, JobStatus::Pending);
        assert!(code.is_none());
    }

    #[test]
    fn no_capacity_fails_outside_window() {
        let submitted = Utc::now() - chrono::Duration::hours(2);
        let p = profile(RetryPolicy::Window(Duration::from_secs(3600)));
        let (status, code) = no_capacity_outcome(
            &p,
            submitted,
            Utc::now(),
            JobErrorCode::FailedToStartDueToNoCapacity,
        );
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(code, Some(JobErrorCode::FailedToStartDueToNoCapacity));
    }
}
