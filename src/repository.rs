//! Repository model shared by the store, the platform clients and the engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::platform::Platform;

/// A repository registered for mirroring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    /// Stable id derived from the platform and the upstream numeric id (e.g. "gh_1296269")
    pub id: String,

    /// "owner/name" on the primary platform
    pub full_name: String,

    /// Source of truth
    pub primary_platform: Platform,

    /// Mirror target
    pub secondary_platform: Platform,

    /// Only enabled repositories are picked up by the scheduler
    pub sync_enabled: bool,

    /// Completion time of the last successful sync
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl Repository {
    /// Create an enabled repository mirrored from `primary` to `secondary`
    pub fn new(
        id: impl Into<String>,
        full_name: impl Into<String>,
        primary_platform: Platform,
        secondary_platform: Platform,
    ) -> Self {
        Self {
            id: id.into(),
            full_name: full_name.into(),
            primary_platform,
            secondary_platform,
            sync_enabled: true,
            last_sync_time: None,
        }
    }
}

/// Partial update applied by `CredentialStore::update_repository`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryUpdate {
    pub sync_enabled: Option<bool>,
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl RepositoryUpdate {
    pub fn last_sync_time(time: DateTime<Utc>) -> Self {
        Self {
            last_sync_time: Some(time),
            ..Default::default()
        }
    }

    pub fn sync_enabled(enabled: bool) -> Self {
        Self {
            sync_enabled: Some(enabled),
            ..Default::default()
        }
    }

    /// Apply the present fields onto a repository
    pub fn apply(&self, repo: &mut Repository) {
        if let Some(enabled) = self.sync_enabled {
            repo.sync_enabled = enabled;
        }
        if let Some(time) = self.last_sync_time {
            repo.last_sync_time = Some(time);
        }
    }
}

/// A repository as listed by a platform API
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRepository {
    pub platform: Platform,

    /// Numeric id assigned by the platform
    pub upstream_id: u64,

    pub full_name: String,

    pub description: Option<String>,

    pub private: bool,
}

impl RemoteRepository {
    /// Registry id for this repository (`gh_<id>` / `gt_<id>`)
    pub fn repository_id(&self) -> String {
        format!("{}_{}", self.platform.id_prefix(), self.upstream_id)
    }

    /// Build a repository that mirrors this one onto `secondary`
    pub fn into_repository(self, secondary: Platform) -> Repository {
        let id = self.repository_id();
        Repository::new(id, self.full_name, self.platform, secondary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_repository_is_enabled() {
        let repo = Repository::new("gh_1", "octocat/hello", Platform::GitHub, Platform::Gitee);
        assert!(repo.sync_enabled);
        assert!(repo.last_sync_time.is_none());
    }

    #[test]
    fn test_update_applies_present_fields_only() {
        let mut repo = Repository::new("gh_1", "octocat/hello", Platform::GitHub, Platform::Gitee);
        let now = Utc::now();

        RepositoryUpdate::last_sync_time(now).apply(&mut repo);
        assert_eq!(repo.last_sync_time, Some(now));
        assert!(repo.sync_enabled);

        RepositoryUpdate::sync_enabled(false).apply(&mut repo);
        assert!(!repo.sync_enabled);
        assert_eq!(repo.last_sync_time, Some(now));
    }

    #[test]
    fn test_remote_repository_ids() {
        let github = RemoteRepository {
            platform: Platform::GitHub,
            upstream_id: 1296269,
            full_name: "octocat/Hello-World".to_string(),
            description: None,
            private: false,
        };
        assert_eq!(github.repository_id(), "gh_1296269");

        let repo = github.into_repository(Platform::Gitee);
        assert_eq!(repo.id, "gh_1296269");
        assert_eq!(repo.primary_platform, Platform::GitHub);
        assert_eq!(repo.secondary_platform, Platform::Gitee);

        let gitee = RemoteRepository {
            platform: Platform::Gitee,
            upstream_id: 42,
            full_name: "oschina/git-osc".to_string(),
            description: Some("mirror".to_string()),
            private: true,
        };
        assert_eq!(gitee.repository_id(), "gt_42");
    }

    #[test]
    fn test_repository_json_shape() {
        let repo = Repository::new("gh_7", "a/b", Platform::GitHub, Platform::Gitee);
        let json = serde_json::to_value(&repo).unwrap();
        assert_eq!(json["fullName"], "a/b");
        assert_eq!(json["primaryPlatform"], "github");
        assert_eq!(json["syncEnabled"], true);
    }
}
