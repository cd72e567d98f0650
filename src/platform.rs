use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use octocrab::Octocrab;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

use crate::config::PlatformsConfig;
use crate::repository::RemoteRepository;

/// Hosting platforms a repository can be mirrored between
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[value(name = "github")]
    GitHub,
    #[value(name = "gitee")]
    Gitee,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::GitHub, Platform::Gitee];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::GitHub => "github",
            Platform::Gitee => "gitee",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "github" => Some(Platform::GitHub),
            "gitee" => Some(Platform::Gitee),
            _ => None,
        }
    }

    /// Prefix of repository ids discovered on this platform
    pub fn id_prefix(&self) -> &'static str {
        match self {
            Platform::GitHub => "gh",
            Platform::Gitee => "gt",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Platform::GitHub => "GitHub",
            Platform::Gitee => "Gitee",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Remote-facing operations on a hosting platform
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// Clone/push URL for `full_name` with the token embedded as an inline credential
    fn remote_url(&self, platform: Platform, full_name: &str, token: &str) -> Result<String>;

    /// Check a token and return the login it belongs to
    async fn validate_token(&self, platform: Platform, token: &str) -> Result<String>;

    /// All repositories visible to the token owner
    async fn list_repositories(&self, platform: Platform, token: &str)
        -> Result<Vec<RemoteRepository>>;

    /// Look up a single repository by "owner/name"
    async fn fetch_repository(
        &self,
        platform: Platform,
        full_name: &str,
        token: &str,
    ) -> Result<RemoteRepository>;
}

/// Platform client: GitHub through octocrab, Gitee through its v5 REST API
pub struct PlatformClient {
    endpoints: PlatformsConfig,
    http: reqwest::Client,
}

/// Gitee repository payload (only the fields we use)
#[derive(Debug, Deserialize)]
struct GiteeRepository {
    id: u64,
    full_name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    private: bool,
}

#[derive(Debug, Deserialize)]
struct GiteeUser {
    login: String,
}

const GITEE_PAGE_SIZE: usize = 100;

impl PlatformClient {
    pub fn new(endpoints: PlatformsConfig) -> Self {
        Self {
            endpoints,
            http: reqwest::Client::new(),
        }
    }

    fn github(&self, token: &str) -> Result<Octocrab> {
        Octocrab::builder()
            .personal_token(token.to_string())
            .base_uri(self.endpoints.github.api_url.as_str())
            .context("Invalid GitHub API URL")?
            .build()
            .context("Failed to create GitHub client")
    }

    fn gitee_url(&self, path: &str) -> String {
        format!("{}{}", self.endpoints.gitee.api_url.trim_end_matches('/'), path)
    }

    fn from_github(repo: octocrab::models::Repository) -> RemoteRepository {
        let full_name = repo.full_name.clone().unwrap_or_else(|| {
            let owner = repo
                .owner
                .as_ref()
                .map(|o| o.login.clone())
                .unwrap_or_else(|| "unknown".to_string());
            format!("{}/{}", owner, repo.name)
        });

        RemoteRepository {
            platform: Platform::GitHub,
            upstream_id: repo.id.into_inner(),
            full_name,
            description: repo.description,
            private: repo.private.unwrap_or(false),
        }
    }

    fn from_gitee(repo: GiteeRepository) -> RemoteRepository {
        RemoteRepository {
            platform: Platform::Gitee,
            upstream_id: repo.id,
            full_name: repo.full_name,
            description: repo.description,
            private: repo.private,
        }
    }

    async fn list_github(&self, token: &str) -> Result<Vec<RemoteRepository>> {
        let client = self.github(token)?;
        let mut repositories = Vec::new();
        let mut page = 1u8;

        loop {
            let page_repos = client
                .current()
                .list_repos_for_authenticated_user()
                .per_page(100)
                .page(page)
                .send()
                .await
                .with_context(|| format!("Failed to fetch GitHub repositories page {}", page))?;

            let items = page_repos.items;
            if items.is_empty() {
                break;
            }

            repositories.extend(items.into_iter().map(Self::from_github));

            // GitHub API pagination limit for u8
            if page >= 255 {
                warn!("Reached maximum pagination limit (255 pages)");
                break;
            }
            page += 1;
        }

        Ok(repositories)
    }

    async fn list_gitee(&self, token: &str) -> Result<Vec<RemoteRepository>> {
        let mut repositories = Vec::new();
        let mut page = 1usize;

        loop {
            let items: Vec<GiteeRepository> = self
                .http
                .get(self.gitee_url("/user/repos"))
                .query(&[
                    ("access_token", token),
                    ("type", "all"),
                    ("sort", "updated"),
                ])
                .query(&[("per_page", GITEE_PAGE_SIZE), ("page", page)])
                .send()
                .await
                .with_context(|| format!("Failed to fetch Gitee repositories page {}", page))?
                .error_for_status()
                .context("Gitee rejected the repository listing request")?
                .json()
                .await
                .context("Failed to parse Gitee repository list")?;

            let count = items.len();
            repositories.extend(items.into_iter().map(Self::from_gitee));

            if count < GITEE_PAGE_SIZE {
                break;
            }
            page += 1;
        }

        Ok(repositories)
    }
}

/// Split "owner/name", rejecting anything else
pub fn split_full_name(full_name: &str) -> Result<(&str, &str)> {
    match full_name.trim_matches('/').split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((owner, name))
        }
        _ => bail!("Repository name must be in owner/name form: {}", full_name),
    }
}

#[async_trait]
impl PlatformApi for PlatformClient {
    fn remote_url(&self, platform: Platform, full_name: &str, token: &str) -> Result<String> {
        let (owner, name) = split_full_name(full_name)?;
        let host = &self.endpoints.endpoint(platform).host;
        let base = if host.contains("://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", host)
        };

        let mut url = Url::parse(&format!("{}/{}/{}.git", base, owner, name))
            .with_context(|| format!("Invalid {} host: {}", platform, host))?;
        url.set_username("oauth2")
            .map_err(|_| anyhow!("Cannot embed credentials in {} URL", platform))?;
        url.set_password(Some(token))
            .map_err(|_| anyhow!("Cannot embed credentials in {} URL", platform))?;

        Ok(url.to_string())
    }

    async fn validate_token(&self, platform: Platform, token: &str) -> Result<String> {
        debug!("Validating {} token", platform);

        let login = match platform {
            Platform::GitHub => {
                let user = self
                    .github(token)?
                    .current()
                    .user()
                    .await
                    .context("GitHub token validation failed")?;
                user.login
            }
            Platform::Gitee => {
                let user: GiteeUser = self
                    .http
                    .get(self.gitee_url("/user"))
                    .query(&[("access_token", token)])
                    .send()
                    .await
                    .context("Failed to reach Gitee")?
                    .error_for_status()
                    .context("Gitee token validation failed")?
                    .json()
                    .await
                    .context("Failed to parse Gitee user")?;
                user.login
            }
        };

        info!("{} token belongs to {}", platform, login);
        Ok(login)
    }

    async fn list_repositories(
        &self,
        platform: Platform,
        token: &str,
    ) -> Result<Vec<RemoteRepository>> {
        let repositories = match platform {
            Platform::GitHub => self.list_github(token).await?,
            Platform::Gitee => self.list_gitee(token).await?,
        };

        info!("Found {} repositories on {}", repositories.len(), platform);
        Ok(repositories)
    }

    async fn fetch_repository(
        &self,
        platform: Platform,
        full_name: &str,
        token: &str,
    ) -> Result<RemoteRepository> {
        let (owner, name) = split_full_name(full_name)?;

        match platform {
            Platform::GitHub => {
                let repo = self
                    .github(token)?
                    .repos(owner, name)
                    .get()
                    .await
                    .with_context(|| format!("Failed to look up {} on GitHub", full_name))?;
                Ok(Self::from_github(repo))
            }
            Platform::Gitee => {
                let repo: GiteeRepository = self
                    .http
                    .get(self.gitee_url(&format!("/repos/{}/{}", owner, name)))
                    .query(&[("access_token", token)])
                    .send()
                    .await
                    .context("Failed to reach Gitee")?
                    .error_for_status()
                    .with_context(|| format!("Failed to look up {} on Gitee", full_name))?
                    .json()
                    .await
                    .context("Failed to parse Gitee repository")?;
                Ok(Self::from_gitee(repo))
            }
        }
    }
}
