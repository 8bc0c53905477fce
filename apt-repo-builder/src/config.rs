// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Builder configuration.

[BuilderConfig] is deserialized from YAML. Keys are snake_case; the camelCase
spellings are accepted as aliases. Unknown keys are rejected.

```yaml
repo_source: github:owner/tool
release: v1.2.0
destination: /srv/apt/tool   # or github:owner/tool@apt-stable
codename: stable
architectures: [amd64, arm64]
index_compressions: [gzip, xz]
public_url: https://apt.example.com/tool
```
*/

use {
    crate::{
        destination::DestinationLocator,
        error::{BuildError, Result},
        io::Compression,
        repository::{assembler::AssemblyOptions, RepositoryLayout},
        retry::RetryPolicy,
        signing_key::{KeyAlgorithm, KeyRequest},
        source::{ReleaseSelector, SourceLocator},
    },
    regex::Regex,
    serde::{Deserialize, Serialize},
    std::path::{Path, PathBuf},
};

fn default_release() -> String {
    "latest".to_string()
}

fn default_codename() -> String {
    "stable".to_string()
}

fn default_components() -> Vec<String> {
    vec!["main".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".github-apt-repos")
}

fn default_concurrency() -> usize {
    4
}

fn default_compressions() -> Vec<Compression> {
    vec![Compression::Gzip]
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_max_retries() -> usize {
    RetryPolicy::default().max_retries
}

/// Configuration of a repository build.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BuilderConfig {
    /// Where releases are read from. See [SourceLocator::parse].
    #[serde(alias = "repoSource")]
    pub repo_source: String,

    /// Release tag, or `latest`.
    #[serde(default = "default_release")]
    pub release: String,

    /// Regular expression asset names must match in addition to ending in `.deb`.
    #[serde(default, alias = "assetPattern")]
    pub asset_pattern: Option<String>,

    /// Where the repository is published. See [DestinationLocator::parse].
    /// Publishing is skipped without one.
    #[serde(default)]
    pub destination: Option<String>,

    /// Defaults to `flat` for GitHub release destinations and `pool` otherwise.
    #[serde(default)]
    pub layout: Option<RepositoryLayout>,

    #[serde(default = "default_codename")]
    pub codename: String,

    /// Defaults to the codename.
    #[serde(default)]
    pub suite: Option<String>,

    /// Defaults to the repository owner.
    #[serde(default)]
    pub origin: Option<String>,

    /// Defaults to the repository name.
    #[serde(default)]
    pub label: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default = "default_components")]
    pub components: Vec<String>,

    /// Concrete architectures to index. Empty means discover from packages.
    #[serde(default)]
    pub architectures: Vec<String>,

    /// Armored secret key location. Defaults to `<work_dir>/signing-key.asc`.
    #[serde(default, alias = "gpgKeyPath")]
    pub gpg_key_path: Option<PathBuf>,

    #[serde(default, alias = "gpgUserId")]
    pub gpg_user_id: Option<String>,

    /// Environment variable holding the key passphrase.
    #[serde(default, alias = "gpgPassphraseEnv")]
    pub gpg_passphrase_env: Option<String>,

    #[serde(default = "default_true", alias = "generateKeyIfMissing")]
    pub generate_key_if_missing: bool,

    #[serde(default, alias = "keyAlgorithm")]
    pub key_algorithm: KeyAlgorithm,

    #[serde(default = "default_true")]
    pub sign: bool,

    #[serde(default, alias = "deleteExistingPublished")]
    pub delete_existing_published: bool,

    /// Defaults to `<work_dir>/cache`.
    #[serde(default, alias = "cacheDir")]
    pub cache_dir: Option<PathBuf>,

    #[serde(default = "default_work_dir", alias = "workDir")]
    pub work_dir: PathBuf,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_compressions", alias = "indexCompressions")]
    pub index_compressions: Vec<Compression>,

    #[serde(default, alias = "preserveStale")]
    pub preserve_stale: bool,

    /// URL the published repository is served from.
    #[serde(default, alias = "publicUrl")]
    pub public_url: Option<String>,

    #[serde(default, alias = "validDays")]
    pub valid_days: Option<u32>,

    #[serde(default = "default_token_env", alias = "githubTokenEnv")]
    pub github_token_env: String,

    #[serde(default, alias = "githubApiUrl")]
    pub github_api_url: Option<String>,

    #[serde(default = "default_max_retries", alias = "maxRetries")]
    pub max_retries: usize,
}

impl BuilderConfig {
    /// A configuration with defaults for everything but the source.
    pub fn new(repo_source: impl ToString) -> Self {
        Self {
            repo_source: repo_source.to_string(),
            release: default_release(),
            asset_pattern: None,
            destination: None,
            layout: None,
            codename: default_codename(),
            suite: None,
            origin: None,
            label: None,
            description: None,
            components: default_components(),
            architectures: vec![],
            gpg_key_path: None,
            gpg_user_id: None,
            gpg_passphrase_env: None,
            generate_key_if_missing: true,
            key_algorithm: KeyAlgorithm::default(),
            sign: true,
            delete_existing_published: false,
            cache_dir: None,
            work_dir: default_work_dir(),
            concurrency: default_concurrency(),
            index_compressions: default_compressions(),
            preserve_stale: false,
            public_url: None,
            valid_days: None,
            github_token_env: default_token_env(),
            github_api_url: None,
            max_retries: default_max_retries(),
        }
    }

    pub fn from_yaml(s: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(s)
            .map_err(|e| BuildError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;

        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| BuildError::Config(format!("reading {}: {}", path.display(), e)))?;

        Self::from_yaml(&data)
    }

    /// Check values deserialization can't.
    pub fn validate(&self) -> Result<()> {
        self.source_locator()?;
        self.asset_regex()?;
        self.layout()?;

        if self.components.is_empty() {
            return Err(BuildError::Config("at least one component is required".into()));
        }
        if self.concurrency == 0 {
            return Err(BuildError::Config("concurrency must be at least 1".into()));
        }

        let invalid_name = |s: &str| {
            s.is_empty() || s.contains('/') || s.contains(char::is_whitespace) || s == "." || s == ".."
        };
        if invalid_name(&self.codename) {
            return Err(BuildError::Config(format!("invalid codename: {:?}", self.codename)));
        }
        if let Some(name) = self
            .components
            .iter()
            .chain(self.architectures.iter())
            .find(|s| invalid_name(s))
        {
            return Err(BuildError::Config(format!(
                "invalid component or architecture: {:?}",
                name
            )));
        }

        Ok(())
    }

    pub fn source_locator(&self) -> Result<SourceLocator> {
        SourceLocator::parse(&self.repo_source)
    }

    pub fn destination_locator(&self) -> Result<Option<DestinationLocator>> {
        self.destination
            .as_deref()
            .map(DestinationLocator::parse)
            .transpose()
    }

    /// Release assets can't hold directories, so GitHub destinations are flat.
    pub fn layout(&self) -> Result<RepositoryLayout> {
        let github = self
            .destination_locator()?
            .map(|d| d.is_github())
            .unwrap_or(false);

        match (self.layout, github) {
            (Some(RepositoryLayout::Pool), true) => Err(BuildError::Config(
                "GitHub release destinations require the flat layout".into(),
            )),
            (Some(layout), _) => Ok(layout),
            (None, true) => Ok(RepositoryLayout::Flat),
            (None, false) => Ok(RepositoryLayout::Pool),
        }
    }

    /// Tag of the release a GitHub destination publishes to.
    pub fn destination_tag(&self) -> Result<Option<String>> {
        Ok(match self.destination_locator()? {
            Some(DestinationLocator::GitHubRelease { tag, .. }) => {
                Some(tag.unwrap_or_else(|| format!("apt-{}", self.codename)))
            }
            _ => None,
        })
    }

    /// URL the repository is served from.
    ///
    /// GitHub destinations default to the download URL of their release.
    pub fn public_url(&self) -> Result<Option<String>> {
        if self.public_url.is_some() {
            return Ok(self.public_url.clone());
        }

        Ok(match (self.destination_locator()?, self.destination_tag()?) {
            (Some(DestinationLocator::GitHubRelease { owner, repo, .. }), Some(tag)) => Some(
                format!("https://github.com/{}/{}/releases/download/{}", owner, repo, tag),
            ),
            _ => None,
        })
    }

    pub fn release_selector(&self) -> ReleaseSelector {
        self.release.parse().unwrap_or_default()
    }

    pub fn asset_regex(&self) -> Result<Option<Regex>> {
        self.asset_pattern
            .as_deref()
            .map(|p| {
                Regex::new(p)
                    .map_err(|e| BuildError::Config(format!("invalid asset_pattern: {}", e)))
            })
            .transpose()
    }

    /// The `(owner, repo)` naming the repository.
    ///
    /// Local sources are named `local` and the directory name.
    pub fn owner_repo(&self) -> Result<(String, String)> {
        Ok(match self.source_locator()? {
            SourceLocator::GitHub { owner, repo } => (owner, repo),
            SourceLocator::Local(path) => (
                "local".to_string(),
                path.file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "repository".to_string()),
            ),
        })
    }

    /// Prefix of files at the repository root.
    pub fn basename(&self) -> Result<String> {
        let (owner, repo) = self.owner_repo()?;

        Ok(format!("{}-{}", owner, repo))
    }

    pub fn user_id(&self) -> Result<String> {
        if let Some(user_id) = &self.gpg_user_id {
            return Ok(user_id.clone());
        }

        let (owner, repo) = self.owner_repo()?;

        Ok(format!("{} {} <{}+{}@github.com>", repo, owner, owner, repo))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join("cache"))
    }

    pub fn key_path(&self) -> PathBuf {
        self.gpg_key_path
            .clone()
            .unwrap_or_else(|| self.work_dir.join("signing-key.asc"))
    }

    /// Where the assembled tree is written.
    pub fn repository_dir(&self) -> PathBuf {
        self.work_dir.join("repository")
    }

    pub fn state_path(&self) -> PathBuf {
        self.work_dir.join("state.json")
    }

    pub fn fetch_manifest_path(&self) -> PathBuf {
        self.work_dir.join("fetch-manifest.json")
    }

    /// Directory of per-digest parse results.
    pub fn parse_cache_dir(&self) -> PathBuf {
        self.work_dir.join("parsed")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            ..RetryPolicy::default()
        }
    }

    fn env(name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }

    pub fn github_token(&self) -> Option<String> {
        Self::env(&self.github_token_env)
    }

    pub fn passphrase(&self) -> Option<String> {
        self.gpg_passphrase_env.as_deref().and_then(Self::env)
    }

    pub fn key_request(&self) -> Result<KeyRequest> {
        Ok(KeyRequest {
            user_id: self.user_id()?,
            algorithm: self.key_algorithm,
            passphrase: self.passphrase(),
            generate_if_missing: self.generate_key_if_missing,
        })
    }

    pub fn assembly_options(&self) -> Result<AssemblyOptions> {
        let (owner, repo) = self.owner_repo()?;

        Ok(AssemblyOptions {
            codename: self.codename.clone(),
            suite: self.suite.clone().unwrap_or_else(|| self.codename.clone()),
            origin: self.origin.clone().unwrap_or(owner),
            label: self.label.clone().unwrap_or(repo),
            description: self.description.clone(),
            compressions: self
                .index_compressions
                .iter()
                .copied()
                .filter(|c| *c != Compression::None)
                .collect(),
            preserve_stale: self.preserve_stale,
            valid_days: self.valid_days,
            basename: self.basename()?,
            public_url: self.public_url()?,
            signed: self.sign,
            layout: self.layout()?,
        })
    }
}

#[cfg(test)]
mod test {
    use {super::*, indoc::indoc};

    #[test]
    fn defaults() -> Result<()> {
        let config = BuilderConfig::from_yaml("repo_source: github:acme/widget\n")?;

        assert_eq!(config, BuilderConfig::new("github:acme/widget"));
        assert_eq!(config.release_selector(), ReleaseSelector::Latest);
        assert_eq!(config.basename()?, "acme-widget");
        assert_eq!(config.user_id()?, "widget acme <acme+widget@github.com>");
        assert_eq!(config.cache_dir(), PathBuf::from(".github-apt-repos/cache"));
        assert_eq!(config.key_path(), PathBuf::from(".github-apt-repos/signing-key.asc"));

        let options = config.assembly_options()?;
        assert_eq!(options.origin, "acme");
        assert_eq!(options.label, "widget");
        assert_eq!(options.suite, "stable");
        assert_eq!(options.compressions, vec![Compression::Gzip]);
        assert!(options.signed);

        Ok(())
    }

    #[test]
    fn camel_case_aliases() -> Result<()> {
        let config = BuilderConfig::from_yaml(indoc! {"
            repoSource: https://github.com/acme/widget.git
            release: v1.0
            assetPattern: amd64
            deleteExistingPublished: true
            indexCompressions: [gzip, xz]
            keyAlgorithm: rsa4096
            workDir: /tmp/work
            maxRetries: 1
        "})?;

        assert_eq!(config.release_selector(), ReleaseSelector::Tag("v1.0".into()));
        assert!(config.asset_regex()?.is_some());
        assert!(config.delete_existing_published);
        assert_eq!(config.index_compressions, vec![Compression::Gzip, Compression::Xz]);
        assert_eq!(config.key_algorithm, KeyAlgorithm::Rsa4096);
        assert_eq!(config.retry_policy().max_retries, 1);
        assert_eq!(config.state_path(), PathBuf::from("/tmp/work/state.json"));

        Ok(())
    }

    #[test]
    fn rejects_invalid() {
        for yaml in [
            "repo_source: github:a/b\nunknown_key: 1\n",
            "codename: stable\n",
            "repo_source: github:a/b\ncomponents: []\n",
            "repo_source: github:a/b\nconcurrency: 0\n",
            "repo_source: github:a/b\ncodename: a/b\n",
            "repo_source: github:a/b\nasset_pattern: '('\n",
            "repo_source: s3://bucket\n",
            "repo_source: github:a/b\nlayout: nested\n",
            "repo_source: github:a/b\ndestination: github:a/b\nlayout: pool\n",
            "repo_source: github:a/b\ndestination: github:a/b@\n",
        ] {
            assert!(
                matches!(BuilderConfig::from_yaml(yaml), Err(BuildError::Config(_))),
                "{}",
                yaml
            );
        }
    }

    #[test]
    fn local_source_naming() -> Result<()> {
        let mut config = BuilderConfig::new("/srv/releases/widget");
        config.gpg_user_id = Some("Widget Builders <builders@example.com>".into());

        assert_eq!(config.basename()?, "local-widget");
        assert_eq!(config.user_id()?, "Widget Builders <builders@example.com>");

        Ok(())
    }

    #[test]
    fn github_release_destination() -> Result<()> {
        let config = BuilderConfig::from_yaml(indoc! {"
            repo_source: github:acme/widget
            destination: github:acme/widget
            codename: bookworm
        "})?;

        assert_eq!(config.layout()?, RepositoryLayout::Flat);
        assert_eq!(config.destination_tag()?.as_deref(), Some("apt-bookworm"));
        assert_eq!(
            config.public_url()?.as_deref(),
            Some("https://github.com/acme/widget/releases/download/apt-bookworm")
        );
        assert_eq!(config.assembly_options()?.layout, RepositoryLayout::Flat);

        let mut config = config;
        config.destination = Some("github:acme/apt@stable".into());
        config.public_url = Some("https://apt.example.com".into());
        assert_eq!(config.destination_tag()?.as_deref(), Some("stable"));
        assert_eq!(config.public_url()?.as_deref(), Some("https://apt.example.com"));

        config.destination = Some("/srv/apt".into());
        assert_eq!(config.layout()?, RepositoryLayout::Pool);
        assert_eq!(config.destination_tag()?, None);

        Ok(())
    }
}
