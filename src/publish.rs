//! Shipping an applied patch: publish the changed file, then trigger a redeploy.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use filetime::FileTime;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{DeployConfig, PublishConfig, ResolvedEnvironment};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("git {step} failed: {detail}")]
    Git { step: &'static str, detail: String },

    #[error("content API request failed: {0}")]
    Http(String),

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("deploy trigger failed: {0}")]
    Deploy(String),
}

pub trait Publisher {
    fn name(&self) -> &'static str;
    /// Publish `file` and return the resulting revision, if the backend has one.
    fn publish(&self, file: &Path, message: &str) -> Result<Option<String>, PublishError>;
}

pub trait Deployer {
    fn name(&self) -> &'static str;
    fn deploy(&self) -> Result<(), PublishError>;
}

pub struct NoopPublisher;

impl Publisher for NoopPublisher {
    fn name(&self) -> &'static str {
        "none"
    }

    fn publish(&self, file: &Path, _message: &str) -> Result<Option<String>, PublishError> {
        debug!(file = %file.display(), "publishing disabled");
        Ok(None)
    }
}

/// Stage, commit and push through the `git` CLI.
pub struct GitPublisher {
    repo_root: PathBuf,
    remote: String,
    branch: String,
}

impl GitPublisher {
    pub fn new(repo_root: &Path, remote: &str, branch: &str) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            remote: remote.to_string(),
            branch: branch.to_string(),
        }
    }

    fn git<I, S>(&self, step: &'static str, args: I) -> Result<Output, PublishError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = run_git(&self.repo_root, args).map_err(|e| PublishError::Git {
            step,
            detail: e.to_string(),
        })?;
        if !output.status.success() {
            return Err(PublishError::Git {
                step,
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

impl Publisher for GitPublisher {
    fn name(&self) -> &'static str {
        "git"
    }

    fn publish(&self, file: &Path, message: &str) -> Result<Option<String>, PublishError> {
        self.git("add", [OsStr::new("add"), OsStr::new("--"), file.as_os_str()])?;
        self.git("commit", ["commit", "-q", "-m", message])?;
        self.git("push", ["push", "-q", self.remote.as_str(), self.branch.as_str()])?;

        let head = self.git("rev-parse", ["rev-parse", "HEAD"])?;
        let sha = String::from_utf8_lossy(&head.stdout).trim().to_string();
        info!(remote = %self.remote, branch = %self.branch, commit = %sha, "patch pushed");
        Ok(Some(sha))
    }
}

fn run_git<I, S>(repo_root: &Path, args: I) -> std::io::Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new("git").current_dir(repo_root).args(args).output()
}

/// Update one file through the GitHub contents API.
pub struct GitHubContentsPublisher {
    agent: ureq::Agent,
    api_base: String,
    owner: String,
    repo: String,
    branch: String,
    path: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ContentInfo {
    sha: String,
}

impl GitHubContentsPublisher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api_base: &str,
        owner: &str,
        repo: &str,
        branch: &str,
        path: &str,
        token: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            api_base: api_base.trim_end_matches('/').to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            branch: branch.to_string(),
            path: path.trim_start_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn contents_url(&self) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}",
            self.api_base, self.owner, self.repo, self.path
        )
    }

    fn current_sha(&self) -> Result<Option<String>, PublishError> {
        let response = self
            .agent
            .get(&self.contents_url())
            .query("ref", &self.branch)
            .set("Authorization", &format!("Bearer {}", self.token))
            .set("Accept", "application/vnd.github+json")
            .call();
        match response {
            Ok(resp) => {
                let info: ContentInfo = resp
                    .into_json()
                    .map_err(|e| PublishError::Http(format!("unreadable contents response: {e}")))?;
                Ok(Some(info.sha))
            }
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(e) => Err(http_error(e)),
        }
    }
}

fn http_error(err: ureq::Error) -> PublishError {
    match err {
        ureq::Error::Status(code, resp) => PublishError::Http(format!(
            "HTTP {code}: {}",
            resp.into_string().unwrap_or_default().trim()
        )),
        ureq::Error::Transport(t) => PublishError::Http(t.to_string()),
    }
}

/// Request body for a contents update.
pub fn contents_body(message: &str, content: &[u8], branch: &str, sha: Option<&str>) -> Value {
    let mut body = json!({
        "message": message,
        "content": STANDARD.encode(content),
        "branch": branch,
    });
    if let Some(sha) = sha {
        body["sha"] = json!(sha);
    }
    body
}

impl Publisher for GitHubContentsPublisher {
    fn name(&self) -> &'static str {
        "github"
    }

    fn publish(&self, file: &Path, message: &str) -> Result<Option<String>, PublishError> {
        let content = std::fs::read(file).map_err(|source| PublishError::Io {
            path: file.to_path_buf(),
            source,
        })?;
        let sha = self.current_sha()?;
        debug!(path = %self.path, previous = ?sha, "updating repository contents");

        let response = self
            .agent
            .put(&self.contents_url())
            .set("Authorization", &format!("Bearer {}", self.token))
            .set("Accept", "application/vnd.github+json")
            .send_json(contents_body(message, &content, &self.branch, sha.as_deref()))
            .map_err(http_error)?;
        let reply: Value = response
            .into_json()
            .map_err(|e| PublishError::Http(format!("unreadable update response: {e}")))?;

        let commit = reply["commit"]["sha"].as_str().map(str::to_string);
        info!(repo = %self.repo, branch = %self.branch, commit = ?commit, "repository contents updated");
        Ok(commit)
    }
}

pub struct NoopDeployer;

impl Deployer for NoopDeployer {
    fn name(&self) -> &'static str {
        "none"
    }

    fn deploy(&self) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Bump a watched file's mtime so the host reloads the app.
pub struct TouchDeployer {
    path: PathBuf,
}

impl TouchDeployer {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl Deployer for TouchDeployer {
    fn name(&self) -> &'static str {
        "touch"
    }

    fn deploy(&self) -> Result<(), PublishError> {
        let io_err = |source| PublishError::Io {
            path: self.path.clone(),
            source,
        };
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        filetime::set_file_mtime(&self.path, FileTime::now()).map_err(io_err)?;
        info!(path = %self.path.display(), "restart triggered");
        Ok(())
    }
}

pub struct CommandDeployer {
    program: String,
    args: Vec<String>,
    cwd: PathBuf,
}

impl CommandDeployer {
    pub fn new(program: &str, args: &[String], cwd: &Path) -> Self {
        Self {
            program: program.to_string(),
            args: args.to_vec(),
            cwd: cwd.to_path_buf(),
        }
    }
}

impl Deployer for CommandDeployer {
    fn name(&self) -> &'static str {
        "command"
    }

    fn deploy(&self) -> Result<(), PublishError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.cwd)
            .output()
            .map_err(|e| PublishError::Deploy(format!("{}: {e}", self.program)))?;
        if !output.status.success() {
            return Err(PublishError::Deploy(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        info!(program = %self.program, "deploy command finished");
        Ok(())
    }
}

/// Build the publisher for an environment. `token` is only used by GitHub.
pub fn publisher_for(
    env: &ResolvedEnvironment,
    token: Option<&str>,
) -> Result<Box<dyn Publisher>, PublishError> {
    Ok(match &env.publish {
        PublishConfig::None => Box::new(NoopPublisher),
        PublishConfig::Git { remote, branch } => {
            Box::new(GitPublisher::new(&env.source_root, remote, branch))
        }
        PublishConfig::Github {
            owner,
            repo,
            branch,
            path,
            api_base,
            ..
        } => {
            let token = token.ok_or_else(|| PublishError::Http("no GitHub token available".to_string()))?;
            let path = path.clone().unwrap_or_else(|| {
                env.target_file
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default()
            });
            Box::new(GitHubContentsPublisher::new(
                api_base,
                owner,
                repo,
                branch,
                &path,
                token,
                env.publish_timeout,
            ))
        }
    })
}

pub fn deployer_for(env: &ResolvedEnvironment) -> Box<dyn Deployer> {
    match &env.deploy {
        DeployConfig::None => Box::new(NoopDeployer),
        DeployConfig::Touch { path } => {
            let path = if path.is_absolute() {
                path.clone()
            } else {
                env.source_root.join(path)
            };
            Box::new(TouchDeployer::new(&path))
        }
        DeployConfig::Command { program, args } => {
            Box::new(CommandDeployer::new(program, args, &env.source_root))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn git(repo: &Path, args: &[&str]) -> Output {
        let output = Command::new("git")
            .current_dir(repo)
            .args(args)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        output
    }

    /// A working repo on `main` with a bare `origin`.
    fn init_repo() -> Option<tempfile::TempDir> {
        if !git_available() {
            return None;
        }

        let tmp = tempfile::tempdir().unwrap();
        let remote = tmp.path().join("remote.git");
        let work = tmp.path().join("work");
        fs::create_dir_all(&work).unwrap();
        git(tmp.path(), &["init", "-q", "--bare", remote.to_str().unwrap()]);
        git(&work, &["init", "-q"]);
        git(&work, &["config", "user.email", "patchwarden-test@example.com"]);
        git(&work, &["config", "user.name", "Patchwarden Test"]);
        git(&work, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        fs::write(work.join("app.py"), "def f(x):\n    return x\n").unwrap();
        git(&work, &["add", "app.py"]);
        git(&work, &["commit", "-q", "-m", "init"]);
        git(&work, &["remote", "add", "origin", remote.to_str().unwrap()]);
        git(&work, &["push", "-q", "origin", "main"]);
        Some(tmp)
    }

    #[test]
    fn git_publisher_commits_and_pushes() {
        let Some(tmp) = init_repo() else {
            return;
        };
        let work = tmp.path().join("work");
        let file = work.join("app.py");
        fs::write(&file, "def f(x):\n    return [x]\n").unwrap();

        let publisher = GitPublisher::new(&work, "origin", "main");
        let sha = publisher.publish(&file, "Replace f").unwrap().unwrap();

        let remote = tmp.path().join("remote.git");
        let log = git(&remote, &["log", "-1", "--format=%H %s", "main"]);
        let line = String::from_utf8_lossy(&log.stdout).trim().to_string();
        assert_eq!(line, format!("{sha} Replace f"));
    }

    #[test]
    fn git_publisher_without_changes_fails_at_commit() {
        let Some(tmp) = init_repo() else {
            return;
        };
        let work = tmp.path().join("work");
        let publisher = GitPublisher::new(&work, "origin", "main");
        match publisher.publish(&work.join("app.py"), "nothing") {
            Err(PublishError::Git { step, .. }) => assert_eq!(step, "commit"),
            other => panic!("expected commit failure, got {other:?}"),
        }
    }

    #[test]
    fn contents_body_encodes_and_carries_sha() {
        let body = contents_body("fix", b"def f(): pass\n", "main", Some("abc123"));
        assert_eq!(body["content"], json!("ZGVmIGYoKTogcGFzcwo="));
        assert_eq!(body["sha"], json!("abc123"));
        assert_eq!(body["branch"], json!("main"));

        let fresh = contents_body("add", b"x", "main", None);
        assert!(fresh.get("sha").is_none());
    }

    #[test]
    fn contents_url_layout() {
        let publisher = GitHubContentsPublisher::new(
            "https://api.github.com/",
            "acme",
            "helpdesk",
            "main",
            "/Streamlit_app.py",
            "t",
            Duration::from_secs(1),
        );
        assert_eq!(
            publisher.contents_url(),
            "https://api.github.com/repos/acme/helpdesk/contents/Streamlit_app.py"
        );
    }

    #[test]
    fn unreachable_api_is_an_http_error() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("app.py");
        fs::write(&file, "x").unwrap();
        let publisher = GitHubContentsPublisher::new(
            "http://127.0.0.1:9",
            "o",
            "r",
            "main",
            "app.py",
            "t",
            Duration::from_secs(2),
        );
        assert!(matches!(
            publisher.publish(&file, "m"),
            Err(PublishError::Http(_))
        ));
    }

    #[test]
    fn touch_deployer_creates_and_bumps_mtime() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("web.config");
        fs::write(&path, "<configuration/>").unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(1_000_000, 0)).unwrap();

        TouchDeployer::new(&path).deploy().unwrap();
        let mtime = FileTime::from_last_modification_time(&fs::metadata(&path).unwrap());
        assert!(mtime.unix_seconds() > 1_000_000);
        assert_eq!(fs::read_to_string(&path).unwrap(), "<configuration/>");

        let fresh = tmp.path().join("restart.txt");
        TouchDeployer::new(&fresh).deploy().unwrap();
        assert!(fresh.exists());
    }

    #[test]
    fn command_deployer_reports_failure() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(CommandDeployer::new("true", &[], tmp.path()).deploy().is_ok());
        assert!(matches!(
            CommandDeployer::new("false", &[], tmp.path()).deploy(),
            Err(PublishError::Deploy(_))
        ));
    }

    #[test]
    fn factories_follow_environment() {
        let env = ResolvedEnvironment {
            name: "hosted".to_string(),
            source_root: PathBuf::from("/home/site/wwwroot"),
            target_file: PathBuf::from("/home/site/wwwroot/Streamlit_app.py"),
            backup_dir: PathBuf::from("/home/site/wwwroot/.patchwarden/backups"),
            commit_message: "m".to_string(),
            publish_timeout: Duration::from_secs(1),
            publish: PublishConfig::Github {
                owner: "o".to_string(),
                repo: "r".to_string(),
                branch: "main".to_string(),
                path: None,
                token_secret: "github-pat".to_string(),
                api_base: "https://api.github.com".to_string(),
            },
            deploy: DeployConfig::Touch {
                path: PathBuf::from("web.config"),
            },
        };
        assert!(publisher_for(&env, None).is_err());
        let publisher = publisher_for(&env, Some("t")).unwrap();
        assert_eq!(publisher.name(), "github");
        assert_eq!(deployer_for(&env).name(), "touch");
    }
}
