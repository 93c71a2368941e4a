//! Running external tools (mysqldump, pg_dump, psql, ...).

use crate::error::{Error, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{error, info};

/// Environment passed to a command. Values are never logged.
pub type Env = Vec<(String, String)>;

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Runs `script` through a shell and returns its exit status.
    async fn run(&self, script: &str, env: &Env) -> Result<i32>;

    fn has_tool(&self, name: &str) -> bool;
}

/// Runs scripts with `bash -c` so pipelines can use `set -o pipefail`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRunner;

#[async_trait]
impl ProcessRunner for ShellRunner {
    async fn run(&self, script: &str, env: &Env) -> Result<i32> {
        let names: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
        info!("running: {} (env: {:?})", script, names);

        let status = Command::new("bash")
            .arg("-c")
            .arg(script)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .status()
            .await?;

        // killed by a signal has no code
        let code = status.code().unwrap_or(-1);
        if code != 0 {
            error!("command exited with status {}: {}", code, script);
        }
        Ok(code)
    }

    fn has_tool(&self, name: &str) -> bool {
        which::which(name).is_ok()
    }
}

/// Runs `script` and turns a non-zero exit into [`Error::ExternalTool`].
pub async fn run_checked(runner: &dyn ProcessRunner, script: &str, env: &Env) -> Result<()> {
    match runner.run(script, env).await? {
        0 => Ok(()),
        status => Err(Error::ExternalTool {
            command: script.to_string(),
            status,
        }),
    }
}

/// Single-quotes `value` for a POSIX shell.
pub fn quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote() {
        assert_eq!(quote("mydb"), "mydb");
        assert_eq!(quote("/tmp/out/mydb-mysql.gz"), "/tmp/out/mydb-mysql.gz");
        assert_eq!(quote("my db"), "'my db'");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote(""), "''");
    }

    #[tokio::test]
    async fn test_shell_runner_status() {
        let runner = ShellRunner;
        assert_eq!(runner.run("true", &Env::new()).await.unwrap(), 0);
        assert_eq!(runner.run("exit 3", &Env::new()).await.unwrap(), 3);
        // pipefail surfaces failures early in a pipeline
        assert_ne!(
            runner.run("set -o pipefail; false | cat", &Env::new()).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_shell_runner_env() {
        let env = vec![("STASH_TEST_VALUE".to_string(), "42".to_string())];
        let status = ShellRunner
            .run("test \"$STASH_TEST_VALUE\" = 42", &env)
            .await
            .unwrap();
        assert_eq!(status, 0);
    }

    #[tokio::test]
    async fn test_run_checked() {
        let err = run_checked(&ShellRunner, "exit 2", &Env::new()).await.unwrap_err();
        assert!(matches!(err, Error::ExternalTool { status: 2, .. }));
        assert!(run_checked(&ShellRunner, "true", &Env::new()).await.is_ok());
    }

    #[test]
    fn test_has_tool() {
        assert!(ShellRunner.has_tool("bash"));
        assert!(!ShellRunner.has_tool("definitely-not-a-real-tool-xyz"));
    }
}
