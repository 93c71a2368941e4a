//! MySQL databases, dumped with `mysqldump` and loaded with `mysql`.
//!
//! Names are `dbname` or `dbname.table`. The password, if any, is handed to
//! the tools through `MYSQL_PWD` and never appears on a command line.

use super::{Artifact, BackupTarget, RestoreResult, TargetContext};
use crate::config::DatabaseConfig;
use crate::descriptor::TargetKind;
use crate::error::{Error, Result};
use crate::process::{quote, run_checked, Env};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

pub struct MysqlDatabase;

/// `mydb` => `mydb-mysql.gz`, `mydb.table1` => `mydb.table1-mysql.gz`
pub fn backup_name(name: &str) -> Result<String> {
    if name.trim().is_empty() {
        return Err(Error::InvalidName(format!(
            "a database name is required, got {name:?}"
        )));
    }
    Ok(format!("{name}-mysql.gz"))
}

fn env(config: &DatabaseConfig) -> Env {
    config
        .password
        .iter()
        .map(|pw| ("MYSQL_PWD".to_string(), pw.clone()))
        .collect()
}

fn connection_args(config: &DatabaseConfig) -> String {
    format!(
        "--user={} --host={} --port={}",
        quote(&config.user),
        quote(&config.host),
        config.port
    )
}

fn split_name(name: &str) -> (&str, Option<&str>) {
    match name.split_once('.') {
        Some((db, table)) => (db, Some(table)),
        None => (name, None),
    }
}

pub fn dump_command(config: &DatabaseConfig, name: &str, output: &Path) -> String {
    let (db, table) = split_name(name);
    let table = table.map(|t| format!(" {}", quote(t))).unwrap_or_default();
    format!(
        "set -o pipefail; mysqldump {} --single-transaction --skip-dump-date --set-gtid-purged=OFF {}{} | gzip > {}",
        connection_args(config),
        quote(db),
        table,
        quote(&output.to_string_lossy())
    )
}

pub fn reset_command(config: &DatabaseConfig, db: &str) -> String {
    let sql = format!("DROP DATABASE IF EXISTS `{db}`; CREATE DATABASE `{db}`;");
    format!("mysql {} -e {}", connection_args(config), quote(&sql))
}

pub fn load_command(config: &DatabaseConfig, db: &str, dump: &Path) -> String {
    format!(
        "set -o pipefail; zcat {} | mysql {} {}",
        quote(&dump.to_string_lossy()),
        connection_args(config),
        quote(db)
    )
}

async fn restore_one(name: &str, source_dir: &Path, ctx: &TargetContext<'_>) -> Result<bool> {
    let dump = source_dir.join(backup_name(name)?);
    if !dump.is_file() {
        warn!("expected path {} does not exist or is not a file", dump.display());
        return Ok(false);
    }

    let config = &ctx.config.mysql;
    let env = env(config);
    let (db, table) = split_name(name);

    info!("restoring MySQL database {:?}", name);
    // a single table loads into the existing database
    if table.is_none() {
        run_checked(ctx.runner, &reset_command(config, db), &env).await?;
    }
    run_checked(ctx.runner, &load_command(config, db, &dump), &env).await?;
    Ok(true)
}

#[async_trait]
impl BackupTarget for MysqlDatabase {
    fn kind(&self) -> TargetKind {
        TargetKind::MysqlDatabase
    }

    async fn backup(
        &self,
        names: &[String],
        destination: &Path,
        ctx: &TargetContext<'_>,
    ) -> Result<Artifact> {
        if !names.is_empty() && !ctx.runner.has_tool("mysqldump") {
            return Err(Error::NotFound("mysqldump is not installed".to_string()));
        }
        fs::create_dir_all(destination)?;
        let config = &ctx.config.mysql;
        let env = env(config);

        let mut output: Vec<PathBuf> = Vec::with_capacity(names.len());
        for name in names {
            let path = destination.join(backup_name(name)?);
            info!("backing up MySQL database {:?}", name);
            run_checked(ctx.runner, &dump_command(config, name, &path), &env).await?;
            output.push(path);
        }

        Ok(Artifact {
            output_dir: destination.to_path_buf(),
            output,
        })
    }

    async fn restore(
        &self,
        names: &[String],
        source_dir: &Path,
        ctx: &TargetContext<'_>,
    ) -> Result<RestoreResult> {
        let mut output = Vec::with_capacity(names.len());
        for name in names {
            let ok = match restore_one(name, source_dir, ctx).await {
                Ok(ok) => ok,
                Err(err) => {
                    error!("failed to restore MySQL database {:?}: {}", name, err);
                    false
                }
            };
            output.push((name.clone(), ok));
        }
        Ok(RestoreResult { output })
    }

    fn artifact_names(&self, names: &[String]) -> Result<Vec<String>> {
        names.iter().map(|n| backup_name(n)).collect()
    }

    fn remote_pattern(&self) -> Option<&'static str> {
        Some(r".+-mysql\.gz")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::process::testing::RecordingRunner;
    use tempfile::TempDir;

    fn ctx<'a>(config: &'a AppConfig, runner: &'a RecordingRunner) -> TargetContext<'a> {
        TargetContext {
            config,
            runner,
            snapshots: None,
        }
    }

    #[test]
    fn test_backup_name() {
        assert_eq!(backup_name("mydb").unwrap(), "mydb-mysql.gz");
        assert_eq!(backup_name("mydb2.table1").unwrap(), "mydb2.table1-mysql.gz");
        assert!(matches!(backup_name(""), Err(Error::InvalidName(_))));
        assert!(matches!(backup_name("  "), Err(Error::InvalidName(_))));
    }

    #[test]
    fn test_dump_command() {
        let config = AppConfig::default();
        let cmd = dump_command(&config.mysql, "mydb2.table1", Path::new("/tmp/out/x-mysql.gz"));
        assert!(cmd.starts_with("set -o pipefail; mysqldump --user=root --host=localhost --port=3306"));
        assert!(cmd.contains("--single-transaction --skip-dump-date --set-gtid-purged=OFF mydb2 table1"));
        assert!(cmd.ends_with("| gzip > /tmp/out/x-mysql.gz"));
    }

    #[tokio::test]
    async fn test_backup_runs_one_dump_per_name() {
        let mut config = AppConfig::default();
        config.mysql.password = Some("hunter2".to_string());
        let runner = RecordingRunner::default();
        let out = TempDir::new().unwrap();

        let names = vec!["mydb1".to_string(), "mydb2.table1".to_string()];
        let artifact = MysqlDatabase
            .backup(&names, out.path(), &ctx(&config, &runner))
            .await
            .unwrap();

        assert_eq!(
            artifact.output,
            vec![
                out.path().join("mydb1-mysql.gz"),
                out.path().join("mydb2.table1-mysql.gz")
            ]
        );
        let recorded = runner.scripts.lock().unwrap().clone();
        assert_eq!(recorded.len(), 2);
        assert!(recorded.iter().all(|(script, _)| !script.contains("hunter2")));
        assert_eq!(recorded[0].1, vec![("MYSQL_PWD".to_string(), "hunter2".to_string())]);
    }

    #[tokio::test]
    async fn test_failed_dump_is_an_error() {
        let config = AppConfig::default();
        let runner = RecordingRunner::failing_on("mysqldump");
        let out = TempDir::new().unwrap();

        let result = MysqlDatabase
            .backup(&["mydb".to_string()], out.path(), &ctx(&config, &runner))
            .await;
        assert!(matches!(result, Err(Error::ExternalTool { status: 1, .. })));
    }

    #[tokio::test]
    async fn test_restore() {
        let config = AppConfig::default();
        let runner = RecordingRunner::default();
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("mydb1-mysql.gz"), b"").unwrap();

        let names = vec!["mydb1".to_string(), "missing".to_string()];
        let result = MysqlDatabase
            .restore(&names, dir.path(), &ctx(&config, &runner))
            .await
            .unwrap();

        assert_eq!(
            result.output,
            vec![("mydb1".to_string(), true), ("missing".to_string(), false)]
        );
        let scripts = runner.scripts();
        assert_eq!(scripts.len(), 2);
        assert!(scripts[0].contains("DROP DATABASE IF EXISTS `mydb1`"));
        assert!(scripts[1].contains("zcat"));
    }

    #[tokio::test]
    async fn test_restore_failure_reports_false() {
        let config = AppConfig::default();
        let runner = RecordingRunner::failing_on("zcat");
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("mydb1-mysql.gz"), b"").unwrap();

        let result = MysqlDatabase
            .restore(&["mydb1".to_string()], dir.path(), &ctx(&config, &runner))
            .await
            .unwrap();
        assert_eq!(result.output, vec![("mydb1".to_string(), false)]);
    }

    #[tokio::test]
    async fn test_restore_single_table_keeps_database() {
        let config = AppConfig::default();
        let runner = RecordingRunner::default();
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("mydb2.table1-mysql.gz"), b"").unwrap();

        MysqlDatabase
            .restore(&["mydb2.table1".to_string()], dir.path(), &ctx(&config, &runner))
            .await
            .unwrap();

        let scripts = runner.scripts();
        assert_eq!(scripts.len(), 1);
        assert!(!scripts[0].contains("DROP DATABASE"));
    }
}
