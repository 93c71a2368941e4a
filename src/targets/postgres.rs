//! PostgreSQL databases via `pg_dump`, `dropdb`, `createdb` and `psql`.

use super::{Artifact, BackupTarget, RestoreResult, TargetContext};
use crate::config::DatabaseConfig;
use crate::descriptor::TargetKind;
use crate::error::{Error, Result};
use crate::process::{quote, run_checked, Env};
use async_trait::async_trait;
use std::fs;
use std::path::Path;
use tracing::{error, info, warn};

pub struct PostgresqlDatabase;

pub fn backup_name(dbname: &str) -> Result<String> {
    if dbname.trim().is_empty() {
        return Err(Error::InvalidName(format!(
            "a database name is required, got {dbname:?}"
        )));
    }
    Ok(format!("{dbname}-psql.gz"))
}

fn env(config: &DatabaseConfig) -> Env {
    config
        .password
        .iter()
        .map(|pw| ("PGPASSWORD".to_string(), pw.clone()))
        .collect()
}

fn connection_args(config: &DatabaseConfig) -> String {
    format!(
        "--username {} --no-password --host {} --port {}",
        quote(&config.user),
        quote(&config.host),
        config.port
    )
}

pub fn dump_command(config: &DatabaseConfig, dbname: &str, output: &Path) -> String {
    // no --clean/--create: an automated restore shouldn't be able to lose data
    format!(
        "set -o pipefail; pg_dump {} --no-owner --dbname {} | gzip > {}",
        connection_args(config),
        quote(dbname),
        quote(&output.to_string_lossy())
    )
}

pub fn drop_command(config: &DatabaseConfig, dbname: &str) -> String {
    format!("dropdb {} --if-exists {}", connection_args(config), quote(dbname))
}

pub fn create_command(config: &DatabaseConfig, dbname: &str) -> String {
    format!("createdb {} {}", connection_args(config), quote(dbname))
}

pub fn load_command(config: &DatabaseConfig, dbname: &str, dump: &Path) -> String {
    format!(
        "set -o pipefail; gunzip -c {} | psql {} --dbname {}",
        quote(&dump.to_string_lossy()),
        connection_args(config),
        quote(dbname)
    )
}

async fn restore_one(dbname: &str, source_dir: &Path, ctx: &TargetContext<'_>) -> Result<bool> {
    let dump = source_dir.join(backup_name(dbname)?);
    if !dump.is_file() {
        warn!("expected path {} does not exist or is not a file", dump.display());
        return Ok(false);
    }

    let config = &ctx.config.postgresql;
    let env = env(config);

    info!("restoring PostgreSQL database {:?}", dbname);
    run_checked(ctx.runner, &drop_command(config, dbname), &env).await?;
    run_checked(ctx.runner, &create_command(config, dbname), &env).await?;
    run_checked(ctx.runner, &load_command(config, dbname, &dump), &env).await?;
    Ok(true)
}

#[async_trait]
impl BackupTarget for PostgresqlDatabase {
    fn kind(&self) -> TargetKind {
        TargetKind::PostgresqlDatabase
    }

    async fn backup(
        &self,
        names: &[String],
        destination: &Path,
        ctx: &TargetContext<'_>,
    ) -> Result<Artifact> {
        if !names.is_empty() && !ctx.runner.has_tool("pg_dump") {
            return Err(Error::NotFound("pg_dump is not installed".to_string()));
        }
        fs::create_dir_all(destination)?;
        let config = &ctx.config.postgresql;
        let env = env(config);

        let mut output = Vec::with_capacity(names.len());
        for dbname in names {
            let path = destination.join(backup_name(dbname)?);
            info!("backing up PostgreSQL database {:?}", dbname);
            run_checked(ctx.runner, &dump_command(config, dbname, &path), &env).await?;
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
        for dbname in names {
            let ok = restore_one(dbname, source_dir, ctx).await.unwrap_or_else(|err| {
                error!("failed to restore PostgreSQL database {:?}: {}", dbname, err);
                false
            });
            output.push((dbname.clone(), ok));
        }
        Ok(RestoreResult { output })
    }

    fn artifact_names(&self, names: &[String]) -> Result<Vec<String>> {
        names.iter().map(|n| backup_name(n)).collect()
    }

    fn remote_pattern(&self) -> Option<&'static str> {
        Some(r".+-psql\.gz")
    }
}
