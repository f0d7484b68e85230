//! Repository construction.
//!
//! Identifiers are validated here and nowhere else; every repository
//! interpolates them into its statements unquoted.

use std::sync::Arc;

use tracing::debug;

use super::clickhouse::ClickHouseRepository;
use super::mysql::MySqlRepository;
use super::postgres::{PostgresRepository, DEFAULT_SCHEMA};
use super::tarantool::TarantoolRepository;
use super::{Repository, RepositoryOptions};
use crate::conn::clickhouse::ClickHouseConfig;
use crate::conn::Conn;
use crate::dsn::Driver;
use crate::error::Result;
use crate::identifier::{split_qualified, validate, validate_all};

/// Builds the repository for the connection's driver. Fails before any
/// statement is sent when an identifier is invalid.
pub fn create(conn: Arc<Conn>, options: &RepositoryOptions) -> Result<Arc<dyn Repository>> {
    let repository: Arc<dyn Repository> = match conn.driver() {
        Driver::ClickHouse => Arc::new(clickhouse(conn, options)?),
        Driver::Postgres => Arc::new(postgres(conn, options)?),
        Driver::MySql => Arc::new(mysql(conn, options)?),
        Driver::Tarantool => Arc::new(tarantool(conn, options)?),
    };
    debug!(
        driver = %repository.driver(),
        table = %repository.table_name_with_schema(),
        "repository created"
    );
    Ok(repository)
}

fn clickhouse(conn: Arc<Conn>, options: &RepositoryOptions) -> Result<ClickHouseRepository> {
    let config = ClickHouseConfig::from_dsn(conn.dsn())?;
    let (schema, table) = split_qualified(&options.table_name);
    let database = schema.unwrap_or(&config.database);
    validate_all([database, table, options.cluster_name.as_str()])?;
    Ok(ClickHouseRepository::new(
        conn,
        database.to_string(),
        table.to_string(),
        options.cluster_name.clone(),
        options.replicated,
    ))
}

fn postgres(conn: Arc<Conn>, options: &RepositoryOptions) -> Result<PostgresRepository> {
    let (schema, table) = split_qualified(&options.table_name);
    let schema = schema.unwrap_or(DEFAULT_SCHEMA);
    validate_all([schema, table])?;
    Ok(PostgresRepository::new(
        conn,
        schema.to_string(),
        table.to_string(),
    ))
}

fn mysql(conn: Arc<Conn>, options: &RepositoryOptions) -> Result<MySqlRepository> {
    let database = conn.dsn().database.clone();
    validate_all([database.as_str(), options.table_name.as_str()])?;
    Ok(MySqlRepository::new(
        conn,
        database,
        options.table_name.clone(),
    ))
}

fn tarantool(conn: Arc<Conn>, options: &RepositoryOptions) -> Result<TarantoolRepository> {
    validate(&options.table_name)?;
    Ok(TarantoolRepository::new(conn, options.table_name.clone()))
}
