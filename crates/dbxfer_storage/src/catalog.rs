use anyhow::{Context, Result};
use dbxfer_contract::{
    DatabaseCredentials, DatabaseInstance, DatabaseKind, DatabaseStatus, Environment, Server,
};
use serde::Deserialize;
use sqlx::FromRow;

use crate::repository::DbxferStorage;

#[derive(Debug, Clone, Deserialize)]
pub struct NewServer {
    pub uuid: String,
    pub name: String,
    pub ip: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    pub private_key_path: Option<String>,
    #[serde(default = "default_true")]
    pub reachable: bool,
    #[serde(default = "default_true")]
    pub usable: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewEnvironment {
    pub uuid: String,
    pub name: String,
    pub team_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewDatabase {
    pub uuid: String,
    pub kind: DatabaseKind,
    pub name: String,
    pub environment_uuid: String,
    pub server_uuid: String,
    pub container: String,
    pub image: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub status: Option<DatabaseStatus>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, FromRow)]
struct ServerRow {
    id: i64,
    uuid: String,
    name: String,
    ip: String,
    port: i64,
    ssh_user: String,
    private_key_path: Option<String>,
    reachable: bool,
    usable: bool,
}

impl ServerRow {
    fn into_server(self) -> Result<Server> {
        Ok(Server {
            id: self.id,
            uuid: self.uuid,
            name: self.name,
            ip: self.ip,
            port: u16::try_from(self.port)
                .with_context(|| format!("server port {} out of range", self.port))?,
            user: self.ssh_user,
            private_key_path: self.private_key_path,
            reachable: self.reachable,
            usable: self.usable,
        })
    }
}

#[derive(Debug, FromRow)]
struct EnvironmentRow {
    id: i64,
    uuid: String,
    name: String,
    team_id: i64,
}

impl From<EnvironmentRow> for Environment {
    fn from(row: EnvironmentRow) -> Self {
        Environment {
            id: row.id,
            uuid: row.uuid,
            name: row.name,
            team_id: row.team_id,
        }
    }
}

#[derive(Debug, FromRow)]
struct DatabaseRow {
    id: i64,
    uuid: String,
    kind: String,
    name: String,
    environment_id: i64,
    server_id: i64,
    container: String,
    image: String,
    db_user: String,
    db_password: String,
    db_name: String,
    status: Option<String>,
}

impl DatabaseRow {
    fn into_instance(self) -> Result<DatabaseInstance> {
        let kind = self
            .kind
            .parse::<DatabaseKind>()
            .with_context(|| format!("database {} has unknown kind", self.uuid))?;
        Ok(DatabaseInstance {
            id: self.id,
            uuid: self.uuid,
            kind,
            name: self.name,
            environment_id: self.environment_id,
            server_id: self.server_id,
            container: self.container,
            image: self.image,
            credentials: DatabaseCredentials {
                user: self.db_user,
                password: self.db_password,
                database: self.db_name,
            },
            status: self.status.as_deref().and_then(DatabaseStatus::parse),
        })
    }
}

const SERVER_COLUMNS: &str =
    "id, uuid, name, ip, port, ssh_user, private_key_path, reachable, usable";
const DATABASE_COLUMNS: &str = "id, uuid, kind, name, environment_id, server_id, container, image, db_user, db_password, db_name, status";

impl DbxferStorage {
    pub async fn upsert_server(&self, server: &NewServer) -> Result<Server> {
        sqlx::query(
            "INSERT INTO servers(uuid, name, ip, port, ssh_user, private_key_path, reachable, usable) VALUES (?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT(uuid) DO UPDATE SET name = excluded.name, ip = excluded.ip, port = excluded.port, ssh_user = excluded.ssh_user, private_key_path = excluded.private_key_path, reachable = excluded.reachable, usable = excluded.usable",
        )
        .bind(&server.uuid)
        .bind(&server.name)
        .bind(&server.ip)
        .bind(i64::from(server.port))
        .bind(&server.user)
        .bind(&server.private_key_path)
        .bind(server.reachable)
        .bind(server.usable)
        .execute(self.pool())
        .await
        .with_context(|| format!("upsert server {}", server.uuid))?;

        self.get_server_by_uuid(&server.uuid)
            .await?
            .context("server missing after upsert")
    }

    pub async fn get_server(&self, id: i64) -> Result<Option<Server>> {
        let row = sqlx::query_as::<_, ServerRow>(&format!(
            "SELECT {SERVER_COLUMNS} FROM servers WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .with_context(|| format!("query server {id}"))?;
        row.map(ServerRow::into_server).transpose()
    }

    pub async fn get_server_by_uuid(&self, uuid: &str) -> Result<Option<Server>> {
        let row = sqlx::query_as::<_, ServerRow>(&format!(
            "SELECT {SERVER_COLUMNS} FROM servers WHERE uuid = ?"
        ))
        .bind(uuid)
        .fetch_optional(self.pool())
        .await
        .with_context(|| format!("query server {uuid}"))?;
        row.map(ServerRow::into_server).transpose()
    }

    pub async fn upsert_environment(&self, environment: &NewEnvironment) -> Result<Environment> {
        sqlx::query(
            "INSERT INTO environments(uuid, name, team_id) VALUES (?, ?, ?) ON CONFLICT(uuid) DO UPDATE SET name = excluded.name, team_id = excluded.team_id",
        )
        .bind(&environment.uuid)
        .bind(&environment.name)
        .bind(environment.team_id)
        .execute(self.pool())
        .await
        .with_context(|| format!("upsert environment {}", environment.uuid))?;

        self.get_environment_by_uuid(&environment.uuid)
            .await?
            .context("environment missing after upsert")
    }

    pub async fn get_environment(&self, id: i64) -> Result<Option<Environment>> {
        let row = sqlx::query_as::<_, EnvironmentRow>(
            "SELECT id, uuid, name, team_id FROM environments WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .with_context(|| format!("query environment {id}"))?;
        Ok(row.map(Environment::from))
    }

    pub async fn get_environment_by_uuid(&self, uuid: &str) -> Result<Option<Environment>> {
        let row = sqlx::query_as::<_, EnvironmentRow>(
            "SELECT id, uuid, name, team_id FROM environments WHERE uuid = ?",
        )
        .bind(uuid)
        .fetch_optional(self.pool())
        .await
        .with_context(|| format!("query environment {uuid}"))?;
        Ok(row.map(Environment::from))
    }

    /// Inserts or updates a database; environment and server are referenced by uuid.
    pub async fn upsert_database(&self, database: &NewDatabase) -> Result<DatabaseInstance> {
        let result = sqlx::query(
            "INSERT INTO databases(uuid, kind, name, environment_id, server_id, container, image, db_user, db_password, db_name, status) SELECT ?, ?, ?, e.id, s.id, ?, ?, ?, ?, ?, ? FROM environments e, servers s WHERE e.uuid = ? AND s.uuid = ? ON CONFLICT(uuid) DO UPDATE SET kind = excluded.kind, name = excluded.name, environment_id = excluded.environment_id, server_id = excluded.server_id, container = excluded.container, image = excluded.image, db_user = excluded.db_user, db_password = excluded.db_password, db_name = excluded.db_name, status = excluded.status",
        )
        .bind(&database.uuid)
        .bind(database.kind.as_str())
        .bind(&database.name)
        .bind(&database.container)
        .bind(&database.image)
        .bind(&database.user)
        .bind(&database.password)
        .bind(&database.database)
        .bind(database.status.map(|status| status.as_str()))
        .bind(&database.environment_uuid)
        .bind(&database.server_uuid)
        .execute(self.pool())
        .await
        .with_context(|| format!("upsert database {}", database.uuid))?;

        if result.rows_affected() == 0 {
            anyhow::bail!(
                "database {} references unknown environment {} or server {}",
                database.uuid,
                database.environment_uuid,
                database.server_uuid
            );
        }

        self.get_database_by_uuid(&database.uuid)
            .await?
            .context("database missing after upsert")
    }

    pub async fn get_database(&self, id: i64) -> Result<Option<DatabaseInstance>> {
        let row = sqlx::query_as::<_, DatabaseRow>(&format!(
            "SELECT {DATABASE_COLUMNS} FROM databases WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .with_context(|| format!("query database {id}"))?;
        row.map(DatabaseRow::into_instance).transpose()
    }

    pub async fn get_database_by_uuid(&self, uuid: &str) -> Result<Option<DatabaseInstance>> {
        let row = sqlx::query_as::<_, DatabaseRow>(&format!(
            "SELECT {DATABASE_COLUMNS} FROM databases WHERE uuid = ?"
        ))
        .bind(uuid)
        .fetch_optional(self.pool())
        .await
        .with_context(|| format!("query database {uuid}"))?;
        row.map(DatabaseRow::into_instance).transpose()
    }

    pub async fn set_database_status(&self, uuid: &str, status: DatabaseStatus) -> Result<()> {
        sqlx::query("UPDATE databases SET status = ? WHERE uuid = ?")
            .bind(status.as_str())
            .bind(uuid)
            .execute(self.pool())
            .await
            .with_context(|| format!("update status of database {uuid}"))?;
        Ok(())
    }
}
