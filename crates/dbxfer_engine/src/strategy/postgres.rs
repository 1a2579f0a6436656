use async_trait::async_trait;
use dbxfer_contract::{DatabaseInstance, StructureItem, TransferOptions};
use dbxfer_remote::quote;
use tracing::{info, warn};

use super::{
    docker_exec, log_best_effort, parse_count, parse_size_rows, DatabaseHandle, DumpOutcome,
    EngineContext, RestoreOutcome, TransferStrategy,
};
use crate::artifact::ArtifactPath;
use crate::identifier::{quote_pg, validate_options};

const CUSTOM_FORMAT_MAGIC: &[u8] = b"PGDMP";

/// `pg_dump` custom format for whole databases, plain SQL for table subsets.
pub struct PostgresStrategy {
    context: EngineContext,
}

impl PostgresStrategy {
    pub fn new(context: EngineContext) -> Self {
        Self { context }
    }

    fn exec(&self, database: &DatabaseHandle, interactive: bool, command: &str) -> String {
        let password = database.instance.credentials.password.as_str();
        docker_exec(
            database.container(),
            &[("PGPASSWORD", password)],
            interactive,
            command,
        )
    }

    fn psql(&self, database: &DatabaseHandle, sql: &str) -> String {
        let credentials = &database.instance.credentials;
        self.exec(
            database,
            false,
            &format!(
                "psql -U {} -d {} -tA -F '|' -c {}",
                quote(&credentials.user),
                quote(&credentials.database),
                quote(sql)
            ),
        )
    }

    fn dump_command(&self, database: &DatabaseHandle, options: Option<&TransferOptions>) -> String {
        let credentials = &database.instance.credentials;
        let mut command = format!(
            "pg_dump -U {} -d {} --no-owner --no-acl",
            quote(&credentials.user),
            quote(&credentials.database)
        );
        match options {
            Some(options) => {
                command.push_str(" --clean --if-exists");
                for table in options.units() {
                    command.push_str(" -t ");
                    command.push_str(&quote(&quote_pg(table)));
                }
            }
            None => command.push_str(" -Fc"),
        }
        self.exec(database, false, &command)
    }
}

#[async_trait]
impl TransferStrategy for PostgresStrategy {
    fn context(&self) -> &EngineContext {
        &self.context
    }

    fn database_kind(&self) -> &'static str {
        "postgresql"
    }

    fn dump_file_extension(&self) -> &'static str {
        "dump"
    }

    fn data_directory(&self) -> &'static str {
        "/var/lib/postgresql/data"
    }

    fn container_environment(&self, instance: &DatabaseInstance) -> Vec<(String, String)> {
        let credentials = &instance.credentials;
        vec![
            ("POSTGRES_USER".to_string(), credentials.user.clone()),
            ("POSTGRES_PASSWORD".to_string(), credentials.password.clone()),
            ("POSTGRES_DB".to_string(), credentials.database.clone()),
        ]
    }

    async fn ping(&self, database: &DatabaseHandle) -> bool {
        let credentials = &database.instance.credentials;
        let command = self.exec(
            database,
            false,
            &format!(
                "pg_isready -U {} -d {}",
                quote(&credentials.user),
                quote(&credentials.database)
            ),
        );
        self.context.query(&database.server, command).await.is_ok()
    }

    async fn create_dump(
        &self,
        database: &DatabaseHandle,
        path: &ArtifactPath,
        options: Option<&TransferOptions>,
    ) -> DumpOutcome {
        if let Some(options) = options {
            if let Err(error) = validate_options(options) {
                return DumpOutcome::failed(error.to_string());
            }
        }

        let commands = vec![
            format!("mkdir -p {}", quote(path.dir())),
            format!(
                "{} > {}",
                self.dump_command(database, options),
                quote(&path.partial())
            ),
            format!("mv {} {}", quote(&path.partial()), quote(path.file())),
        ];
        if let Err(error) = self
            .context
            .run(&database.server, commands, self.context.settings.dump_timeout)
            .await
        {
            return DumpOutcome::failed(error.to_string());
        }

        match self.context.artifact_size(&database.server, path.file()).await {
            Ok(0) => DumpOutcome::failed("pg_dump produced an empty file"),
            Ok(size) => {
                info!(database = %database.instance.uuid, size, "postgres dump created");
                DumpOutcome::created(size)
            }
            Err(error) => DumpOutcome::failed(error.to_string()),
        }
    }

    async fn restore_dump(
        &self,
        database: &DatabaseHandle,
        path: &ArtifactPath,
        _options: Option<&TransferOptions>,
        _origin: &DatabaseInstance,
    ) -> RestoreOutcome {
        let magic = match self
            .context
            .probe_magic(&database.server, path.file(), CUSTOM_FORMAT_MAGIC.len())
            .await
        {
            Ok(magic) => magic,
            Err(error) => return RestoreOutcome::failed(error.to_string()),
        };

        let credentials = &database.instance.credentials;
        let tool = if magic == CUSTOM_FORMAT_MAGIC {
            format!(
                "pg_restore -U {} -d {} --clean --if-exists --no-owner --no-acl --exit-on-error",
                quote(&credentials.user),
                quote(&credentials.database)
            )
        } else {
            format!(
                "psql -U {} -d {} -q -v ON_ERROR_STOP=1",
                quote(&credentials.user),
                quote(&credentials.database)
            )
        };
        let command = format!("{} < {}", self.exec(database, true, &tool), quote(path.file()));

        match self
            .context
            .run(&database.server, vec![command], self.context.settings.restore_timeout)
            .await
        {
            Ok(_) => RestoreOutcome::restored(),
            Err(error) => {
                warn!(database = %database.instance.uuid, error = %error, "postgres restore failed");
                RestoreOutcome::failed(error.to_string())
            }
        }
    }

    async fn estimate_size(
        &self,
        database: &DatabaseHandle,
        options: Option<&TransferOptions>,
    ) -> u64 {
        let sql = match options {
            Some(options) => {
                if validate_options(options).is_err() {
                    return 0;
                }
                let relations: Vec<String> = options
                    .units()
                    .iter()
                    .map(|table| format!("'{}'", quote_pg(table)))
                    .collect();
                format!(
                    "SELECT COALESCE(SUM(pg_total_relation_size(to_regclass(name))), 0) FROM unnest(ARRAY[{}]) AS name",
                    relations.join(", ")
                )
            }
            None => "SELECT pg_database_size(current_database())".to_string(),
        };

        match self
            .context
            .query(&database.server, self.psql(database, &sql))
            .await
        {
            Ok(output) => parse_count(&output),
            Err(error) => {
                log_best_effort("size estimate", database, &error);
                0
            }
        }
    }

    async fn get_structure(&self, database: &DatabaseHandle) -> Vec<StructureItem> {
        let sql = "SELECT schemaname || '.' || relname, pg_total_relation_size(relid) FROM pg_statio_user_tables ORDER BY 1";
        match self
            .context
            .query(&database.server, self.psql(database, sql))
            .await
        {
            Ok(output) => parse_size_rows(&output, '|'),
            Err(error) => {
                log_best_effort("structure", database, &error);
                Vec::new()
            }
        }
    }
}
