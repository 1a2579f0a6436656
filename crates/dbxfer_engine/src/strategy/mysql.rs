use async_trait::async_trait;
use dbxfer_contract::{DatabaseInstance, DatabaseKind, StructureItem, TransferOptions};
use dbxfer_remote::quote;
use tracing::{info, warn};

use super::{
    docker_exec, is_gzip, log_best_effort, parse_count, parse_size_rows, DatabaseHandle,
    DumpOutcome, EngineContext, RestoreOutcome, TransferStrategy,
};
use crate::artifact::ArtifactPath;
use crate::identifier::{sql_literal, validate_options_for};

struct ClientTools {
    dump: &'static str,
    client: &'static str,
    admin: &'static str,
}

const MYSQL_TOOLS: ClientTools = ClientTools {
    dump: "mysqldump",
    client: "mysql",
    admin: "mysqladmin",
};

const MARIADB_TOOLS: ClientTools = ClientTools {
    dump: "mariadb-dump",
    client: "mariadb",
    admin: "mariadb-admin",
};

/// MySQL and MariaDB. Whole databases are dumped gzip-compressed, table subsets as plain SQL.
pub struct MysqlStrategy {
    context: EngineContext,
    kind: DatabaseKind,
}

impl MysqlStrategy {
    pub fn new(context: EngineContext, kind: DatabaseKind) -> Self {
        Self { context, kind }
    }

    fn tools(&self) -> &'static ClientTools {
        match self.kind {
            DatabaseKind::Mariadb => &MARIADB_TOOLS,
            _ => &MYSQL_TOOLS,
        }
    }

    fn exec(&self, database: &DatabaseHandle, interactive: bool, command: &str) -> String {
        let password = database.instance.credentials.password.as_str();
        docker_exec(
            database.container(),
            &[("MYSQL_PWD", password)],
            interactive,
            command,
        )
    }

    fn query_command(&self, database: &DatabaseHandle, sql: &str) -> String {
        self.exec(
            database,
            false,
            &format!(
                "{} -u {} -N -B -e {}",
                self.tools().client,
                quote(&database.instance.credentials.user),
                quote(sql)
            ),
        )
    }

    fn schema_filter(&self, database: &DatabaseHandle, options: Option<&TransferOptions>) -> String {
        let mut filter = format!(
            "table_schema = {}",
            sql_literal(&database.instance.credentials.database)
        );
        if let Some(options) = options {
            let names: Vec<String> = options.units().iter().map(|name| sql_literal(name)).collect();
            filter.push_str(&format!(" AND table_name IN ({})", names.join(", ")));
        }
        filter
    }
}

#[async_trait]
impl TransferStrategy for MysqlStrategy {
    fn context(&self) -> &EngineContext {
        &self.context
    }

    fn database_kind(&self) -> &'static str {
        self.kind.as_str()
    }

    fn dump_file_extension(&self) -> &'static str {
        "sql.gz"
    }

    fn data_directory(&self) -> &'static str {
        "/var/lib/mysql"
    }

    fn container_environment(&self, instance: &DatabaseInstance) -> Vec<(String, String)> {
        let credentials = &instance.credentials;
        let mut env = vec![
            ("MYSQL_ROOT_PASSWORD".to_string(), credentials.password.clone()),
            ("MYSQL_DATABASE".to_string(), credentials.database.clone()),
        ];
        if credentials.user != "root" {
            env.push(("MYSQL_USER".to_string(), credentials.user.clone()));
            env.push(("MYSQL_PASSWORD".to_string(), credentials.password.clone()));
        }
        env
    }

    async fn ping(&self, database: &DatabaseHandle) -> bool {
        let command = self.exec(
            database,
            false,
            &format!(
                "{} -u {} ping",
                self.tools().admin,
                quote(&database.instance.credentials.user)
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
            if let Err(error) = validate_options_for(self.kind, options) {
                return DumpOutcome::failed(error.to_string());
            }
        }

        let credentials = &database.instance.credentials;
        let mut dump = format!(
            "{} -u {} --single-transaction --no-tablespaces",
            self.tools().dump,
            quote(&credentials.user)
        );
        let target = match options {
            Some(options) => {
                dump.push(' ');
                dump.push_str(&quote(&credentials.database));
                for table in options.units() {
                    dump.push(' ');
                    dump.push_str(&quote(table));
                }
                format!("{} > {}", self.exec(database, false, &dump), quote(&path.partial()))
            }
            None => {
                dump.push_str(" --routines --triggers ");
                dump.push_str(&quote(&credentials.database));
                format!(
                    "{} | gzip -c > {}",
                    self.exec(database, false, &dump),
                    quote(&path.partial())
                )
            }
        };

        let commands = vec![
            format!("mkdir -p {}", quote(path.dir())),
            target,
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
            Ok(0) => DumpOutcome::failed(format!("{} produced an empty file", self.tools().dump)),
            Ok(size) => {
                info!(database = %database.instance.uuid, size, kind = self.database_kind(), "mysql dump created");
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
        let magic = match self.context.probe_magic(&database.server, path.file(), 2).await {
            Ok(magic) => magic,
            Err(error) => return RestoreOutcome::failed(error.to_string()),
        };

        let credentials = &database.instance.credentials;
        let client = self.exec(
            database,
            true,
            &format!(
                "{} -u {} {}",
                self.tools().client,
                quote(&credentials.user),
                quote(&credentials.database)
            ),
        );
        let command = if is_gzip(&magic) {
            format!("gunzip -c {} | {client}", quote(path.file()))
        } else {
            format!("{client} < {}", quote(path.file()))
        };

        match self
            .context
            .run(&database.server, vec![command], self.context.settings.restore_timeout)
            .await
        {
            Ok(_) => RestoreOutcome::restored(),
            Err(error) => {
                warn!(database = %database.instance.uuid, error = %error, "mysql restore failed");
                RestoreOutcome::failed(error.to_string())
            }
        }
    }

    async fn estimate_size(
        &self,
        database: &DatabaseHandle,
        options: Option<&TransferOptions>,
    ) -> u64 {
        if options.is_some_and(|options| validate_options_for(self.kind, options).is_err()) {
            return 0;
        }
        let sql = format!(
            "SELECT COALESCE(SUM(data_length + index_length), 0) FROM information_schema.tables WHERE {}",
            self.schema_filter(database, options)
        );
        match self
            .context
            .query(&database.server, self.query_command(database, &sql))
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
        let sql = format!(
            "SELECT table_name, COALESCE(data_length + index_length, 0) FROM information_schema.tables WHERE {} AND table_type = 'BASE TABLE' ORDER BY table_name",
            self.schema_filter(database, None)
        );
        match self
            .context
            .query(&database.server, self.query_command(database, &sql))
            .await
        {
            Ok(output) => parse_size_rows(&output, '\t'),
            Err(error) => {
                log_best_effort("structure", database, &error);
                Vec::new()
            }
        }
    }
}
