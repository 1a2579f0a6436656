use async_trait::async_trait;
use dbxfer_contract::{DatabaseInstance, StructureItem, TransferOptions};
use dbxfer_remote::quote;
use tracing::{info, warn};

use super::columnar::{plan_restore, SectionKind, TableSections, COLUMNAR_HEADER, MARKER_PREFIX};
use super::{
    docker_exec, log_best_effort, parse_count, parse_size_rows, DatabaseHandle, DumpOutcome,
    EngineContext, RestoreOutcome, TransferStrategy,
};
use crate::artifact::ArtifactPath;
use crate::error::EngineError;
use crate::identifier::{quote_backtick, sql_literal, validate_name, validate_options};

const TABLE_FILTER: &str =
    "database = currentDatabase() AND NOT is_temporary AND engine NOT LIKE '%View'";

/// ClickHouse, dumped table by table into the sectioned format of
/// [`columnar`](super::columnar). Views are not transferred.
pub struct ClickhouseStrategy {
    context: EngineContext,
}

impl ClickhouseStrategy {
    pub fn new(context: EngineContext) -> Self {
        Self { context }
    }

    fn client(&self, database: &DatabaseHandle, interactive: bool) -> String {
        let credentials = &database.instance.credentials;
        docker_exec(
            database.container(),
            &[],
            interactive,
            &format!(
                "clickhouse-client --user {} --password {} --database {}",
                quote(&credentials.user),
                quote(&credentials.password),
                quote(&credentials.database)
            ),
        )
    }

    fn query_command(&self, database: &DatabaseHandle, sql: &str) -> String {
        format!("{} --query {}", self.client(database, false), quote(sql))
    }

    async fn list_tables(&self, database: &DatabaseHandle) -> Result<Vec<String>, EngineError> {
        let sql = format!("SELECT name FROM system.tables WHERE {TABLE_FILTER} ORDER BY name");
        let output = self
            .context
            .query(&database.server, self.query_command(database, &sql))
            .await?;
        let tables: Vec<String> = output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect();
        // Names read back from the server get the same scrutiny as requested ones.
        for table in &tables {
            validate_name("table", table)?;
        }
        Ok(tables)
    }

    fn section_commands(&self, database: &DatabaseHandle, path: &ArtifactPath, table: &str) -> Vec<String> {
        let staging = quote(&path.staging());
        let partial = quote(&path.partial());
        let quoted = quote_backtick(table);
        let append = |kind: SectionKind| {
            vec![
                format!("lines=$(wc -l < {staging} | tr -d ' ')"),
                format!(
                    "printf -- {} {} \"$lines\" >> {partial}",
                    quote(&format!("{MARKER_PREFIX}{} table=%s lines=%s\\n", kind.as_str())),
                    quote(table)
                ),
                format!("cat {staging} >> {partial}"),
            ]
        };

        let mut commands = vec![format!(
            "{} | sed -E {} > {staging}",
            self.query_command(database, &format!("SHOW CREATE TABLE {quoted} FORMAT TSVRaw")),
            quote(&format!("1s/^CREATE TABLE [^ (]+/CREATE TABLE {quoted}/"))
        )];
        commands.extend(append(SectionKind::Schema));
        commands.push(format!(
            "{} > {staging}",
            self.query_command(database, &format!("SELECT * FROM {quoted} FORMAT TabSeparated"))
        ));
        commands.extend(append(SectionKind::Data));
        commands
    }

    fn replay_commands(&self, database: &DatabaseHandle, path: &ArtifactPath, table: &TableSections) -> Vec<String> {
        let file = quote(path.file());
        let quoted = quote_backtick(&table.table);
        let mut commands = vec![
            self.query_command(database, &format!("DROP TABLE IF EXISTS {quoted}")),
            format!(
                "sed -n {} {file} | {}",
                quote(&table.schema.sed_address()),
                self.client(database, true)
            ),
        ];
        if let Some(data) = table.data.filter(|data| !data.is_empty()) {
            commands.push(format!(
                "sed -n {} {file} | {} --query {}",
                quote(&data.sed_address()),
                self.client(database, true),
                quote(&format!("INSERT INTO {quoted} FORMAT TabSeparated"))
            ));
        }
        commands
    }

    async fn read_plan(&self, database: &DatabaseHandle, path: &ArtifactPath) -> Result<Vec<TableSections>, EngineError> {
        let file = quote(path.file());
        let output = self
            .context
            .query(
                &database.server,
                format!(
                    "head -n 1 {file}; wc -l < {file} | tr -d ' '; grep -n {} {file} || true",
                    quote(&format!("^{MARKER_PREFIX}"))
                ),
            )
            .await?;
        let mut lines = output.lines();
        if lines.next().map(str::trim) != Some(COLUMNAR_HEADER) {
            return Err(EngineError::Format("missing columnar dump header".to_string()));
        }
        let total = lines
            .next()
            .and_then(|line| line.trim().parse::<usize>().ok())
            .ok_or_else(|| EngineError::Format("could not count dump lines".to_string()))?;
        let index: Vec<&str> = lines.collect();
        plan_restore(&index.join("\n"), total)
    }
}

#[async_trait]
impl TransferStrategy for ClickhouseStrategy {
    fn context(&self) -> &EngineContext {
        &self.context
    }

    fn database_kind(&self) -> &'static str {
        "clickhouse"
    }

    fn dump_file_extension(&self) -> &'static str {
        "chdump"
    }

    fn data_directory(&self) -> &'static str {
        "/var/lib/clickhouse"
    }

    fn container_environment(&self, instance: &DatabaseInstance) -> Vec<(String, String)> {
        let credentials = &instance.credentials;
        vec![
            ("CLICKHOUSE_USER".to_string(), credentials.user.clone()),
            ("CLICKHOUSE_PASSWORD".to_string(), credentials.password.clone()),
            ("CLICKHOUSE_DB".to_string(), credentials.database.clone()),
            (
                "CLICKHOUSE_DEFAULT_ACCESS_MANAGEMENT".to_string(),
                "1".to_string(),
            ),
        ]
    }

    async fn ping(&self, database: &DatabaseHandle) -> bool {
        match self
            .context
            .query(&database.server, self.query_command(database, "SELECT 1"))
            .await
        {
            Ok(output) => output.trim() == "1",
            Err(_) => false,
        }
    }

    async fn create_dump(
        &self,
        database: &DatabaseHandle,
        path: &ArtifactPath,
        options: Option<&TransferOptions>,
    ) -> DumpOutcome {
        let tables = match options {
            Some(options) => match validate_options(options) {
                Ok(()) => options.units().to_vec(),
                Err(error) => return DumpOutcome::failed(error.to_string()),
            },
            None => match self.list_tables(database).await {
                Ok(tables) => tables,
                Err(error) => return DumpOutcome::failed(error.to_string()),
            },
        };
        if tables.is_empty() {
            return DumpOutcome::failed("database has no tables to dump");
        }

        let mut commands = vec![
            format!("mkdir -p {}", quote(path.dir())),
            format!(
                "printf '%s\\n' {} > {}",
                quote(COLUMNAR_HEADER),
                quote(&path.partial())
            ),
        ];
        for table in &tables {
            commands.extend(self.section_commands(database, path, table));
        }
        commands.push(format!("rm -f {}", quote(&path.staging())));
        commands.push(format!("mv {} {}", quote(&path.partial()), quote(path.file())));

        if let Err(error) = self
            .context
            .run(&database.server, commands, self.context.settings.dump_timeout)
            .await
        {
            return DumpOutcome::failed(error.to_string());
        }

        match self.context.artifact_size(&database.server, path.file()).await {
            Ok(0) => DumpOutcome::failed("clickhouse dump is empty"),
            Ok(size) => {
                info!(database = %database.instance.uuid, size, tables = tables.len(), "clickhouse dump created");
                DumpOutcome::created(size)
            }
            Err(error) => DumpOutcome::failed(error.to_string()),
        }
    }

    async fn restore_dump(
        &self,
        database: &DatabaseHandle,
        path: &ArtifactPath,
        options: Option<&TransferOptions>,
        _origin: &DatabaseInstance,
    ) -> RestoreOutcome {
        let mut plan = match self.read_plan(database, path).await {
            Ok(plan) => plan,
            Err(error) => return RestoreOutcome::failed(error.to_string()),
        };
        if let Some(options) = options {
            let wanted = options.units();
            if let Some(missing) = wanted
                .iter()
                .find(|table| !plan.iter().any(|entry| &entry.table == *table))
            {
                return RestoreOutcome::failed(format!("table {missing} is not in the dump"));
            }
            plan.retain(|entry| wanted.contains(&entry.table));
        }
        if plan.is_empty() {
            return RestoreOutcome::failed("dump contains no tables");
        }

        let commands: Vec<String> = plan
            .iter()
            .flat_map(|table| self.replay_commands(database, path, table))
            .collect();
        match self
            .context
            .run(&database.server, commands, self.context.settings.restore_timeout)
            .await
        {
            Ok(_) => RestoreOutcome::restored(),
            Err(error) => {
                warn!(database = %database.instance.uuid, error = %error, "clickhouse restore failed");
                RestoreOutcome::failed(error.to_string())
            }
        }
    }

    async fn estimate_size(
        &self,
        database: &DatabaseHandle,
        options: Option<&TransferOptions>,
    ) -> u64 {
        let mut sql = "SELECT sum(total_bytes) FROM system.tables WHERE database = currentDatabase()".to_string();
        if let Some(options) = options {
            if validate_options(options).is_err() {
                return 0;
            }
            let names: Vec<String> = options.units().iter().map(|name| sql_literal(name)).collect();
            sql.push_str(&format!(" AND name IN ({})", names.join(", ")));
        }
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
            "SELECT name, ifNull(total_bytes, 0) FROM system.tables WHERE {TABLE_FILTER} ORDER BY name FORMAT TabSeparated"
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
