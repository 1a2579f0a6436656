use async_trait::async_trait;
use dbxfer_contract::{DatabaseInstance, StructureItem, TransferOptions};
use dbxfer_remote::quote;
use tracing::{info, warn};

use super::{
    docker_exec, is_gzip, log_best_effort, parse_count, parse_size_rows, DatabaseHandle,
    DumpOutcome, EngineContext, RestoreOutcome, TransferStrategy,
};
use crate::artifact::ArtifactPath;
use crate::identifier::validate_options;

/// Offset and value of the POSIX tar signature.
const TAR_MAGIC_OFFSET: usize = 257;
const TAR_MAGIC: &[u8] = b"ustar";

const PASSWORD_ENV: &str = "DBXFER_MONGO_PASSWORD";

/// `mongodump --archive --gzip`. A collection subset is dumped one archive per
/// collection and bundled into a tar file.
pub struct MongoStrategy {
    context: EngineContext,
}

impl MongoStrategy {
    pub fn new(context: EngineContext) -> Self {
        Self { context }
    }

    /// Options for the database tools. The password comes from the config file
    /// written by [`MongoStrategy::with_tool_config`].
    fn tool_args(&self, instance: &DatabaseInstance, config: &str) -> String {
        format!(
            "--config {} --username {} --authenticationDatabase admin",
            quote(config),
            quote(&instance.credentials.user)
        )
    }

    /// mongosh logs in from its own environment.
    fn eval_command(&self, database: &DatabaseHandle, script: &str) -> String {
        let credentials = &database.instance.credentials;
        let login = format!(
            "db.getSiblingDB('admin').auth({}, process.env.{PASSWORD_ENV});",
            js_string(&credentials.user)
        );
        docker_exec(
            database.container(),
            &[(PASSWORD_ENV, credentials.password.as_str())],
            false,
            &format!(
                "mongosh --quiet {} --eval {}",
                quote(&credentials.database),
                quote(&format!("{login} {script}"))
            ),
        )
    }

    /// Prefixes `commands` with a tools config holding the password, piped into the
    /// container over stdin, and removes it when the script exits.
    fn with_tool_config(
        &self,
        database: &DatabaseHandle,
        config: &str,
        commands: Vec<String>,
    ) -> Vec<String> {
        let container = quote(database.container());
        let yaml = format!(
            "password: '{}'",
            database.instance.credentials.password.replace('\'', "''")
        );
        let mut script = vec![
            format!(
                "trap {} EXIT",
                quote(&format!("docker exec {container} rm -f {}", quote(config)))
            ),
            format!(
                "printf '%s\\n' {} | docker exec -i {container} sh -c {}",
                quote(&yaml),
                quote(&format!("umask 077 && cat > {}", quote(config)))
            ),
        ];
        script.extend(commands);
        script
    }

    fn restore_command(
        &self,
        database: &DatabaseHandle,
        origin: &DatabaseInstance,
        config: &str,
    ) -> String {
        docker_exec(
            database.container(),
            &[],
            true,
            &format!(
                "mongorestore {} --archive --gzip --drop --nsFrom {} --nsTo {}",
                self.tool_args(&database.instance, config),
                quote(&format!("{}.*", origin.credentials.database)),
                quote(&format!("{}.*", database.instance.credentials.database))
            ),
        )
    }
}

/// Tools config path inside the container, unique per dump.
fn tool_config_path(path: &ArtifactPath) -> String {
    let name = path.file().rsplit('/').next().unwrap_or("dump");
    format!("/tmp/{name}.mongo.yaml")
}

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

/// JavaScript array literal of collection names.
fn js_names(names: &[String]) -> String {
    serde_json::to_string(names).unwrap_or_else(|_| "[]".to_string())
}

#[async_trait]
impl TransferStrategy for MongoStrategy {
    fn context(&self) -> &EngineContext {
        &self.context
    }

    fn database_kind(&self) -> &'static str {
        "mongodb"
    }

    fn dump_file_extension(&self) -> &'static str {
        "archive"
    }

    fn data_directory(&self) -> &'static str {
        "/data/db"
    }

    fn container_environment(&self, instance: &DatabaseInstance) -> Vec<(String, String)> {
        let credentials = &instance.credentials;
        vec![
            ("MONGO_INITDB_ROOT_USERNAME".to_string(), credentials.user.clone()),
            ("MONGO_INITDB_ROOT_PASSWORD".to_string(), credentials.password.clone()),
            ("MONGO_INITDB_DATABASE".to_string(), credentials.database.clone()),
        ]
    }

    async fn ping(&self, database: &DatabaseHandle) -> bool {
        let command = self.eval_command(database, "db.adminCommand({ ping: 1 }).ok");
        match self.context.query(&database.server, command).await {
            Ok(output) => parse_count(&output) == 1,
            Err(_) => false,
        }
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

        let instance = &database.instance;
        let db_name = quote(&instance.credentials.database);
        let config = tool_config_path(path);
        let mut commands = vec![format!("mkdir -p {}", quote(path.dir()))];
        match options {
            None => {
                let dump = format!(
                    "mongodump {} --db {db_name} --archive --gzip",
                    self.tool_args(instance, &config)
                );
                commands.push(format!(
                    "{} > {}",
                    docker_exec(database.container(), &[], false, &dump),
                    quote(&path.partial())
                ));
            }
            Some(options) => {
                let staging = path.staging();
                commands.push(format!("rm -rf {0} && mkdir -p {0}", quote(&staging)));
                // Collection filters only apply within a named database.
                for collection in options.units() {
                    let dump = format!(
                        "mongodump {} --db {db_name} --collection {} --archive --gzip",
                        self.tool_args(instance, &config),
                        quote(collection)
                    );
                    commands.push(format!(
                        "{} > {}",
                        docker_exec(database.container(), &[], false, &dump),
                        quote(&format!("{staging}/{collection}.archive"))
                    ));
                }
                commands.push(format!(
                    "tar -C {} -cf {} .",
                    quote(&staging),
                    quote(&path.partial())
                ));
                commands.push(format!("rm -rf {}", quote(&staging)));
            }
        }
        commands.push(format!("mv {} {}", quote(&path.partial()), quote(path.file())));
        let commands = self.with_tool_config(database, &config, commands);

        if let Err(error) = self
            .context
            .run(&database.server, commands, self.context.settings.dump_timeout)
            .await
        {
            return DumpOutcome::failed(error.to_string());
        }

        match self.context.artifact_size(&database.server, path.file()).await {
            Ok(0) => DumpOutcome::failed("mongodump produced an empty file"),
            Ok(size) => {
                info!(database = %instance.uuid, size, "mongo dump created");
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
        origin: &DatabaseInstance,
    ) -> RestoreOutcome {
        let magic = match self
            .context
            .probe_magic(&database.server, path.file(), TAR_MAGIC_OFFSET + TAR_MAGIC.len())
            .await
        {
            Ok(magic) => magic,
            Err(error) => return RestoreOutcome::failed(error.to_string()),
        };

        let config = tool_config_path(path);
        let restore = self.restore_command(database, origin, &config);
        let commands = if is_gzip(&magic) {
            vec![format!("{restore} < {}", quote(path.file()))]
        } else if magic.get(TAR_MAGIC_OFFSET..) == Some(TAR_MAGIC) {
            let staging = path.staging();
            vec![
                format!("rm -rf {0} && mkdir -p {0}", quote(&staging)),
                format!("tar -C {} -xf {}", quote(&staging), quote(path.file())),
                format!(
                    "for member in {}/*.archive; do {restore} < \"$member\"; done",
                    quote(&staging)
                ),
                format!("rm -rf {}", quote(&staging)),
            ]
        } else {
            return RestoreOutcome::failed("unrecognized mongo dump format");
        };
        let commands = self.with_tool_config(database, &config, commands);

        match self
            .context
            .run(&database.server, commands, self.context.settings.restore_timeout)
            .await
        {
            Ok(_) => RestoreOutcome::restored(),
            Err(error) => {
                warn!(database = %database.instance.uuid, error = %error, "mongo restore failed");
                RestoreOutcome::failed(error.to_string())
            }
        }
    }

    async fn estimate_size(
        &self,
        database: &DatabaseHandle,
        options: Option<&TransferOptions>,
    ) -> u64 {
        let script = match options {
            Some(options) => {
                if validate_options(options).is_err() {
                    return 0;
                }
                format!(
                    "{}.reduce((sum, name) => sum + (db.getCollection(name).stats().size || 0), 0)",
                    js_names(options.units())
                )
            }
            None => "db.stats().dataSize".to_string(),
        };
        match self
            .context
            .query(&database.server, self.eval_command(database, &script))
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
        let script = "db.getCollectionNames().sort().forEach(name => print(name + '\\t' + (db.getCollection(name).stats().size || 0)))";
        match self
            .context
            .query(&database.server, self.eval_command(database, script))
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use dbxfer_contract::DatabaseKind;
    use dbxfer_remote::RecordingExecutor;

    use crate::settings::TransferSettings;
    use crate::testing;

    fn strategy(executor: &RecordingExecutor) -> MongoStrategy {
        MongoStrategy::new(EngineContext::new(
            Arc::new(executor.clone()),
            TransferSettings::without_delays(),
        ))
    }

    fn tar_header() -> String {
        let mut bytes = vec![0u8; TAR_MAGIC_OFFSET];
        bytes.extend_from_slice(TAR_MAGIC);
        bytes.iter().map(|byte| format!(" {byte:02x}")).collect()
    }

    #[tokio::test]
    async fn collection_subset_names_the_database() {
        let executor = RecordingExecutor::new();
        executor.respond("stat -c %s", "900");
        let database = testing::handle(DatabaseKind::Mongodb, "alpha");
        let options = TransferOptions::Collections(vec!["users".to_string(), "events".to_string()]);

        let outcome = strategy(&executor)
            .create_dump(&database, &testing::artifact("archive"), Some(&options))
            .await;

        assert!(outcome.success);
        let script = &executor.scripts_containing("mongodump")[0].script;
        assert!(script.contains("--db 'shop' --collection 'users' --archive --gzip"));
        assert!(script.contains("--db 'shop' --collection 'events' --archive --gzip"));
        assert!(script.contains("tar -C"));
    }

    #[tokio::test]
    async fn passwords_never_reach_a_command_line() {
        let executor = RecordingExecutor::new();
        executor
            .respond("stat -c %s", "900")
            .respond("od -An", " 1f 8b 08 00");
        let database = testing::handle(DatabaseKind::Mongodb, "alpha");
        let strategy = strategy(&executor);

        strategy
            .create_dump(&database, &testing::artifact("archive"), None)
            .await;
        strategy
            .restore_dump(&database, &testing::artifact("archive"), None, &database.instance)
            .await;
        strategy.ping(&database).await;

        let calls = executor.calls();
        let tool_lines = calls
            .iter()
            .flat_map(|call| call.script.lines())
            .filter(|line| line.contains("mongodump") || line.contains("mongorestore"));
        for line in tool_lines {
            assert!(!line.contains("secret"), "{line}");
            assert!(!line.contains("--password"), "{line}");
            assert!(line.contains("--config '/tmp/"), "{line}");
        }
        let dump = &executor.scripts_containing("mongodump")[0].script;
        assert!(dump.starts_with("trap "));
        assert!(dump.contains("umask 077"));

        let ping = &executor.scripts_containing("mongosh")[0].script;
        assert!(ping.contains("process.env.DBXFER_MONGO_PASSWORD"));
        assert!(ping.contains("-e DBXFER_MONGO_PASSWORD 'mongodb-src' mongosh"));
    }

    #[tokio::test]
    async fn archive_restore_renames_the_namespace() {
        let executor = RecordingExecutor::new();
        executor.respond("od -An", " 1f 8b 08 00");
        let origin = testing::handle(DatabaseKind::Mongodb, "alpha").instance;
        let mut target = testing::handle(DatabaseKind::Mongodb, "beta");
        target.instance.credentials.database = "shop_copy".to_string();

        let outcome = strategy(&executor)
            .restore_dump(&target, &testing::artifact("archive"), None, &origin)
            .await;

        assert!(outcome.success);
        let script = &executor.scripts_containing("mongorestore")[0].script;
        assert!(script.contains("--nsFrom 'shop.*' --nsTo 'shop_copy.*'"));
        assert!(!script.contains("tar -C"));
    }

    #[tokio::test]
    async fn bundle_restore_replays_every_member() {
        let executor = RecordingExecutor::new();
        executor.respond("od -An", &tar_header());
        let database = testing::handle(DatabaseKind::Mongodb, "beta");

        let outcome = strategy(&executor)
            .restore_dump(&database, &testing::artifact("archive"), None, &database.instance)
            .await;

        assert!(outcome.success);
        let script = &executor.scripts_containing("mongorestore")[0].script;
        assert!(script.contains("tar -C"));
        assert!(script.contains("for member in"));
    }

    #[tokio::test]
    async fn unknown_format_is_refused() {
        let executor = RecordingExecutor::new();
        executor.respond("od -An", " 7b 22");
        let database = testing::handle(DatabaseKind::Mongodb, "beta");
        let outcome = strategy(&executor)
            .restore_dump(&database, &testing::artifact("archive"), None, &database.instance)
            .await;
        assert!(!outcome.success);
        assert!(executor.scripts_containing("mongorestore").is_empty());
    }

    #[tokio::test]
    async fn estimate_sums_requested_collections() {
        let executor = RecordingExecutor::new();
        executor.respond("reduce", "4096");
        let options = TransferOptions::Collections(vec!["users".to_string()]);
        let size = strategy(&executor)
            .estimate_size(&testing::handle(DatabaseKind::Mongodb, "alpha"), Some(&options))
            .await;
        assert_eq!(size, 4096);
        let script = &executor.scripts_containing("reduce")[0].script;
        assert!(script.contains("[\"users\"]"));
    }
}
