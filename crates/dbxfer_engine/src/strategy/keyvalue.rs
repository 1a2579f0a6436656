use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use dbxfer_contract::{DatabaseInstance, DatabaseKind, StructureItem, TransferOptions};
use dbxfer_remote::{quote, ExecError};
use tracing::{debug, info, warn};

use super::{
    docker_exec, log_best_effort, parse_count, DatabaseHandle, DumpOutcome, EngineContext,
    RestoreOutcome, TransferStrategy,
};
use crate::artifact::ArtifactPath;
use crate::identifier::validate_options;

/// First line of a keyspace dump.
///
/// ```text
/// file   := header NL record*
/// record := "KEY" SP base64(key) SP ttl_ms NL base64(DUMP payload) NL
/// ```
///
/// `ttl_ms` is `0` for keys without expiry. Base64 keeps keys and payloads on one line.
pub const KEYSPACE_HEADER: &str = "# dbxfer-keyspace v1";

const SNAPSHOT_MAGIC: &[u8] = b"REDIS";
const STRUCTURE_SCAN_LIMIT: usize = 10_000;

/// Redis `MATCH` glob semantics: `*`, `?`, `[...]` classes with ranges and `^`, `\` escapes.
pub(crate) fn key_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let key: Vec<char> = key.chars().collect();
    glob(&pattern, &key)
}

fn glob(pattern: &[char], key: &[char]) -> bool {
    match pattern.first() {
        None => key.is_empty(),
        Some('*') => {
            let rest = &pattern[1..];
            (0..=key.len()).any(|skip| glob(rest, &key[skip..]))
        }
        Some('?') => !key.is_empty() && glob(&pattern[1..], &key[1..]),
        Some('[') => match class_end(pattern) {
            Some(end) => match key.first() {
                Some(ch) => in_class(&pattern[1..end], *ch) && glob(&pattern[end + 1..], &key[1..]),
                None => false,
            },
            None => key.first() == Some(&'[') && glob(&pattern[1..], &key[1..]),
        },
        Some('\\') if pattern.len() > 1 => {
            key.first() == Some(&pattern[1]) && glob(&pattern[2..], &key[1..])
        }
        Some(literal) => key.first() == Some(literal) && glob(&pattern[1..], &key[1..]),
    }
}

/// Index of the `]` closing the class opened at `pattern[0]`.
fn class_end(pattern: &[char]) -> Option<usize> {
    let start = if pattern.get(1) == Some(&'^') { 2 } else { 1 };
    (start..pattern.len()).find(|&index| pattern[index] == ']')
}

fn in_class(class: &[char], ch: char) -> bool {
    let (negated, class) = match class.split_first() {
        Some(('^', rest)) => (true, rest),
        _ => (false, class),
    };
    let mut matched = false;
    let mut index = 0;
    while index < class.len() {
        if index + 2 < class.len() && class[index + 1] == '-' {
            let (low, high) = if class[index] <= class[index + 2] {
                (class[index], class[index + 2])
            } else {
                (class[index + 2], class[index])
            };
            matched |= (low..=high).contains(&ch);
            index += 3;
        } else {
            matched |= class[index] == ch;
            index += 1;
        }
    }
    matched != negated
}

/// Redis-protocol engines: Redis, KeyDB and Dragonfly.
///
/// Whole databases move as a native snapshot (`BGSAVE` then copy the RDB file),
/// except on Dragonfly whose snapshot files are not RDB; there the whole keyspace
/// goes through the keyspace format with the pattern `*`. Key-pattern subsets
/// always use the keyspace format.
pub struct KeyValueStrategy {
    context: EngineContext,
    kind: DatabaseKind,
}

impl KeyValueStrategy {
    pub fn new(context: EngineContext, kind: DatabaseKind) -> Self {
        Self { context, kind }
    }

    fn cli_binary(&self) -> &'static str {
        match self.kind {
            DatabaseKind::Keydb => "keydb-cli",
            _ => "redis-cli",
        }
    }

    fn native_snapshots(&self) -> bool {
        self.kind != DatabaseKind::Dragonfly
    }

    /// `docker exec ... redis-cli`, ready for arguments.
    fn cli(&self, database: &DatabaseHandle, interactive: bool) -> String {
        let password = database.instance.credentials.password.as_str();
        let auth = [("REDISCLI_AUTH", password)];
        let env: &[(&str, &str)] = if password.is_empty() { &[] } else { &auth };
        docker_exec(database.container(), env, interactive, self.cli_binary())
    }

    async fn cli_query(&self, database: &DatabaseHandle, args: &str) -> Result<String, ExecError> {
        self.context
            .query(&database.server, format!("{} {args}", self.cli(database, false)))
            .await
    }

    async fn config_value(&self, database: &DatabaseHandle, name: &str) -> Result<String, String> {
        let output = self
            .cli_query(database, &format!("CONFIG GET {name}"))
            .await
            .map_err(|error| error.to_string())?;
        output
            .lines()
            .nth(1)
            .map(|value| value.trim().to_string())
            .ok_or_else(|| format!("server did not report `{name}`"))
    }

    async fn scan_keys(
        &self,
        database: &DatabaseHandle,
        patterns: &[String],
    ) -> Result<BTreeSet<String>, ExecError> {
        let mut keys = BTreeSet::new();
        for pattern in patterns {
            let output = self
                .cli_query(database, &format!("--scan --pattern {}", quote(pattern)))
                .await?;
            let mut skipped = 0usize;
            for line in output.lines().filter(|line| !line.is_empty()) {
                if key_matches(pattern, line) {
                    keys.insert(line.to_owned());
                } else {
                    skipped += 1;
                }
            }
            if skipped > 0 {
                warn!(database = %database.instance.uuid, pattern = %pattern, skipped, "scan returned lines outside the pattern");
            }
        }
        Ok(keys)
    }

    async fn dump_snapshot(&self, database: &DatabaseHandle, path: &ArtifactPath) -> Result<(), String> {
        let before = self
            .cli_query(database, "LASTSAVE")
            .await
            .map(|output| parse_count(&output))
            .map_err(|error| error.to_string())?;
        self.cli_query(database, "BGSAVE")
            .await
            .map_err(|error| error.to_string())?;

        let settings = &self.context.settings;
        let mut saved = false;
        for attempt in 1..=settings.snapshot_poll_attempts {
            tokio::time::sleep(settings.snapshot_poll_interval).await;
            match self.cli_query(database, "LASTSAVE").await {
                Ok(output) if parse_count(&output) > before => {
                    debug!(database = %database.instance.uuid, attempt, "background save finished");
                    saved = true;
                    break;
                }
                Ok(_) => {}
                Err(error) => {
                    debug!(database = %database.instance.uuid, attempt, error = %error, "LASTSAVE check failed")
                }
            }
        }
        if !saved {
            return Err(format!(
                "background save did not finish after {} checks",
                settings.snapshot_poll_attempts
            ));
        }

        let dir = self.config_value(database, "dir").await?;
        let file = self.config_value(database, "dbfilename").await?;
        let commands = vec![
            format!("mkdir -p {}", quote(path.dir())),
            format!(
                "docker cp {} {}",
                quote(&format!("{}:{dir}/{file}", database.container())),
                quote(&path.partial())
            ),
            format!("mv {} {}", quote(&path.partial()), quote(path.file())),
        ];
        self.context
            .run(&database.server, commands, settings.dump_timeout)
            .await
            .map(|_| ())
            .map_err(|error| error.to_string())
    }

    async fn dump_keyspace(
        &self,
        database: &DatabaseHandle,
        path: &ArtifactPath,
        patterns: &[String],
    ) -> Result<usize, String> {
        let keys = self
            .scan_keys(database, patterns)
            .await
            .map_err(|error| error.to_string())?;
        if keys.is_empty() {
            return Err(format!("no keys match {}", patterns.join(", ")));
        }

        let cli = self.cli(database, false);
        let partial = quote(&path.partial());
        let mut commands = vec![
            format!("mkdir -p {}", quote(path.dir())),
            format!("printf '%s\\n' {} > {partial}", quote(KEYSPACE_HEADER)),
            format!(
                "dump_key() {{\n  ttl=$({cli} PTTL \"$1\")\n  if [ \"$ttl\" = \"-2\" ]; then return 0; fi\n  if [ \"$ttl\" = \"-1\" ]; then ttl=0; fi\n  payload=$({cli} DUMP \"$1\" | head -c -1 | base64 -w0)\n  if [ -z \"$payload\" ]; then return 0; fi\n  printf 'KEY %s %s\\n%s\\n' \"$(printf '%s' \"$1\" | base64 -w0)\" \"$ttl\" \"$payload\" >> {partial}\n}}"
            ),
        ];
        commands.extend(keys.iter().map(|key| format!("dump_key {}", quote(key))));
        commands.push(format!("mv {partial} {}", quote(path.file())));

        self.context
            .run(&database.server, commands, self.context.settings.dump_timeout)
            .await
            .map_err(|error| error.to_string())?;
        Ok(keys.len())
    }

    async fn restore_snapshot(&self, database: &DatabaseHandle, path: &ArtifactPath) -> Result<(), String> {
        if self.config_value(database, "appendonly").await? == "yes" {
            return Err(
                "target has appendonly enabled; its AOF would replace the snapshot on start"
                    .to_string(),
            );
        }
        let dir = self.config_value(database, "dir").await?;
        let file = self.config_value(database, "dbfilename").await?;
        let container = quote(database.container());
        let commands = vec![
            format!("docker stop {container}"),
            format!(
                "docker cp {} {}",
                quote(path.file()),
                quote(&format!("{}:{dir}/{file}", database.container()))
            ),
            format!("docker start {container}"),
        ];
        self.context
            .run(&database.server, commands, self.context.settings.restore_timeout)
            .await
            .map_err(|error| error.to_string())?;

        let settings = &self.context.settings;
        for _ in 0..settings.readiness_poll_attempts {
            if self.ping(database).await {
                return Ok(());
            }
            tokio::time::sleep(settings.readiness_poll_interval).await;
        }
        Err(format!(
            "{} did not answer PING after loading the snapshot",
            database.instance.name
        ))
    }

    async fn restore_keyspace(
        &self,
        database: &DatabaseHandle,
        path: &ArtifactPath,
        replace_all: bool,
    ) -> Result<(), String> {
        let cli = self.cli(database, false);
        let cli_stdin = self.cli(database, true);
        let mut commands = Vec::new();
        if replace_all {
            commands.push(format!("{cli} FLUSHALL > /dev/null"));
        }
        commands.push(format!(
            "while IFS=' ' read -r marker key ttl; do\n  if [ \"$marker\" != \"KEY\" ]; then continue; fi\n  IFS= read -r payload\n  name=$(printf '%s' \"$key\" | base64 -d)\n  {cli} DEL \"$name\" > /dev/null\n  reply=$(printf '%s' \"$payload\" | base64 -d | {cli_stdin} -x RESTORE \"$name\" \"$ttl\")\n  if [ \"$reply\" != \"OK\" ]; then echo \"RESTORE $name failed: $reply\" >&2; exit 1; fi\ndone < {}",
            quote(path.file())
        ));
        self.context
            .run(&database.server, commands, self.context.settings.restore_timeout)
            .await
            .map(|_| ())
            .map_err(|error| error.to_string())
    }
}

/// Groups `key<TAB>bytes` rows by the prefix before the first `:` into `prefix:*`.
fn group_by_prefix(output: &str) -> Vec<StructureItem> {
    let mut groups: BTreeMap<String, u64> = BTreeMap::new();
    for line in output.lines() {
        let Some((key, size)) = line.rsplit_once('\t') else {
            continue;
        };
        if key.is_empty() {
            continue;
        }
        let name = match key.split_once(':') {
            Some((prefix, _)) => format!("{prefix}:*"),
            None => key.to_string(),
        };
        *groups.entry(name).or_default() += parse_count(size);
    }
    groups
        .into_iter()
        .map(|(name, size_bytes)| StructureItem { name, size_bytes })
        .collect()
}

fn used_memory(info: &str) -> u64 {
    info.lines()
        .find_map(|line| line.trim().strip_prefix("used_memory:"))
        .map(parse_count)
        .unwrap_or(0)
}

#[async_trait]
impl TransferStrategy for KeyValueStrategy {
    fn context(&self) -> &EngineContext {
        &self.context
    }

    fn database_kind(&self) -> &'static str {
        self.kind.as_str()
    }

    fn dump_file_extension(&self) -> &'static str {
        "rdb"
    }

    fn data_directory(&self) -> &'static str {
        "/data"
    }

    fn container_environment(&self, _instance: &DatabaseInstance) -> Vec<(String, String)> {
        Vec::new()
    }

    fn container_command(&self, instance: &DatabaseInstance) -> Vec<String> {
        let password = &instance.credentials.password;
        match self.kind {
            DatabaseKind::Dragonfly => {
                let mut args = vec!["--dir=/data".to_string()];
                if !password.is_empty() {
                    args.push(format!("--requirepass={password}"));
                }
                args
            }
            _ => {
                let server = if self.kind == DatabaseKind::Keydb {
                    "keydb-server"
                } else {
                    "redis-server"
                };
                let mut args = vec![
                    server.to_string(),
                    "--appendonly".to_string(),
                    "no".to_string(),
                ];
                if !password.is_empty() {
                    args.push("--requirepass".to_string());
                    args.push(password.clone());
                }
                args
            }
        }
    }

    async fn ping(&self, database: &DatabaseHandle) -> bool {
        matches!(
            self.cli_query(database, "PING").await.as_deref().map(str::trim),
            Ok("PONG")
        )
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

        let result = match options {
            Some(options) => self
                .dump_keyspace(database, path, options.units())
                .await
                .map(|keys| info!(database = %database.instance.uuid, keys, "keyspace dumped")),
            None if self.native_snapshots() => self.dump_snapshot(database, path).await,
            None => self
                .dump_keyspace(database, path, &["*".to_string()])
                .await
                .map(|keys| info!(database = %database.instance.uuid, keys, "keyspace dumped")),
        };
        if let Err(error) = result {
            return DumpOutcome::failed(error);
        }

        match self.context.artifact_size(&database.server, path.file()).await {
            Ok(0) => DumpOutcome::failed("key-value dump is empty"),
            Ok(size) => DumpOutcome::created(size),
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
        let magic = match self
            .context
            .probe_magic(&database.server, path.file(), KEYSPACE_HEADER.len())
            .await
        {
            Ok(magic) => magic,
            Err(error) => return RestoreOutcome::failed(error.to_string()),
        };

        let result = if magic.starts_with(SNAPSHOT_MAGIC) {
            self.restore_snapshot(database, path).await
        } else if magic.starts_with(KEYSPACE_HEADER.as_bytes()) {
            self.restore_keyspace(database, path, options.is_none()).await
        } else {
            Err("unrecognized key-value dump format".to_string())
        };

        match result {
            Ok(()) => RestoreOutcome::restored(),
            Err(error) => {
                warn!(database = %database.instance.uuid, error = %error, "key-value restore failed");
                RestoreOutcome::failed(error)
            }
        }
    }

    async fn estimate_size(
        &self,
        database: &DatabaseHandle,
        options: Option<&TransferOptions>,
    ) -> u64 {
        let result = match options {
            Some(options) => {
                if validate_options(options).is_err() {
                    return 0;
                }
                let cli = self.cli(database, false);
                let scans: Vec<String> = options
                    .units()
                    .iter()
                    .map(|pattern| format!("{cli} --scan --pattern {};", quote(pattern)))
                    .collect();
                let command = format!(
                    "{{ {} }} | sort -u | while IFS= read -r key; do {cli} MEMORY USAGE \"$key\"; done | awk '{{ total += $1 }} END {{ print total + 0 }}'",
                    scans.join(" ")
                );
                self.context
                    .query(&database.server, command)
                    .await
                    .map(|output| parse_count(&output))
            }
            None => self
                .cli_query(database, "INFO memory")
                .await
                .map(|output| used_memory(&output)),
        };
        result.unwrap_or_else(|error| {
            log_best_effort("size estimate", database, &error);
            0
        })
    }

    async fn get_structure(&self, database: &DatabaseHandle) -> Vec<StructureItem> {
        let cli = self.cli(database, false);
        let command = format!(
            "{cli} --scan --count 1000 | head -n {STRUCTURE_SCAN_LIMIT} | while IFS= read -r key; do printf '%s\\t%s\\n' \"$key\" \"$({cli} MEMORY USAGE \"$key\")\"; done"
        );
        // `head` closes the scan early, so a non-zero pipeline status is expected.
        match self
            .context
            .executor
            .run(
                &[command],
                &database.server,
                false,
                Some(self.context.settings.command_timeout),
            )
            .await
        {
            Ok(output) => group_by_prefix(&output),
            Err(error) => {
                log_best_effort("structure", database, &error);
                Vec::new()
            }
        }
    }
}
