use dbxfer_contract::TransferRecord;

/// Where one transfer keeps its dump. The same path is used on every server the
/// transfer touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPath {
    dir: String,
    file: String,
}

impl ArtifactPath {
    /// `{scratch}/{record id}/{record id}-{created %Y%m%d%H%M%S}.{extension}`
    pub fn for_record(scratch_dir: &str, record: &TransferRecord, extension: &str) -> Self {
        let dir = format!("{}/{}", scratch_dir.trim_end_matches('/'), record.id);
        let file = format!(
            "{dir}/{}-{}.{extension}",
            record.id,
            record.created_at.format("%Y%m%d%H%M%S")
        );
        Self { dir, file }
    }

    pub fn dir(&self) -> &str {
        &self.dir
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    /// Scratch file or directory next to the dump, for multi-part work.
    pub fn staging(&self) -> String {
        format!("{}.staging", self.file)
    }

    /// The dump is written here first and renamed into place once complete.
    pub fn partial(&self) -> String {
        format!("{}.part", self.file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use dbxfer_contract::{DatabaseKind, SourceRef, TransferMode, TransferStatus};
    use uuid::Uuid;

    fn record(id: Uuid) -> TransferRecord {
        let created = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).single().expect("time");
        TransferRecord {
            id,
            source: SourceRef {
                kind: DatabaseKind::Postgresql,
                id: 1,
            },
            source_database_uuid: "pg".to_string(),
            target_environment_id: 1,
            target_server_id: 1,
            mode: TransferMode::Clone,
            transfer_options: None,
            existing_target_uuid: None,
            target_database_uuid: None,
            status: TransferStatus::Pending,
            progress: 0,
            current_step: None,
            total_bytes: 0,
            transferred_bytes: 0,
            error: None,
            log: Vec::new(),
            initiated_by: 1,
            team_id: 1,
            created_at: created,
            updated_at: created,
            started_at: None,
            finished_at: None,
        }
    }

    #[test]
    fn path_is_scoped_to_the_record() {
        let id = Uuid::now_v7();
        let path = ArtifactPath::for_record("/tmp/dbxfer/", &record(id), "dump");
        assert_eq!(path.dir(), format!("/tmp/dbxfer/{id}"));
        assert_eq!(
            path.file(),
            format!("/tmp/dbxfer/{id}/{id}-20260314092653.dump")
        );
        assert_eq!(path.partial(), format!("{}.part", path.file()));
    }

    #[test]
    fn concurrent_records_never_share_a_path() {
        let a = ArtifactPath::for_record("/tmp/dbxfer", &record(Uuid::now_v7()), "dump");
        let b = ArtifactPath::for_record("/tmp/dbxfer", &record(Uuid::now_v7()), "dump");
        assert_ne!(a.dir(), b.dir());
        assert_ne!(a.file(), b.file());
    }
}
