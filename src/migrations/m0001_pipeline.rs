use cetane::prelude::*;

/// Every stage table shares the same lifecycle columns.
macro_rules! stage_table {
    ($table:literal) => {
        concat!(
            "CREATE TABLE ",
            $table,
            r#" (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id INTEGER NOT NULL UNIQUE,
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
    failure_reason TEXT,
    last_error TEXT,
    last_attempt_at TEXT,
    claimed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT '{}'
)"#
        )
    };
}

macro_rules! status_index {
    ($table:literal) => {
        concat!(
            "CREATE INDEX idx_",
            $table,
            "_status ON ",
            $table,
            "(status, created_at)"
        )
    };
}

pub fn migration() -> Migration {
    Migration::new("0001_pipeline")
        .operation(RunSql::portable().for_backend("sqlite", stage_table!("os_downloads")))
        .operation(RunSql::portable().for_backend("sqlite", status_index!("os_downloads")))
        .operation(RunSql::portable().for_backend("sqlite", stage_table!("os_triage")))
        .operation(RunSql::portable().for_backend("sqlite", status_index!("os_triage")))
        .operation(RunSql::portable().for_backend("sqlite", stage_table!("os_tomados")))
        .operation(RunSql::portable().for_backend("sqlite", status_index!("os_tomados")))
        .operation(RunSql::portable().for_backend(
            "sqlite",
            r#"CREATE TABLE work_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    queue TEXT NOT NULL,
    entity_id INTEGER NOT NULL,
    enqueued_at TEXT NOT NULL
)"#,
        ))
        .operation(RunSql::portable().for_backend(
            "sqlite",
            "CREATE INDEX idx_work_queue_queue ON work_queue(queue, seq)",
        ))
        .operation(RunSql::portable().for_backend(
            "sqlite",
            "CREATE INDEX idx_work_queue_entity ON work_queue(queue, entity_id)",
        ))
}
