use cetane::prelude::*;

pub fn migration() -> Migration {
    Migration::new("0002_service_status")
        .depends_on(&["0001_pipeline"])
        .operation(RunSql::portable().for_backend(
            "sqlite",
            r#"CREATE TABLE service_status (
    id TEXT PRIMARY KEY NOT NULL,
    service_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'starting',
    last_heartbeat TEXT NOT NULL,
    last_activity TEXT,
    current_task TEXT,
    stats TEXT NOT NULL DEFAULT '{}',
    started_at TEXT NOT NULL,
    host TEXT,
    version TEXT,
    last_error TEXT,
    last_error_at TEXT,
    error_count INTEGER NOT NULL DEFAULT 0
)"#,
        ))
        .operation(RunSql::portable().for_backend(
            "sqlite",
            "CREATE INDEX idx_service_status_type ON service_status(service_type)",
        ))
        .operation(RunSql::portable().for_backend(
            "sqlite",
            "CREATE INDEX idx_service_status_heartbeat ON service_status(last_heartbeat)",
        ))
}
