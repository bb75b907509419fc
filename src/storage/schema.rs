//! Database schema constants.
//!
//! Statements are grouped into named [`Migration`]s. Every statement is
//! idempotent, so a migration interrupted halfway can simply run again.

/// SQL schema for creating the systems table.
pub const CREATE_SYSTEMS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS systems (
    system_id VARCHAR(255) PRIMARY KEY,
    system_key VARCHAR(255) NOT NULL UNIQUE,
    secret_public VARCHAR(255) NOT NULL,
    secret_hash TEXT NOT NULL,
    active BOOLEAN NOT NULL DEFAULT TRUE,
    last_used_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the system_heartbeats table.
pub const CREATE_HEARTBEATS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS system_heartbeats (
    system_id VARCHAR(255) PRIMARY KEY,
    last_heartbeat TIMESTAMPTZ NOT NULL
)
"#;

/// Liveness status kept next to the heartbeat.
pub const ADD_HEARTBEAT_STATUS: &str = r#"
ALTER TABLE system_heartbeats
    ADD COLUMN IF NOT EXISTS status VARCHAR(16) NOT NULL DEFAULT 'unknown'
"#;

/// SQL schema for creating the inventory_records table.
pub const CREATE_INVENTORY_RECORDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS inventory_records (
    id BIGSERIAL PRIMARY KEY,
    system_id VARCHAR(255) NOT NULL,
    timestamp TIMESTAMPTZ NOT NULL,
    data JSONB NOT NULL,
    data_hash CHAR(64) NOT NULL,
    data_size BIGINT NOT NULL,
    processed_at TIMESTAMPTZ,
    has_changes BOOLEAN NOT NULL DEFAULT FALSE,
    change_count INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE(system_id, data_hash)
)
"#;

/// SQL schema for creating the inventory_diffs table.
///
/// Diffs outlive their records under the retention policy, so `current_id`
/// carries no foreign key.
pub const CREATE_INVENTORY_DIFFS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS inventory_diffs (
    id BIGSERIAL PRIMARY KEY,
    system_id VARCHAR(255) NOT NULL,
    previous_id BIGINT,
    current_id BIGINT NOT NULL,
    diff_type VARCHAR(10) NOT NULL,
    field_path TEXT NOT NULL,
    previous_value JSONB,
    current_value JSONB,
    severity VARCHAR(10) NOT NULL,
    category VARCHAR(20) NOT NULL,
    notification_sent BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the inventory_alerts table.
pub const CREATE_INVENTORY_ALERTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS inventory_alerts (
    id BIGSERIAL PRIMARY KEY,
    system_id VARCHAR(255) NOT NULL,
    diff_id BIGINT REFERENCES inventory_diffs(id) ON DELETE SET NULL,
    alert_type VARCHAR(20) NOT NULL,
    message TEXT NOT NULL,
    severity VARCHAR(10) NOT NULL,
    is_resolved BOOLEAN NOT NULL DEFAULT FALSE,
    resolved_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Index statements, one per entry since each runs as its own statement.
pub const CREATE_INDEXES: [&str; 6] = [
    "CREATE INDEX IF NOT EXISTS idx_inventory_records_system_ts ON inventory_records(system_id, timestamp DESC)",
    "CREATE INDEX IF NOT EXISTS idx_inventory_records_processed ON inventory_records(processed_at)",
    "CREATE INDEX IF NOT EXISTS idx_inventory_diffs_current ON inventory_diffs(current_id)",
    "CREATE INDEX IF NOT EXISTS idx_inventory_diffs_system ON inventory_diffs(system_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_inventory_diffs_severity ON inventory_diffs(severity, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_inventory_alerts_system ON inventory_alerts(system_id, is_resolved)",
];

/// A named, ordered group of schema statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    pub name: &'static str,
    pub statements: &'static [&'static str],
}

/// Schema history, oldest first. Append only: applied entries are checked
/// against their checksum on every run.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "0001_systems",
        statements: &[CREATE_SYSTEMS_TABLE, CREATE_HEARTBEATS_TABLE],
    },
    Migration {
        name: "0002_inventory",
        statements: &[
            CREATE_INVENTORY_RECORDS_TABLE,
            CREATE_INVENTORY_DIFFS_TABLE,
            CREATE_INVENTORY_ALERTS_TABLE,
        ],
    },
    Migration {
        name: "0003_indexes",
        statements: &CREATE_INDEXES,
    },
    Migration {
        name: "0004_heartbeat_status",
        statements: &[ADD_HEARTBEAT_STATUS],
    },
];
