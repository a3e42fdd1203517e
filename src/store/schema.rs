//! Table definitions.
//!
//! A pipeline is the aggregate root: deleting it cascades to its steps,
//! resource bindings, config snapshots and logs. Resources are only
//! referenced and outlive any pipeline that binds them.

use rusqlite::Connection;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS resources (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    resource_type TEXT NOT NULL CHECK (resource_type IN ('GENOME', 'ANNOTATION', 'PEPTIDE')),
    species       TEXT,
    version       TEXT,
    file_path     TEXT NOT NULL,
    file_size     INTEGER,
    uploaded_by   TEXT NOT NULL,
    date_added    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_resources_type_species
    ON resources (resource_type, species);

CREATE TABLE IF NOT EXISTS read_resources (
    id            TEXT PRIMARY KEY,
    srr_id        TEXT NOT NULL UNIQUE,
    bioproject_id TEXT NOT NULL,
    description   TEXT NOT NULL,
    file_path     TEXT NOT NULL,
    file_size     INTEGER NOT NULL DEFAULT 0,
    status        TEXT NOT NULL CHECK (status IN ('registered', 'downloaded', 'failed')),
    date_added    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pipelines (
    id         TEXT PRIMARY KEY,
    name       TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    status     TEXT NOT NULL CHECK (status IN ('pending', 'running', 'completed', 'failed')),
    created_at TEXT NOT NULL,
    start_time TEXT,
    end_time   TEXT,
    notes      TEXT
);

CREATE INDEX IF NOT EXISTS idx_pipelines_user ON pipelines (user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_pipelines_status ON pipelines (status);

CREATE TABLE IF NOT EXISTS pipeline_steps (
    id                  TEXT PRIMARY KEY,
    pipeline_id         TEXT NOT NULL REFERENCES pipelines (id) ON DELETE CASCADE,
    position            INTEGER NOT NULL,
    name                TEXT NOT NULL,
    parameters          TEXT NOT NULL,
    requires_input_file INTEGER NOT NULL DEFAULT 0,
    input_files         TEXT,
    status              TEXT NOT NULL CHECK (status IN ('pending', 'running', 'completed', 'failed')),
    start_time          TEXT,
    end_time            TEXT,
    results             TEXT,
    input_mapping       TEXT NOT NULL,
    UNIQUE (pipeline_id, position)
);

CREATE TABLE IF NOT EXISTS pipeline_resources (
    pipeline_id TEXT NOT NULL REFERENCES pipelines (id) ON DELETE CASCADE,
    resource_id TEXT NOT NULL REFERENCES resources (id) ON DELETE CASCADE,
    PRIMARY KEY (pipeline_id, resource_id)
);

CREATE TABLE IF NOT EXISTS pipeline_configs (
    id          TEXT PRIMARY KEY,
    pipeline_id TEXT NOT NULL REFERENCES pipelines (id) ON DELETE CASCADE,
    config_type TEXT NOT NULL CHECK (config_type IN ('initial', 'final')),
    config_data TEXT NOT NULL,
    file_path   TEXT NOT NULL UNIQUE,
    date_added  TEXT NOT NULL,
    UNIQUE (pipeline_id, config_type)
);

CREATE TABLE IF NOT EXISTS pipeline_logs (
    id          TEXT PRIMARY KEY,
    pipeline_id TEXT NOT NULL REFERENCES pipelines (id) ON DELETE CASCADE,
    step_id     TEXT REFERENCES pipeline_steps (id) ON DELETE CASCADE,
    text        TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_logs_pipeline ON pipeline_logs (pipeline_id, created_at);
CREATE INDEX IF NOT EXISTS idx_logs_step ON pipeline_logs (step_id, created_at);
"#;

/// Creates any missing tables and indexes.
pub fn apply(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}
