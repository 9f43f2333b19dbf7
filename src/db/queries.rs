//! SQL query constants
//!
//! Contains all SQL run against the metadata store and the introspection
//! queries run against deployment targets.

pub const PING: &str = "SELECT 1";

/// Metadata tables: versions, deployments and their backups
pub const CREATE_METADATA_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_versions (
        id UUID PRIMARY KEY,
        project_id UUID NOT NULL,
        major INTEGER NOT NULL,
        minor INTEGER NOT NULL,
        patch INTEGER NOT NULL,
        tables JSONB NOT NULL,
        checksum VARCHAR(64) NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        created_by UUID NOT NULL,
        from_version VARCHAR(32),
        migration_up TEXT,
        migration_down TEXT,
        breaking BOOLEAN NOT NULL DEFAULT false,
        estimated_downtime_seconds BIGINT NOT NULL DEFAULT 0,
        UNIQUE (project_id, major, minor, patch)
    );

    CREATE INDEX IF NOT EXISTS idx_schema_versions_checksum
        ON schema_versions (project_id, checksum);

    CREATE TABLE IF NOT EXISTS deployments (
        id UUID PRIMARY KEY,
        project_id UUID NOT NULL,
        schema_version VARCHAR(32),
        forward_sql TEXT NOT NULL,
        status VARCHAR(32) NOT NULL,
        backup_id UUID,
        rolled_back BOOLEAN NOT NULL DEFAULT false,
        started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        completed_at TIMESTAMPTZ,
        error_kind VARCHAR(32),
        error_message TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_deployments_project_id
        ON deployments (project_id, started_at DESC);

    CREATE TABLE IF NOT EXISTS deployment_backups (
        id UUID PRIMARY KEY,
        deployment_id UUID NOT NULL REFERENCES deployments (id) ON DELETE CASCADE,
        project_id UUID NOT NULL,
        tables JSONB NOT NULL,
        checksum VARCHAR(64) NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
"#;

/// Transaction-scoped lock serializing version assignment per project
pub const LOCK_PROJECT_VERSIONS: &str =
    "SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))";

const VERSION_COLUMNS: &str = "id, project_id, major, minor, patch, tables, checksum, created_at, \
     created_by, from_version, migration_up, migration_down, breaking, estimated_downtime_seconds";

pub fn select_versions(filter: &str) -> String {
    format!("SELECT {} FROM schema_versions WHERE {}", VERSION_COLUMNS, filter)
}

pub const INSERT_VERSION: &str = r#"
    INSERT INTO schema_versions (
        id, project_id, major, minor, patch, tables, checksum, created_at,
        created_by, from_version, migration_up, migration_down, breaking,
        estimated_downtime_seconds
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
"#;

pub const INSERT_DEPLOYMENT: &str = r#"
    INSERT INTO deployments (
        id, project_id, schema_version, forward_sql, status, backup_id,
        rolled_back, started_at, completed_at, error_kind, error_message
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
"#;

pub const UPDATE_DEPLOYMENT: &str = r#"
    UPDATE deployments
    SET status = $2, backup_id = $3, rolled_back = $4, completed_at = $5,
        error_kind = $6, error_message = $7
    WHERE id = $1
"#;

pub const SELECT_DEPLOYMENT: &str = r#"
    SELECT id, project_id, schema_version, forward_sql, status, backup_id,
           rolled_back, started_at, completed_at, error_kind, error_message
    FROM deployments
    WHERE id = $1
"#;

pub const LIST_DEPLOYMENTS: &str = r#"
    SELECT id, project_id, schema_version, forward_sql, status, backup_id,
           rolled_back, started_at, completed_at, error_kind, error_message
    FROM deployments
    WHERE project_id = $1
    ORDER BY started_at DESC
    LIMIT $2
"#;

pub const INSERT_BACKUP: &str = r#"
    INSERT INTO deployment_backups (id, deployment_id, project_id, tables, checksum, created_at)
    VALUES ($1, $2, $3, $4, $5, $6)
"#;

pub const SELECT_BACKUP: &str = r#"
    SELECT id, deployment_id, project_id, tables, checksum, created_at
    FROM deployment_backups
    WHERE id = $1
"#;

/// Base tables of a schema
pub const LIST_TABLES: &str = r#"
    SELECT table_name::text
    FROM information_schema.tables
    WHERE table_schema = $1
        AND table_type = 'BASE TABLE'
    ORDER BY table_name
"#;

/// Columns of a table with single-column key and uniqueness flags
pub const GET_COLUMNS: &str = r#"
    SELECT
        c.column_name::text AS column_name,
        CASE WHEN c.data_type = 'USER-DEFINED' THEN c.udt_name::text ELSE c.data_type::text END AS data_type,
        c.is_nullable = 'YES' AS nullable,
        c.column_default::text AS column_default,
        COALESCE(pk.is_pk, false) AS is_primary_key,
        COALESCE(uq.is_unique, false) AS is_unique
    FROM information_schema.columns c
    LEFT JOIN (
        SELECT kcu.column_name, true AS is_pk
        FROM information_schema.table_constraints tc
        JOIN information_schema.key_column_usage kcu
            ON tc.constraint_name = kcu.constraint_name
            AND tc.table_schema = kcu.table_schema
        WHERE tc.constraint_type = 'PRIMARY KEY'
            AND tc.table_schema = $1
            AND tc.table_name = $2
    ) pk ON c.column_name = pk.column_name
    LEFT JOIN (
        SELECT kcu.column_name, true AS is_unique
        FROM information_schema.table_constraints tc
        JOIN information_schema.key_column_usage kcu
            ON tc.constraint_name = kcu.constraint_name
            AND tc.table_schema = kcu.table_schema
        WHERE tc.constraint_type = 'UNIQUE'
            AND tc.table_schema = $1
            AND tc.table_name = $2
            AND (
                SELECT COUNT(*)
                FROM information_schema.key_column_usage k2
                WHERE k2.constraint_name = tc.constraint_name
                    AND k2.table_schema = tc.table_schema
            ) = 1
    ) uq ON c.column_name = uq.column_name
    WHERE c.table_schema = $1
        AND c.table_name = $2
    ORDER BY c.ordinal_position
"#;

/// Single-column foreign keys of a table
pub const GET_FOREIGN_KEYS: &str = r#"
    SELECT
        a.attname::text AS column_name,
        rc.relname::text AS foreign_table,
        ra.attname::text AS foreign_column,
        CASE con.confdeltype
            WHEN 'c' THEN 'CASCADE'
            WHEN 'r' THEN 'RESTRICT'
            WHEN 'n' THEN 'SET NULL'
            WHEN 'd' THEN 'SET DEFAULT'
            ELSE 'NO ACTION'
        END AS on_delete
    FROM pg_constraint con
    JOIN pg_class c ON c.oid = con.conrelid
    JOIN pg_namespace n ON n.oid = c.relnamespace
    JOIN pg_class rc ON rc.oid = con.confrelid
    JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = con.conkey[1]
    JOIN pg_attribute ra ON ra.attrelid = con.confrelid AND ra.attnum = con.confkey[1]
    WHERE con.contype = 'f'
        AND array_length(con.conkey, 1) = 1
        AND n.nspname = $1
        AND c.relname = $2
"#;

/// Indexes that do not back a constraint
pub const GET_INDEXES: &str = r#"
    SELECT
        i.relname::text AS index_name,
        ix.indisunique AS is_unique,
        ARRAY(
            SELECT a.attname::text
            FROM unnest(ix.indkey) WITH ORDINALITY AS k(attnum, ord)
            JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
            ORDER BY k.ord
        ) AS columns
    FROM pg_index ix
    JOIN pg_class i ON i.oid = ix.indexrelid
    JOIN pg_class t ON t.oid = ix.indrelid
    JOIN pg_namespace n ON n.oid = t.relnamespace
    WHERE n.nspname = $1
        AND t.relname = $2
        AND NOT ix.indisprimary
        AND NOT EXISTS (SELECT 1 FROM pg_constraint con WHERE con.conindid = ix.indexrelid)
    ORDER BY i.relname
"#;

/// Row-level security policies of a table
pub const GET_POLICIES: &str = r#"
    SELECT policyname::text AS name, cmd, roles::text[] AS roles, qual, with_check
    FROM pg_policies
    WHERE schemaname = $1
        AND tablename = $2
    ORDER BY policyname
"#;
