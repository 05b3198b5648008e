//! SQL used by the PostgreSQL wide-column adapter
//!
//! Every cell is one row of `wide_cells`. A NULL value is a tombstone.

/// Schema for the cell table
pub const CREATE_CELLS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS wide_cells (
        family      TEXT        NOT NULL,
        partition   BYTEA       NOT NULL,
        name        TEXT        NOT NULL,
        value       BYTEA,
        write_ts    BIGINT      NOT NULL,
        expires_at  TIMESTAMPTZ,
        PRIMARY KEY (family, partition, name)
    )
"#;

/// Lets the purge find expiring cells without a full scan
pub const CREATE_EXPIRY_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS wide_cells_expires_at
    ON wide_cells (expires_at)
    WHERE expires_at IS NOT NULL
"#;

/// Point read of one live cell
pub const GET_CELL: &str = r#"
    SELECT value, write_ts
    FROM wide_cells
    WHERE family = $1
        AND partition = $2
        AND name = $3
        AND value IS NOT NULL
        AND (expires_at IS NULL OR expires_at > NOW())
"#;

/// Last-writer-wins insert. A stored tombstone at the same timestamp wins.
pub const UPSERT_CELL: &str = r#"
    INSERT INTO wide_cells (family, partition, name, value, write_ts, expires_at)
    VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (family, partition, name) DO UPDATE
        SET value = EXCLUDED.value,
            write_ts = EXCLUDED.write_ts,
            expires_at = EXCLUDED.expires_at
        WHERE wide_cells.write_ts < EXCLUDED.write_ts
            OR (wide_cells.write_ts = EXCLUDED.write_ts AND wide_cells.value IS NOT NULL)
"#;

/// Tombstone every listed column written at or before the given timestamp.
/// The tombstone itself expires at `$5`, once its grace period is over.
pub const TOMBSTONE_CELLS: &str = r#"
    INSERT INTO wide_cells (family, partition, name, value, write_ts, expires_at)
    SELECT $1::TEXT, $2::BYTEA, column_name, NULL::BYTEA, $4::BIGINT, $5::TIMESTAMPTZ
    FROM UNNEST($3::TEXT[]) AS column_name
    ON CONFLICT (family, partition, name) DO UPDATE
        SET value = NULL,
            write_ts = EXCLUDED.write_ts,
            expires_at = EXCLUDED.expires_at
        WHERE wide_cells.write_ts <= EXCLUDED.write_ts
"#;

/// Drop expired cells and spent tombstones of one partition
pub const PURGE_PARTITION: &str = r#"
    DELETE FROM wide_cells
    WHERE family = $1
        AND partition = $2
        AND expires_at IS NOT NULL
        AND expires_at <= NOW()
"#;

/// Drop every expired cell and spent tombstone
pub const PURGE_EXPIRED: &str = r#"
    DELETE FROM wide_cells
    WHERE expires_at IS NOT NULL
        AND expires_at <= NOW()
"#;

/// Range scan: pick the rows first, then join the projected live columns so
/// rows without any surviving column still come back (with NULL name).
pub const RANGE_SCAN: &str = r#"
    WITH rows AS (
        SELECT DISTINCT w.partition
        FROM wide_cells w
        WHERE w.family = $1
            AND w.partition >= $2
            AND w.partition < $3
        ORDER BY w.partition
        LIMIT $4
    )
    SELECT r.partition, c.name, c.value, c.write_ts
    FROM rows r
    LEFT JOIN wide_cells c
        ON c.family = $1
        AND c.partition = r.partition
        AND c.name = ANY($5)
        AND c.value IS NOT NULL
        AND (c.expires_at IS NULL OR c.expires_at > NOW())
    ORDER BY r.partition, c.name
"#;

/// Range scan restricted to rows whose column `$6` equals `$7`
pub const RANGE_SCAN_FILTERED: &str = r#"
    WITH rows AS (
        SELECT DISTINCT w.partition
        FROM wide_cells w
        WHERE w.family = $1
            AND w.partition >= $2
            AND w.partition < $3
            AND EXISTS (
                SELECT 1 FROM wide_cells f
                WHERE f.family = $1
                    AND f.partition = w.partition
                    AND f.name = $6
                    AND f.value = $7
                    AND (f.expires_at IS NULL OR f.expires_at > NOW())
            )
        ORDER BY w.partition
        LIMIT $4
    )
    SELECT r.partition, c.name, c.value, c.write_ts
    FROM rows r
    LEFT JOIN wide_cells c
        ON c.family = $1
        AND c.partition = r.partition
        AND c.name = ANY($5)
        AND c.value IS NOT NULL
        AND (c.expires_at IS NULL OR c.expires_at > NOW())
    ORDER BY r.partition, c.name
"#;
