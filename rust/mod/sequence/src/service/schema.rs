use openerp_core::ServiceError;
use openerp_sql::SQLStore;

/// SQL DDL for sequence configuration and gap-free counters.
///
/// Rows keep explicit columns: `number_next` is read and written directly by
/// gap-free draws.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS ir_sequence (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        code TEXT,
        implementation TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        prefix TEXT,
        suffix TEXT,
        number_next INTEGER NOT NULL DEFAULT 1,
        number_increment INTEGER NOT NULL DEFAULT 1,
        padding INTEGER NOT NULL DEFAULT 0,
        company_id INTEGER,
        use_date_range INTEGER NOT NULL DEFAULT 0,
        create_at TEXT,
        update_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS ir_sequence_date_range (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        sequence_id INTEGER NOT NULL,
        date_from TEXT NOT NULL,
        date_to TEXT NOT NULL,
        number_next INTEGER NOT NULL DEFAULT 1,
        UNIQUE(sequence_id, date_from)
    )",
    "CREATE INDEX IF NOT EXISTS idx_seq_code ON ir_sequence(code)",
    "CREATE INDEX IF NOT EXISTS idx_seq_company ON ir_sequence(company_id)",
    "CREATE INDEX IF NOT EXISTS idx_range_bounds ON ir_sequence_date_range(sequence_id, date_to)",
];

/// Initialize the database schema. Idempotent.
pub fn init_schema(sql: &dyn SQLStore) -> Result<(), ServiceError> {
    for ddl in SCHEMA {
        sql.exec(ddl, &[])
            .map_err(|e| ServiceError::Storage(format!("sequence schema init: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use openerp_sql::SqliteStore;

    use super::*;

    #[test]
    fn init_twice_is_harmless() {
        let sql = SqliteStore::open_in_memory().unwrap();
        init_schema(&sql).unwrap();
        init_schema(&sql).unwrap();
        let rows = sql
            .query(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'ir_sequence%' ORDER BY name",
                &[],
            )
            .unwrap();
        let names: Vec<&str> = rows.iter().filter_map(|r| r.get_str("name")).collect();
        assert_eq!(names, vec!["ir_sequence", "ir_sequence_date_range"]);
    }
}
