use rusqlite::{Connection, Params};
use trc::{Error, ErrorKind};

/// Prepares `sql`, asserts the DB-reported parameter count matches
/// `expected_params` (invariant v), then executes it.
pub fn checked_execute(
    conn: &Connection,
    sql: &str,
    expected_params: usize,
    params: impl Params,
) -> trc::Result<usize> {
    let mut stmt = conn
        .prepare_cached(sql)
        .map_err(|e| sql_error(&e).trace(sql.to_string()))?;
    if stmt.parameter_count() != expected_params {
        return Err(Error::new(
            ErrorKind::Internal,
            format!(
                "nargs mismatch for `{sql}`: expected {expected_params}, db reports {}",
                stmt.parameter_count()
            ),
        ));
    }
    stmt.execute(params).map_err(|e| sql_error(&e))
}

pub fn sql_error(e: &rusqlite::Error) -> Error {
    let is_dup = matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    );
    Error::new(
        if is_dup { ErrorKind::SqlDup } else { ErrorKind::Sql },
        e.to_string(),
    )
}
