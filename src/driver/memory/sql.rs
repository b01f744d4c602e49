use lazy_static::lazy_static;
use regex::Regex;

use crate::core::{DbError, DbResult};

lazy_static! {
    static ref INSERT_RE: Regex =
        Regex::new(r"(?is)^\s*insert\s+into\s+([\w.]+)\s*\(([^)]*)\)\s*values\s*(.+?)\s*;?\s*$").unwrap();
    static ref INSERT_DEFAULTS_RE: Regex =
        Regex::new(r"(?is)^\s*insert\s+into\s+([\w.]+)\s+default\s+values\s*;?\s*$").unwrap();
    static ref UPDATE_RE: Regex =
        Regex::new(r"(?is)^\s*update\s+([\w.]+)\s+set\s+(.+?)\s+where\s+(.+?)\s*;?\s*$").unwrap();
    static ref DELETE_RE: Regex =
        Regex::new(r"(?is)^\s*delete\s+from\s+([\w.]+)\s+where\s+(.+?)\s*;?\s*$").unwrap();
    static ref SELECT_RE: Regex = Regex::new(
        r"(?is)^\s*select\s+\*\s+from\s+([\w.]+)(?:\s+where\s+(.+?))?(?:\s+order\s+by\s+(\w+))?\s*;?\s*$"
    )
    .unwrap();
    static ref CALL_RE: Regex =
        Regex::new(r"(?is)^\s*\{?\s*call\s+([\w.]+)\s*\(([^)]*)\)\s*\}?\s*;?\s*$").unwrap();
    static ref TUPLE_RE: Regex = Regex::new(r"\(([^)]*)\)").unwrap();
    static ref PARAM_EQ_RE: Regex = Regex::new(r"^\s*(\w+)\s*=\s*\?\s*$").unwrap();
    static ref AND_RE: Regex = Regex::new(r"(?i)\s+and\s+").unwrap();
}

/// The statement shapes the memory driver executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Insert {
        table: String,
        columns: Vec<String>,
        rows: usize,
    },
    Update {
        table: String,
        assignments: Vec<String>,
        conditions: Vec<String>,
    },
    Delete {
        table: String,
        conditions: Vec<String>,
    },
    Select {
        table: String,
        conditions: Vec<String>,
        order_by: Option<String>,
    },
    Call {
        procedure: String,
        params: usize,
    },
}

impl Command {
    pub(crate) fn parse(sql: &str) -> DbResult<Self> {
        if let Some(caps) = INSERT_DEFAULTS_RE.captures(sql) {
            return Ok(Self::Insert {
                table: caps[1].to_string(),
                columns: Vec::new(),
                rows: 1,
            });
        }

        if let Some(caps) = INSERT_RE.captures(sql) {
            let columns = split_list(&caps[2]);
            let mut rows = 0;
            for tuple in TUPLE_RE.captures_iter(&caps[3]) {
                let params = split_list(&tuple[1]);
                if params.len() != columns.len() || params.iter().any(|p| p != "?") {
                    return Err(unsupported(sql));
                }
                rows += 1;
            }
            if rows == 0 || columns.is_empty() {
                return Err(unsupported(sql));
            }
            return Ok(Self::Insert {
                table: caps[1].to_string(),
                columns,
                rows,
            });
        }

        if let Some(caps) = UPDATE_RE.captures(sql) {
            let assignments = caps[2]
                .split(',')
                .map(|part| param_column(part, sql))
                .collect::<DbResult<Vec<_>>>()?;
            return Ok(Self::Update {
                table: caps[1].to_string(),
                assignments,
                conditions: conditions(&caps[3], sql)?,
            });
        }

        if let Some(caps) = DELETE_RE.captures(sql) {
            return Ok(Self::Delete {
                table: caps[1].to_string(),
                conditions: conditions(&caps[2], sql)?,
            });
        }

        if let Some(caps) = SELECT_RE.captures(sql) {
            let conditions = match caps.get(2) {
                Some(clause) => conditions(clause.as_str(), sql)?,
                None => Vec::new(),
            };
            return Ok(Self::Select {
                table: caps[1].to_string(),
                conditions,
                order_by: caps.get(3).map(|m| m.as_str().to_string()),
            });
        }

        if let Some(caps) = CALL_RE.captures(sql) {
            let params = split_list(&caps[2]);
            if params.iter().any(|p| p != "?") {
                return Err(unsupported(sql));
            }
            return Ok(Self::Call {
                procedure: caps[1].to_string(),
                params: params.len(),
            });
        }

        Err(unsupported(sql))
    }

    pub(crate) fn param_count(&self) -> usize {
        match self {
            Self::Insert { columns, rows, .. } => columns.len() * rows,
            Self::Update {
                assignments,
                conditions,
                ..
            } => assignments.len() + conditions.len(),
            Self::Delete { conditions, .. } | Self::Select { conditions, .. } => conditions.len(),
            Self::Call { params, .. } => *params,
        }
    }

    pub(crate) fn returns_rows(&self) -> bool {
        matches!(self, Self::Select { .. })
    }
}

fn unsupported(sql: &str) -> DbError {
    DbError::Unsupported(format!("memory driver cannot execute '{}'", sql.trim()))
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn param_column(part: &str, sql: &str) -> DbResult<String> {
    PARAM_EQ_RE
        .captures(part)
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| unsupported(sql))
}

fn conditions(clause: &str, sql: &str) -> DbResult<Vec<String>> {
    AND_RE.split(clause).map(|part| param_column(part, sql)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_multi_row_insert() {
        let command = Command::parse("insert into hr.dept(id,name) values(?,?),(?,?)").unwrap();
        assert_eq!(
            command,
            Command::Insert {
                table: "hr.dept".into(),
                columns: vec!["id".into(), "name".into()],
                rows: 2,
            }
        );
        assert_eq!(command.param_count(), 4);
    }

    #[test]
    fn test_parse_default_values_insert() {
        let command = Command::parse("insert into hr.dept default values").unwrap();
        assert_eq!(
            command,
            Command::Insert {
                table: "hr.dept".into(),
                columns: Vec::new(),
                rows: 1,
            }
        );
        assert_eq!(command.param_count(), 0);
        assert!(Command::parse("insert into hr.dept () values ()").is_err());
    }

    #[test]
    fn test_parse_update_and_delete() {
        let update = Command::parse("update dept set name=?, budget = ? where id=? AND region=?").unwrap();
        assert_eq!(update.param_count(), 4);

        let delete = Command::parse("delete from dept where id=?").unwrap();
        assert_eq!(
            delete,
            Command::Delete {
                table: "dept".into(),
                conditions: vec!["id".into()],
            }
        );
    }

    #[test]
    fn test_parse_select() {
        let select = Command::parse("select * from dept where name=? order by id").unwrap();
        assert_eq!(
            select,
            Command::Select {
                table: "dept".into(),
                conditions: vec!["name".into()],
                order_by: Some("id".into()),
            }
        );

        let all = Command::parse("SELECT * FROM dept").unwrap();
        assert_eq!(all.param_count(), 0);
        assert!(all.returns_rows());
    }

    #[test]
    fn test_parse_call() {
        let call = Command::parse("{call bump_budget(?, ?)}").unwrap();
        assert_eq!(
            call,
            Command::Call {
                procedure: "bump_budget".into(),
                params: 2,
            }
        );
    }

    #[test]
    fn test_rejects_other_sql() {
        assert!(matches!(
            Command::parse("select name from dept"),
            Err(DbError::Unsupported(_))
        ));
        assert!(Command::parse("insert into dept(id) values(1)").is_err());
    }
}
