/// Filtered, ordered, ranged selects over a remote table
use serde_json::Value;

use crate::RemoteRow;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Column equals the value (compared as text)
    Eq(String, String),
    /// SQL `LIKE` pattern, `%` matching any run of characters
    Like(String, String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub descending: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectQuery {
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl SelectQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.push(Filter::Eq(column.into(), value.into()));
        self
    }

    pub fn like(mut self, column: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.filters.push(Filter::Like(column.into(), pattern.into()));
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, descending: bool) -> Self {
        self.order = Some(Order {
            column: column.into(),
            descending,
        });
        self
    }

    /// Inclusive row range, as in `range(0, 0)` for the first row only
    pub fn range(mut self, from: usize, to: usize) -> Self {
        self.offset = from;
        self.limit = Some(to.saturating_sub(from) + 1);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, row: &RemoteRow) -> bool {
        self.filters.iter().all(|f| match f {
            Filter::Eq(col, want) => row.get(col).and_then(as_text).as_deref() == Some(want),
            Filter::Like(col, pattern) => row
                .get(col)
                .and_then(as_text)
                .map(|v| like_matches(pattern, &v))
                .unwrap_or(false),
        })
    }

    /// Apply filters, ordering and range to an in-memory table
    pub fn apply(&self, rows: &[RemoteRow]) -> Vec<RemoteRow> {
        let mut out: Vec<RemoteRow> = rows.iter().filter(|r| self.matches(r)).cloned().collect();
        if let Some(order) = &self.order {
            out.sort_by(|a, b| {
                let ka = a.get(&order.column).and_then(as_text);
                let kb = b.get(&order.column).and_then(as_text);
                let ord = ka.cmp(&kb);
                if order.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
        let out = out.into_iter().skip(self.offset);
        match self.limit {
            Some(n) => out.take(n).collect(),
            None => out.collect(),
        }
    }

    /// PostgREST query-string pairs
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![("select".to_string(), "*".to_string())];
        for f in &self.filters {
            match f {
                Filter::Eq(col, v) => pairs.push((col.clone(), format!("eq.{v}"))),
                Filter::Like(col, p) => pairs.push((col.clone(), format!("like.{p}"))),
            }
        }
        if let Some(order) = &self.order {
            let dir = if order.descending { "desc" } else { "asc" };
            pairs.push(("order".to_string(), format!("{}.{dir}", order.column)));
        }
        if self.offset > 0 {
            pairs.push(("offset".to_string(), self.offset.to_string()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        pairs
    }
}

pub(crate) fn as_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn like_matches(pattern: &str, value: &str) -> bool {
    let parts: Vec<&str> = pattern.split('%').collect();
    if parts.len() == 1 {
        return pattern == value;
    }
    let mut rest = value;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: Value) -> RemoteRow {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_like_patterns() {
        assert!(like_matches("%/2026", "007/2026"));
        assert!(!like_matches("%/2026", "007/2025"));
        assert!(like_matches("00%", "007/2026"));
        assert!(like_matches("%7/%", "007/2026"));
        assert!(like_matches("exact", "exact"));
    }

    #[test]
    fn test_apply_orders_desc_and_limits() {
        let rows = vec![
            row(json!({"vistoria_id": "02/2026"})),
            row(json!({"vistoria_id": "10/2026"})),
            row(json!({"vistoria_id": "09/2025"})),
        ];
        let q = SelectQuery::new()
            .like("vistoria_id", "%/2026")
            .order_by("vistoria_id", true)
            .range(0, 0);
        let out = q.apply(&rows);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["vistoria_id"], "10/2026");
    }

    #[test]
    fn test_query_pairs() {
        let q = SelectQuery::new().eq("sync_id", "abc").order_by("created_at", false).limit(5);
        let pairs = q.to_query_pairs();
        assert!(pairs.contains(&("sync_id".to_string(), "eq.abc".to_string())));
        assert!(pairs.contains(&("order".to_string(), "created_at.asc".to_string())));
        assert!(pairs.contains(&("limit".to_string(), "5".to_string())));
    }
}
