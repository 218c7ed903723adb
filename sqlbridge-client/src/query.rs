//! Table query parameters for the REST layer

/// Parameters for a `GET /rest/v1/<table>` request
///
/// Renders into PostgREST query-string pairs:
///
/// ```
/// use sqlbridge_client::SelectQuery;
///
/// let query = SelectQuery::new("id,status")
///     .eq("status", "failed")
///     .order_desc("created_at")
///     .limit(10);
///
/// assert_eq!(
///     query.to_pairs(),
///     vec![
///         ("select".to_string(), "id,status".to_string()),
///         ("status".to_string(), "eq.failed".to_string()),
///         ("order".to_string(), "created_at.desc".to_string()),
///         ("limit".to_string(), "10".to_string()),
///     ]
/// );
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    columns: String,
    filters: Vec<(String, String)>,
    order: Option<(String, bool)>,
    limit: Option<u32>,
}

impl Default for SelectQuery {
    fn default() -> Self {
        Self::new("*")
    }
}

impl SelectQuery {
    /// Select the given comma-separated columns
    pub fn new(columns: impl Into<String>) -> Self {
        Self {
            columns: columns.into(),
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    /// Add an equality filter
    pub fn eq(mut self, column: impl Into<String>, value: impl AsRef<str>) -> Self {
        self.filters
            .push((column.into(), format!("eq.{}", value.as_ref())));
        self
    }

    /// Order ascending by a column
    pub fn order_asc(mut self, column: impl Into<String>) -> Self {
        self.order = Some((column.into(), true));
        self
    }

    /// Order descending by a column
    pub fn order_desc(mut self, column: impl Into<String>) -> Self {
        self.order = Some((column.into(), false));
        self
    }

    /// Cap the number of returned rows
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Query-string pairs in the order PostgREST expects them
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![("select".to_string(), self.columns.clone())];
        pairs.extend(self.filters.iter().cloned());
        if let Some((column, ascending)) = &self.order {
            let direction = if *ascending { "asc" } else { "desc" };
            pairs.push(("order".to_string(), format!("{}.{}", column, direction)));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_selects_everything() {
        assert_eq!(
            SelectQuery::default().to_pairs(),
            vec![("select".to_string(), "*".to_string())]
        );
    }

    #[test]
    fn test_order_asc() {
        let pairs = SelectQuery::new("id").order_asc("id").to_pairs();
        assert_eq!(pairs[1], ("order".to_string(), "id.asc".to_string()));
    }
}
