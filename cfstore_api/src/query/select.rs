//! Read queries against a single table.

use url::Url;

use super::{Filter, Query, SortDirection};

/// Builder for `GET /rest/v1/{table}` requests.
///
/// ```
/// use cfstore_api::{Filter, Select};
///
/// let q = Select::from("cf_donations")
///     .columns(&["donation_id", "report_id"])
///     .filter(Filter::eq("report_id", 7))
///     .order_by("donation_id")
///     .limit(1000);
/// assert_eq!(q.table, "cf_donations");
/// ```
#[derive(Debug, Clone, Default)]
pub struct Select {
    pub table: String,
    pub columns: Vec<String>,
    pub filters: Vec<Filter>,
    pub order: Vec<(String, SortDirection)>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Select {
    pub fn from(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Default::default()
        }
    }

    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn filters(mut self, filters: impl IntoIterator<Item = Filter>) -> Self {
        self.filters.extend(filters);
        self
    }

    pub fn order_by(mut self, column: &str) -> Self {
        self.order.push((column.to_string(), SortDirection::Asc));
        self
    }

    pub fn order_desc(mut self, column: &str) -> Self {
        self.order.push((column.to_string(), SortDirection::Desc));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

impl Query for Select {
    fn add_to_url(&self, url: &Url) -> Url {
        let mut url = url.clone();
        let select = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns.join(",")
        };
        url.query_pairs_mut().append_pair("select", &select);
        let mut url = self.filters.as_slice().add_to_url(&url);
        if !self.order.is_empty() {
            let order = self
                .order
                .iter()
                .map(|(col, dir)| format!("{}.{}", col, dir))
                .collect::<Vec<_>>()
                .join(",");
            url.query_pairs_mut().append_pair("order", &order);
        }
        if let Some(limit) = self.limit {
            url.query_pairs_mut()
                .append_pair("limit", &limit.to_string());
        }
        if let Some(offset) = self.offset {
            url.query_pairs_mut()
                .append_pair("offset", &offset.to_string());
        }
        url
    }
}
