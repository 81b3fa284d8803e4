//! Shared query infrastructure: the [`Query`] trait and [`SortDirection`].

use std::fmt;

use url::Url;

use super::Filter;

/// Trait implemented by request builders that serialize into URL query pairs.
pub trait Query {
    /// Appends this query's parameters to the given URL, returning the modified URL.
    fn add_to_url(&self, url: &Url) -> Url;
}

impl Query for [Filter] {
    fn add_to_url(&self, url: &Url) -> Url {
        let mut url = url.clone();
        for filter in self.iter() {
            let (column, value) = filter.to_param();
            url.query_pairs_mut().append_pair(&column, &value);
        }
        url
    }
}

/// Sort order for `order=` clauses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortDirection {
    /// Ascending order (smallest first). This is the default.
    #[default]
    Asc,
    /// Descending order (largest first).
    Desc,
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Asc => write!(f, "asc"),
            Self::Desc => write!(f, "desc"),
        }
    }
}
