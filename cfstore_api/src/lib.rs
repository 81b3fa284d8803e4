mod client;
mod errors;
mod query;
pub use self::client::{Client, Row};
pub use self::errors::Error;
pub use self::query::{Conflict, Filter, InsertMode, Query, Returning, Select, SortDirection};
