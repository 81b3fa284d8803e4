mod common;
pub use self::common::{Query, SortDirection};
mod filter;
pub use self::filter::Filter;

mod select;
pub use self::select::Select;

mod insert;
pub use self::insert::{Conflict, InsertMode, Returning};
