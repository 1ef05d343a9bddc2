mod batch;
mod connection;
mod query;
mod schema;
mod writer;

pub use batch::*;
pub use connection::*;
pub use query::*;
pub use schema::*;
pub use writer::*;
