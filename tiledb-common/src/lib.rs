//! Shared schema, datatype and layout vocabulary for the query execution
//! core. Analogous to `tiledb-common` in the wrapped-C bindings crate
//! family, but free of any FFI: every type here is plain Rust data.

pub mod datatype;
pub mod layout;
pub mod schema;

pub use datatype::{CellValNum, Datatype};
pub use layout::{Layout, Mode, TileOrder};
pub use schema::{Attribute, Dimension, Domain, Schema, Subarray, COORDS_NAME};
