//! ewald-io: typed HDF5 persistence for ewald scans.
//!
//! # Key Components
//!
//! - [`data_to_h5`] / [`h5_to_data`] - Write and read any [`H5Value`] under a
//!   group, tagging every node with an `encoded` attribute
//! - [`attributes_to_h5`] / [`h5_to_attributes`] - Bulk helpers over named nodes
//! - [`serialized_to_h5`] - JSON or YAML text for values with no native layout
//! - [`H5Record`] - Group layouts of the integration containers and the PONI
//! - [`safe_open`] - Retrying open of a file shared between writer and readers

mod error;
pub mod open;
pub mod record;
pub mod store;
pub mod value;

pub use error::{Error, Result};
pub use open::{safe_open, OpenMode, DEFAULT_TRIES, RETRY_INTERVAL};
pub use record::{load_record, save_record, H5Record};
pub use store::{
    attributes_to_h5, data_to_h5, h5_to_attributes, h5_to_data, h5_to_serialized, node_encoding,
    read_array1, read_array2, read_scalar_node, read_str_attr, read_str_node, remove_node,
    require_group, serialized_to_h5, set_str_attr, ENCODED_ATTR,
};
pub use value::{Encoding, H5Value, Scalar, TextFormat};

/// Re-exported so dependents need not name the HDF5 crate directly.
pub use hdf5::{File as H5File, Group as H5Group};
