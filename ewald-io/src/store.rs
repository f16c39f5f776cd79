//! Typed persistence into HDF5 groups.
//!
//! Every node written under a group carries an `encoded` attribute naming its
//! layout, so it can be read back without an external schema. Rewriting a key
//! keeps the node in place when the layout is compatible: arrays of the same
//! tag, dtype and rank are resized and overwritten, and groups are reused
//! with stale members removed. Anything else is unlinked and recreated.

use crate::value::{Encoding, H5Value, Scalar, TextFormat};
use crate::{Error, Result};
use ewald_core::{Index, NzArray1, NzArray2, ScanTable, Series};
use hdf5::types::{H5Type, VarLenUnicode};
use hdf5::{Dataset, Group, Location, SimpleExtents};
use ndarray::{Array1, Array2, ArrayD, ArrayView1, ArrayViewD, Ix1, Ix2, IxDyn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::str::FromStr;

/// Attribute holding the layout tag of a node.
pub const ENCODED_ATTR: &str = "encoded";

/// Largest chunk extent along any axis.
const MAX_CHUNK: usize = 512;

/// Writes `value` under `group/key`.
///
/// # Errors
/// Returns an error if the HDF5 library rejects a write.
pub fn data_to_h5(value: &H5Value, group: &Group, key: &str) -> Result<()> {
    match value {
        H5Value::None => {
            if node_encoding(group, key)? != Some(Encoding::None) {
                remove_node(group, key)?;
                let ds = group.new_dataset::<u8>().shape(()).create(key)?;
                set_encoding(&ds, Encoding::None)?;
            }
            Ok(())
        }
        H5Value::Dict(map) => write_dict(map, group, key),
        H5Value::Str(s) => write_string(group, key, s, Encoding::Str),
        H5Value::Text { format, text } => write_string(group, key, text, format.encoding()),
        H5Value::Unknown(repr) => write_string(group, key, repr, Encoding::Unknown),
        H5Value::Scalar(scalar) => write_scalar(group, key, *scalar),
        H5Value::Array(arr) => write_array(group, key, &arr.view()),
        H5Value::IntArray(arr) => write_array(group, key, &arr.view()),
        H5Value::StrArray(values) => write_str_array(group, key, values),
        H5Value::Series(series) => write_series(group, key, series),
        H5Value::DataFrame(table) => write_frame(group, key, table),
        H5Value::NzArray1(nz) => {
            let (lo, hi) = nz.corners();
            write_nzarray(group, key, &[nz.shape()], &[lo, hi], &nz.data().view().into_dyn())
        }
        H5Value::NzArray2(nz) => {
            let (rows, cols) = nz.shape();
            write_nzarray(group, key, &[rows, cols], &nz.corners(), &nz.data().view().into_dyn())
        }
    }
}

/// Reads the node at `group/key`, selecting the reader from its tag.
///
/// # Errors
/// Returns [`Error::MissingNode`] if the key is absent, or an error if the
/// node is untagged or malformed.
pub fn h5_to_data(group: &Group, key: &str) -> Result<H5Value> {
    let encoding = node_encoding(group, key)?
        .ok_or_else(|| Error::MissingNode(format!("{}/{key}", group.name())))?;
    if encoding.is_group() {
        let sub = group.group(key)?;
        return match encoding {
            Encoding::Dict => read_dict(&sub),
            Encoding::Series => read_series(&sub),
            Encoding::DataFrame => read_frame(&sub),
            _ => read_nzarray(&sub),
        };
    }
    let ds = group.dataset(key)?;
    Ok(match encoding {
        Encoding::None => H5Value::None,
        Encoding::Str => H5Value::Str(read_string(&ds)?),
        Encoding::Unknown => H5Value::Unknown(read_string(&ds)?),
        Encoding::Json => H5Value::Text {
            format: TextFormat::Json,
            text: read_string(&ds)?,
        },
        Encoding::Yaml => H5Value::Text {
            format: TextFormat::Yaml,
            text: read_string(&ds)?,
        },
        Encoding::Scalar => H5Value::Scalar(read_scalar(&ds)?),
        _ => read_array(&ds)?,
    })
}

/// Writes each `(name, value)` pair under `group`.
///
/// # Errors
/// Returns the first write error.
pub fn attributes_to_h5<'a, I>(group: &Group, attrs: I) -> Result<()>
where
    I: IntoIterator<Item = (&'a str, &'a H5Value)>,
{
    for (name, value) in attrs {
        data_to_h5(value, group, name)?;
    }
    Ok(())
}

/// Reads the named nodes under `group`; absent names are skipped.
///
/// # Errors
/// Returns the first read error other than a missing node.
pub fn h5_to_attributes(group: &Group, names: &[&str]) -> Result<BTreeMap<String, H5Value>> {
    let mut out = BTreeMap::new();
    for &name in names {
        match h5_to_data(group, name) {
            Ok(value) => {
                out.insert(name.to_string(), value);
            }
            Err(Error::MissingNode(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}

/// Serializes `value` as text. Values the serializer rejects are stored as
/// their `Debug` repr under the `unknown` tag.
///
/// # Errors
/// Returns an error if the HDF5 library rejects the write.
pub fn serialized_to_h5<T>(value: &T, group: &Group, key: &str, format: TextFormat) -> Result<()>
where
    T: Serialize + Debug,
{
    let text = match format {
        TextFormat::Json => serde_json::to_string(value).map_err(|e| e.to_string()),
        TextFormat::Yaml => serde_yaml::to_string(value).map_err(|e| e.to_string()),
    };
    let node = match text {
        Ok(text) => H5Value::Text { format, text },
        Err(e) => {
            log::debug!("storing {key} as repr: {e}");
            H5Value::Unknown(format!("{value:?}"))
        }
    };
    data_to_h5(&node, group, key)
}

/// Reads a value written by [`serialized_to_h5`]. Plain dict nodes are
/// accepted too.
///
/// # Errors
/// Returns an error if the node is missing, stored as a repr, or does not
/// deserialize into `T`.
pub fn h5_to_serialized<T: DeserializeOwned>(group: &Group, key: &str) -> Result<T> {
    match h5_to_data(group, key)? {
        H5Value::Text {
            format: TextFormat::Json,
            text,
        } => Ok(serde_json::from_str(&text)?),
        H5Value::Text {
            format: TextFormat::Yaml,
            text,
        } => Ok(serde_yaml::from_str(&text)?),
        H5Value::Unknown(repr) => Err(Error::Encoding(format!(
            "{key} was stored as a repr: {repr}"
        ))),
        other => Ok(serde_json::from_value(other.to_json()?)?),
    }
}

/// Reads a 1D float array.
///
/// # Errors
/// Returns an error if the node is missing or not a 1D numeric array.
pub fn read_array1(group: &Group, key: &str) -> Result<Array1<f64>> {
    numeric(h5_to_data(group, key)?, key)?
        .into_dimensionality::<Ix1>()
        .map_err(|e| Error::InvalidFormat(format!("{key}: {e}")))
}

/// Reads a 2D float array.
///
/// # Errors
/// Returns an error if the node is missing or not a 2D numeric array.
pub fn read_array2(group: &Group, key: &str) -> Result<Array2<f64>> {
    numeric(h5_to_data(group, key)?, key)?
        .into_dimensionality::<Ix2>()
        .map_err(|e| Error::InvalidFormat(format!("{key}: {e}")))
}

/// Reads a scalar.
///
/// # Errors
/// Returns an error if the node is missing or not a scalar.
pub fn read_scalar_node(group: &Group, key: &str) -> Result<Scalar> {
    match h5_to_data(group, key)? {
        H5Value::Scalar(s) => Ok(s),
        other => Err(Error::InvalidFormat(format!(
            "{key}: expected scalar, found {}",
            other.encoding()
        ))),
    }
}

/// Reads a string node.
///
/// # Errors
/// Returns an error if the node is missing or not a string.
pub fn read_str_node(group: &Group, key: &str) -> Result<String> {
    match h5_to_data(group, key)? {
        H5Value::Str(s) => Ok(s),
        other => Err(Error::InvalidFormat(format!(
            "{key}: expected str, found {}",
            other.encoding()
        ))),
    }
}

/// Returns the subgroup `key`, creating it (tagged `dict`) when absent or
/// when `key` currently names a dataset.
///
/// # Errors
/// Returns an error if the group cannot be created.
pub fn require_group(group: &Group, key: &str) -> Result<Group> {
    if group.link_exists(key) {
        if let Ok(sub) = group.group(key) {
            return Ok(sub);
        }
        group.unlink(key)?;
    }
    let sub = group.create_group(key)?;
    set_encoding(&sub, Encoding::Dict)?;
    Ok(sub)
}

/// Removes `group/key` if present.
///
/// # Errors
/// Returns an error if the link exists but cannot be removed.
pub fn remove_node(group: &Group, key: &str) -> Result<()> {
    if group.link_exists(key) {
        group.unlink(key)?;
    }
    Ok(())
}

/// Tag of the node at `group/key`, `None` if the key is absent.
///
/// # Errors
/// Returns an error if the node exists but its tag is unreadable.
pub fn node_encoding(group: &Group, key: &str) -> Result<Option<Encoding>> {
    if !group.link_exists(key) {
        return Ok(None);
    }
    let tag = match group.group(key) {
        Ok(sub) => read_tag(&sub),
        Err(_) => read_tag(&group.dataset(key)?),
    };
    match tag {
        Some(tag) => Ok(Some(Encoding::from_str(&tag)?)),
        None => Err(Error::InvalidFormat(format!(
            "{}/{key} has no '{ENCODED_ATTR}' attribute",
            group.name()
        ))),
    }
}

fn read_tag(loc: &Location) -> Option<String> {
    let attr = loc.attr(ENCODED_ATTR).ok()?;
    attr.read_scalar::<VarLenUnicode>()
        .ok()
        .map(|v| v.to_string())
}

/// Sets the string attribute `name` on `loc`, overwriting any previous value.
///
/// # Errors
/// Returns an error if the value is not valid UTF-8 or the write fails.
pub fn set_str_attr(loc: &Location, name: &str, value: &str) -> Result<()> {
    let value = to_var_len_unicode(value)?;
    match loc.attr(name) {
        Ok(attr) => attr.write_scalar(&value)?,
        Err(_) => loc
            .new_attr::<VarLenUnicode>()
            .create(name)?
            .write_scalar(&value)?,
    }
    Ok(())
}

/// Reads the string attribute `name`, `None` if absent.
///
/// # Errors
/// Returns an error if the attribute exists but is not a string.
pub fn read_str_attr(loc: &Location, name: &str) -> Result<Option<String>> {
    match loc.attr(name) {
        Ok(attr) => Ok(Some(attr.read_scalar::<VarLenUnicode>()?.to_string())),
        Err(_) => Ok(None),
    }
}

fn set_encoding(loc: &Location, encoding: Encoding) -> Result<()> {
    set_str_attr(loc, ENCODED_ATTR, encoding.as_str())
}

fn to_var_len_unicode(value: &str) -> Result<VarLenUnicode> {
    VarLenUnicode::from_str(value)
        .map_err(|e| Error::Encoding(format!("invalid utf-8 string: {e}")))
}

/// Reuses `group/key` if it is a group with the same tag, otherwise
/// replaces whatever is there with a fresh group.
fn prepare_group(group: &Group, key: &str, encoding: Encoding) -> Result<Group> {
    if node_encoding(group, key).ok().flatten() == Some(encoding) {
        return Ok(group.group(key)?);
    }
    remove_node(group, key)?;
    let sub = group.create_group(key)?;
    set_encoding(&sub, encoding)?;
    Ok(sub)
}

/// Reuses `group/key` if it is a dataset with the same tag, element type
/// and rank, otherwise unlinks it. `None` means a new dataset is needed.
fn reusable_dataset<T: H5Type>(
    group: &Group,
    key: &str,
    encoding: Encoding,
    ndim: usize,
) -> Result<Option<Dataset>> {
    if node_encoding(group, key).ok().flatten() == Some(encoding) {
        if let Ok(ds) = group.dataset(key) {
            if ds.dtype()?.is::<T>() && ds.ndim() == ndim && (ndim == 0 || ds.is_chunked()) {
                return Ok(Some(ds));
            }
        }
    }
    remove_node(group, key)?;
    Ok(None)
}

fn write_dict(map: &BTreeMap<String, H5Value>, group: &Group, key: &str) -> Result<()> {
    let sub = prepare_group(group, key, Encoding::Dict)?;
    for name in sub.member_names()? {
        if !map.contains_key(&name) {
            sub.unlink(&name)?;
        }
    }
    for (name, value) in map {
        data_to_h5(value, &sub, name)?;
    }
    Ok(())
}

pub(crate) fn read_dict(group: &Group) -> Result<H5Value> {
    let mut map = BTreeMap::new();
    for name in group.member_names()? {
        let value = h5_to_data(group, &name)?;
        map.insert(name, value);
    }
    Ok(H5Value::Dict(map))
}

fn write_string(group: &Group, key: &str, value: &str, encoding: Encoding) -> Result<()> {
    let value = to_var_len_unicode(value)?;
    let ds = match reusable_dataset::<VarLenUnicode>(group, key, encoding, 0)? {
        Some(ds) => ds,
        None => {
            let ds = group.new_dataset::<VarLenUnicode>().shape(()).create(key)?;
            set_encoding(&ds, encoding)?;
            ds
        }
    };
    ds.write_scalar(&value)?;
    Ok(())
}

fn read_string(ds: &Dataset) -> Result<String> {
    Ok(ds.read_scalar::<VarLenUnicode>()?.to_string())
}

fn write_scalar(group: &Group, key: &str, scalar: Scalar) -> Result<()> {
    match scalar {
        Scalar::Float(v) => write_typed_scalar(group, key, &v),
        Scalar::Int(v) => write_typed_scalar(group, key, &v),
        Scalar::Bool(v) => write_typed_scalar(group, key, &v),
    }
}

fn write_typed_scalar<T: H5Type>(group: &Group, key: &str, value: &T) -> Result<()> {
    let ds = match reusable_dataset::<T>(group, key, Encoding::Scalar, 0)? {
        Some(ds) => ds,
        None => {
            let ds = group.new_dataset::<T>().shape(()).create(key)?;
            set_encoding(&ds, Encoding::Scalar)?;
            ds
        }
    };
    ds.write_scalar(value)?;
    Ok(())
}

fn read_scalar(ds: &Dataset) -> Result<Scalar> {
    let dtype = ds.dtype()?;
    if dtype.is::<f64>() {
        Ok(Scalar::Float(ds.read_scalar::<f64>()?))
    } else if dtype.is::<i64>() {
        Ok(Scalar::Int(ds.read_scalar::<i64>()?))
    } else if dtype.is::<bool>() {
        Ok(Scalar::Bool(ds.read_scalar::<bool>()?))
    } else {
        Err(Error::InvalidFormat(format!(
            "{}: unsupported scalar type",
            ds.name()
        )))
    }
}

/// Chunk extent per axis, clamped to `1..=MAX_CHUNK`.
fn chunk_dims(shape: &[usize]) -> Vec<usize> {
    shape.iter().map(|&n| n.clamp(1, MAX_CHUNK)).collect()
}

fn create_resizable<T: H5Type>(group: &Group, key: &str, shape: &[usize]) -> Result<Dataset> {
    let builder = group
        .new_dataset::<T>()
        .shape(SimpleExtents::resizable(shape.to_vec()));
    let ds = match chunk_dims(shape).as_slice() {
        &[a] => builder.chunk([a]).create(key)?,
        &[a, b] => builder.chunk([a, b]).create(key)?,
        &[a, b, c] => builder.chunk([a, b, c]).create(key)?,
        _ => {
            return Err(Error::Encoding(format!(
                "{key}: arrays of rank {} are not supported",
                shape.len()
            )))
        }
    };
    set_encoding(&ds, Encoding::Arr)?;
    Ok(ds)
}

fn resize(ds: &Dataset, shape: &[usize]) -> Result<()> {
    match *shape {
        [a] => ds.resize((a,))?,
        [a, b] => ds.resize((a, b))?,
        [a, b, c] => ds.resize((a, b, c))?,
        _ => {
            return Err(Error::Encoding(format!(
                "arrays of rank {} are not supported",
                shape.len()
            )))
        }
    }
    Ok(())
}

fn write_array<T: H5Type + Clone>(group: &Group, key: &str, arr: &ArrayViewD<'_, T>) -> Result<()> {
    let shape = arr.shape();
    let ds = match reusable_dataset::<T>(group, key, Encoding::Arr, shape.len())? {
        Some(ds) => {
            if ds.shape() != shape {
                resize(&ds, shape)?;
            }
            ds
        }
        None => create_resizable::<T>(group, key, shape)?,
    };
    if !arr.is_empty() {
        let contiguous = arr.as_standard_layout();
        ds.write(contiguous.view())?;
    }
    Ok(())
}

fn write_str_array(group: &Group, key: &str, values: &[String]) -> Result<()> {
    // Variable-length strings are rewritten whole.
    remove_node(group, key)?;
    let encoded = values
        .iter()
        .map(|v| to_var_len_unicode(v))
        .collect::<Result<Vec<_>>>()?;
    let ds = group
        .new_dataset::<VarLenUnicode>()
        .shape((encoded.len(),))
        .create(key)?;
    set_encoding(&ds, Encoding::Arr)?;
    if !encoded.is_empty() {
        ds.write(ArrayView1::from(encoded.as_slice()))?;
    }
    Ok(())
}

fn read_array(ds: &Dataset) -> Result<H5Value> {
    let dtype = ds.dtype()?;
    let shape = ds.shape();
    let empty = shape.iter().product::<usize>() == 0;
    if dtype.is::<f64>() {
        if empty {
            return Ok(H5Value::Array(ArrayD::zeros(IxDyn(&shape))));
        }
        Ok(H5Value::Array(ds.read_dyn::<f64>()?))
    } else if dtype.is::<i64>() {
        if empty {
            return Ok(H5Value::IntArray(ArrayD::zeros(IxDyn(&shape))));
        }
        Ok(H5Value::IntArray(ds.read_dyn::<i64>()?))
    } else if dtype.is::<VarLenUnicode>() {
        if empty {
            return Ok(H5Value::StrArray(Vec::new()));
        }
        Ok(H5Value::StrArray(
            ds.read_raw::<VarLenUnicode>()?
                .iter()
                .map(ToString::to_string)
                .collect(),
        ))
    } else {
        Err(Error::InvalidFormat(format!(
            "{}: unsupported array type",
            ds.name()
        )))
    }
}

fn numeric(value: H5Value, key: &str) -> Result<ArrayD<f64>> {
    match value {
        H5Value::Array(a) => Ok(a),
        #[allow(clippy::cast_precision_loss)]
        H5Value::IntArray(a) => Ok(a.mapv(|v| v as f64)),
        other => Err(Error::InvalidFormat(format!(
            "{key}: expected arr, found {}",
            other.encoding()
        ))),
    }
}

fn int_array(value: H5Value, key: &str) -> Result<Vec<usize>> {
    match value {
        H5Value::IntArray(a) => a
            .iter()
            .map(|&v| usize::try_from(v).map_err(|_| Error::InvalidFormat(format!("{key}: negative extent {v}"))))
            .collect(),
        other => Err(Error::InvalidFormat(format!(
            "{key}: expected integer arr, found {}",
            other.encoding()
        ))),
    }
}

fn to_i64(values: &[usize]) -> Result<ArrayD<i64>> {
    let data = values
        .iter()
        .map(|&v| i64::try_from(v).map_err(|_| Error::Encoding(format!("extent {v} overflows i64"))))
        .collect::<Result<Vec<_>>>()?;
    Ok(Array1::from(data).into_dyn())
}

fn write_index(group: &Group, index: &Index) -> Result<()> {
    match index {
        Index::Int(labels) => write_array(group, "index", &ArrayView1::from(labels.as_slice()).into_dyn()),
        Index::Str(labels) => write_str_array(group, "index", labels),
    }
}

fn read_index(group: &Group) -> Result<Index> {
    match h5_to_data(group, "index")? {
        H5Value::IntArray(a) => Ok(Index::Int(a.iter().copied().collect())),
        H5Value::StrArray(v) => Ok(Index::Str(v)),
        // An empty index is written without a dtype hint.
        H5Value::Array(a) if a.is_empty() => Ok(Index::Int(Vec::new())),
        other => Err(Error::InvalidFormat(format!(
            "index: expected arr, found {}",
            other.encoding()
        ))),
    }
}

fn write_series(group: &Group, key: &str, series: &Series) -> Result<()> {
    let sub = prepare_group(group, key, Encoding::Series)?;
    write_array(&sub, "data", &series.data.view().into_dyn())?;
    write_index(&sub, &series.index)?;
    set_str_attr(&sub, "name", &series.name)
}

fn read_series(group: &Group) -> Result<H5Value> {
    let name = read_str_attr(group, "name")?.unwrap_or_default();
    let index = read_index(group)?;
    let data = read_array1(group, "data")?;
    Ok(H5Value::Series(Series::new(name, index, data)?))
}

fn write_frame(group: &Group, key: &str, table: &ScanTable) -> Result<()> {
    let sub = prepare_group(group, key, Encoding::DataFrame)?;
    write_array(&sub, "data", &table.to_array().view().into_dyn())?;
    write_array(
        &sub,
        "index",
        &ArrayView1::from(table.index()).into_dyn(),
    )?;
    write_str_array(&sub, "columns", table.columns())
}

fn read_frame(group: &Group) -> Result<H5Value> {
    let index = match read_index(group)? {
        Index::Int(labels) => labels,
        Index::Str(_) => {
            return Err(Error::InvalidFormat(
                "scan table index must be integer".to_string(),
            ))
        }
    };
    let columns = match h5_to_data(group, "columns")? {
        H5Value::StrArray(v) => v,
        H5Value::Array(a) if a.is_empty() => Vec::new(),
        other => {
            return Err(Error::InvalidFormat(format!(
                "columns: expected string arr, found {}",
                other.encoding()
            )))
        }
    };
    let data = numeric(h5_to_data(group, "data")?, "data")?;
    let data = if data.is_empty() {
        Array2::zeros((index.len(), columns.len()))
    } else {
        data.into_dimensionality::<Ix2>()
            .map_err(|e| Error::InvalidFormat(format!("data: {e}")))?
    };
    Ok(H5Value::DataFrame(ScanTable::from_parts(index, columns, &data)?))
}

fn write_nzarray(
    group: &Group,
    key: &str,
    shape: &[usize],
    corners: &[usize],
    data: &ArrayViewD<'_, f64>,
) -> Result<()> {
    let sub = prepare_group(group, key, Encoding::NzArray)?;
    write_array(&sub, "shape", &to_i64(shape)?.view())?;
    write_array(&sub, "corners", &to_i64(corners)?.view())?;
    write_array(&sub, "data", data)
}

fn read_nzarray(group: &Group) -> Result<H5Value> {
    let shape = int_array(h5_to_data(group, "shape")?, "shape")?;
    let corners = int_array(h5_to_data(group, "corners")?, "corners")?;
    let data = numeric(h5_to_data(group, "data")?, "data")?;
    match (shape.as_slice(), corners.as_slice()) {
        (&[n], &[lo, hi]) => {
            let data = data
                .into_dimensionality::<Ix1>()
                .map_err(|e| Error::InvalidFormat(format!("nzarray data: {e}")))?;
            Ok(H5Value::NzArray1(NzArray1::from_parts(n, (lo, hi), data)?))
        }
        (&[rows, cols], &[r_lo, r_hi, c_lo, c_hi]) => {
            let data = data
                .into_dimensionality::<Ix2>()
                .map_err(|e| Error::InvalidFormat(format!("nzarray data: {e}")))?;
            Ok(H5Value::NzArray2(NzArray2::from_parts(
                (rows, cols),
                [r_lo, r_hi, c_lo, c_hi],
                data,
            )?))
        }
        _ => Err(Error::InvalidFormat(format!(
            "nzarray: shape {shape:?} and corners {corners:?} disagree"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::NamedTempFile;

    fn scratch() -> (NamedTempFile, hdf5::File) {
        let tmp = NamedTempFile::new().unwrap();
        let file = hdf5::File::create(tmp.path()).unwrap();
        (tmp, file)
    }

    #[test]
    fn test_scalars_keep_their_type() {
        let (_tmp, file) = scratch();
        data_to_h5(&H5Value::from(1.5), &file, "f").unwrap();
        data_to_h5(&H5Value::from(7_i64), &file, "i").unwrap();
        data_to_h5(&H5Value::from(true), &file, "b").unwrap();
        assert_eq!(h5_to_data(&file, "f").unwrap(), H5Value::from(1.5));
        assert_eq!(h5_to_data(&file, "i").unwrap(), H5Value::from(7_i64));
        assert_eq!(h5_to_data(&file, "b").unwrap(), H5Value::from(true));
        assert_eq!(node_encoding(&file, "f").unwrap(), Some(Encoding::Scalar));
    }

    #[test]
    fn test_none_and_strings() {
        let (_tmp, file) = scratch();
        data_to_h5(&H5Value::None, &file, "nothing").unwrap();
        data_to_h5(&H5Value::from("TwoTheta"), &file, "th_mtr").unwrap();
        assert_eq!(h5_to_data(&file, "nothing").unwrap(), H5Value::None);
        assert_eq!(read_str_node(&file, "th_mtr").unwrap(), "TwoTheta");
        assert!(matches!(
            h5_to_data(&file, "absent"),
            Err(Error::MissingNode(_))
        ));
    }

    #[test]
    fn test_array_resized_in_place() {
        let (_tmp, file) = scratch();
        let a = array![1.0, 2.0, 3.0].into_dyn();
        data_to_h5(&H5Value::Array(a), &file, "x").unwrap();
        let b = array![4.0, 5.0, 6.0, 7.0, 8.0].into_dyn();
        data_to_h5(&H5Value::Array(b.clone()), &file, "x").unwrap();
        assert_eq!(h5_to_data(&file, "x").unwrap(), H5Value::Array(b));
        assert_eq!(file.dataset("x").unwrap().shape(), vec![5]);

        // A rank change replaces the node.
        let c = array![[1.0, 2.0], [3.0, 4.0]].into_dyn();
        data_to_h5(&H5Value::Array(c.clone()), &file, "x").unwrap();
        assert_eq!(h5_to_data(&file, "x").unwrap(), H5Value::Array(c));
    }

    #[test]
    fn test_type_change_replaces_node() {
        let (_tmp, file) = scratch();
        data_to_h5(&H5Value::from("text"), &file, "v").unwrap();
        data_to_h5(&H5Value::from(3_i64), &file, "v").unwrap();
        assert_eq!(h5_to_data(&file, "v").unwrap(), H5Value::from(3_i64));
        data_to_h5(&H5Value::Array(ArrayD::zeros(IxDyn(&[0]))), &file, "v").unwrap();
        assert_eq!(
            h5_to_data(&file, "v").unwrap(),
            H5Value::Array(ArrayD::zeros(IxDyn(&[0])))
        );
    }

    #[test]
    fn test_dict_drops_stale_keys() {
        let (_tmp, file) = scratch();
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), H5Value::from(1_i64));
        map.insert("b".to_string(), H5Value::from("x"));
        data_to_h5(&H5Value::Dict(map.clone()), &file, "d").unwrap();
        map.remove("b");
        map.insert("c".to_string(), H5Value::None);
        data_to_h5(&H5Value::Dict(map.clone()), &file, "d").unwrap();
        assert_eq!(h5_to_data(&file, "d").unwrap(), H5Value::Dict(map));
    }

    #[test]
    fn test_series_and_frame() {
        let (_tmp, file) = scratch();
        let series = Series::new(
            "i0",
            Index::Str(vec!["a".into(), "b".into()]),
            array![1.0, 2.0],
        )
        .unwrap();
        data_to_h5(&H5Value::Series(series.clone()), &file, "s").unwrap();
        assert_eq!(h5_to_data(&file, "s").unwrap(), H5Value::Series(series));

        let mut table = ScanTable::new();
        let row = |th: f64| BTreeMap::from([("TwoTheta".to_string(), th), ("i0".to_string(), 1000.0)]);
        table.append_row(3, &row(1.0)).unwrap();
        table.append_row(1, &row(-3.0)).unwrap();
        data_to_h5(&H5Value::DataFrame(table.clone()), &file, "scan_data").unwrap();
        assert_eq!(
            h5_to_data(&file, "scan_data").unwrap(),
            H5Value::DataFrame(table)
        );

        data_to_h5(&H5Value::DataFrame(ScanTable::new()), &file, "empty").unwrap();
        assert_eq!(
            h5_to_data(&file, "empty").unwrap(),
            H5Value::DataFrame(ScanTable::new())
        );
    }

    #[test]
    fn test_nzarray_layout() {
        let (_tmp, file) = scratch();
        let mut dense = vec![0.0; 20];
        dense.extend(vec![1.0; 50]);
        dense.extend(vec![0.0; 30]);
        let nz = NzArray1::from(Array1::from(dense));
        data_to_h5(&H5Value::NzArray1(nz.clone()), &file, "raw").unwrap();
        let sub = file.group("raw").unwrap();
        assert_eq!(read_tag(&sub).as_deref(), Some("nzarray"));
        assert_eq!(sub.dataset("data").unwrap().shape(), vec![50]);
        assert_eq!(h5_to_data(&file, "raw").unwrap(), H5Value::NzArray1(nz));

        let nz2 = NzArray2::from(array![[0.0, 0.0, 0.0], [0.0, 2.0, 3.0]]);
        data_to_h5(&H5Value::NzArray2(nz2.clone()), &file, "raw2").unwrap();
        assert_eq!(h5_to_data(&file, "raw2").unwrap(), H5Value::NzArray2(nz2));

        let empty = NzArray2::zeros((4, 4));
        data_to_h5(&H5Value::NzArray2(empty.clone()), &file, "raw2").unwrap();
        assert_eq!(h5_to_data(&file, "raw2").unwrap(), H5Value::NzArray2(empty));
    }

    #[derive(Debug, Serialize, serde::Deserialize, PartialEq)]
    struct Settings {
        name: String,
        range: [f64; 2],
    }

    #[test]
    fn test_serialized_formats() {
        let (_tmp, file) = scratch();
        let settings = Settings {
            name: "x".into(),
            range: [0.0, 30.0],
        };
        serialized_to_h5(&settings, &file, "json", TextFormat::Json).unwrap();
        serialized_to_h5(&settings, &file, "yaml", TextFormat::Yaml).unwrap();
        assert_eq!(node_encoding(&file, "yaml").unwrap(), Some(Encoding::Yaml));
        let back: Settings = h5_to_serialized(&file, "json").unwrap();
        assert_eq!(back, settings);
        let back: Settings = h5_to_serialized(&file, "yaml").unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn test_unserializable_falls_back_to_repr() {
        let (_tmp, file) = scratch();
        // JSON object keys must be strings.
        let value = BTreeMap::from([((1, 2), 3.0)]);
        serialized_to_h5(&value, &file, "odd", TextFormat::Json).unwrap();
        assert_eq!(
            h5_to_data(&file, "odd").unwrap(),
            H5Value::Unknown("{(1, 2): 3.0}".to_string())
        );
        assert!(h5_to_serialized::<BTreeMap<String, f64>>(&file, "odd").is_err());
    }

    #[test]
    fn test_attribute_helpers() {
        let (_tmp, file) = scratch();
        let gi = H5Value::from(false);
        let th = H5Value::from("th");
        attributes_to_h5(&file, [("gi", &gi), ("th_mtr", &th)]).unwrap();
        let read = h5_to_attributes(&file, &["gi", "th_mtr", "missing"]).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read["gi"], gi);
    }

    #[test]
    fn test_chunk_dims_clamped() {
        assert_eq!(chunk_dims(&[0, 100, 5000]), vec![1, 100, 512]);
    }
}
