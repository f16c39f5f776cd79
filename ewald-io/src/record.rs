//! Group layouts of the integration containers and the calibration.

use crate::store::{
    data_to_h5, h5_to_data, read_array1, read_array2, read_dict, read_scalar_node, remove_node,
    require_group,
};
use crate::value::H5Value;
use crate::{Error, Result};
use ewald_core::{IntData1D, IntData2D, IntData2DStatic, Integration2D, NzArray1, NzArray2, Poni};
use hdf5::Group;
use ndarray::{Array1, Array2};

/// A value stored as the members of one group.
pub trait H5Record: Sized {
    /// Writes the members into `group`.
    ///
    /// # Errors
    /// Returns an error if a member cannot be written.
    fn write_h5(&self, group: &Group) -> Result<()>;

    /// Reads the members back from `group`.
    ///
    /// # Errors
    /// Returns an error if a member is missing or malformed.
    fn read_h5(group: &Group) -> Result<Self>;
}

/// Writes `record` into the subgroup `parent/key`, creating it if needed.
///
/// # Errors
/// Returns an error if the subgroup or a member cannot be written.
pub fn save_record<T: H5Record>(parent: &Group, key: &str, record: &T) -> Result<()> {
    record.write_h5(&require_group(parent, key)?)
}

/// Reads the record stored in `parent/key`.
///
/// # Errors
/// Returns [`Error::MissingNode`] if the subgroup is absent.
pub fn load_record<T: H5Record>(parent: &Group, key: &str) -> Result<T> {
    if !parent.link_exists(key) {
        return Err(Error::MissingNode(format!("{}/{key}", parent.name())));
    }
    T::read_h5(&parent.group(key)?)
}

fn write_nz1(group: &Group, key: &str, value: &NzArray1) -> Result<()> {
    data_to_h5(&H5Value::NzArray1(value.clone()), group, key)
}

fn write_nz2(group: &Group, key: &str, value: &NzArray2) -> Result<()> {
    data_to_h5(&H5Value::NzArray2(value.clone()), group, key)
}

fn write_arr1(group: &Group, key: &str, value: &Array1<f64>) -> Result<()> {
    data_to_h5(&H5Value::Array(value.clone().into_dyn()), group, key)
}

fn write_arr2(group: &Group, key: &str, value: &Array2<f64>) -> Result<()> {
    data_to_h5(&H5Value::Array(value.clone().into_dyn()), group, key)
}

fn read_nz1(group: &Group, key: &str) -> Result<NzArray1> {
    match h5_to_data(group, key)? {
        H5Value::NzArray1(nz) => Ok(nz),
        other => Err(Error::InvalidFormat(format!(
            "{key}: expected 1D nzarray, found {}",
            other.encoding()
        ))),
    }
}

fn read_nz2(group: &Group, key: &str) -> Result<NzArray2> {
    match h5_to_data(group, key)? {
        H5Value::NzArray2(nz) => Ok(nz),
        other => Err(Error::InvalidFormat(format!(
            "{key}: expected 2D nzarray, found {}",
            other.encoding()
        ))),
    }
}

impl H5Record for IntData1D {
    fn write_h5(&self, group: &Group) -> Result<()> {
        write_nz1(group, "raw", &self.raw)?;
        write_nz1(group, "pcount", &self.pcount)?;
        write_nz1(group, "norm", &self.norm)?;
        write_nz1(group, "sigma", &self.sigma)?;
        write_nz1(group, "sigma_raw", &self.sigma_raw)?;
        write_arr1(group, "ttheta", &self.ttheta)?;
        write_arr1(group, "q", &self.q)
    }

    fn read_h5(group: &Group) -> Result<Self> {
        Ok(Self {
            raw: read_nz1(group, "raw")?,
            pcount: read_nz1(group, "pcount")?,
            norm: read_nz1(group, "norm")?,
            sigma: read_nz1(group, "sigma")?,
            sigma_raw: read_nz1(group, "sigma_raw")?,
            ttheta: read_array1(group, "ttheta")?,
            q: read_array1(group, "q")?,
        })
    }
}

impl H5Record for IntData2D {
    fn write_h5(&self, group: &Group) -> Result<()> {
        write_nz2(group, "raw", &self.raw)?;
        write_nz2(group, "pcount", &self.pcount)?;
        write_nz2(group, "norm", &self.norm)?;
        write_nz2(group, "sigma", &self.sigma)?;
        write_nz2(group, "sigma_raw", &self.sigma_raw)?;
        write_arr1(group, "ttheta", &self.ttheta)?;
        write_arr1(group, "q", &self.q)?;
        write_arr1(group, "chi", &self.chi)
    }

    fn read_h5(group: &Group) -> Result<Self> {
        Ok(Self {
            raw: read_nz2(group, "raw")?,
            pcount: read_nz2(group, "pcount")?,
            norm: read_nz2(group, "norm")?,
            sigma: read_nz2(group, "sigma")?,
            sigma_raw: read_nz2(group, "sigma_raw")?,
            ttheta: read_array1(group, "ttheta")?,
            q: read_array1(group, "q")?,
            chi: read_array1(group, "chi")?,
        })
    }
}

impl H5Record for IntData2DStatic {
    fn write_h5(&self, group: &Group) -> Result<()> {
        write_arr2(group, "i_tthChi", &self.i_tth_chi)?;
        write_arr2(group, "i_qChi", &self.i_q_chi)?;
        write_arr2(group, "i_QxyQz", &self.i_qxy_qz)?;
        write_arr1(group, "qz", &self.qz)?;
        write_arr1(group, "qxy", &self.qxy)?;
        write_arr1(group, "ttheta", &self.ttheta)?;
        write_arr1(group, "q", &self.q)?;
        write_arr1(group, "chi", &self.chi)?;
        data_to_h5(&H5Value::from(self.q_from_tth), group, "q_from_tth")?;
        data_to_h5(&H5Value::from(self.tth_from_q), group, "tth_from_q")
    }

    fn read_h5(group: &Group) -> Result<Self> {
        Ok(Self {
            i_tth_chi: read_array2(group, "i_tthChi")?,
            i_q_chi: read_array2(group, "i_qChi")?,
            i_qxy_qz: read_array2(group, "i_QxyQz")?,
            qz: read_array1(group, "qz")?,
            qxy: read_array1(group, "qxy")?,
            ttheta: read_array1(group, "ttheta")?,
            q: read_array1(group, "q")?,
            chi: read_array1(group, "chi")?,
            q_from_tth: read_scalar_node(group, "q_from_tth")?.as_bool(),
            tth_from_q: read_scalar_node(group, "tth_from_q")?.as_bool(),
        })
    }
}

const SCANNING_ONLY: &[&str] = &["raw", "pcount", "norm", "sigma", "sigma_raw"];
const STATIC_ONLY: &[&str] = &["i_tthChi", "i_qChi", "i_QxyQz", "qz", "qxy", "q_from_tth", "tth_from_q"];

impl H5Record for Integration2D {
    fn write_h5(&self, group: &Group) -> Result<()> {
        let stale = match self {
            Self::Scanning(_) => STATIC_ONLY,
            Self::Static(_) => SCANNING_ONLY,
        };
        for key in stale {
            remove_node(group, key)?;
        }
        match self {
            Self::Scanning(data) => data.write_h5(group),
            Self::Static(data) => data.write_h5(group),
        }
    }

    fn read_h5(group: &Group) -> Result<Self> {
        if group.link_exists("i_tthChi") {
            Ok(Self::Static(IntData2DStatic::read_h5(group)?))
        } else {
            Ok(Self::Scanning(IntData2D::read_h5(group)?))
        }
    }
}

impl H5Record for Poni {
    fn write_h5(&self, group: &Group) -> Result<()> {
        let value = serde_json::Value::Object(self.to_dict());
        if let H5Value::Dict(entries) = H5Value::from_json(&value) {
            for (key, entry) in &entries {
                data_to_h5(entry, group, key)?;
            }
        }
        Ok(())
    }

    fn read_h5(group: &Group) -> Result<Self> {
        match read_dict(group)?.to_json()? {
            serde_json::Value::Object(map) => Ok(Self::from_dict(&map)?),
            _ => Err(Error::InvalidFormat("poni is not a mapping".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ewald_core::{Detector, Integrate1dResult, Integrate2dResult, RadialUnit};
    use ndarray::array;
    use tempfile::NamedTempFile;

    fn scratch() -> (NamedTempFile, hdf5::File) {
        let tmp = NamedTempFile::new().unwrap();
        let file = hdf5::File::create(tmp.path()).unwrap();
        (tmp, file)
    }

    fn int_1d() -> IntData1D {
        let result = Integrate1dResult {
            radial: array![1.0, 2.0, 3.0, 4.0],
            sum_signal: array![0.0, 4.0, 9.0, 0.0],
            count: array![0.0, 2.0, 3.0, 0.0],
            intensity: array![0.0, 2.0, 3.0, 0.0],
            sigma: None,
            unit: RadialUnit::TwoThetaDeg,
        };
        IntData1D::from_result(&result, 1e-10, Some(1000.0))
    }

    #[test]
    fn test_int_1d_record() {
        let (_tmp, file) = scratch();
        let data = int_1d();
        save_record(&file, "int_1d", &data).unwrap();
        let back: IntData1D = load_record(&file, "int_1d").unwrap();
        assert_eq!(back, data);
        assert_eq!(back.raw.corners(), (1, 3));
    }

    #[test]
    fn test_int_2d_switches_layout() {
        let (_tmp, file) = scratch();
        let result = Integrate2dResult {
            radial: array![1.0, 2.0],
            azimuthal: array![-90.0, 90.0],
            sum_signal: array![[0.0, 1.0], [0.0, 2.0]],
            count: array![[0.0, 1.0], [0.0, 1.0]],
            intensity: array![[0.0, 1.0], [0.0, 2.0]],
            sigma: None,
            unit: RadialUnit::TwoThetaDeg,
        };
        let scanning = Integration2D::Scanning(IntData2D::from_result(&result, 1e-10, None));
        save_record(&file, "int_2d", &scanning).unwrap();
        assert_eq!(load_record::<Integration2D>(&file, "int_2d").unwrap(), scanning);

        let mut stat = IntData2DStatic::default();
        stat.i_tth_chi = array![[1.0, 2.0]];
        stat.i_q_chi = array![[1.5, 2.5]];
        stat.q_from_tth = true;
        let stat = Integration2D::Static(stat);
        save_record(&file, "int_2d", &stat).unwrap();
        let group = file.group("int_2d").unwrap();
        assert!(!group.link_exists("raw"));
        assert_eq!(load_record::<Integration2D>(&file, "int_2d").unwrap(), stat);
    }

    #[test]
    fn test_poni_record() {
        let (_tmp, file) = scratch();
        let poni = Poni {
            dist: 0.25,
            poni1: 0.01,
            poni2: 0.04,
            rot1: 0.001,
            rot2: -0.2,
            rot3: 0.0,
            wavelength: 9.762e-11,
            detector: Detector::pilatus_100k(),
        };
        save_record(&file, "poni", &poni).unwrap();
        let back: Poni = load_record(&file, "poni").unwrap();
        assert_relative_eq!(back.dist, poni.dist);
        assert_relative_eq!(back.rot2, poni.rot2);
        assert_eq!(back.detector, poni.detector);
        assert!(load_record::<Poni>(&file, "absent").is_err());
    }
}
