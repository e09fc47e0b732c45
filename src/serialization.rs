//! Binary persistence for trained models.
//!
//! Fixed-field-order little-endian layout. Every file starts with the
//! `HGMM` magic, a format version, and a payload tag; arrays and strings
//! are length-prefixed with a `u32`, and a stored length of 0 means
//! "absent", never "empty but present". Writers emit counts before
//! payloads and readers consume field-for-field.
//!
//! File writes go to a sibling temporary path and are renamed into place on
//! success, so a crash mid-write never leaves a truncated model at the
//! target path.

use crate::context::{ContextClass, ContextScheme, ContextualGmmParams};
use crate::error::{HablarError, Result};
use crate::gmm::{CovarianceKind, GaussianComponent, Gmm};
use crate::joint::{FeatureDescriptor, FeatureKind, JointGmm, JointGmmSet};
use crate::primitives::{Matrix, Vector};
use crate::trainer::GmmTrainerParams;
use log::debug;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Leading magic of every model file.
pub const MAGIC: &[u8; 4] = b"HGMM";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Payload tag following the header.
const PAYLOAD_GMM: u32 = 0;
const PAYLOAD_JOINT_GMM_SET: u32 = 1;

/// Serializes a GMM, header included.
///
/// # Errors
///
/// Returns an error on I/O failure.
pub fn write_gmm<W: Write>(writer: &mut W, gmm: &Gmm) -> Result<()> {
    write_header(writer, PAYLOAD_GMM)?;
    write_gmm_body(writer, gmm)
}

/// Deserializes a GMM written by [`write_gmm`].
///
/// # Errors
///
/// Returns an error on I/O failure, a malformed or truncated stream, an
/// unsupported format version, or a payload that is not a plain GMM.
pub fn read_gmm<R: Read>(reader: &mut R) -> Result<Gmm> {
    read_header(reader, PAYLOAD_GMM)?;
    read_gmm_body(reader)
}

/// Serializes a joint GMM set, header included.
///
/// # Errors
///
/// Returns an error on I/O failure.
pub fn write_joint_gmm_set<W: Write>(writer: &mut W, set: &JointGmmSet) -> Result<()> {
    write_header(writer, PAYLOAD_JOINT_GMM_SET)?;
    write_contextual_params(writer, set.context())?;
    write_u32(writer, u32::try_from(set.gmms().len()).map_err(count_overflow)?)?;
    for joint in set.gmms() {
        write_joint_gmm(writer, joint)?;
    }
    Ok(())
}

/// Deserializes a joint GMM set written by [`write_joint_gmm_set`].
///
/// # Errors
///
/// Returns an error on I/O failure, a malformed or truncated stream, an
/// unsupported format version, or a payload that is not a joint GMM set.
pub fn read_joint_gmm_set<R: Read>(reader: &mut R) -> Result<JointGmmSet> {
    read_header(reader, PAYLOAD_JOINT_GMM_SET)?;
    let context = read_contextual_params(reader)?;
    let count = read_u32(reader)? as usize;
    let mut gmms = Vec::with_capacity(count);
    for _ in 0..count {
        gmms.push(read_joint_gmm(reader)?);
    }
    JointGmmSet::new(gmms, context)
}

/// Writes a GMM to `path` via a sibling temporary file.
///
/// # Errors
///
/// Returns an error on I/O failure; the target path is left untouched.
pub fn save_gmm<P: AsRef<Path>>(path: P, gmm: &Gmm) -> Result<()> {
    save_atomically(path.as_ref(), |writer| write_gmm(writer, gmm))
}

/// Loads a GMM from `path`.
///
/// # Errors
///
/// See [`read_gmm`].
pub fn load_gmm<P: AsRef<Path>>(path: P) -> Result<Gmm> {
    let mut reader = BufReader::new(File::open(path)?);
    read_gmm(&mut reader)
}

/// Writes a joint GMM set to `path` via a sibling temporary file.
///
/// # Errors
///
/// Returns an error on I/O failure; the target path is left untouched.
pub fn save_joint_gmm_set<P: AsRef<Path>>(path: P, set: &JointGmmSet) -> Result<()> {
    save_atomically(path.as_ref(), |writer| write_joint_gmm_set(writer, set))
}

/// Loads a joint GMM set from `path`.
///
/// # Errors
///
/// See [`read_joint_gmm_set`].
pub fn load_joint_gmm_set<P: AsRef<Path>>(path: P) -> Result<JointGmmSet> {
    let mut reader = BufReader::new(File::open(path)?);
    read_joint_gmm_set(&mut reader)
}

fn save_atomically(path: &Path, write: impl FnOnce(&mut BufWriter<File>) -> Result<()>) -> Result<()> {
    let mut temp_path = path.as_os_str().to_owned();
    temp_path.push(".tmp");
    let temp_path = Path::new(&temp_path);

    let result = (|| {
        let mut writer = BufWriter::new(File::create(temp_path)?);
        write(&mut writer)?;
        writer.flush()?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            fs::rename(temp_path, path)?;
            debug!("model written to {}", path.display());
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(temp_path);
            Err(e)
        }
    }
}

fn write_header<W: Write>(writer: &mut W, payload: u32) -> Result<()> {
    writer.write_all(MAGIC)?;
    write_u32(writer, FORMAT_VERSION)?;
    write_u32(writer, payload)
}

fn read_header<R: Read>(reader: &mut R, expected_payload: u32) -> Result<()> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(HablarError::FormatError {
            message: format!("bad magic {magic:?}, not a model file"),
        });
    }
    let version = read_u32(reader)?;
    if version != FORMAT_VERSION {
        return Err(HablarError::UnsupportedVersion {
            found: version,
            supported: FORMAT_VERSION,
        });
    }
    let payload = read_u32(reader)?;
    if payload != expected_payload {
        return Err(HablarError::FormatError {
            message: format!("payload tag {payload}, expected {expected_payload}"),
        });
    }
    Ok(())
}

fn write_gmm_body<W: Write>(writer: &mut W, gmm: &Gmm) -> Result<()> {
    write_u32(writer, u32::try_from(gmm.n_components()).map_err(count_overflow)?)?;
    for &weight in gmm.weights() {
        write_f64(writer, weight)?;
    }
    for component in gmm.components() {
        write_component(writer, component)?;
    }
    Ok(())
}

fn read_gmm_body<R: Read>(reader: &mut R) -> Result<Gmm> {
    let count = read_u32(reader)? as usize;
    if count == 0 {
        return Err(HablarError::FormatError {
            message: "mixture with zero components".to_string(),
        });
    }
    let mut weights = Vec::with_capacity(count);
    for _ in 0..count {
        weights.push(read_f64(reader)?);
    }
    let mut components = Vec::with_capacity(count);
    for _ in 0..count {
        components.push(read_component(reader)?);
    }
    Gmm::new(components, weights)
}

fn write_component<W: Write>(writer: &mut W, component: &GaussianComponent) -> Result<()> {
    let kind = match component.kind() {
        CovarianceKind::Diagonal => 0u32,
        CovarianceKind::Full => 1u32,
    };
    write_u32(writer, kind)?;
    write_vector(writer, component.mean())?;
    write_matrix(writer, component.covariance())
}

/// Reads one component, rebuilding its cached inverse, determinant, and
/// normalization constants through the normal constructors.
fn read_component<R: Read>(reader: &mut R) -> Result<GaussianComponent> {
    let kind = read_u32(reader)?;
    let mean = read_vector(reader)?;
    let covariance = read_matrix(reader)?;
    match kind {
        0 => {
            let variances = Vector::from_vec(covariance.as_slice().to_vec());
            GaussianComponent::diagonal(mean, variances)
        }
        1 => GaussianComponent::full(mean, covariance),
        other => Err(HablarError::FormatError {
            message: format!("unknown covariance kind tag {other}"),
        }),
    }
}

fn write_contextual_params<W: Write>(writer: &mut W, params: &ContextualGmmParams) -> Result<()> {
    write_u32(writer, params.scheme().code())?;
    write_u32(writer, u32::try_from(params.n_classes()).map_err(count_overflow)?)?;
    for class in params.classes() {
        write_context_class(writer, class)?;
    }
    Ok(())
}

/// Reads the partition and rebuilds the phone lookup index.
fn read_contextual_params<R: Read>(reader: &mut R) -> Result<ContextualGmmParams> {
    let scheme = ContextScheme::from_code(read_u32(reader)?)?;
    let count = read_u32(reader)? as usize;
    let mut classes = Vec::with_capacity(count);
    for _ in 0..count {
        classes.push(read_context_class(reader)?);
    }
    Ok(ContextualGmmParams::from_classes(scheme, classes))
}

fn write_context_class<W: Write>(writer: &mut W, class: &ContextClass) -> Result<()> {
    write_string(writer, &class.name)?;
    write_u32(writer, u32::try_from(class.phones.len()).map_err(count_overflow)?)?;
    for phone in &class.phones {
        write_string(writer, phone)?;
    }
    write_trainer_params(writer, &class.trainer_params)
}

fn read_context_class<R: Read>(reader: &mut R) -> Result<ContextClass> {
    let name = read_string(reader)?;
    let count = read_u32(reader)? as usize;
    let mut phones = Vec::with_capacity(count);
    for _ in 0..count {
        phones.push(read_string(reader)?);
    }
    let trainer_params = read_trainer_params(reader)?;
    Ok(ContextClass {
        name,
        phones,
        trainer_params,
    })
}

fn write_trainer_params<W: Write>(writer: &mut W, params: &GmmTrainerParams) -> Result<()> {
    write_u64(writer, params.total_components as u64)?;
    write_bool(writer, params.is_diagonal_covariance)?;
    write_u64(writer, params.kmeans_max_iterations as u64)?;
    write_f64(writer, params.kmeans_min_cluster_percent)?;
    write_u64(writer, params.em_min_iterations as u64)?;
    write_u64(writer, params.em_max_iterations as u64)?;
    write_bool(writer, params.update_covariances)?;
    write_f64(writer, params.tiny_log_likelihood_change_percent)?;
    write_f64(writer, params.min_covariance)
}

fn read_trainer_params<R: Read>(reader: &mut R) -> Result<GmmTrainerParams> {
    Ok(GmmTrainerParams {
        total_components: read_u64(reader)? as usize,
        is_diagonal_covariance: read_bool(reader)?,
        kmeans_max_iterations: read_u64(reader)? as usize,
        kmeans_min_cluster_percent: read_f64(reader)?,
        em_min_iterations: read_u64(reader)? as usize,
        em_max_iterations: read_u64(reader)? as usize,
        update_covariances: read_bool(reader)?,
        tiny_log_likelihood_change_percent: read_f64(reader)?,
        min_covariance: read_f64(reader)?,
    })
}

fn write_joint_gmm<W: Write>(writer: &mut W, joint: &JointGmm) -> Result<()> {
    write_feature_descriptor(writer, joint.source())?;
    write_feature_descriptor(writer, joint.target())?;
    write_gmm_body(writer, joint.gmm())
}

fn read_joint_gmm<R: Read>(reader: &mut R) -> Result<JointGmm> {
    let source = read_feature_descriptor(reader)?;
    let target = read_feature_descriptor(reader)?;
    let gmm = read_gmm_body(reader)?;
    JointGmm::new(gmm, source, target)
}

fn write_feature_descriptor<W: Write>(writer: &mut W, descriptor: FeatureDescriptor) -> Result<()> {
    write_u32(writer, descriptor.kind.code())?;
    write_u32(writer, u32::try_from(descriptor.dimension).map_err(count_overflow)?)
}

fn read_feature_descriptor<R: Read>(reader: &mut R) -> Result<FeatureDescriptor> {
    let kind = FeatureKind::from_code(read_u32(reader)?)?;
    let dimension = read_u32(reader)? as usize;
    Ok(FeatureDescriptor { kind, dimension })
}

fn write_vector<W: Write>(writer: &mut W, vector: &Vector<f64>) -> Result<()> {
    write_u32(writer, u32::try_from(vector.len()).map_err(count_overflow)?)?;
    for &value in vector.iter() {
        write_f64(writer, value)?;
    }
    Ok(())
}

fn read_vector<R: Read>(reader: &mut R) -> Result<Vector<f64>> {
    let len = read_u32(reader)? as usize;
    let mut data = Vec::with_capacity(len);
    for _ in 0..len {
        data.push(read_f64(reader)?);
    }
    Ok(Vector::from_vec(data))
}

fn write_matrix<W: Write>(writer: &mut W, matrix: &Matrix<f64>) -> Result<()> {
    write_u32(writer, u32::try_from(matrix.n_rows()).map_err(count_overflow)?)?;
    write_u32(writer, u32::try_from(matrix.n_cols()).map_err(count_overflow)?)?;
    for &value in matrix.as_slice() {
        write_f64(writer, value)?;
    }
    Ok(())
}

fn read_matrix<R: Read>(reader: &mut R) -> Result<Matrix<f64>> {
    let rows = read_u32(reader)? as usize;
    let cols = read_u32(reader)? as usize;
    let mut data = Vec::with_capacity(rows * cols);
    for _ in 0..rows * cols {
        data.push(read_f64(reader)?);
    }
    Matrix::from_vec(rows, cols, data)
}

fn write_string<W: Write>(writer: &mut W, s: &str) -> Result<()> {
    write_u32(writer, u32::try_from(s.len()).map_err(count_overflow)?)?;
    writer.write_all(s.as_bytes())?;
    Ok(())
}

fn read_string<R: Read>(reader: &mut R) -> Result<String> {
    let len = read_u32(reader)? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| HablarError::FormatError {
        message: format!("invalid UTF-8 in string field: {e}"),
    })
}

fn write_bool<W: Write>(writer: &mut W, value: bool) -> Result<()> {
    writer.write_all(&[u8::from(value)])?;
    Ok(())
}

fn read_bool<R: Read>(reader: &mut R) -> Result<bool> {
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte)?;
    match byte[0] {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(HablarError::FormatError {
            message: format!("invalid boolean byte {other}"),
        }),
    }
}

fn write_u32<W: Write>(writer: &mut W, value: u32) -> Result<()> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn write_u64<W: Write>(writer: &mut W, value: u64) -> Result<()> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

fn write_f64<W: Write>(writer: &mut W, value: f64) -> Result<()> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn read_f64<R: Read>(reader: &mut R) -> Result<f64> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(f64::from_le_bytes(bytes))
}

fn count_overflow(_: std::num::TryFromIntError) -> HablarError {
    HablarError::FormatError {
        message: "count exceeds u32 range".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{phonology, Phone};
    use std::io::Cursor;

    fn diagonal_gmm() -> Gmm {
        let components = vec![
            GaussianComponent::diagonal(
                Vector::from_slice(&[0.0, 1.0]),
                Vector::from_slice(&[1.0, 2.0]),
            )
            .unwrap(),
            GaussianComponent::diagonal(
                Vector::from_slice(&[5.0, 6.0]),
                Vector::from_slice(&[0.5, 0.25]),
            )
            .unwrap(),
        ];
        Gmm::new(components, vec![0.3, 0.7]).unwrap()
    }

    fn full_gmm() -> Gmm {
        let cov = Matrix::from_vec(2, 2, vec![2.0, 0.3, 0.3, 1.5]).unwrap();
        let components = vec![GaussianComponent::full(Vector::from_slice(&[1.0, 2.0]), cov).unwrap()];
        Gmm::new(components, vec![1.0]).unwrap()
    }

    fn small_set() -> JointGmmSet {
        let inventory = vec![
            Phone::new("_", phonology::PAUSE),
            Phone::new("a", phonology::VOWEL),
        ];
        let context = ContextualGmmParams::from_inventory(
            crate::context::ContextScheme::SilenceSpeech,
            &inventory,
            &[GmmTrainerParams::default()],
        )
        .unwrap();
        let descriptor = FeatureDescriptor {
            kind: FeatureKind::MelFrequencyCepstral,
            dimension: 1,
        };
        let gmms = (0..2)
            .map(|i| {
                let gmm = Gmm::new(
                    vec![GaussianComponent::diagonal(
                        Vector::from_slice(&[i as f64, 0.0]),
                        Vector::ones(2),
                    )
                    .unwrap()],
                    vec![1.0],
                )
                .unwrap();
                JointGmm::new(gmm, descriptor, descriptor).unwrap()
            })
            .collect();
        JointGmmSet::new(gmms, context).unwrap()
    }

    #[test]
    fn test_gmm_round_trip() {
        let gmm = diagonal_gmm();
        let mut buffer = Vec::new();
        write_gmm(&mut buffer, &gmm).unwrap();
        let restored = read_gmm(&mut Cursor::new(buffer)).unwrap();
        assert_eq!(gmm, restored);
    }

    #[test]
    fn test_full_covariance_round_trip() {
        let gmm = full_gmm();
        let mut buffer = Vec::new();
        write_gmm(&mut buffer, &gmm).unwrap();
        let restored = read_gmm(&mut Cursor::new(buffer)).unwrap();
        // Cached inverse and constants are rebuilt to identical values.
        assert_eq!(gmm, restored);
    }

    #[test]
    fn test_joint_set_round_trip() {
        let set = small_set();
        let mut buffer = Vec::new();
        write_joint_gmm_set(&mut buffer, &set).unwrap();
        let restored = read_joint_gmm_set(&mut Cursor::new(buffer)).unwrap();
        assert_eq!(set, restored);
        // The lookup index is rebuilt on read.
        assert_eq!(restored.context().class_index("_"), Some(0));
        assert_eq!(restored.context().class_index("a"), Some(1));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.hgmm");
        let set = small_set();
        save_joint_gmm_set(&path, &set).unwrap();
        let restored = load_joint_gmm_set(&path).unwrap();
        assert_eq!(set, restored);
        // No leftover temporary file.
        assert!(!dir.path().join("model.hgmm.tmp").exists());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut buffer = Vec::new();
        write_gmm(&mut buffer, &diagonal_gmm()).unwrap();
        buffer[0] = b'X';
        let result = read_gmm(&mut Cursor::new(buffer));
        assert!(matches!(result, Err(HablarError::FormatError { .. })));
    }

    #[test]
    fn test_future_version_rejected() {
        let mut buffer = Vec::new();
        write_gmm(&mut buffer, &diagonal_gmm()).unwrap();
        buffer[4..8].copy_from_slice(&2u32.to_le_bytes());
        let result = read_gmm(&mut Cursor::new(buffer));
        assert!(matches!(
            result,
            Err(HablarError::UnsupportedVersion {
                found: 2,
                supported: FORMAT_VERSION
            })
        ));
    }

    #[test]
    fn test_payload_tag_mismatch() {
        let mut buffer = Vec::new();
        write_gmm(&mut buffer, &diagonal_gmm()).unwrap();
        let result = read_joint_gmm_set(&mut Cursor::new(buffer));
        assert!(matches!(result, Err(HablarError::FormatError { .. })));
    }

    #[test]
    fn test_truncated_stream_rejected() {
        let mut buffer = Vec::new();
        write_gmm(&mut buffer, &diagonal_gmm()).unwrap();
        buffer.truncate(buffer.len() / 2);
        let result = read_gmm(&mut Cursor::new(buffer));
        assert!(matches!(result, Err(HablarError::Io(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = load_gmm("/nonexistent/path/model.hgmm");
        assert!(matches!(result, Err(HablarError::Io(_))));
    }

    #[test]
    fn test_failed_save_leaves_target_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("model.hgmm");
        assert!(save_gmm(&path, &diagonal_gmm()).is_err());
        assert!(!path.exists());
    }
}
