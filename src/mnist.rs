use crate::config::TrainingConfig;
use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use log::{debug, info, warn};
use ndarray::{Array2, Axis};
use ndarray_rand::rand::{Rng, seq::SliceRandom};
use reqwest::blocking::Client;
use std::{
    fs::{self, File},
    io::Read,
    path::{Path, PathBuf},
};

pub const TRAIN_IMAGES: &str = "train-images-idx3-ubyte.gz";
pub const TRAIN_LABELS: &str = "train-labels-idx1-ubyte.gz";
pub const TEST_IMAGES: &str = "t10k-images-idx3-ubyte.gz";
pub const TEST_LABELS: &str = "t10k-labels-idx1-ubyte.gz";

const IMAGE_MAGIC: u32 = 2051;
const LABEL_MAGIC: u32 = 2049;

/// A set of samples stored row-wise: row `i` of `images` is a flattened image
/// with pixels scaled to `[0, 1]`, and row `i` of `labels` is its one-hot
/// encoded class.
#[derive(Debug, Clone)]
pub struct Samples {
    pub images: Array2<f32>,
    pub labels: Array2<f32>,
}

impl Samples {
    pub fn new(images: Array2<f32>, labels: Array2<f32>) -> Result<Samples> {
        if images.nrows() != labels.nrows() {
            return Err(Error::CountMismatch {
                images: images.nrows(),
                labels: labels.nrows(),
            });
        }
        Ok(Samples { images, labels })
    }

    pub fn len(&self) -> usize {
        self.images.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the given rows, in the given order, into a new set of samples.
    pub fn select(&self, indices: &[usize]) -> Samples {
        Samples {
            images: self.images.select(Axis(0), indices),
            labels: self.labels.select(Axis(0), indices),
        }
    }
}

/// The three splits used by a training run. None of them share a sample.
#[derive(Debug, Clone)]
pub struct MnistData {
    pub train: Samples,
    pub validation: Samples,
    pub test: Samples,
}

impl MnistData {
    /// Download (if not cached) and decode the four MNIST archives, then carve
    /// the validation split out of the training set.
    pub fn load<R: Rng + ?Sized>(config: &TrainingConfig, rng: &mut R) -> Result<MnistData> {
        let dir = Path::new(&config.data_dir);
        for name in [TRAIN_IMAGES, TRAIN_LABELS, TEST_IMAGES, TEST_LABELS] {
            fetch(&config.base_url, dir, name)?;
        }

        let train = read_samples(
            &dir.join(TRAIN_IMAGES),
            &dir.join(TRAIN_LABELS),
            config.input_size,
            config.num_classes,
        )?;
        let test = read_samples(
            &dir.join(TEST_IMAGES),
            &dir.join(TEST_LABELS),
            config.input_size,
            config.num_classes,
        )?;

        let data = MnistData::from_parts(train, test, config.validation_fraction, rng);
        info!(
            "Loaded MNIST: {} training, {} validation, {} test samples",
            data.train.len(),
            data.validation.len(),
            data.test.len()
        );
        Ok(data)
    }

    /// Split `train` into training and validation samples. The split is made
    /// once here and is never reshuffled afterwards.
    pub fn from_parts<R: Rng + ?Sized>(
        train: Samples,
        test: Samples,
        validation_fraction: f64,
        rng: &mut R,
    ) -> MnistData {
        let (train_indices, validation_indices) =
            split_indices(train.len(), validation_fraction, rng);
        MnistData {
            validation: train.select(&validation_indices),
            train: train.select(&train_indices),
            test,
        }
    }
}

/// Shuffle `0..n` and cut it in two. The second part holds `floor(n * fraction)`
/// indices and the first part holds the rest.
pub fn split_indices<R: Rng + ?Sized>(
    n: usize,
    fraction: f64,
    rng: &mut R,
) -> (Vec<usize>, Vec<usize>) {
    let validation_len = ((n as f64 * fraction).floor() as usize).min(n);
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(rng);
    let validation = indices.split_off(n - validation_len);
    (indices, validation)
}

/// Make sure `name` exists in `dir`, downloading it from `base_url` if not.
pub fn fetch(base_url: &str, dir: &Path, name: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    if path.exists() {
        debug!("Using cached {}", path.display());
        return Ok(path);
    }

    fs::create_dir_all(dir)?;
    download(&format!("{base_url}{name}"), &path)?;
    Ok(path)
}

// Fetch the whole file into memory and write it next to its final location
// first. Only a complete file gets renamed into place, so a file in the cache
// directory is always a full download.
fn download(url: &str, dest: &Path) -> Result<()> {
    info!("Downloading {url}");
    let to_error = |source| Error::Download {
        url: url.to_string(),
        source,
    };
    // The blocking client gives up after 30 seconds by default, and that
    // limit includes reading the body. The training archive is about 10 MB,
    // so on a slow link it could never finish. Downloads wait as long as the
    // connection stays open.
    let client = Client::builder().timeout(None).build().map_err(to_error)?;
    let bytes = client
        .get(url)
        .send()
        .and_then(|response| response.error_for_status())
        .map_err(to_error)?
        .bytes()
        .map_err(to_error)?;

    let mut partial = dest.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    if let Err(error) = fs::write(&partial, &bytes).and_then(|()| fs::rename(&partial, dest)) {
        warn!("Discarding partial download {}", partial.display());
        let _ = fs::remove_file(&partial);
        return Err(error.into());
    }
    Ok(())
}

/// Decode a gzipped image archive and its label archive into samples.
pub fn read_samples(
    images_path: &Path,
    labels_path: &Path,
    input_size: usize,
    num_classes: usize,
) -> Result<Samples> {
    let images = parse_images(&read_gz(images_path)?, &images_path.display().to_string())?;
    let labels = parse_labels(&read_gz(labels_path)?, &labels_path.display().to_string())?;

    if images.nrows() != labels.len() {
        return Err(Error::CountMismatch {
            images: images.nrows(),
            labels: labels.len(),
        });
    }
    if images.ncols() != input_size {
        return Err(Error::ImageSize {
            expected: input_size,
            found: images.ncols(),
        });
    }

    Samples::new(images, one_hot(&labels, num_classes)?)
}

fn read_gz(path: &Path) -> Result<Vec<u8>> {
    let mut unzipped_file = GzDecoder::new(File::open(path)?);
    let mut bytes = Vec::new();
    unzipped_file.read_to_end(&mut bytes)?;
    Ok(bytes)
}

// An IDX file starts with a big-endian u32 magic number followed by one
// big-endian u32 per dimension. Everything after that is the raw payload.
// Returns the dimensions and the payload, which must hold exactly the number
// of bytes the dimensions promise.
//
// For MNIST the layouts are:
//
//   images: 2051, count, rows, columns, then count * rows * columns pixels
//   labels: 2049, count, then count labels
//
// Every pixel and label is a single unsigned byte, so the payload length in
// bytes is the product of the dimensions.
fn read_idx<'a>(
    bytes: &'a [u8],
    file: &str,
    magic: u32,
    dimensions: usize,
) -> Result<(Vec<usize>, &'a [u8])> {
    // One u32 for the magic number and one for each dimension.
    let header_len = 4 * (dimensions + 1);
    if bytes.len() < header_len {
        return Err(Error::Truncated {
            file: file.to_string(),
            expected: header_len,
            found: bytes.len(),
        });
    }

    // The header splits into 4-byte words. `chunks_exact` cannot leave a
    // short chunk here because `header_len` is a multiple of 4.
    let (header, payload) = bytes.split_at(header_len);
    let mut header = header
        .chunks_exact(4)
        .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));

    // A wrong magic number usually means the image and label archives were
    // swapped, or the file is not IDX at all.
    let found = header.next().unwrap_or_default();
    if found != magic {
        return Err(Error::BadMagic {
            file: file.to_string(),
            expected: magic,
            found,
        });
    }

    // The dimensions come from the file, so their product can overflow on a
    // corrupt header. An overflowing length can never match, so saturate it
    // and let the comparison below report the file as truncated.
    let dims: Vec<usize> = header.map(|dim| dim as usize).collect();
    let expected = dims
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .and_then(|payload_len| payload_len.checked_add(header_len))
        .unwrap_or(usize::MAX);
    if bytes.len() != expected {
        return Err(Error::Truncated {
            file: file.to_string(),
            expected,
            found: bytes.len(),
        });
    }
    Ok((dims, payload))
}

/// Decode an image archive (magic 2051) into an `[images, rows * columns]`
/// array with every pixel divided by 255.
pub fn parse_images(bytes: &[u8], file: &str) -> Result<Array2<f32>> {
    let (dims, payload) = read_idx(bytes, file, IMAGE_MAGIC, 3)?;
    // Pixels are stored row by row, image after image, so each image's
    // rows * columns bytes are contiguous and become one flattened row of the
    // matrix without any reordering. Dividing by 255 maps the 0..=255 grey
    // levels onto [0, 1].
    let (images, pixels) = (dims[0], dims[1] * dims[2]);
    let scaled = payload.iter().map(|&value| value as f32 / 255.0).collect();
    Ok(Array2::from_shape_vec((images, pixels), scaled)?)
}

/// Decode a label archive (magic 2049) into one byte per label.
pub fn parse_labels(bytes: &[u8], file: &str) -> Result<Vec<u8>> {
    let (_, payload) = read_idx(bytes, file, LABEL_MAGIC, 1)?;
    Ok(payload.to_vec())
}

/// Turn each label into a row that is 1.0 at the label's index and 0.0
/// everywhere else.
pub fn one_hot(labels: &[u8], num_classes: usize) -> Result<Array2<f32>> {
    let mut encoded = Array2::zeros((labels.len(), num_classes));
    for (mut row, &label) in encoded.outer_iter_mut().zip(labels) {
        if label as usize >= num_classes {
            return Err(Error::LabelOutOfRange {
                label,
                classes: num_classes,
            });
        }
        row[label as usize] = 1.0;
    }
    Ok(encoded)
}
