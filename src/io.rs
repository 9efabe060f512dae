//! Plain-text tensor import/export:
//!
//! ```text
//! dense|list
//! <tensor name>
//! <shape: space-separated extents>
//! <signature: space-separated base offsets>
//! <elements>
//! ```
//!
//! In `dense` layout, elements follow column-major generalized order (first
//! index fastest), any count per line. In `list` layout each line reads
//! `<value> <index_1> <index_2> ...` with zero-based indices. Real values
//! are written as a single token and round-trip bitwise for REAL64; complex
//! values use `re,im`.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::str::FromStr;

use ndarray::{ArrayD, IxDyn};
use num_complex::Complex64;

use crate::error::{Error, Result};
use crate::tensor::{Tensor, TensorShape, TensorSignature};
use crate::types::{ElementType, SOME_SPACE};

/// Element layout of a tensor file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFormat {
    Dense,
    List,
}

impl FromStr for StorageFormat {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        match name {
            "dense" => Ok(Self::Dense),
            "list" => Ok(Self::List),
            other => Err(Error::FileFormat(format!("unknown storage mode `{other}`"))),
        }
    }
}

fn format_value(value: Complex64, complex: bool) -> String {
    if complex {
        format!("{},{}", value.re, value.im)
    } else {
        format!("{}", value.re)
    }
}

fn parse_value(token: &str) -> Result<Complex64> {
    if let Some((re, im)) = token.split_once(',') {
        let re: f64 = re
            .parse()
            .map_err(|_| Error::FileFormat(format!("bad value `{token}`")))?;
        let im: f64 = im
            .parse()
            .map_err(|_| Error::FileFormat(format!("bad value `{token}`")))?;
        Ok(Complex64::new(re, im))
    } else {
        let re: f64 = token
            .parse()
            .map_err(|_| Error::FileFormat(format!("bad value `{token}`")))?;
        Ok(Complex64::new(re, 0.0))
    }
}

/// Column-major index of `flat` over `shape` (first index fastest).
fn column_major_index(flat: usize, shape: &[usize]) -> Vec<usize> {
    let mut idx = vec![0usize; shape.len()];
    let mut rest = flat;
    for (axis, &extent) in shape.iter().enumerate() {
        idx[axis] = rest % extent;
        rest /= extent;
    }
    idx
}

/// Writes a tensor body to `writer`.
pub fn write_tensor<W: Write>(
    writer: &mut W,
    tensor: &Tensor,
    data: &ArrayD<Complex64>,
    format: StorageFormat,
) -> Result<()> {
    let complex = tensor.element_type().is_complex();
    match format {
        StorageFormat::Dense => writeln!(writer, "dense")?,
        StorageFormat::List => writeln!(writer, "list")?,
    }
    writeln!(writer, "{}", tensor.name())?;
    writeln!(
        writer,
        "{}",
        tensor
            .shape()
            .extents()
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    )?;
    writeln!(
        writer,
        "{}",
        tensor
            .signature()
            .base_offsets()
            .iter()
            .map(|o| o.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    )?;

    let shape: Vec<usize> = tensor.shape().extents().iter().map(|&e| e as usize).collect();
    let volume: usize = shape.iter().product();
    match format {
        StorageFormat::Dense => {
            const PER_LINE: usize = 8;
            let mut line = Vec::with_capacity(PER_LINE);
            for flat in 0..volume {
                let idx = column_major_index(flat, &shape);
                line.push(format_value(data[IxDyn(&idx)], complex));
                if line.len() == PER_LINE || flat + 1 == volume {
                    writeln!(writer, "{}", line.join(" "))?;
                    line.clear();
                }
            }
        }
        StorageFormat::List => {
            for flat in 0..volume {
                let idx = column_major_index(flat, &shape);
                let value = data[IxDyn(&idx)];
                if value == Complex64::new(0.0, 0.0) {
                    continue;
                }
                let indices = idx
                    .iter()
                    .map(|i| i.to_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                writeln!(writer, "{} {}", format_value(value, complex), indices)?;
            }
        }
    }
    Ok(())
}

fn next_line<B: BufRead>(lines: &mut std::io::Lines<B>) -> Result<String> {
    lines
        .next()
        .transpose()?
        .ok_or_else(|| Error::FileFormat("unexpected end of file".to_string()))
}

/// Reads a tensor body written by [`write_tensor`].
pub fn read_tensor<R: Read>(reader: R) -> Result<(Tensor, ArrayD<Complex64>)> {
    let mut lines = BufReader::new(reader).lines();

    let format = StorageFormat::from_str(next_line(&mut lines)?.trim())?;
    let name = next_line(&mut lines)?.trim().to_string();
    if name.is_empty() {
        return Err(Error::FileFormat("missing tensor name".to_string()));
    }
    let extents: Vec<u64> = next_line(&mut lines)?
        .split_whitespace()
        .map(|t| {
            t.parse::<u64>()
                .map_err(|_| Error::FileFormat(format!("bad extent `{t}`")))
        })
        .collect::<Result<_>>()?;
    let offsets: Vec<u64> = next_line(&mut lines)?
        .split_whitespace()
        .map(|t| {
            t.parse::<u64>()
                .map_err(|_| Error::FileFormat(format!("bad base offset `{t}`")))
        })
        .collect::<Result<_>>()?;
    if offsets.len() != extents.len() {
        return Err(Error::FileFormat(format!(
            "signature length {} does not match shape length {}",
            offsets.len(),
            extents.len()
        )));
    }

    let shape: Vec<usize> = extents.iter().map(|&e| e as usize).collect();
    let volume: usize = shape.iter().product();
    let mut data = ArrayD::zeros(IxDyn(&shape));
    let mut saw_complex = false;

    match format {
        StorageFormat::Dense => {
            let mut flat = 0usize;
            while flat < volume {
                let line = next_line(&mut lines)?;
                for token in line.split_whitespace() {
                    if flat >= volume {
                        return Err(Error::FileFormat("too many elements".to_string()));
                    }
                    saw_complex |= token.contains(',');
                    let idx = column_major_index(flat, &shape);
                    data[IxDyn(&idx)] = parse_value(token)?;
                    flat += 1;
                }
            }
        }
        StorageFormat::List => {
            for line in lines {
                let line = line?;
                let mut tokens = line.split_whitespace();
                let Some(value_token) = tokens.next() else {
                    continue;
                };
                saw_complex |= value_token.contains(',');
                let value = parse_value(value_token)?;
                let idx: Vec<usize> = tokens
                    .map(|t| {
                        t.parse::<usize>()
                            .map_err(|_| Error::FileFormat(format!("bad index `{t}`")))
                    })
                    .collect::<Result<_>>()?;
                if idx.len() != shape.len() {
                    return Err(Error::FileFormat(format!(
                        "index tuple of length {} for a rank-{} tensor",
                        idx.len(),
                        shape.len()
                    )));
                }
                *data.get_mut(IxDyn(&idx)).ok_or_else(|| {
                    Error::FileFormat(format!("index {idx:?} out of bounds"))
                })? = value;
            }
        }
    }

    let signature = TensorSignature::new(
        offsets.iter().map(|&o| (SOME_SPACE, o)).collect(),
    );
    let mut tensor = Tensor::with_signature(&name, TensorShape::new(extents)?, signature)?;
    tensor.set_element_type(if saw_complex {
        ElementType::Complex64
    } else {
        ElementType::Real64
    });
    Ok((tensor, data))
}

pub fn write_tensor_file(
    path: &Path,
    tensor: &Tensor,
    data: &ArrayD<Complex64>,
    format: StorageFormat,
) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    write_tensor(&mut writer, tensor, data, format)
}

pub fn read_tensor_file(path: &Path) -> Result<(Tensor, ArrayD<Complex64>)> {
    read_tensor(File::open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn sample_tensor() -> (Tensor, ArrayD<Complex64>) {
        let tensor = Tensor::new("T0", TensorShape::from([2, 3]));
        let mut rng = StdRng::seed_from_u64(11);
        let data = ArrayD::from_shape_fn(IxDyn(&[2, 3]), |_| {
            Complex64::new(rng.gen_range(-1.0..1.0), 0.0)
        });
        (tensor, data)
    }

    #[test]
    fn test_dense_round_trip_bitwise() {
        let (tensor, data) = sample_tensor();
        let mut buffer = Vec::new();
        write_tensor(&mut buffer, &tensor, &data, StorageFormat::Dense).unwrap();
        let (restored, restored_data) = read_tensor(buffer.as_slice()).unwrap();
        assert_eq!(restored.name(), "T0");
        assert_eq!(restored.shape().extents(), &[2, 3]);
        assert_eq!(restored.element_type(), ElementType::Real64);
        for (a, b) in data.iter().zip(restored_data.iter()) {
            assert_eq!(a.re.to_bits(), b.re.to_bits());
        }
    }

    #[test]
    fn test_list_round_trip() {
        let (tensor, mut data) = sample_tensor();
        data[IxDyn(&[0, 1])] = Complex64::new(0.0, 0.0);
        let mut buffer = Vec::new();
        write_tensor(&mut buffer, &tensor, &data, StorageFormat::List).unwrap();
        let (_, restored) = read_tensor(buffer.as_slice()).unwrap();
        assert_eq!(data, restored);
    }

    #[test]
    fn test_complex_values() {
        let mut tensor = Tensor::new("C", TensorShape::from([2]));
        tensor.set_element_type(ElementType::Complex64);
        let data = ArrayD::from_shape_vec(
            IxDyn(&[2]),
            vec![Complex64::new(1.0, -2.0), Complex64::new(0.5, 0.25)],
        )
        .unwrap();
        let mut buffer = Vec::new();
        write_tensor(&mut buffer, &tensor, &data, StorageFormat::Dense).unwrap();
        let (restored, restored_data) = read_tensor(buffer.as_slice()).unwrap();
        assert_eq!(restored.element_type(), ElementType::Complex64);
        assert_eq!(data, restored_data);
    }

    #[test]
    fn test_dense_is_column_major() {
        let tensor = Tensor::new("M", TensorShape::from([2, 2]));
        let data = ArrayD::from_shape_vec(
            IxDyn(&[2, 2]),
            vec![
                Complex64::new(1.0, 0.0), // [0,0]
                Complex64::new(2.0, 0.0), // [0,1]
                Complex64::new(3.0, 0.0), // [1,0]
                Complex64::new(4.0, 0.0), // [1,1]
            ],
        )
        .unwrap();
        let mut buffer = Vec::new();
        write_tensor(&mut buffer, &tensor, &data, StorageFormat::Dense).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        // First index fastest: [0,0], [1,0], [0,1], [1,1].
        assert!(text.ends_with("1 3 2 4\n"));
    }

    #[test]
    fn test_malformed_rejected() {
        assert!(read_tensor("dense\n".as_bytes()).is_err());
        assert!(read_tensor("chunky\nT\n2\n0\n1 2\n".as_bytes()).is_err());
        assert!(read_tensor("dense\nT\n2\n0 0\n1 2\n".as_bytes()).is_err());
    }
}
