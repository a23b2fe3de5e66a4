use anyhow::{bail, format_err, Context, Error};
use flate2::bufread::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sc_types::Layer;
use sprs::TriMat;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Open a text file for line reading, transparently decompressing `.gz` files.
pub fn open_text(path: impl AsRef<Path>) -> Result<Box<dyn BufRead>, Error> {
    let path = path.as_ref();
    let file = BufReader::new(File::open(path).with_context(|| path.display().to_string())?);
    if path.extension().map_or(false, |e| e == "gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(file))
    }
}

/// Load a sparse matrix from (optionally gzipped) MatrixMarket coordinate format. Rows
/// and columns keep the file's orientation; repeated coordinates are summed.
pub fn load_mtx(path: impl AsRef<Path>) -> Result<Layer, Error> {
    let path = path.as_ref();
    let mut reader = open_text(path)?;
    let mut line = String::new();
    let mut mat: Option<TriMat<f64>> = None;
    let mut expected_nnz = 0;
    let mut line_no = 0;

    loop {
        line.clear();
        let sz = reader
            .read_line(&mut line)
            .with_context(|| path.display().to_string())?;
        if sz == 0 {
            break;
        }
        line_no += 1;
        if line.starts_with('%') || line.trim().is_empty() {
            continue;
        }
        let mut data = line.split_whitespace();
        match mat.as_mut() {
            None => {
                let nrow = data.next().ok_or_else(|| format_err!("no NROW"))?.parse::<usize>()?;
                let ncol = data.next().ok_or_else(|| format_err!("no NCOL"))?.parse::<usize>()?;
                expected_nnz = data.next().ok_or_else(|| format_err!("no NNZ"))?.parse::<usize>()?;
                mat = Some(TriMat::with_capacity((nrow, ncol), expected_nnz));
            }
            Some(m) => {
                let row = data
                    .next()
                    .ok_or_else(|| format_err!("missing ROW on line {}", line_no))?
                    .parse::<usize>()?;
                let col = data
                    .next()
                    .ok_or_else(|| format_err!("missing COL on line {}", line_no))?
                    .parse::<usize>()?;
                let val = data
                    .next()
                    .ok_or_else(|| format_err!("missing VAL on line {}", line_no))?
                    .parse::<f64>()?;
                if row == 0 || col == 0 || row > m.rows() || col > m.cols() {
                    bail!(
                        "{}: entry ({}, {}) on line {} is outside the {}x{} matrix",
                        path.display(),
                        row,
                        col,
                        line_no,
                        m.rows(),
                        m.cols()
                    );
                }
                m.add_triplet(row - 1, col - 1, val);
            }
        }
    }

    let Some(matrix) = mat else { bail!("{}: no matrix found", path.display()) };
    if matrix.nnz() != expected_nnz {
        bail!(
            "{}: header announces {} entries, found {}",
            path.display(),
            expected_nnz,
            matrix.nnz()
        );
    }
    Ok(matrix.to_csr())
}

/// Read one tab-separated column (0-based) of a (optionally gzipped) file.
pub fn read_tsv_column(path: impl AsRef<Path>, column: usize) -> Result<Vec<String>, Error> {
    let path = path.as_ref();
    let reader = open_text(path)?;
    let mut values = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line.with_context(|| path.display().to_string())?;
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let value = match fields.nth(column) {
            Some(v) => v,
            // single-column files (barcodes) serve every column request
            None if column > 0 && !line.contains('\t') => line.as_str(),
            None => bail!("{}: line {} has no column {}", path.display(), i + 1, column + 1),
        };
        values.push(value.to_string());
    }
    Ok(values)
}

/// Write a sparse matrix as gzipped MatrixMarket coordinate text.
pub fn write_mtx(mat: &Layer, path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| path.display().to_string())?;
    let mut writer = BufWriter::new(GzEncoder::new(file, Compression::default()));
    writeln!(writer, "%%MatrixMarket matrix coordinate real general")?;
    writeln!(writer, "{} {} {}", mat.rows(), mat.cols(), mat.nnz())?;
    for (&v, (r, c)) in mat.iter() {
        writeln!(writer, "{} {} {}", r + 1, c + 1, v)?;
    }
    writer.into_inner().map_err(|e| e.into_error())?.finish()?;
    Ok(())
}
