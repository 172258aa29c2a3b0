use std::{
    io::{BufRead, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::storage::{io_err, Storage, StorageError};

pub const DEFAULT_LINES_PER_PARTITION: usize = 500;

/// Cómo se corta el archivo de entrada en tareas map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionPolicy {
    /// Una partición cada N líneas.
    FixedLines(usize),
    /// Particiones de ~ceil(S/W) bytes: nunca más de W.
    #[default]
    Balanced,
}

/// Hash de 32 bits sobre la key: `h = 31*h + c (mod 2^32)`, leído como i32.
pub fn hashcode(key: &str) -> i32 {
    let mut h: u32 = 0;
    for c in key.chars() {
        h = h.wrapping_mul(31).wrapping_add(c as u32);
    }
    h as i32
}

/// Partición de reduce a la que va una key. Siempre en `0..workers`,
/// también para hashes negativos.
pub fn shard_for(key: &str, workers: u32) -> u32 {
    let w = i64::from(workers.max(1));
    i64::from(hashcode(key)).rem_euclid(w) as u32
}

/// Clave de orden usada tanto al volcar la salida de map como al reducir.
pub fn shard_sort_key(key: &str, workers: u32) -> (u32, &str) {
    (shard_for(key, workers), key)
}

/// La key de una línea `key\tvalue` (toda la línea si no hay tab).
pub fn line_key(line: &str) -> &str {
    let line = line.trim_end_matches(['\n', '\r']);
    match line.split_once('\t') {
        Some((key, _)) => key,
        None => line,
    }
}

/// Corta `input` según la política. Devuelve los paths de las particiones, en orden.
pub fn partition(
    storage: &dyn Storage,
    input: &Path,
    policy: PartitionPolicy,
    workers: u32,
) -> Result<Vec<PathBuf>, StorageError> {
    match policy {
        PartitionPolicy::FixedLines(n) => fixed_size_partition(storage, input, n),
        PartitionPolicy::Balanced => size_balanced_partition(storage, input, workers),
    }
}

/// Una partición cada `lines_per_partition` líneas; la última puede ser más corta.
pub fn fixed_size_partition(
    storage: &dyn Storage,
    input: &Path,
    lines_per_partition: usize,
) -> Result<Vec<PathBuf>, StorageError> {
    let per = lines_per_partition.max(1);
    split_by(storage, input, |_, lines| lines >= per)
}

/// Particiones de `ceil(S/W)` bytes: se abre una nueva cuando la actual llega
/// al tamaño. Con el redondeo hacia arriba nunca salen más de W.
pub fn size_balanced_partition(
    storage: &dyn Storage,
    input: &Path,
    workers: u32,
) -> Result<Vec<PathBuf>, StorageError> {
    let size = storage.size_of(input)?;
    let chunk = size.div_ceil(u64::from(workers.max(1))).max(1);
    split_by(storage, input, |bytes, _| bytes >= chunk)
}

/// Copia `input` línea a línea (bytes exactos) cortando cuando `full(bytes, lines)`.
/// Si algo falla no quedan particiones a medias en el storage.
fn split_by(
    storage: &dyn Storage,
    input: &Path,
    full: impl Fn(u64, usize) -> bool,
) -> Result<Vec<PathBuf>, StorageError> {
    let mut parts = Vec::new();
    match write_parts(storage, input, full, &mut parts) {
        Ok(()) => {
            debug!("{} partido en {} particiones", input.display(), parts.len());
            Ok(parts)
        }
        Err(e) => {
            for part in &parts {
                if let Err(cleanup) = storage.remove(part) {
                    debug!("no se pudo borrar {}: {cleanup}", part.display());
                }
            }
            Err(e)
        }
    }
}

/// Cada archivo se anota en `parts` apenas se crea.
fn write_parts(
    storage: &dyn Storage,
    input: &Path,
    full: impl Fn(u64, usize) -> bool,
    parts: &mut Vec<PathBuf>,
) -> Result<(), StorageError> {
    let mut reader = storage.open_read(input)?;
    let mut current: Option<Box<dyn Write + Send>> = None;
    let mut bytes = 0u64;
    let mut lines = 0usize;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf).map_err(io_err(input))?;
        if n == 0 {
            break;
        }

        if current.is_none() {
            let path = storage.allocate_path();
            parts.push(path.clone());
            current = Some(storage.create(&path)?);
        }
        let path = parts.last().map(PathBuf::as_path).unwrap_or(input);
        if let Some(out) = current.as_mut() {
            out.write_all(&buf).map_err(io_err(path))?;
        }
        bytes += n as u64;
        lines += 1;

        if full(bytes, lines) {
            if let Some(mut out) = current.take() {
                out.flush().map_err(io_err(path))?;
            }
            bytes = 0;
            lines = 0;
        }
    }

    if let Some(mut out) = current.take() {
        let path = parts.last().map(PathBuf::as_path).unwrap_or(input);
        out.flush().map_err(io_err(path))?;
    }
    Ok(())
}

/// Ordena (estable) las líneas `key\tvalue` de `path` por `(hash(key) mod W, key)`.
pub fn sort_file_by_shard(
    storage: &dyn Storage,
    path: &Path,
    workers: u32,
) -> Result<(), StorageError> {
    let reader = storage.open_read(path)?;
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(io_err(path))?;
        if !line.is_empty() {
            lines.push(line);
        }
    }

    lines.sort_by(|a, b| {
        shard_sort_key(line_key(a), workers).cmp(&shard_sort_key(line_key(b), workers))
    });

    let mut out = storage.create(path)?;
    for line in &lines {
        writeln!(out, "{line}").map_err(io_err(path))?;
    }
    out.flush().map_err(io_err(path))?;
    Ok(())
}
