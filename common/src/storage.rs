use std::{
    fs::{self, File},
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("map output {0} has no shard {1}")]
    MissingShard(PathBuf, u32),

    #[error("{0} is not a file")]
    NotAFile(PathBuf),
}

pub(crate) fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Nombre del archivo de la partición `index` dentro de un directorio de salida de map.
pub fn shard_file(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("shard-{index}.txt"))
}

/// Almacenamiento de archivos intermedios compartido por master y workers.
pub trait Storage: Send + Sync {
    fn root(&self) -> &Path;

    /// Path nuevo y único (el archivo no se crea).
    fn allocate_path(&self) -> PathBuf;

    /// Directorio nuevo y único, ya creado.
    fn allocate_dir(&self) -> Result<PathBuf, StorageError>;

    fn open_read(&self, path: &Path) -> Result<Box<dyn BufRead + Send>, StorageError>;

    /// Crea (o trunca) un archivo para escritura, con sus directorios padre.
    fn create(&self, path: &Path) -> Result<Box<dyn Write + Send>, StorageError>;

    fn size_of(&self, path: &Path) -> Result<u64, StorageError>;

    /// Borra un archivo o directorio.
    fn remove(&self, path: &Path) -> Result<(), StorageError>;

    /// Borra todo lo que haya bajo la raíz salvo las entradas de `keep`
    /// (y los directorios que las contienen).
    fn clean(&self, keep: &[PathBuf]) -> Result<(), StorageError>;

    /// Resultado de reduce: un archivo que existe.
    fn check_file(&self, path: &Path) -> Result<(), StorageError> {
        if path.is_file() {
            Ok(())
        } else {
            Err(StorageError::NotAFile(path.to_path_buf()))
        }
    }

    /// Resultado de map: un directorio con los `workers` shards.
    fn check_map_output(&self, dir: &Path, workers: u32) -> Result<(), StorageError> {
        let dir = dir.to_path_buf();
        for index in 0..workers.max(1) {
            self.list_partition_files(std::slice::from_ref(&dir), index)?;
        }
        Ok(())
    }

    /// Para cada salida de map, el archivo de la partición `index`.
    fn list_partition_files(
        &self,
        map_outputs: &[PathBuf],
        index: u32,
    ) -> Result<Vec<PathBuf>, StorageError> {
        map_outputs
            .iter()
            .map(|dir| {
                let shard = shard_file(dir, index);
                if shard.is_file() {
                    Ok(shard)
                } else {
                    Err(StorageError::MissingShard(dir.clone(), index))
                }
            })
            .collect()
    }

    /// Copia los inputs en orden a `dest`.
    fn concatenate(&self, inputs: &[PathBuf], dest: &Path) -> Result<(), StorageError> {
        let mut out = self.create(dest)?;
        for input in inputs {
            let mut reader = self.open_read(input)?;
            io::copy(&mut reader, &mut out).map_err(io_err(dest))?;
        }
        out.flush().map_err(io_err(dest))?;
        Ok(())
    }
}

/// Implementación sobre el filesystem local, con raíz configurable.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Crea la raíz si no existe. Los paths que entrega son absolutos, así
    /// se pueden mandar por la red a procesos con otro directorio de trabajo.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_err(&root))?;
        let root = fs::canonicalize(&root).map_err(io_err(&root))?;
        Ok(Self { root })
    }
}

impl Storage for LocalStorage {
    fn root(&self) -> &Path {
        &self.root
    }

    fn allocate_path(&self) -> PathBuf {
        self.root.join(format!("{}.txt", Uuid::new_v4().simple()))
    }

    fn allocate_dir(&self) -> Result<PathBuf, StorageError> {
        let dir = self.root.join(Uuid::new_v4().simple().to_string());
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        Ok(dir)
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn BufRead + Send>, StorageError> {
        let file = File::open(path).map_err(io_err(path))?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn create(&self, path: &Path) -> Result<Box<dyn Write + Send>, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
        }
        let file = File::create(path).map_err(io_err(path))?;
        Ok(Box::new(BufWriter::new(file)))
    }

    fn size_of(&self, path: &Path) -> Result<u64, StorageError> {
        let meta = fs::metadata(path).map_err(io_err(path))?;
        Ok(meta.len())
    }

    fn remove(&self, path: &Path) -> Result<(), StorageError> {
        if path.is_dir() {
            fs::remove_dir_all(path).map_err(io_err(path))
        } else {
            fs::remove_file(path).map_err(io_err(path))
        }
    }

    fn clean(&self, keep: &[PathBuf]) -> Result<(), StorageError> {
        let entries = fs::read_dir(&self.root).map_err(io_err(&self.root))?;
        let mut removed = 0usize;
        for entry in entries {
            let path = entry.map_err(io_err(&self.root))?.path();
            if keep.iter().any(|k| k.starts_with(&path)) {
                continue;
            }
            self.remove(&path)?;
            removed += 1;
        }
        debug!("storage {}: {} entradas borradas", self.root.display(), removed);
        Ok(())
    }
}
