//! `state.json` under the kernel home directory.

use super::{sanitize_module_dir, KernelState, KernelStorage, StorageError};
use crate::types::ModuleId;
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};

const STATE_FILE: &str = "state.json";
const MODULES_DIR: &str = "modules";

/// File-backed store rooted at a home directory.
#[derive(Debug, Clone)]
pub struct FileKernelStorage {
    home: PathBuf,
    state_file: PathBuf,
    read_only: bool,
}

impl FileKernelStorage {
    #[must_use]
    pub fn new(home: impl Into<PathBuf>, read_only: bool) -> Self {
        let home = home.into();
        Self {
            state_file: home.join(STATE_FILE),
            home,
            read_only,
        }
    }

    #[must_use]
    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
        move |source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl KernelStorage for FileKernelStorage {
    fn load_state(&self) -> Result<KernelState, StorageError> {
        let text = match fs::read_to_string(&self.state_file) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(KernelState::default())
            }
            Err(err) => return Err(Self::io_error(&self.state_file)(err)),
        };
        if text.trim().is_empty() {
            return Ok(KernelState::default());
        }
        serde_json::from_str(&text).map_err(|source| StorageError::Json {
            path: self.state_file.clone(),
            source,
        })
    }

    fn save_state(&self, state: &KernelState) -> Result<(), StorageError> {
        if self.read_only {
            return Ok(());
        }
        fs::create_dir_all(&self.home).map_err(Self::io_error(&self.home))?;

        let mut stamped = state.clone();
        stamped.updated_at = Utc::now();
        let json = serde_json::to_string_pretty(&stamped).map_err(|source| StorageError::Json {
            path: self.state_file.clone(),
            source,
        })?;

        // write to a sibling temp file, then rename over the record
        let tmp = self.state_file.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(Self::io_error(&tmp))?;
        fs::rename(&tmp, &self.state_file).map_err(Self::io_error(&self.state_file))
    }

    fn module_data_dir(&self, module_id: &ModuleId) -> Result<PathBuf, StorageError> {
        let dir = self
            .home
            .join(MODULES_DIR)
            .join(sanitize_module_dir(module_id));
        if !self.read_only {
            fs::create_dir_all(&dir).map_err(Self::io_error(&dir))?;
        }
        Ok(dir)
    }

    fn home_dir(&self) -> &Path {
        &self.home
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}
