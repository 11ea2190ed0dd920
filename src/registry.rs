//! On-disk artifact storage: immutable timestamped snapshots plus a
//! `current.json` pointer that is replaced atomically.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::classifier::{Model, ModelFamily};
use crate::error::{Error, Result};
use crate::features::TransformBundle;

pub const BUNDLE_FORMAT_VERSION: u32 = 1;
pub const CURRENT: &str = "current";

/// Length of the `YYYYmmdd_HHMMSS_mmm` suffix on snapshot names.
const STAMP_LEN: usize = 19;

/// A trained model together with the transforms that produced its input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactBundle {
    pub format_version: u32,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub family: ModelFamily,
    pub model: Model,
    pub transforms: TransformBundle,
}

impl ArtifactBundle {
    pub fn new(run_id: Uuid, model: Model, transforms: TransformBundle) -> Result<Self> {
        let bundle = Self {
            format_version: BUNDLE_FORMAT_VERSION,
            run_id,
            created_at: Utc::now(),
            family: model.family(),
            model,
            transforms,
        };
        bundle.validate()?;
        Ok(bundle)
    }

    pub fn validate(&self) -> Result<()> {
        if self.format_version != BUNDLE_FORMAT_VERSION {
            return Err(Error::Registry(format!(
                "unsupported bundle format {} (expected {BUNDLE_FORMAT_VERSION})",
                self.format_version
            )));
        }
        if self.transforms.run_id != self.run_id {
            return Err(Error::Registry(format!(
                "model from run {} paired with transforms from run {}",
                self.run_id, self.transforms.run_id
            )));
        }
        if self.family != self.model.family() {
            return Err(Error::Registry(format!(
                "bundle labelled {} holds a {} model",
                self.family,
                self.model.family()
            )));
        }
        if self.transforms.feature_order.is_empty() {
            return Err(Error::Registry("bundle has no feature order".to_string()));
        }
        Ok(())
    }
}

pub struct ArtifactRegistry {
    dir: PathBuf,
}

impl ArtifactRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `<name>_<stamp>.json`, then points `current.json` at the same
    /// content. Returns the snapshot path.
    pub fn save(&self, bundle: &ArtifactBundle, name: &str) -> Result<PathBuf> {
        bundle.validate()?;
        if name.is_empty() || name == CURRENT || name.contains(['/', '\\']) {
            return Err(Error::Registry(format!("invalid artifact name '{name}'")));
        }
        fs::create_dir_all(&self.dir)?;
        let body = serde_json::to_vec(bundle)?;

        let snapshot = self.write_snapshot(name, &body)?;

        let tmp = self.dir.join(format!(".{CURRENT}.json.tmp"));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.path_for(CURRENT))?;

        info!(
            snapshot = %snapshot.display(),
            family = %bundle.family,
            run_id = %bundle.run_id,
            "artifacts saved"
        );
        Ok(snapshot)
    }

    fn write_snapshot(&self, name: &str, body: &[u8]) -> Result<PathBuf> {
        // a same-millisecond collision waits for the next stamp
        for _ in 0..5 {
            let stamp = Utc::now().format("%Y%m%d_%H%M%S_%3f");
            let path = self.dir.join(format!("{name}_{stamp}.json"));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(body)?;
                    file.sync_all()?;
                    return Ok(path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Registry(format!("could not allocate a snapshot name for '{name}'")))
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// `Ok(None)` when the artifact does not exist.
    pub fn load(&self, name: &str) -> Result<Option<ArtifactBundle>> {
        let path = self.path_for(name);
        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let bundle: ArtifactBundle = serde_json::from_slice(&body)
            .map_err(|e| Error::Registry(format!("{} is corrupt: {e}", path.display())))?;
        bundle.validate()?;
        Ok(Some(bundle))
    }

    pub fn load_current(&self) -> Result<Option<ArtifactBundle>> {
        self.load(CURRENT)
    }

    /// Snapshot names (without `.json`), oldest first.
    pub fn snapshots(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                warn!(path = %entry.path().display(), "skipping non-UTF-8 artifact name");
                continue;
            };
            let Some(stem) = file_name.strip_suffix(".json") else {
                continue;
            };
            if stem.starts_with('.') || stamp_of(stem).is_none() {
                continue;
            }
            names.push(stem.to_string());
        }
        names.sort_by(|a, b| stamp_of(a).cmp(&stamp_of(b)).then_with(|| a.cmp(b)));
        Ok(names)
    }
}

/// The trailing `YYYYmmdd_HHMMSS_mmm` of a snapshot name.
fn stamp_of(stem: &str) -> Option<&str> {
    let stamp = stem.get(stem.len().checked_sub(STAMP_LEN + 1)?..)?;
    let stamp = stamp.strip_prefix('_')?;
    let well_formed = stamp.char_indices().all(|(i, c)| match i {
        8 | 15 => c == '_',
        _ => c.is_ascii_digit(),
    });
    well_formed.then_some(stamp)
}
