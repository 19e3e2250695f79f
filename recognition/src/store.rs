//! Per-user enrolled templates on disk.
//!
//! Layout: `<root>/users/<identity>/<finger>-<seq>.tpl`, one record per
//! file. A record is a header line `FPT1 <sha256 of body>` followed by a
//! JSON body holding only minutiae and metadata; no image data is ever
//! stored. Records that fail the checksum, do not parse, carry an unknown
//! version or are accessible by group/other are skipped one by one and
//! counted, so a single bad file never hides the others.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config;
use crate::deadline::{Deadline, Expired};
use crate::error::ErrorKind;
use crate::features::{FeatureSet, Minutia};

const MAGIC: &str = "FPT1";
const EXTENSION: &str = "tpl";
pub const TEMPLATE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no templates enrolled for {0}")]
    NotEnrolled(String),
    #[error("{0:?} is not a valid identity")]
    InvalidIdentity(String),
    #[error("template store unavailable at {path}: {source}")]
    Unavailable { path: PathBuf, source: io::Error },
    #[error("all {skipped} template records for {identity} are unreadable")]
    AllCorrupt { identity: String, skipped: usize },
    #[error("failed to encode template: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Timeout(#[from] Expired),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotEnrolled(_) => ErrorKind::NotEnrolled,
            StoreError::InvalidIdentity(_) => ErrorKind::UnknownUser,
            StoreError::Unavailable { .. } | StoreError::AllCorrupt { .. } => {
                ErrorKind::StoreUnavailable
            }
            StoreError::Encode(_) => ErrorKind::InternalFault,
            StoreError::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

/// One enrolled finger capture.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    id: String,
    finger: u8,
    enrolled_at: DateTime<Utc>,
    version: u32,
    features: FeatureSet,
}

impl Template {
    pub fn new(id: impl Into<String>, finger: u8, features: FeatureSet) -> Self {
        Self {
            id: id.into(),
            finger,
            enrolled_at: Utc::now(),
            version: TEMPLATE_VERSION,
            features,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn finger(&self) -> u8 {
        self.finger
    }

    pub fn enrolled_at(&self) -> DateTime<Utc> {
        self.enrolled_at
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn features(&self) -> &FeatureSet {
        &self.features
    }
}

/// Templates of one identity plus the number of records that were
/// dropped while loading them.
#[derive(Debug, Clone, Default)]
pub struct LoadedTemplates {
    pub templates: Vec<Template>,
    pub skipped: usize,
}

pub trait TemplateStore {
    fn load_templates(
        &self,
        identity: &str,
        deadline: &Deadline,
    ) -> Result<LoadedTemplates, StoreError>;
}

#[derive(Serialize, Deserialize)]
struct RecordBody {
    version: u32,
    finger: u8,
    enrolled_at: DateTime<Utc>,
    orientation: f64,
    quality: f64,
    minutiae: Vec<Minutia>,
}

#[derive(Debug, Error, PartialEq)]
enum RecordError {
    #[error("missing header")]
    Header,
    #[error("checksum mismatch")]
    Checksum,
    #[error("unsupported version {0}")]
    Version(u32),
    #[error("malformed body: {0}")]
    Body(String),
}

fn encode_record(template: &Template) -> Result<String, serde_json::Error> {
    let features = template.features();
    let body = serde_json::to_string(&RecordBody {
        version: template.version,
        finger: template.finger,
        enrolled_at: template.enrolled_at,
        orientation: features.orientation(),
        quality: features.quality(),
        minutiae: features.minutiae().to_vec(),
    })?;
    let digest = hex::encode(Sha256::digest(body.as_bytes()));
    Ok(format!("{MAGIC} {digest}\n{body}"))
}

fn decode_record(id: &str, text: &str) -> Result<Template, RecordError> {
    let (header, body) = text.split_once('\n').ok_or(RecordError::Header)?;
    let digest = header
        .strip_prefix(MAGIC)
        .map(str::trim)
        .ok_or(RecordError::Header)?;
    if hex::encode(Sha256::digest(body.as_bytes())) != digest {
        return Err(RecordError::Checksum);
    }

    let body: RecordBody =
        serde_json::from_str(body).map_err(|e| RecordError::Body(e.to_string()))?;
    if body.version != TEMPLATE_VERSION {
        return Err(RecordError::Version(body.version));
    }

    Ok(Template {
        id: id.to_owned(),
        finger: body.finger,
        enrolled_at: body.enrolled_at,
        version: body.version,
        features: FeatureSet::from_points(body.minutiae, body.orientation, body.quality),
    })
}

/// Rejects anything that could escape the user directory or hide in it.
pub fn validate_identity(identity: &str) -> Result<(), StoreError> {
    let valid = !identity.is_empty()
        && identity.len() <= 256
        && !identity.starts_with('.')
        && identity
            .chars()
            .all(|c| c.is_ascii_graphic() && c != '/' && c != '\\');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentity(identity.escape_debug().to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct FsTemplateStore {
    root: PathBuf,
    max_per_identity: usize,
}

impl FsTemplateStore {
    pub fn new(root: impl Into<PathBuf>, max_per_identity: usize) -> Self {
        Self {
            root: root.into(),
            max_per_identity: max_per_identity.max(1),
        }
    }

    pub fn from_config(config: &config::Store) -> Self {
        Self::new(&config.template_path, config.max_templates_per_identity)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn user_dir(&self, identity: &str) -> Result<PathBuf, StoreError> {
        validate_identity(identity)?;
        Ok(self.root.join("users").join(identity))
    }

    /// Record files of `identity`, sorted by name. An absent user directory
    /// yields no records; any other problem reaching it, including a missing
    /// store root, makes the store unavailable.
    fn records(&self, identity: &str) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.user_dir(identity)?;
        let unavailable = |path: &Path, source: io::Error| StoreError::Unavailable {
            path: path.to_path_buf(),
            source,
        };

        let root = fs::metadata(&self.root).map_err(|e| unavailable(&self.root, e))?;
        if !root.is_dir() {
            return Err(unavailable(&self.root, io::Error::other("not a directory")));
        }
        match fs::symlink_metadata(&dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(unavailable(&dir, io::Error::other("not a directory"))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(unavailable(&dir, err)),
        }

        let mut records = Vec::new();
        for entry in WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| StoreError::Unavailable {
                path: dir.clone(),
                source: e.into(),
            })?;
            let path = entry.path();
            if entry.file_type().is_file()
                && path.extension().is_some_and(|ext| ext == EXTENSION)
            {
                records.push(path.to_path_buf());
            }
        }
        Ok(records)
    }

    /// Persists a new template and returns it. The record is written to a
    /// temporary file and renamed into place so readers never see it
    /// half-written.
    pub fn save_template(
        &self,
        identity: &str,
        finger: u8,
        features: FeatureSet,
    ) -> Result<Template, StoreError> {
        let dir = self.user_dir(identity)?;
        let unavailable = |source: io::Error| StoreError::Unavailable {
            path: dir.clone(),
            source,
        };
        fs::create_dir_all(&dir).map_err(unavailable)?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)).map_err(unavailable)?;

        let prefix = format!("{finger}-");
        let next = self
            .records(identity)?
            .iter()
            .filter_map(|p| p.file_stem()?.to_str()?.strip_prefix(&prefix)?.parse::<u32>().ok())
            .max()
            .map_or(0, |n| n + 1);
        let id = format!("{finger}-{next:03}");

        let template = Template::new(&id, finger, features);
        let text = encode_record(&template)?;

        let staging = dir.join(format!(".{id}.tmp"));
        let target = dir.join(format!("{id}.{EXTENSION}"));
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&staging)
            .map_err(unavailable)?;
        let written = file
            .write_all(text.as_bytes())
            .and_then(|_| file.sync_all())
            .and_then(|_| fs::rename(&staging, &target));
        if let Err(err) = written {
            if let Err(cleanup) = fs::remove_file(&staging) {
                warn!("failed to remove {}: {cleanup}", staging.display());
            }
            return Err(unavailable(err));
        }

        debug!("enrolled template {id} for {identity}");
        Ok(template)
    }

    /// Deletes every record of `identity`; returns how many were removed.
    pub fn remove_templates(&self, identity: &str) -> Result<usize, StoreError> {
        let records = self.records(identity)?;
        for path in &records {
            fs::remove_file(path).map_err(|source| StoreError::Unavailable {
                path: path.clone(),
                source,
            })?;
        }
        Ok(records.len())
    }

    fn read_record(&self, path: &Path) -> Result<Template, String> {
        let metadata = fs::metadata(path).map_err(|e| e.to_string())?;
        if metadata.permissions().mode() & 0o077 != 0 {
            return Err("record is accessible by group or others".into());
        }
        let text = fs::read_to_string(path).map_err(|e| e.to_string())?;
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        decode_record(id, &text).map_err(|e| e.to_string())
    }
}

impl TemplateStore for FsTemplateStore {
    fn load_templates(
        &self,
        identity: &str,
        deadline: &Deadline,
    ) -> Result<LoadedTemplates, StoreError> {
        let records = self.records(identity)?;
        if records.is_empty() {
            return Err(StoreError::NotEnrolled(identity.to_owned()));
        }

        let mut loaded = LoadedTemplates::default();
        for path in &records {
            deadline.check()?;
            if loaded.templates.len() == self.max_per_identity {
                warn!(
                    "{identity} has more than {} templates, ignoring the rest",
                    self.max_per_identity
                );
                break;
            }
            match self.read_record(path) {
                Ok(template) => loaded.templates.push(template),
                Err(reason) => {
                    warn!("skipping template record {}: {reason}", path.display());
                    loaded.skipped += 1;
                }
            }
        }

        if loaded.templates.is_empty() {
            return Err(StoreError::AllCorrupt {
                identity: identity.to_owned(),
                skipped: loaded.skipped,
            });
        }
        Ok(loaded)
    }
}
