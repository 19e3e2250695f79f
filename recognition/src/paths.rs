use anyhow::Result;
use std::{fs, os::unix::fs::PermissionsExt, path::Path, path::PathBuf};
use walkdir::WalkDir;

use crate::config::Config;

const CONFIG_PATH: &str = "/etc/pam-fingerprint/";
const DATA_PATH: &str = "/var/lib/pam-fingerprint/";

pub(crate) fn set_permissions_recursively(
    path: &Path,
    dir_mode: u32,
    file_mode: u32,
) -> Result<()> {
    for entry in WalkDir::new(path) {
        let entry = entry?;
        let mode = if entry.file_type().is_dir() {
            dir_mode
        } else {
            file_mode
        };
        fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode))?;
    }

    Ok(())
}

pub fn get_config_dir() -> PathBuf {
    PathBuf::from(CONFIG_PATH)
}

pub fn create_config_dir() -> Result<PathBuf> {
    let config_path = get_config_dir();

    if !config_path.exists() {
        fs::create_dir_all(&config_path)?;
    }
    fs::set_permissions(&config_path, fs::Permissions::from_mode(0o755))?;

    Ok(config_path)
}

pub fn get_data_dir() -> PathBuf {
    PathBuf::from(DATA_PATH)
}

/// Creates the template root. Everything below `users/` is readable by
/// root only.
pub fn create_data_dir(data_path: &Path) -> Result<PathBuf> {
    let full_path = data_path.join("users");

    if !full_path.exists() {
        fs::create_dir_all(&full_path)?;
    }

    fs::set_permissions(data_path, fs::Permissions::from_mode(0o755))?;
    set_permissions_recursively(&full_path, 0o700, 0o600)?;

    Ok(data_path.to_path_buf())
}

pub fn get_config_file_path() -> PathBuf {
    get_config_dir().join("config.toml")
}

/// Returns the configuration file, writing the defaults first if it does
/// not exist yet.
pub fn get_config_file() -> Result<PathBuf> {
    let config_file = get_config_file_path();

    if !config_file.exists() {
        let default_config = Config::default();
        fs::write(&config_file, toml::to_string_pretty(&default_config)?)?;
    }

    Ok(config_file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_dir_is_locked_down() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        fs::create_dir_all(root.join("users/alice")).unwrap();
        fs::write(root.join("users/alice/0-000.tpl"), "x").unwrap();

        create_data_dir(&root).unwrap();

        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&root.join("users")), 0o700);
        assert_eq!(mode(&root.join("users/alice")), 0o700);
        assert_eq!(mode(&root.join("users/alice/0-000.tpl")), 0o600);
    }
}
