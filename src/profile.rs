//! Named tunnel profiles and their JSON-file store.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelProfile {
    pub name: String,
    /// Remote endpoint, `host:port`.
    pub address: String,
    pub auth_token: String,
    pub upload_limit_mbps: u32,
    pub download_limit_mbps: u32,
    #[serde(default)]
    pub allow_insecure_tls: bool,
}

impl TunnelProfile {
    /// Reject profiles that cannot be used to start a tunnel.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::InvalidProfile("name is required".into()));
        }
        if self.address.trim().is_empty() {
            return Err(AppError::InvalidProfile(format!(
                "{}: address is required",
                self.name
            )));
        }
        if self.auth_token.trim().is_empty() {
            return Err(AppError::InvalidProfile(format!(
                "{}: auth token is required",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredProfiles {
    #[serde(default)]
    profiles: Vec<TunnelProfile>,
    #[serde(default)]
    selected: Option<usize>,
}

/// The saved profile list plus the selected index, backed by one JSON file.
#[derive(Debug)]
pub struct ProfileStore {
    path: PathBuf,
    data: StoredProfiles,
}

impl ProfileStore {
    /// Open the store at the default location.
    pub fn open_default() -> Result<Self> {
        Self::open(config::profiles_path())
    }

    /// Open the store at `path`; a missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = if path.exists() {
            let json = fs::read_to_string(&path)?;
            serde_json::from_str(&json)?
        } else {
            StoredProfiles::default()
        };
        Ok(Self { path, data })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn profiles(&self) -> &[TunnelProfile] {
        &self.data.profiles
    }

    #[must_use]
    pub fn selected_index(&self) -> Option<usize> {
        self.data
            .selected
            .filter(|&index| index < self.data.profiles.len())
    }

    #[must_use]
    pub fn selected(&self) -> Option<&TunnelProfile> {
        self.selected_index().map(|index| &self.data.profiles[index])
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<&TunnelProfile> {
        self.data.profiles.iter().find(|p| p.name == name)
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.data
            .profiles
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| AppError::ProfileNotFound(name.to_string()))
    }

    pub fn add(&mut self, profile: TunnelProfile) -> Result<()> {
        profile.validate()?;
        if self.find(&profile.name).is_some() {
            return Err(AppError::InvalidProfile(format!(
                "{}: a profile with this name already exists",
                profile.name
            )));
        }
        self.data.profiles.push(profile);
        self.save()
    }

    /// Replace the profile called `name`; the replacement may rename it.
    pub fn edit(&mut self, name: &str, profile: TunnelProfile) -> Result<()> {
        profile.validate()?;
        let index = self.position(name)?;
        if profile.name != name && self.find(&profile.name).is_some() {
            return Err(AppError::InvalidProfile(format!(
                "{}: a profile with this name already exists",
                profile.name
            )));
        }
        self.data.profiles[index] = profile;
        self.save()
    }

    /// Remove a profile, keeping the selection pointed at the same entry.
    pub fn remove(&mut self, name: &str) -> Result<TunnelProfile> {
        let index = self.position(name)?;
        let removed = self.data.profiles.remove(index);
        self.data.selected = match self.data.selected {
            Some(selected) if selected == index => None,
            Some(selected) if selected > index => Some(selected - 1),
            other => other,
        };
        self.save()?;
        Ok(removed)
    }

    pub fn select(&mut self, name: &str) -> Result<()> {
        let index = self.position(name)?;
        self.data.selected = Some(index);
        self.save()
    }

    pub fn clear_selection(&mut self) -> Result<()> {
        self.data.selected = None;
        self.save()
    }

    fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.data)?;
        config::write_private_file(&self.path, json.as_bytes())?;
        info!("Profiles saved to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn sample_profile() -> TunnelProfile {
    TunnelProfile {
        name: "home".to_string(),
        address: "h.example.com:443".to_string(),
        auth_token: "tok".to_string(),
        upload_limit_mbps: 10,
        download_limit_mbps: 50,
        allow_insecure_tls: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str) -> TunnelProfile {
        TunnelProfile {
            name: name.to_string(),
            ..sample_profile()
        }
    }

    #[test]
    fn validate_rejects_blank_address_and_token() {
        let mut profile = sample_profile();
        profile.address = "  ".into();
        assert!(matches!(profile.validate(), Err(AppError::InvalidProfile(_))));

        let mut profile = sample_profile();
        profile.auth_token.clear();
        assert!(matches!(profile.validate(), Err(AppError::InvalidProfile(_))));

        assert!(sample_profile().validate().is_ok());
    }

    #[test]
    fn store_persists_profiles_and_selection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.json");

        let mut store = ProfileStore::open(&path).unwrap();
        assert!(store.profiles().is_empty());
        assert!(store.selected().is_none());

        store.add(named("a")).unwrap();
        store.add(named("b")).unwrap();
        store.select("b").unwrap();

        let reopened = ProfileStore::open(&path).unwrap();
        assert_eq!(reopened.profiles().len(), 2);
        assert_eq!(reopened.selected().map(|p| p.name.as_str()), Some("b"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ProfileStore::open(dir.path().join("profiles.json")).unwrap();
        store.add(named("a")).unwrap();
        assert!(store.add(named("a")).is_err());
        store.add(named("b")).unwrap();
        assert!(store.edit("b", named("a")).is_err());
    }

    #[test]
    fn remove_clears_or_shifts_selection() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ProfileStore::open(dir.path().join("profiles.json")).unwrap();
        for name in ["a", "b", "c"] {
            store.add(named(name)).unwrap();
        }

        store.select("c").unwrap();
        store.remove("a").unwrap();
        assert_eq!(store.selected_index(), Some(1));
        assert_eq!(store.selected().map(|p| p.name.as_str()), Some("c"));

        store.remove("c").unwrap();
        assert_eq!(store.selected_index(), None);
        assert!(matches!(
            store.remove("missing"),
            Err(AppError::ProfileNotFound(_))
        ));
    }

    #[test]
    fn edit_replaces_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ProfileStore::open(dir.path().join("profiles.json")).unwrap();
        store.add(named("a")).unwrap();
        let mut updated = named("renamed");
        updated.download_limit_mbps = 100;
        store.edit("a", updated.clone()).unwrap();
        assert_eq!(store.profiles(), &[updated]);
    }
}
