//! Named boolean tweak options, the built-in catalog and the persisted settings snapshot.
use crate::error::{DebloatError, Result};
use crate::write_atomically;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;

pub const DEFAULT_SETTINGS_FILE: &str = "debloat_settings.json";

static OPTION_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").unwrap());

/// Presentation group an option is rendered under. Carries no behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionGroup {
    SystemTweaks,
    Applications,
    UiTweaks,
}

impl OptionGroup {
    pub fn title(self) -> &'static str {
        match self {
            OptionGroup::SystemTweaks => "System Tweaks",
            OptionGroup::Applications => "Applications",
            OptionGroup::UiTweaks => "UI Tweaks",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionSpec {
    pub name: &'static str,
    pub label: &'static str,
    pub group: OptionGroup,
    pub default: bool,
}

const fn spec(name: &'static str, label: &'static str, group: OptionGroup, default: bool) -> OptionSpec {
    OptionSpec {
        name,
        label,
        group,
        default,
    }
}

pub const BUILTIN_OPTIONS: &[OptionSpec] = &[
    spec("DisableTelemetry", "Disable Telemetry", OptionGroup::SystemTweaks, true),
    spec("DisableBing", "Disable Bing Search/Cortana", OptionGroup::SystemTweaks, true),
    spec("DisableWidgets", "Disable Widgets", OptionGroup::SystemTweaks, true),
    spec("DisableCopilot", "Disable Copilot", OptionGroup::SystemTweaks, true),
    spec("DisableRecall", "Disable Recall Snapshots", OptionGroup::SystemTweaks, true),
    spec("RemoveApps", "Remove Default Apps", OptionGroup::Applications, true),
    spec("RemoveGamingApps", "Remove Gaming Apps", OptionGroup::Applications, false),
    spec("RemoveCommApps", "Remove Communication Apps", OptionGroup::Applications, false),
    spec("ForceRemoveEdge", "Force Remove Edge Browser", OptionGroup::Applications, false),
    spec("TaskbarAlignLeft", "Align Taskbar Left", OptionGroup::UiTweaks, true),
    spec("RevertContextMenu", "Classic Context Menu", OptionGroup::UiTweaks, true),
    spec("ShowHiddenFolders", "Show Hidden Files", OptionGroup::UiTweaks, true),
    spec("ShowKnownFileExt", "Show File Extensions", OptionGroup::UiTweaks, true),
];

/// Ordered set of options the front-end knows about, with their fixed defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionCatalog {
    specs: Vec<OptionSpec>,
}

impl Default for OptionCatalog {
    fn default() -> Self {
        Self::new(BUILTIN_OPTIONS.to_vec())
    }
}

impl OptionCatalog {
    pub fn new(specs: Vec<OptionSpec>) -> Self {
        OptionCatalog { specs }
    }

    pub fn specs(&self) -> &[OptionSpec] {
        &self.specs
    }

    pub fn find(&self, name: &str) -> Option<&OptionSpec> {
        self.specs.iter().find(|spec| spec.name == name)
    }

    /// Default for `name`; options outside the catalog default to off.
    pub fn default_for(&self, name: &str) -> bool {
        self.find(name).map(|spec| spec.default).unwrap_or(false)
    }

    pub fn defaults(&self) -> BTreeMap<String, bool> {
        self.specs
            .iter()
            .map(|spec| (spec.name.to_string(), spec.default))
            .collect()
    }
}

pub fn is_valid_option_name(name: &str) -> bool {
    OPTION_NAME_REGEX.is_match(name)
}

/// Why a load fell back to the catalog defaults.
#[derive(Debug)]
pub enum LoadFallback {
    Missing,
    Unreadable(DebloatError),
    Invalid(DebloatError),
}

#[derive(Debug)]
pub struct LoadedOptions {
    pub store: OptionStore,
    pub fallback: Option<LoadFallback>,
}

/// Current value of every option, keyed by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionStore {
    catalog: OptionCatalog,
    values: BTreeMap<String, bool>,
}

impl Default for OptionStore {
    fn default() -> Self {
        Self::with_defaults(OptionCatalog::default())
    }
}

impl OptionStore {
    pub fn with_defaults(catalog: OptionCatalog) -> Self {
        let values = catalog.defaults();
        OptionStore { catalog, values }
    }

    pub fn from_values(catalog: OptionCatalog, values: BTreeMap<String, bool>) -> Self {
        OptionStore { catalog, values }
    }

    pub fn catalog(&self) -> &OptionCatalog {
        &self.catalog
    }

    /// The explicitly held mapping; this is exactly what `save` writes.
    pub fn values(&self) -> &BTreeMap<String, bool> {
        &self.values
    }

    pub fn get(&self, name: &str) -> bool {
        self.values
            .get(name)
            .copied()
            .unwrap_or_else(|| self.catalog.default_for(name))
    }

    pub fn set(&mut self, name: &str, value: bool) {
        self.values.insert(name.to_string(), value);
    }

    pub fn reset_to_defaults(&mut self) {
        self.values = self.catalog.defaults();
    }

    /// Names currently switched on: catalog order first, then any other held names
    /// in lexical order.
    pub fn enabled_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .catalog
            .specs()
            .iter()
            .filter(|spec| self.get(spec.name))
            .map(|spec| spec.name.to_string())
            .collect();

        names.extend(
            self.values
                .iter()
                .filter(|(name, value)| **value && self.catalog.find(name).is_none())
                .map(|(name, _)| name.clone()),
        );
        names
    }

    /// Read a settings snapshot. Never fails: any problem yields the catalog defaults
    /// and a logged fallback reason.
    pub fn load(catalog: OptionCatalog, path: &Path) -> LoadedOptions {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no settings file, using defaults");
                return LoadedOptions {
                    store: OptionStore::with_defaults(catalog),
                    fallback: Some(LoadFallback::Missing),
                };
            }
            Err(err) => {
                let err = DebloatError::persistence(path, err);
                tracing::warn!(error = %err, "settings unreadable, using defaults");
                return LoadedOptions {
                    store: OptionStore::with_defaults(catalog),
                    fallback: Some(LoadFallback::Unreadable(err)),
                };
            }
        };

        match parse_settings(path, &contents) {
            Ok(values) => {
                tracing::info!(path = %path.display(), options = values.len(), "loaded settings");
                LoadedOptions {
                    store: OptionStore::from_values(catalog, values),
                    fallback: None,
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "settings invalid, using defaults");
                LoadedOptions {
                    store: OptionStore::with_defaults(catalog),
                    fallback: Some(LoadFallback::Invalid(err)),
                }
            }
        }
    }

    /// Replace the snapshot at `path` with the full current mapping. A mapping that
    /// `load` would reject is refused before anything is written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let invalid = |source| DebloatError::SettingsFormat {
            source,
            path: path.to_path_buf(),
        };
        if let Some(bad) = first_invalid_name(&self.values) {
            let err = invalid(invalid_name_error(bad));
            tracing::warn!(error = %err, "refusing to save settings");
            return Err(err);
        }
        let mut document = serde_json::to_vec_pretty(&self.values).map_err(invalid)?;
        document.push(b'\n');

        match write_atomically(path, &document) {
            Ok(()) => {
                tracing::info!(path = %path.display(), options = self.values.len(), "settings saved");
                Ok(())
            }
            Err(err) => {
                let err = DebloatError::persistence(path, err);
                tracing::warn!(error = %err, "failed to save settings");
                Err(err)
            }
        }
    }
}

fn parse_settings(path: &Path, contents: &str) -> Result<BTreeMap<String, bool>> {
    let invalid = |source| DebloatError::SettingsFormat {
        source,
        path: path.to_path_buf(),
    };

    let values: BTreeMap<String, bool> = serde_json::from_str(contents).map_err(invalid)?;
    if let Some(bad) = first_invalid_name(&values) {
        return Err(invalid(invalid_name_error(bad)));
    }
    Ok(values)
}

fn first_invalid_name(values: &BTreeMap<String, bool>) -> Option<&str> {
    values
        .keys()
        .map(String::as_str)
        .find(|name| !is_valid_option_name(name))
}

fn invalid_name_error(name: &str) -> serde_json::Error {
    <serde_json::Error as serde::de::Error>::custom(format!("invalid option name {name:?}"))
}
