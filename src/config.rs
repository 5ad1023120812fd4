use std::path::{Path, PathBuf};

use color_eyre::eyre::{Result, WrapErr};
use serde::Deserialize;

use common::shell::Shell;

/// Optional project-local configuration, read from `mash.toml` beside the
/// document.
pub const CONFIG_FILE: &str = "mash.toml";

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Where `keep` places finished outputs.
    keep: Option<PathBuf>,
    /// Extra directories searched by `include` and `imprt`.
    imports: Option<Vec<PathBuf>>,
    /// The shell used for document commands, as a command vector.
    shell: Option<Shell>,
}

impl Config {
    pub fn load(origin: &Path) -> Result<Self> {
        let path = origin.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path).wrap_err("Failed to read config file")?;
        toml::from_str(&text)
            .wrap_err_with(|| format!("Failed to deserialize config from '{}'", path.display()))
    }

    /// Merge the file with the command line into the engine's configuration.
    /// The keep directory is passed through as given; the engine validates
    /// it at the point of use.
    pub fn into_engine(self, origin: PathBuf, keep_override: Option<PathBuf>) -> engine::Config {
        let keep_dir = keep_override
            .or(self.keep)
            .unwrap_or_else(|| origin.clone());

        let mut import_dirs = vec![origin.clone()];
        import_dirs.extend(
            self.imports
                .unwrap_or_default()
                .into_iter()
                .map(|dir| origin.join(dir)),
        );

        engine::Config {
            origin,
            keep_dir,
            import_dirs,
            shell: self.shell.unwrap_or_default(),
        }
    }
}
