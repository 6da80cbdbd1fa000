use std::path::{Path, PathBuf};

use serde::Deserialize;

/// The name of the configuration file, looked up in the working directory.
pub const CONFIG_FILE: &str = "config.yml";

/// The compiler's configuration, read from `config.yml`.
///
/// Every key is optional; a missing file simply yields the defaults, while a present but malformed file is an
/// error (silently ignoring a typo'd config is worse than failing).
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
	/// Adjusts diagnostic verbosity: prints the disassembly listing and compile stats after a successful compile.
	pub debug: bool,
	/// Directories searched (recursively) for non-absolute input paths and for imported files.
	pub script_dirs: Vec<PathBuf>,
	/// The default library root, searched before `script_dirs` when resolving imports. Overridable with
	/// `--stdlib`.
	pub stdlib_dir: PathBuf,
	/// The default VM executable, used by `--execute`. Overridable with `--vm`.
	pub vm_exe: PathBuf,
	/// Write run-length encoded output instead of hex pairs.
	pub use_rle: bool,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			debug: false,
			script_dirs: Vec::new(),
			stdlib_dir: PathBuf::from("stdlib"),
			vm_exe: PathBuf::from("es_vm"),
			use_rle: false,
		}
	}
}

impl Config {
	/// Loads the configuration from the given path, falling back to defaults when the file doesn't exist.
	///
	/// # Errors
	/// When the file exists but cannot be read or parsed as YAML.
	pub fn load(path: &Path) -> anyhow::Result<Self> {
		if !path.exists() {
			return Ok(Self::default());
		}
		let contents = std::fs::read_to_string(path)
			.map_err(|error| anyhow::anyhow!("{error}\n\twhile reading {}", path.display()))?;
		serde_yaml::from_str(&contents).map_err(|error| anyhow::anyhow!("{error}\n\twhile parsing {}", path.display()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn missing_file_yields_defaults() {
		let config = Config::load(Path::new("definitely/not/here/config.yml")).unwrap();
		assert!(!config.debug);
		assert!(!config.use_rle);
		assert!(config.script_dirs.is_empty());
		assert_eq!(config.vm_exe, PathBuf::from("es_vm"));
	}

	#[test]
	fn recognized_keys_deserialize() {
		let config: Config = serde_yaml::from_str(
			"debug: true\nscript_dirs:\n  - scripts\n  - more/scripts\nstdlib_dir: lib\nvm_exe: /opt/es_vm\nuse_rle: true\n",
		)
		.unwrap();
		assert!(config.debug);
		assert!(config.use_rle);
		assert_eq!(config.script_dirs.len(), 2);
		assert_eq!(config.stdlib_dir, PathBuf::from("lib"));
		assert_eq!(config.vm_exe, PathBuf::from("/opt/es_vm"));
	}

	#[test]
	fn unknown_keys_are_tolerated() {
		// Configs written for newer compiler versions shouldn't break older ones.
		let config: Config = serde_yaml::from_str("debug: true\nfuture_option: 3\n").unwrap();
		assert!(config.debug);
	}
}
