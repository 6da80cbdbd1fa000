use std::path::{Path, PathBuf};

use colored::Colorize as _;
use walkdir::WalkDir;

use crate::error::CompileError;

/// Resolves the compiler's input file. Absolute paths are opened directly; anything else is searched for by exact
/// file name, walking each configured script directory recursively. The first match wins.
///
/// # Errors
/// When the path is absolute but doesn't exist, when no script directories are configured for a relative path, or
/// when the walk finds no match.
pub fn resolve_input(input: &Path, script_dirs: &[PathBuf]) -> anyhow::Result<PathBuf> {
	if input.is_absolute() {
		if input.is_file() {
			return Ok(input.to_path_buf());
		}
		return Err(not_found(&input.display().to_string()));
	}

	if script_dirs.is_empty() {
		return Err(CompileError::codegen("No script directories given").into());
	}

	let Some(base_name) = input.file_name() else {
		return Err(not_found(&input.display().to_string()));
	};
	for dir in script_dirs {
		for entry in WalkDir::new(dir).into_iter().filter_map(Result::ok) {
			if entry.file_type().is_file() && entry.file_name() == base_name {
				return Ok(entry.into_path());
			}
		}
	}
	Err(not_found(&base_name.to_string_lossy()))
}

/// Resolves an imported file. Imports name files loosely - `import "util"` matches `util.es` - so candidates are
/// compared by file stem. The library directory is searched first, then each script directory; first match wins.
///
/// # Errors
/// When no file in any searched directory matches the import's stem.
pub fn resolve_import(file: &str, stdlib_dir: &Path, script_dirs: &[PathBuf]) -> anyhow::Result<PathBuf> {
	let wanted = Path::new(file).file_stem().map(std::ffi::OsStr::to_os_string).unwrap_or_default();

	let dirs = std::iter::once(stdlib_dir.to_path_buf()).chain(script_dirs.iter().cloned());
	for dir in dirs {
		for entry in WalkDir::new(&dir).into_iter().filter_map(Result::ok) {
			if entry.file_type().is_file() && entry.path().file_stem() == Some(wanted.as_os_str()) {
				return Ok(entry.into_path());
			}
		}
	}
	Err(not_found(file))
}

fn not_found(file: &str) -> anyhow::Error {
	CompileError::codegen(format!("File {} not found", file.bold().cyan())).into()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn relative_input_without_script_dirs_fails() {
		assert!(resolve_input(Path::new("program.es"), &[]).is_err());
	}

	#[test]
	fn input_is_matched_by_exact_file_name() {
		let dir = tempfile::tempdir().unwrap();
		let nested = dir.path().join("sub").join("deeper");
		std::fs::create_dir_all(&nested).unwrap();
		std::fs::write(nested.join("program.es"), "let a = 1").unwrap();

		let resolved = resolve_input(Path::new("program.es"), &[dir.path().to_path_buf()]).unwrap();
		assert_eq!(resolved, nested.join("program.es"));
		assert!(resolve_input(Path::new("missing.es"), &[dir.path().to_path_buf()]).is_err());
	}

	#[test]
	fn imports_are_matched_by_stem() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("util.es"), "let lib_var = 1").unwrap();

		let resolved = resolve_import("util", dir.path(), &[]).unwrap();
		assert_eq!(resolved, dir.path().join("util.es"));
		// The written extension is ignored when matching.
		let resolved = resolve_import("util.esc", dir.path(), &[]).unwrap();
		assert_eq!(resolved, dir.path().join("util.es"));
	}

	#[test]
	fn stdlib_wins_over_script_dirs() {
		let stdlib = tempfile::tempdir().unwrap();
		let scripts = tempfile::tempdir().unwrap();
		std::fs::write(stdlib.path().join("util.es"), "let from_stdlib = 1").unwrap();
		std::fs::write(scripts.path().join("util.es"), "let from_scripts = 1").unwrap();

		let resolved = resolve_import("util", stdlib.path(), &[scripts.path().to_path_buf()]).unwrap();
		assert_eq!(resolved, stdlib.path().join("util.es"));
	}
}
