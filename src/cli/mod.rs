use std::{
	fmt::Write as _,
	path::{Path, PathBuf},
	process::Command,
};

use colored::Colorize as _;

use crate::{
	config::{Config, CONFIG_FILE},
	emitter::{bytecode, CodeGenerator},
	files,
	parser::Parser,
};

/// The command-line arguments for the compiler.
#[derive(clap::Parser)]
#[command(name = "evoscript", about = "evoscript compiler CLI", version)]
pub struct CompilerArguments {
	/// The source file to compile. Absolute, or resolved against the configured script directories.
	#[arg(short = 'i', long = "input")]
	pub input: Option<PathBuf>,

	/// Write the compiled bytecode to this file (hex pairs, or RLE text with `use_rle`). Relative paths land next
	/// to the resolved input file.
	#[arg(short = 'o', long = "output")]
	pub output: Option<PathBuf>,

	/// Stop after parsing; no bytecode is generated.
	#[arg(short = 'p', long = "parse")]
	pub parse: bool,

	/// Hand the compiled bytecode to the VM after compiling.
	#[arg(short = 'e', long = "execute")]
	pub execute: bool,

	/// The library search root for imports, overriding the configured `stdlib_dir`.
	#[arg(short = 'l', long = "stdlib")]
	pub stdlib: Option<PathBuf>,

	/// The VM executable to use with --execute, overriding the configured `vm_exe`.
	#[arg(short = 'v', long = "vm")]
	pub vm: Option<PathBuf>,

	/// Refuse to produce more bytes than the VM's output buffer holds.
	#[arg(long = "vmoutsize", visible_alias = "vmos")]
	pub vmoutsize: Option<usize>,
}

/// Runs the compiler with the given arguments and returns the process exit code.
///
/// # Errors
/// Any compile error, configuration error, or I/O failure along the way; the caller prints it and exits nonzero.
pub fn run(arguments: &CompilerArguments) -> anyhow::Result<i32> {
	let config = Config::load(Path::new(CONFIG_FILE))?;
	if config.debug {
		println!("Debug mode enabled");
	}

	let Some(input) = &arguments.input else {
		eprintln!("** No file option given, exit");
		return Ok(-1);
	};

	let input_path = files::resolve_input(input, &config.script_dirs)?;
	let source = std::fs::read_to_string(&input_path)
		.map_err(|error| anyhow::anyhow!("{error}\n\twhile reading {}", input_path.display().to_string().bold().cyan()))?;

	let stdlib_dir = arguments.stdlib.clone().unwrap_or_else(|| config.stdlib_dir.clone());
	let mut parser = Parser::with_search_paths(stdlib_dir, config.script_dirs.clone());
	let statements = parser.parse(&source)?;

	if arguments.parse {
		return Ok(0);
	}

	let mut generator = CodeGenerator::new();
	for statement in &statements {
		generator.generate(statement)?;
	}

	if config.debug {
		println!("{}", bytecode::disassemble(generator.bytes())?);
		let stats = generator.stats();
		println!(
			"** STATS: | Bytes: {} | Max scope: {} | Arrays: {} | Symbols: {} | Longest string: {} **",
			generator.bytes().len(),
			stats.max_scope,
			stats.arrays,
			stats.symbols,
			stats.max_strlen
		);
	}

	if let Some(limit) = arguments.vmoutsize {
		if generator.bytes().len() > limit {
			anyhow::bail!("Output of {} bytes exceeds the VM output buffer of {limit} bytes", generator.bytes().len());
		}
	}

	if let Some(output) = &arguments.output {
		let output_path = if output.is_absolute() {
			output.clone()
		} else {
			input_path.parent().unwrap_or_else(|| Path::new(".")).join(output)
		};
		let contents = if config.use_rle { generator.finalize_rle() } else { hex_pairs(generator.bytes()) };
		std::fs::write(&output_path, &contents)
			.map_err(|error| anyhow::anyhow!("{error}\n\twhile writing {}", output_path.display().to_string().bold().cyan()))?;
		println!("** WROTE {} bytes to file {}", generator.bytes().len(), output_path.display());
	}

	if arguments.execute {
		let vm = arguments.vm.clone().unwrap_or_else(|| config.vm_exe.clone());
		execute_vm(&vm, &generator.finalize())?;
	}

	Ok(0)
}

/// Formats bytes as two-character lowercase hex pairs, concatenated without separators. This is the on-disk output
/// format when RLE is off.
#[must_use]
pub fn hex_pairs(bytes: &[u8]) -> String {
	let mut out = String::with_capacity(bytes.len() * 2);
	for byte in bytes {
		let _ = write!(out, "{byte:02x}");
	}
	out
}

/// Spawns the VM with the compiled bytes as decimal strings behind its `-b` option, waits for it, and then
/// force-terminates any lingering VM process by image name. A VM path that doesn't exist on disk is looked up on
/// `$PATH` before giving up.
fn execute_vm(vm: &Path, fbytes: &[String]) -> anyhow::Result<()> {
	let vm_path = if vm.exists() {
		vm.to_path_buf()
	} else {
		which::which(vm).map_err(|_| anyhow::anyhow!("VM executable {} not found", vm.display().to_string().bold().cyan()))?
	};

	let mut child = Command::new(&vm_path)
		.arg("-b")
		.args(fbytes)
		.spawn()
		.map_err(|error| anyhow::anyhow!("{error}\n\twhile spawning the VM {}", vm_path.display().to_string().bold().cyan()))?;
	let _ = child.wait();

	if let Some(image) = vm_path.file_name() {
		terminate_by_name(image);
	}
	Ok(())
}

/// Kills any process with the given image name. The VM is expected to exit on its own; this sweeps up the ones
/// that don't.
fn terminate_by_name(image: &std::ffi::OsStr) {
	let result = if std::env::consts::OS == "windows" {
		Command::new("taskkill").arg("/f").arg("/im").arg(image).output()
	} else {
		Command::new("pkill").arg("-x").arg(image).output()
	};
	// Nothing lingering is the common case; a failed kill is not an error.
	drop(result);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hex_pairs_are_lowercase_and_zero_padded() {
		assert_eq!(hex_pairs(&[0x00, 0x0f, 0xab, 0x14]), "000fab14");
		assert_eq!(hex_pairs(&[]), "");
	}
}
