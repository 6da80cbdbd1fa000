// Bring the `Parser` trait into scope from `clap`, which allows parsing argument structs from the command line. We
// assign it to underscore to indicate clearly that it's not used outside of bringing its trait methods into scope.
use clap::Parser as _;
use colored::Colorize as _;

use evoscript::cli::{self, CompilerArguments};

/// The main entry point for the evoscript compiler. Parses the command-line arguments, runs the compile driver,
/// and maps its outcome to the process exit code: 0 on success, 1 on any error, -1 when no input file was given.
fn main() {
	let arguments = CompilerArguments::parse();
	match cli::run(&arguments) {
		Ok(code) => std::process::exit(code),
		Err(error) => {
			eprintln!("{} {error}", "Error:".bold().red());
			std::process::exit(1);
		},
	}
}
