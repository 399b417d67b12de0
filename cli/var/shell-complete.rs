#![allow(clippy::let_unit_value)]

use std::io::stdout;

use clap::CommandFactory as _;
use clap::Parser;

use clap_complete::generate;
use clap_complete::Shell;


#[allow(unused)]
mod dwflcli {
    include!("../src/args.rs");
}


/// Generate a shell completion script for `dwflcli`.
#[derive(Debug, Parser)]
struct Args {
    /// The shell to generate a completion script for.
    shell: Shell,
    /// The name the program is invoked as.
    #[clap(default_value = "dwflcli")]
    command: String,
}


fn main() {
    let args = Args::parse();
    let mut app = dwflcli::Args::command();
    let () = generate(args.shell, &mut app, &args.command, &mut stdout());
}
