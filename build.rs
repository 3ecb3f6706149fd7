//! Renders the `usocks-server(1)` and `usocks-client(1)` manual pages from
//! the clap definitions.

use std::{fs, io, path::Path};

use clap::{Command, CommandFactory};
use clap_mangen::Man;

#[path = "src/cli.rs"]
mod cli;

#[path = "src/bin/usocks-client/cli.rs"]
mod client_cli;

const MAN_DIR: &str = "target/generated-man";

fn render_man_page(dir: &Path, command: Command) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let mut page = Vec::new();
    Man::new(command.clone()).render(&mut page)?;
    fs::write(dir.join(format!("{}.1", command.get_name())), page)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=src/cli.rs");
    println!("cargo:rerun-if-changed=src/bin/usocks-client/cli.rs");
    render_man_page(Path::new(MAN_DIR), cli::Cli::command())?;
    render_man_page(Path::new(MAN_DIR), client_cli::Cli::command())?;
    Ok(())
}
