//! Build script for the `kiln` manual pages.
//!
//! Renders `kiln.1` with an ENVIRONMENT section listing the variables the
//! builder reads, plus one page per subcommand (`kiln-build.1`,
//! `kiln-destroy.1`), into the build output directory for packaging.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

const MANUAL: &str = "kiln manual";

const ENVIRONMENT: &[(&str, &str)] = &[
    (
        "KILN_<FIELD>",
        "Any configuration field in upper case, for example KILN_REGION or KILN_IMAGE_NAME. Overrides kiln.toml.",
    ),
    (
        "KILN_CONFIG_PATH",
        "Configuration file to load instead of the discovered kiln.toml or .kiln.toml.",
    ),
    (
        "KILN_TIMEOUT_SECONDS",
        "How long a polled resource may stay absent. Defaults to 300.",
    ),
    (
        "KILN_POLL_DELAY_SECONDS",
        "Delay between resource observations. Defaults to 2.",
    ),
    ("RUST_LOG", "Log filter for messages written to stderr. Defaults to info."),
];

fn render_environment(buffer: &mut Vec<u8>) -> std::io::Result<()> {
    writeln!(buffer, ".SH ENVIRONMENT")?;
    for (name, meaning) in ENVIRONMENT {
        writeln!(buffer, ".TP")?;
        writeln!(buffer, r"\fB{name}\fR")?;
        writeln!(buffer, "{meaning}")?;
    }
    Ok(())
}

fn write_page(out_dir: &Path, file_name: &str, page: &[u8]) -> std::io::Result<()> {
    fs::write(out_dir.join(file_name), page)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir =
        PathBuf::from(env::var_os("OUT_DIR").ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "OUT_DIR was not set")
        })?);

    let command = Cli::command();
    let mut buffer = Vec::new();
    Man::new(command.clone()).manual(MANUAL).render(&mut buffer)?;
    render_environment(&mut buffer)?;
    write_page(&out_dir, "kiln.1", &buffer)?;

    for subcommand in command.get_subcommands() {
        let title = format!("kiln-{}", subcommand.get_name());
        let mut page = Vec::new();
        Man::new(subcommand.clone())
            .title(title.to_uppercase())
            .manual(MANUAL)
            .render(&mut page)?;
        write_page(&out_dir, &format!("{title}.1"), &page)?;
    }

    Ok(())
}
