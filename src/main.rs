//! Binary entry point for the Transient CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;

use transient::{
    ImageKind, ImageStore, ImageStoreError, ProcessCommandRunner, RunError, RunOverrides,
    RunRequest, StoreConfig, VmRunner, generated_vm_name, parse_copy_pair, parse_shared_folder,
};

mod cli;

use cli::{Cli, DeleteCli, ListCli, RunCli};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Store(#[from] ImageStoreError),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error("failed to write output: {0}")]
    Output(String),
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    // Logs go to stderr: stdout belongs to the guest console and listings.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Run(args) => run_command(args).await,
        Cli::List(args) => list_command(&args),
        Cli::Delete(args) => delete_command(&args),
    }
}

fn open_store() -> Result<ImageStore<ProcessCommandRunner>, CliError> {
    let store_config =
        StoreConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    store_config
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    Ok(ImageStore::open(&store_config, ProcessCommandRunner)?)
}

async fn run_command(args: RunCli) -> Result<i32, CliError> {
    let run_config = transient::RunConfig::load_without_cli_args()
        .map_err(|err| CliError::Config(err.to_string()))?
        .merge_overrides(RunOverrides {
            ssh_user: args.ssh_user,
            ssh_port: args.ssh_port,
            ssh_timeout_secs: args.ssh_timeout,
            shutdown_timeout_secs: args.shutdown_timeout,
            copy_timeout_secs: args.copy_timeout,
        });

    let store = open_store()?;

    let shared_folders = args
        .shared_folder
        .iter()
        .map(|spec| parse_shared_folder(spec))
        .collect::<Result<Vec<_>, _>>()?;
    let copy_in_before = args
        .copy_in_before
        .iter()
        .map(|spec| parse_copy_pair(spec))
        .collect::<Result<Vec<_>, _>>()?;
    let copy_out_after = args
        .copy_out_after
        .iter()
        .map(|spec| parse_copy_pair(spec))
        .collect::<Result<Vec<_>, _>>()?;

    let request = RunRequest {
        vm_name: args.name.unwrap_or_else(generated_vm_name),
        images: args.image,
        prepare_only: args.prepare_only,
        ssh_console: args.ssh_console,
        ssh_with_serial: args.ssh_with_serial,
        ssh_command: args.ssh_command,
        shared_folders,
        copy_in_before,
        copy_out_after,
        qemu_args: args.qemu_args,
    };

    let runner = VmRunner::new(run_config, store, ProcessCommandRunner)?;
    Ok(runner.execute(&request).await?)
}

fn list_command(args: &ListCli) -> Result<i32, CliError> {
    let store = open_store()?;
    let images = store.list(args.name.as_deref(), args.image.as_deref())?;

    let mut stdout = io::stdout();
    for info in &images {
        let kind = match info.kind {
            ImageKind::Backend => "backend",
            ImageKind::Frontend => "frontend",
        };
        writeln!(
            stdout,
            "{kind}\t{}\t{}\t{}\t{}",
            info.vm_name.as_deref().unwrap_or("-"),
            info.name,
            info.size_bytes,
            info.path
        )
        .map_err(|err| CliError::Output(err.to_string()))?;
    }
    Ok(0)
}

fn delete_command(args: &DeleteCli) -> Result<i32, CliError> {
    let store = open_store()?;
    let removed = store.delete(args.name.as_deref(), args.image.as_deref(), args.force)?;

    let mut stdout = io::stdout();
    for path in &removed {
        writeln!(stdout, "deleted {path}").map_err(|err| CliError::Output(err.to_string()))?;
    }
    Ok(0)
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_error_renders_single_line_messages() {
        let mut buf = Vec::new();
        let err = CliError::Config(String::from("missing ssh_user"));
        write_error(&mut buf, &err);
        let rendered = String::from_utf8(buf).unwrap_or_else(|err| panic!("utf8: {err}"));
        assert_eq!(rendered, "configuration error: missing ssh_user\n");
    }

    #[test]
    fn store_errors_pass_through_unwrapped() {
        let err = CliError::from(ImageStoreError::NothingSelected);
        assert_eq!(
            err.to_string(),
            "nothing selected: pass --name and/or --image to delete"
        );
    }
}
