use anyhow::Result;
use env_logger::{Builder, Env};
use log::error;

mod cli;
mod util;
mod cmd_put;
mod cmd_get;
mod cmd_del;
mod cmd_scan;
mod cmd_updates;
mod cmd_admin;

fn init_logger() {
    // Уровень берём из RUST_LOG, иначе дефолт — info.
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    init_logger();

    if let Err(e) = run() {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = <cli::Cli as clap::Parser>::parse();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(dispatch(cli.cmd))
}

async fn dispatch(cmd: cli::Cmd) -> Result<()> {
    match cmd {
        cli::Cmd::Put { path, key, value, column, sync } =>
            cmd_put::exec(path, key, value, column, sync).await,

        cli::Cmd::Get { path, key, column, out } =>
            cmd_get::exec(path, key, column, out).await,

        cli::Cmd::Del { path, key, column } =>
            cmd_del::exec(path, key, column).await,

        cli::Cmd::Scan(args) =>
            cmd_scan::exec(args).await,

        cli::Cmd::Updates { path, since, follow, json } =>
            cmd_updates::exec(path, since, follow, json).await,

        cli::Cmd::Property { path, name } =>
            cmd_admin::exec_property(path, name).await,

        cli::Cmd::Compact { path, column } =>
            cmd_admin::exec_compact(path, column).await,

        cli::Cmd::WalFiles { path, json } =>
            cmd_admin::exec_wal_files(path, json).await,
    }
}
