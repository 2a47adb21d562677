use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use hutch::backend::{self, Backend, CreateArgs, CreateResult};
use hutch::cli::{self, Cli, Command};
use hutch::image;
use hutch::paths;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("hutch=debug")
    } else {
        EnvFilter::from_default_env()
            .add_directive("hutch=info".parse().expect("valid log directive"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling");
            ctrl_c_cancel.cancel();
        }
    });

    let backend = backend::create_backend();

    match cli.command {
        Command::Create {
            name,
            workload,
            mem,
            cpus,
            disk,
            mount,
            http_proxy,
            https_proxy,
            no_proxy,
            update,
            debug,
        } => {
            let mounts = cli::parse_mounts(&mount)?;
            let args = CreateArgs {
                name,
                workload,
                http_proxy: http_proxy.unwrap_or_default(),
                https_proxy: https_proxy.unwrap_or_default(),
                no_proxy: no_proxy.unwrap_or_default(),
                update,
                debug,
                custom: cli::overrides(mem, cpus, disk, mounts),
            };

            let (result_tx, result_rx) = mpsc::channel::<CreateResult>(64);
            let (download_tx, download_rx) = mpsc::channel(4);
            tokio::spawn(image::run_downloader(paths::cache_dir(), download_rx));
            let printer = tokio::spawn(print_results(result_rx));

            let outcome = backend
                .create_instance(&cancel, &result_tx, &download_tx, args)
                .await;
            drop(result_tx);
            let _ = printer.await;
            outcome?;
        }
        Command::Start {
            name,
            mem,
            cpus,
            disk,
            mount,
        } => {
            let mounts = cli::parse_mounts(&mount)?;
            let custom = cli::overrides(mem, cpus, disk, mounts);
            backend.start(&cancel, &name, custom).await?;
            println!("{name} started");
        }
        Command::Stop { name } => {
            backend.stop(&cancel, &name).await?;
            println!("{name} stopping");
        }
        Command::Quit { name } => {
            backend.quit(&cancel, &name).await?;
            println!("{name} terminated");
        }
        Command::Status { name } => {
            let details = backend.status(&cancel, &name).await?;
            println!("name:     {}", details.name);
            println!("workload: {}", details.workload_name);
            println!(
                "vm:       {} MiB RAM, {} cpus, {} GiB disk",
                details.vm.mem_mib, details.vm.cpus, details.vm.disk_gib
            );
            println!(
                "ssh:      ssh -i {} -p {} hutch@127.0.0.1",
                details.key_path.display(),
                details.ssh_port
            );
        }
        Command::Delete { name } => {
            backend.delete_instance(&cancel, &name).await?;
            println!("{name} deleted");
        }
    }

    Ok(())
}

/// Render creation Result lines: transient download counters update a
/// spinner in place, everything else is printed above it.
async fn print_results(mut rx: mpsc::Receiver<CreateResult>) {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}").expect("valid progress template"),
    );

    while let Some(result) = rx.recv().await {
        let line = result.line.trim_end();
        if line.starts_with("Downloaded ") {
            spinner.set_message(line.to_string());
        } else {
            spinner.println(line);
            spinner.set_message(String::new());
        }
        spinner.tick();
    }
    spinner.finish_and_clear();
}
