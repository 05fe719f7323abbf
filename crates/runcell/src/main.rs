//! runcell CLI entry point.
//!
//! Runs regions of a source file on a kernel behind a Jupyter Server and
//! prints what each region produced. This is a headless host for the
//! `runcell` library: the file is loaded into a buffer, regions become code
//! cells and the registry is ticked until every cell has its reply.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Parser;
use log::{info, warn};
use runcell::magic;
use runcell::persist::SessionData;
use runcell::settings::{load_settings, load_settings_from};
use runcell::{BufferHandle, BufferId, CellId, Point, SessionEvent, SessionRegistry};

#[derive(Parser, Debug)]
#[command(name = "runcell")]
#[command(about = "Run regions of a file on a Jupyter kernel")]
struct Cli {
    /// Source file to run
    file: PathBuf,

    /// Jupyter Server URL, token included (default: server_url from settings)
    #[arg(long)]
    url: Option<String>,

    /// Kernel to start
    #[arg(long, default_value = "python3")]
    kernel: String,

    /// Lines to run as one cell, 1-based and inclusive (e.g. 3:7); repeatable
    #[arg(long = "range", value_parser = parse_range)]
    ranges: Vec<(usize, usize)>,

    /// Run every `#%%` cell of the file in order
    #[arg(long)]
    magic: bool,

    /// Expression to run after the file regions; repeatable
    #[arg(long = "expr")]
    exprs: Vec<String>,

    /// Restore cells and outputs saved by an earlier --save before running
    #[arg(long)]
    load: Option<PathBuf>,

    /// Write cells and outputs here when done
    #[arg(long)]
    save: Option<PathBuf>,

    /// Settings file (default: <config dir>/runcell/settings.json)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn parse_range(value: &str) -> Result<(usize, usize), String> {
    let (first, last) = value
        .split_once(':')
        .ok_or_else(|| format!("expected FIRST:LAST, got {value:?}"))?;
    let first: usize = first.trim().parse().map_err(|e| format!("{first:?}: {e}"))?;
    let last: usize = last.trim().parse().map_err(|e| format!("{last:?}: {e}"))?;
    if first == 0 || last < first {
        return Err(format!("invalid line range {value:?}"));
    }
    Ok((first - 1, last - 1))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let settings = match &cli.settings {
        Some(path) => load_settings_from(path),
        None => load_settings(),
    };
    let Some(server_url) = cli.url.clone().or_else(|| settings.server_url.clone()) else {
        bail!("no server URL: pass --url or set server_url in the settings file");
    };

    let text = std::fs::read_to_string(&cli.file)
        .with_context(|| format!("failed to read {}", cli.file.display()))?;
    let buffer = BufferHandle::from_text(BufferId(1), &text);
    let mut registry = SessionRegistry::new(settings);

    let result = run(&cli, &server_url, &buffer, &mut registry).await;

    if let Err(e) = registry.deinitialize_all().await {
        warn!("Failed to shut down kernels: {}", e);
    }
    result
}

async fn run(
    cli: &Cli,
    server_url: &str,
    buffer: &BufferHandle,
    registry: &mut SessionRegistry,
) -> anyhow::Result<()> {
    let kernel_id = match &cli.load {
        Some(path) => {
            let data = SessionData::read(path)
                .with_context(|| format!("failed to load session from {}", path.display()))?;
            registry.load(buffer, server_url, &data, false).await?
        }
        None => {
            registry
                .initialize_buffer(buffer, server_url, &cli.kernel, false)
                .await?
        }
    };
    info!("Kernel {} ready for {}", kernel_id, cli.file.display());

    let mut ran: Vec<CellId> = Vec::new();
    for (first, last) in &cli.ranges {
        let begin = Point::new(*first, 0);
        let end = Point::new(*last, usize::MAX);
        ran.push(registry.evaluate(buffer, Some(&kernel_id), begin, end).await?);
    }
    if cli.magic {
        let cells = magic::find_magic_cells(&buffer.lock());
        for cell in cells {
            if let Some(id) = registry
                .evaluate_magic_cell(buffer, Some(&kernel_id), cell.marker_line)
                .await?
            {
                ran.push(id);
            }
        }
    }
    // Expression cells sit at the buffer origin and would replace a file
    // cell there, so they get a scratch buffer sharing the kernel.
    let scratch = BufferHandle::from_text(BufferId(2), "");
    let mut expressions: Vec<(String, CellId)> = Vec::new();
    if !cli.exprs.is_empty() {
        registry.attach_shared(&scratch, &kernel_id)?;
        for expr in &cli.exprs {
            let id = registry
                .evaluate_expression(&scratch, Some(&kernel_id), expr)
                .await?;
            expressions.push((expr.clone(), id));
            drive(registry, scratch.id()).await?;
        }
    }
    if ran.is_empty() && expressions.is_empty() && cli.load.is_none() {
        let end = buffer.lock().end_point();
        ran.push(registry.evaluate(buffer, Some(&kernel_id), Point::new(0, 0), end).await?);
    }

    drive(registry, buffer.id()).await?;
    print_cells(registry, buffer.id());
    for (expr, id) in &expressions {
        if let Some(output) = registry.output(&kernel_id, *id) {
            println!(">>> {}", expr);
            println!("{}", output.text().trim_end());
        }
        ran.push(*id);
    }

    if let Some(path) = &cli.save {
        save(registry, buffer.id(), &kernel_id, path)?;
    }

    let failed = ran
        .iter()
        .filter(|id| registry.output(&kernel_id, **id).is_some_and(|o| !o.success))
        .count();
    if failed > 0 {
        bail!("{} of {} cells failed", failed, ran.len());
    }
    Ok(())
}

/// Tick until nothing on `buffer` is waiting for a reply, answering input
/// requests from this process's stdin. The first Ctrl-C interrupts the
/// kernels, a second one gives up.
async fn drive(registry: &mut SessionRegistry, buffer: BufferId) -> anyhow::Result<()> {
    let tick_rate = registry.settings().tick_rate();
    let mut interrupted = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while !registry.is_idle(buffer) {
        for (kernel_id, event) in registry.tick(Some(buffer)) {
            match event {
                SessionEvent::StateChanged { from, to } => {
                    info!("{}: {} -> {}", kernel_id, from, to);
                }
                SessionEvent::Done { cell, success } => {
                    info!("{}: {} finished (success: {})", kernel_id, cell, success);
                }
                _ => {}
            }
        }
        for (kernel_id, prompt) in registry.tick_input(Some(buffer)) {
            let answer = read_line(&prompt.prompt)?;
            registry.send_stdin(&kernel_id, &answer)?;
        }

        tokio::select! {
            _ = tokio::time::sleep(tick_rate) => {}
            signal = &mut ctrl_c => {
                signal.context("failed to listen for ctrl-c")?;
                escalate(&mut interrupted)?;
                ctrl_c.set(tokio::signal::ctrl_c());
                warn!("Interrupting kernels on buffer {}, Ctrl-C again to quit", buffer);
                for kernel_id in registry.kernels_on(buffer) {
                    registry.interrupt(buffer, Some(&kernel_id)).await?;
                }
            }
        }
    }
    Ok(())
}

/// Record a Ctrl-C. The second one is an error, so `main` still shuts the
/// kernels down on the way out.
fn escalate(interrupted: &mut bool) -> anyhow::Result<()> {
    if *interrupted {
        bail!("interrupted");
    }
    *interrupted = true;
    Ok(())
}

fn read_line(prompt: &str) -> anyhow::Result<String> {
    let mut stdout = std::io::stdout();
    write!(stdout, "{}", prompt)?;
    stdout.flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn print_cells(registry: &SessionRegistry, buffer: BufferId) {
    for cell in registry.sorted_cells(buffer) {
        let Some(output) = registry.output(&cell.kernel_id, cell.cell) else {
            continue;
        };
        let count = output
            .execution_count
            .map(|n| n.to_string())
            .unwrap_or_else(|| " ".to_string());
        println!(
            "[{}] lines {}-{}{}",
            count,
            cell.begin.line + 1,
            cell.end.line + 1,
            if output.stale { " (stale)" } else { "" }
        );
        let text = output.text();
        if !text.is_empty() {
            println!("{}", text.trim_end());
        }
    }
}

fn save(
    registry: &SessionRegistry,
    buffer: BufferId,
    kernel_id: &str,
    path: &Path,
) -> anyhow::Result<()> {
    let data = registry.save(buffer, Some(kernel_id))?;
    data.write(path)
        .with_context(|| format!("failed to save session to {}", path.display()))?;
    info!("Saved {} cells to {}", data.cells.len(), path.display());
    Ok(())
}
