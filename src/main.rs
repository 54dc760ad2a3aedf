use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::{arg, command, value_parser, ArgMatches, Command};
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use livepage::config::{LogFormat, RuntimeConfig};
use livepage::controls::{ControlId, ControlSnapshot, ControlValue};
use livepage::message::{BackMsg, Block, Delta, Element, ForwardBody, ForwardMsg, ScriptFinishedStatus, SessionEvent};
use livepage::program::ScriptSource;
use livepage::runtime::{ClientError, Runtime, SessionClient};
use livepage::script::FileSource;
use livepage::session::SessionId;

fn main() -> ExitCode {
    let matches = command!()
        .subcommand_required(true)
        .arg(
            arg!(--config <FILE> "Read settings from this TOML file instead of ./livepage.toml")
                .value_parser(value_parser!(PathBuf))
                .global(true),
        )
        .arg(
            arg!(--"log-format" <FORMAT> "Log output format: compact, pretty or json")
                .value_parser(value_parser!(LogFormat))
                .global(true),
        )
        .arg(
            arg!(--"max-message-size" <BYTES> "Largest delta sent to a client")
                .value_parser(value_parser!(usize))
                .global(true),
        )
        .subcommand(
            Command::new("run")
                .about("Run a page once and print its output")
                .arg(arg!(<file> "The page to run").value_parser(value_parser!(PathBuf)))
                .arg(
                    arg!(--set <ASSIGNMENT> "Rerun with a control set to a value, as key=json")
                        .action(clap::ArgAction::Append),
                ),
        )
        .subcommand(
            Command::new("check")
                .about("Compile a page and report errors without running it")
                .arg(arg!(<file> "The page to check").value_parser(value_parser!(PathBuf))),
        )
        .subcommand(
            Command::new("session")
                .about("Serve one session over stdio as newline-delimited JSON")
                .arg(arg!(<file> "The page to serve").value_parser(value_parser!(PathBuf))),
        )
        .get_matches();

    let config = match load_config(&matches) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", err.bright_red());
            return ExitCode::FAILURE;
        }
    };
    livepage::logging::init(config.log_format);

    match matches.subcommand() {
        Some(("check", args)) => check(file_arg(args)),
        Some(("run", args)) => {
            let assignments: Vec<String> = args
                .get_many::<String>("set")
                .map(|values| values.cloned().collect())
                .unwrap_or_default();
            block_on(run(config, file_arg(args), assignments))
        }
        Some(("session", args)) => block_on(serve_stdio(config, file_arg(args))),
        _ => ExitCode::FAILURE,
    }
}

fn file_arg(args: &ArgMatches) -> PathBuf {
    args.get_one::<PathBuf>("file").cloned().unwrap_or_default()
}

fn load_config(matches: &ArgMatches) -> Result<RuntimeConfig, String> {
    let path = matches.get_one::<PathBuf>("config");
    let mut config = RuntimeConfig::load(path.map(PathBuf::as_path)).map_err(|err| err.to_string())?;
    if let Some(format) = matches.get_one::<LogFormat>("log-format") {
        config.log_format = *format;
    }
    if let Some(size) = matches.get_one::<usize>("max-message-size") {
        config.max_message_size = *size;
    }
    Ok(config)
}

fn block_on(future: impl std::future::Future<Output = ExitCode>) -> ExitCode {
    match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime.block_on(future),
        Err(err) => {
            eprintln!("{}: {err}", "Could not start the async runtime".bright_red());
            ExitCode::FAILURE
        }
    }
}

fn check(file: PathBuf) -> ExitCode {
    let source = FileSource::new(&file);
    match source.compile() {
        Ok(_) => {
            println!("{} {}", "ok".bright_green(), file.display());
            ExitCode::SUCCESS
        }
        Err(failure) => {
            println!("{}", failure.report.bright_red());
            ExitCode::FAILURE
        }
    }
}

/// Forwards messages to the printing loop of `livepage run`.
struct ChannelClient(mpsc::UnboundedSender<ForwardMsg>);

impl SessionClient for ChannelClient {
    fn write_forward_msg(&self, msg: ForwardMsg) -> Result<(), ClientError> {
        self.0.send(msg).map_err(|_| ClientError::Closed)
    }
}

async fn run(config: RuntimeConfig, file: PathBuf, assignments: Vec<String>) -> ExitCode {
    let runtime = Runtime::new(config);
    let task = runtime.start();
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let source: Arc<dyn ScriptSource> = Arc::new(FileSource::new(&file));
    let id = match runtime.connect(source, Arc::new(ChannelClient(sender))) {
        Ok(id) => id,
        Err(err) => {
            eprintln!("{}: {err}", "Could not connect".bright_red());
            return ExitCode::FAILURE;
        }
    };

    let mut status = run_once(&runtime, &id, None, &mut receiver).await;
    if status == Some(ScriptFinishedStatus::FinishedSuccessfully) && !assignments.is_empty() {
        let controls = runtime
            .session_info(&id)
            .map(|info| info.session.controls())
            .unwrap_or_default();
        match resolve_assignments(&controls, &assignments) {
            Ok(snapshot) => {
                println!("{}", "--- rerun ---".dimmed());
                status = run_once(&runtime, &id, Some(snapshot), &mut receiver).await;
            }
            Err(err) => {
                eprintln!("{}", err.bright_red());
                status = None;
            }
        }
    }

    runtime.stop();
    if let Err(err) = task.await {
        eprintln!("{}: {err}", "Runtime task failed".bright_red());
    }
    match status {
        Some(ScriptFinishedStatus::FinishedSuccessfully) => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}

async fn run_once(
    runtime: &Runtime,
    id: &SessionId,
    controls: Option<ControlSnapshot>,
    receiver: &mut mpsc::UnboundedReceiver<ForwardMsg>,
) -> Option<ScriptFinishedStatus> {
    let rerun = BackMsg::Rerun {
        controls,
        fragment_id: None,
    };
    if let Err(err) = runtime.handle_back_msg(id, rerun) {
        eprintln!("{}: {err}", "Could not start the page".bright_red());
        return None;
    }
    while let Some(msg) = receiver.recv().await {
        print_message(&msg);
        if let Some(status) = msg.finished_status() {
            return Some(status);
        }
    }
    None
}

/// Matches `key=json` assignments against the ids of the declared controls:
/// an id matches a key if it equals it or if it is a keyed control with that
/// key.
fn resolve_assignments(controls: &ControlSnapshot, assignments: &[String]) -> Result<ControlSnapshot, String> {
    let mut snapshot = ControlSnapshot::new();
    for assignment in assignments {
        let Some((key, raw)) = assignment.split_once('=') else {
            return Err(format!("expected key=value, got `{assignment}`"));
        };
        let value: ControlValue = serde_json::from_str(raw)
            .or_else(|_| serde_json::from_value(serde_json::Value::String(raw.to_string())))
            .map_err(|err| format!("invalid value for `{key}`: {err}"))?;
        let suffix = format!("-{key}");
        let id = controls
            .iter()
            .map(|(id, _)| id)
            .find(|id| id.as_str() == key || id.as_str().ends_with(&suffix))
            .cloned()
            .unwrap_or_else(|| ControlId::new(key));
        snapshot.insert(id, value);
    }
    Ok(snapshot)
}

fn print_message(msg: &ForwardMsg) {
    let indent = "  ".repeat(msg.delta_path().len().saturating_sub(2));
    match &msg.body {
        ForwardBody::Delta { delta, .. } => match delta {
            Delta::NewElement { element } => println!("{indent}{}", render_element(element)),
            Delta::AddBlock { block } => {
                let label = match block {
                    Block::Vertical => "[container]".to_string(),
                    Block::Expander { label } => format!("[expander] {label}"),
                    Block::Fragment { id } => format!("[fragment {id}]"),
                };
                println!("{indent}{}", label.dimmed());
            }
        },
        ForwardBody::RefHash { hash } => println!("{indent}{}", format!("(cached {})", hash.short()).dimmed()),
        ForwardBody::SessionEvent {
            event: SessionEvent::ScriptCompilationException { report, .. },
        } => println!("{}", report.bright_red()),
        ForwardBody::SessionEvent {
            event: SessionEvent::CacheCleared,
        } => println!("{}", "caches cleared".dimmed()),
        ForwardBody::ScriptFinished { status } => {
            let text = format!("{status:?}");
            match status {
                ScriptFinishedStatus::FinishedWithCompileError => eprintln!("{}", text.bright_red()),
                _ => eprintln!("{}", text.dimmed()),
            }
        }
        ForwardBody::NewSession { .. } | ForwardBody::SessionStatusChanged { .. } => {}
    }
}

fn render_element(element: &Element) -> String {
    match element {
        Element::Title { body } => body.bold().underline().to_string(),
        Element::Header { body } => body.bold().to_string(),
        Element::Text { body } | Element::Markdown { body } => body.clone(),
        Element::Exception { kind, message, trace } => {
            let mut out = format!("{kind}: {message}").bright_red().to_string();
            for frame in trace {
                out.push_str(&format!("\n    {}", frame.red()));
            }
            out
        }
        Element::Image { url, mimetype } => format!("[image {mimetype}] {url}").cyan().to_string(),
        Element::Checkbox { id, label, value } => {
            format!("[checkbox {}] {label} = {value}", short_id(id)).cyan().to_string()
        }
        Element::Slider {
            id,
            label,
            min,
            max,
            value,
        } => format!("[slider {}] {label} = {value} ({min}..={max})", short_id(id))
            .cyan()
            .to_string(),
        Element::TextInput { id, label, value } => {
            format!("[text_input {}] {label} = {value:?}", short_id(id)).cyan().to_string()
        }
        Element::Button { id, label } => format!("[button {}] {label}", short_id(id)).cyan().to_string(),
        Element::Selectbox {
            id,
            label,
            options,
            index,
        } => {
            let selected = options.get(*index).map(String::as_str).unwrap_or("");
            format!("[selectbox {}] {label} = {selected:?}", short_id(id))
                .cyan()
                .to_string()
        }
    }
}

fn short_id(id: &str) -> &str {
    id.strip_prefix("$$ID-").unwrap_or(id)
}

/// Writes each message as one JSON line on stdout.
struct StdoutClient {
    stdout: Mutex<std::io::Stdout>,
}

impl SessionClient for StdoutClient {
    fn write_forward_msg(&self, msg: ForwardMsg) -> Result<(), ClientError> {
        let line = serde_json::to_string(&msg)?;
        let mut stdout = self.stdout.lock().map_err(|_| ClientError::Closed)?;
        writeln!(stdout, "{line}")?;
        stdout.flush()?;
        Ok(())
    }
}

async fn serve_stdio(config: RuntimeConfig, file: PathBuf) -> ExitCode {
    if !Path::new(&file).exists() {
        eprintln!("{}: {}", "No such file".bright_red(), file.display());
        return ExitCode::FAILURE;
    }
    let runtime = Runtime::new(config);
    let task = runtime.start();
    let client = Arc::new(StdoutClient {
        stdout: Mutex::new(std::io::stdout()),
    });
    let id = match runtime.connect(Arc::new(FileSource::new(&file)), client) {
        Ok(id) => id,
        Err(err) => {
            eprintln!("{}: {err}", "Could not connect".bright_red());
            return ExitCode::FAILURE;
        }
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::error!("cannot read stdin: {err}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let msg: BackMsg = match serde_json::from_str(&line) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!("ignoring malformed back message: {err}");
                continue;
            }
        };
        if let Err(err) = runtime.handle_back_msg(&id, msg) {
            tracing::warn!("{err}");
            if !runtime.is_active_session(&id) {
                break;
            }
        }
    }

    runtime.disconnect(&id);
    runtime.stop();
    if let Err(err) = task.await {
        tracing::error!("runtime task failed: {err}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
