use std::collections::VecDeque;
use std::io::{self, Write};
use std::time::Duration;

use clap::{CommandFactory, Parser};
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use studio_stream::backend::{BackendClient, HealthVerdict};
use studio_stream::benchmark::run_benchmark;
use studio_stream::cli::{Args, Command, ReplInput, REPL_HELP};
use studio_stream::config::{Persona, StudioConfig};
use studio_stream::history;
use studio_stream::{ChatStream, StreamEvent, StreamingChatSession};

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "studio_stream=warn",
        1 => "studio_stream=info",
        _ => "studio_stream=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> CliResult {
    let args = Args::parse();
    init_tracing(args.verbose);

    if let Command::Completions { shell } = args.command {
        let mut cmd = Args::command();
        let name = cmd.get_name().to_string();
        clap_complete::generate(shell, &mut cmd, name, &mut io::stdout());
        return Ok(());
    }

    let mut config = StudioConfig::resolve(args.config.as_deref())?;
    if let Some(url) = args.base_url {
        config.base_url = url;
    }
    if let Some(persona) = args.persona {
        config.persona = persona;
        config.system_prompt = None;
    }
    config.validate()?;

    match args.command {
        Command::Chat => run_chat(config).await,
        Command::Ask { prompt } => run_ask(&config, &prompt).await,
        Command::Health => run_health(&config).await,
        Command::WaitForReady { timeout, interval } => {
            let backend = BackendClient::new(config.base_url.as_str());
            let report = backend
                .wait_for_ready(Duration::from_secs(timeout), Duration::from_secs(interval.max(1)))
                .await?;
            let profile = report
                .health
                .and_then(|h| h.current_profile)
                .unwrap_or_else(|| "unknown".into());
            println!("{} model ready (profile: {})", "✓".green().bold(), profile);
            Ok(())
        }
        Command::Benchmark { iterations, prompt, output } => {
            let report =
                run_benchmark(&config.session_config(), &config.chat_options()?, &prompt, iterations).await;
            print!("{}", report.render());
            if let Some(path) = output {
                report.write_json(&path)?;
                println!("report written to {}", path.display());
            }
            if report.aggregate.successful == 0 && iterations > 0 {
                return Err("every benchmark run failed".into());
            }
            Ok(())
        }
        Command::Profiles => {
            let profiles = BackendClient::new(config.base_url.as_str()).profiles().await?;
            println!("{}", serde_json::to_string_pretty(&profiles)?);
            Ok(())
        }
        Command::Switch { profile } => {
            let active = BackendClient::new(config.base_url.as_str()).switch_model(&profile).await?;
            println!("{} active profile: {}", "✓".green().bold(), active.bold());
            Ok(())
        }
        Command::Completions { .. } => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// One-shot commands
// ---------------------------------------------------------------------------

async fn run_ask(config: &StudioConfig, prompt: &str) -> CliResult {
    let session = StreamingChatSession::new(config.session_config());
    let Some(mut stream) = session.send(prompt, &config.chat_options()?) else {
        return Err("prompt is empty".into());
    };

    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::Delta { delta, .. } => {
                print!("{delta}");
                io::stdout().flush()?;
            }
            StreamEvent::Final { metrics, .. } => {
                println!();
                eprintln!(
                    "{}",
                    format!(
                        "{} tokens in {:.2}s ({:.1} tok/s)",
                        metrics.deltas,
                        metrics.elapsed().as_secs_f64(),
                        metrics.tokens_per_second()
                    )
                    .dimmed()
                );
            }
            StreamEvent::Cancelled { .. } => println!(),
            StreamEvent::Error { error, .. } => {
                println!();
                return Err(error.into());
            }
        }
    }
    Ok(())
}

async fn run_health(config: &StudioConfig) -> CliResult {
    let report = BackendClient::new(config.base_url.as_str()).check().await;
    let verdict = match report.verdict {
        HealthVerdict::Healthy => report.verdict.to_string().green().bold(),
        HealthVerdict::Loading => report.verdict.to_string().yellow().bold(),
        HealthVerdict::Unreachable => report.verdict.to_string().red().bold(),
    };

    println!("{} {}", "backend:".bold(), config.base_url);
    println!("{} {}", "status: ".bold(), verdict);
    println!("{} {} ms", "latency:".bold(), report.response_time.as_millis());
    if let Some(health) = &report.health {
        if let Some(profile) = &health.current_profile {
            println!("{} {}", "profile:".bold(), profile);
        }
        if let Some(ready) = health.model_ready {
            println!("{} {}", "ready:  ".bold(), ready);
        }
        if let Some(cap) = &health.capacity {
            println!(
                "{} {}/{} active, {} available",
                "slots:  ".bold(),
                cap.active,
                cap.total,
                cap.available
            );
        }
    }
    if let Some(err) = &report.error {
        println!("{} {}", "error:  ".bold(), err.red());
    }

    if report.verdict == HealthVerdict::Unreachable {
        return Err(format!("backend at {} is unreachable", config.base_url).into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Interactive chat
// ---------------------------------------------------------------------------

enum ReplyEnd {
    Done,
    /// A new line was typed while the reply was streaming.
    BargeIn(String),
    Eof,
}

async fn run_chat(mut config: StudioConfig) -> CliResult {
    let session = StreamingChatSession::new(config.session_config());
    let mut options = config.chat_options()?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!(
        "{} {} {}",
        "studio".bold().cyan(),
        format!("[{}]", config.persona).dimmed(),
        format!("connected to {}. /help for commands, Ctrl-C stops a reply.", config.base_url).dimmed()
    );

    // Lines typed while a reply streamed, run once it ends.
    let mut pending: VecDeque<String> = VecDeque::new();
    loop {
        let line = match pending.pop_front() {
            Some(line) => line,
            None => {
                print!("{} ", ">".green().bold());
                io::stdout().flush()?;
                tokio::select! {
                    line = lines.next_line() => match line? {
                        Some(line) => line,
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        println!();
                        break;
                    }
                }
            }
        };

        match ReplInput::parse(&line) {
            ReplInput::Empty => {}
            ReplInput::Quit => break,
            ReplInput::Help => println!("{}", REPL_HELP.dimmed()),
            ReplInput::Clear => {
                session.clear_history();
                println!("{}", "conversation cleared".dimmed());
            }
            ReplInput::Stats => {
                let stats = session.stats();
                println!(
                    "{}",
                    format!(
                        "{} replies, {} tokens, {:.1}s total, {:.1} tok/s average",
                        stats.requests,
                        stats.total_tokens,
                        stats.total_time.as_secs_f64(),
                        stats.average_tps()
                    )
                    .dimmed()
                );
            }
            ReplInput::Save(path) => {
                let path = path.unwrap_or_else(history::default_export_name);
                match history::save(&path, &session.history()) {
                    Ok(()) => println!("{}", format!("saved to {}", path.display()).dimmed()),
                    Err(e) => eprintln!("{} {}", "error:".red().bold(), e),
                }
            }
            ReplInput::Load(path) => match history::load(&path) {
                Ok(messages) => {
                    let n = messages.len();
                    session.restore_history(messages);
                    println!("{}", format!("loaded {n} messages").dimmed());
                }
                Err(e) => eprintln!("{} {}", "error:".red().bold(), e),
            },
            ReplInput::Persona(name) => match name.parse::<Persona>() {
                Ok(persona) => {
                    config.persona = persona.to_string();
                    config.system_prompt = None;
                    options = config.chat_options()?;
                    println!("{}", format!("persona: {persona}").dimmed());
                }
                Err(e) => eprintln!("{} {}", "error:".red().bold(), e),
            },
            ReplInput::Unknown(cmd) => {
                eprintln!("{} unknown command {}", "error:".red().bold(), cmd);
            }
            ReplInput::Message(text) => {
                let Some(stream) = session.send(&text, &options) else {
                    continue;
                };
                match stream_reply(&session, stream, &mut lines, &mut pending).await? {
                    ReplyEnd::Done => {}
                    ReplyEnd::BargeIn(line) => pending.push_back(line),
                    ReplyEnd::Eof => break,
                }
            }
        }
    }

    session.cancel();
    Ok(())
}

/// Print one reply as it streams, watching stdin and Ctrl-C at the same time.
async fn stream_reply(
    session: &StreamingChatSession,
    mut stream: ChatStream,
    lines: &mut Lines<BufReader<Stdin>>,
    queued: &mut VecDeque<String>,
) -> CliResult<ReplyEnd> {
    loop {
        tokio::select! {
            event = stream.next() => {
                let Some(event) = event else {
                    return Ok(ReplyEnd::Done);
                };
                match event {
                    StreamEvent::Delta { delta, .. } => {
                        print!("{delta}");
                        io::stdout().flush()?;
                    }
                    StreamEvent::Final { metrics, .. } => {
                        println!();
                        println!(
                            "{}",
                            format!(
                                "[{} tokens, {:.2}s, {:.1} tok/s]",
                                metrics.deltas,
                                metrics.elapsed().as_secs_f64(),
                                metrics.tokens_per_second()
                            )
                            .dimmed()
                        );
                    }
                    StreamEvent::Cancelled { .. } => {
                        println!(" {}", "[stopped]".yellow());
                    }
                    StreamEvent::Error { error, .. } => {
                        println!();
                        if error.is_busy() {
                            eprintln!(
                                "{} {} (try `studio wait-for-ready`)",
                                "busy:".yellow().bold(),
                                error
                            );
                        } else {
                            eprintln!("{} {}", "error:".red().bold(), error);
                        }
                    }
                }
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) => match ReplInput::parse(&line) {
                        input if input.interrupts_reply() => {
                            // Dropping the stream settles the turn with its partial text.
                            drop(stream);
                            println!(" {}", "[interrupted]".yellow());
                            return Ok(ReplyEnd::BargeIn(line));
                        }
                        ReplInput::Empty => {}
                        ReplInput::Quit => {
                            session.cancel();
                            println!();
                            return Ok(ReplyEnd::Eof);
                        }
                        // Other slash commands wait for the reply to finish.
                        _ => queued.push_back(line),
                    },
                    None => {
                        session.cancel();
                        println!();
                        return Ok(ReplyEnd::Eof);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                session.cancel();
            }
        }
    }
}
