use std::io::{self, ErrorKind, Write};
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use studio_engine::SessionController;

#[derive(Debug, Parser)]
#[command(name = "studio-rs", version, about = "Image clone studio CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// One-shot: select an image, run a single generation, export the result.
    Edit(EditArgs),
    /// Interactive session with history, like the studio surface.
    Session(SessionArgs),
}

#[derive(Debug, Parser)]
struct EditArgs {
    /// Source image to transform.
    #[arg(long)]
    image: PathBuf,
    /// Instruction text; falls back to the studio default.
    #[arg(long)]
    prompt: Option<String>,
    /// Directory the generated image is exported into.
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    /// Image model; `dryrun` runs offline.
    #[arg(long)]
    model: Option<String>,
}

#[derive(Debug, Parser)]
struct SessionArgs {
    /// Session working directory (previews and exports land here).
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    model: Option<String>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("studio-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Edit(args) => run_edit(args),
        Command::Session(args) => {
            run_session(args)?;
            Ok(0)
        }
    }
}

fn run_edit(args: EditArgs) -> Result<i32> {
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let mut controller = SessionController::new(&args.out, &events_path, args.model)?;

    controller.select_image(&args.image)?;
    if let Some(prompt) = args.prompt {
        controller.update_instruction(prompt);
    }

    match controller.generate() {
        Ok(record) => {
            let path = controller.export_record(&record.id, &args.out)?;
            println!("{}", path.display());
            Ok(0)
        }
        Err(err) => {
            eprintln!("generation failed: {err}");
            Ok(1)
        }
    }
}

fn run_session(args: SessionArgs) -> Result<()> {
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let mut controller = SessionController::new(&args.out, &events_path, args.model)?;
    let export_dir = args.out.join("exports");

    println!(
        "Clone studio session started (provider: {}). Type /help for commands.",
        controller.provider_name()
    );

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']).trim();
        if input.is_empty() {
            continue;
        }

        if !input.starts_with('/') {
            // Plain text edits the instruction, like typing in the prompt box.
            controller.update_instruction(input);
            println!("Instruction set.");
            continue;
        }

        let (command, rest) = match input.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (input, ""),
        };

        match command {
            "/help" => {
                println!(
                    "Commands: /use <path>  /prompt <text>  /show  /generate  /history  \
                     /save <id>  /delete <id>  /wipe  /clear  /quit"
                );
                println!("Plain text (no slash) also sets the instruction.");
            }
            "/use" => {
                if rest.is_empty() {
                    println!("/use requires a path");
                    continue;
                }
                match controller.select_image(&PathBuf::from(rest)) {
                    Ok(()) => println!("Selected {rest}"),
                    Err(err) => println!("Select failed: {err:#}"),
                }
            }
            "/prompt" => {
                if rest.is_empty() {
                    println!("/prompt requires text");
                    continue;
                }
                controller.update_instruction(rest);
                println!("Instruction set.");
            }
            "/show" => {
                println!("Phase: {}", controller.phase().as_str());
                println!("Instruction: {}", controller.instruction());
                match controller.preview_path() {
                    Some(path) => println!("Selection preview: {}", path.display()),
                    None => println!("No image selected."),
                }
                if let Some(error) = controller.error() {
                    println!("Error: {error}");
                }
            }
            "/generate" => match controller.generate() {
                Ok(record) => {
                    println!(
                        "Generated record {} ({} in history)",
                        record.id,
                        controller.history().len()
                    );
                }
                Err(err) => println!("Generation failed: {err}"),
            },
            "/history" => {
                if controller.history().is_empty() {
                    println!("History is empty.");
                    continue;
                }
                for record in controller.history().records() {
                    println!(
                        "{}  {}  \"{}\"",
                        record.id,
                        format_clock(record.timestamp_ms),
                        record.prompt
                    );
                }
            }
            "/save" => {
                if rest.is_empty() {
                    println!("/save requires a record id");
                    continue;
                }
                match controller.export_record(rest, &export_dir) {
                    Ok(path) => println!("Saved {}", path.display()),
                    Err(err) => println!("Save failed: {err:#}"),
                }
            }
            "/delete" => {
                if rest.is_empty() {
                    println!("/delete requires a record id");
                    continue;
                }
                if controller.delete_record(rest)? {
                    println!("Deleted {rest}");
                } else {
                    println!("No record with id {rest}");
                }
            }
            "/wipe" => {
                controller.clear_history()?;
                println!("History cleared.");
            }
            "/clear" => {
                controller.clear_selection()?;
                println!("Selection cleared.");
            }
            "/quit" | "/exit" => break,
            other => println!("Unknown command {other}; try /help"),
        }
    }

    Ok(())
}

fn format_clock(timestamp_ms: u64) -> String {
    let seconds_of_day = (timestamp_ms / 1000) % 86_400;
    format!("{:02}:{:02}", seconds_of_day / 3600, (seconds_of_day % 3600) / 60)
}
