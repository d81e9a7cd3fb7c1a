use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tessel_core::SyncOutcome;
use tessel_notes::{open_notebook, Notebook, NotesError};

#[derive(Parser, Debug)]
#[command(name = "tessel-notes")]
#[command(about = "Local-first notes with message threads")]
struct Cli {
    /// Directory holding every room's data
    #[arg(long, env = "TESSEL_DATA_DIR", default_value = "tessel_data", global = true)]
    data_dir: PathBuf,

    /// Room to open
    #[arg(long, default_value = "hello", global = true)]
    room: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the notes of the room
    List,
    /// Create an empty note
    New,
    /// Send a message to a note
    Send { note_id: String, text: String },
    /// Print a note and its messages
    Show { note_id: String },
    /// Delete everything stored for the room
    Wipe,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        log::error!("{e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), NotesError> {
    let mut book = open_notebook(&cli.data_dir, &cli.room).await?;
    match book.document().sync_outcome() {
        Some(SyncOutcome::Volatile { reason }) => {
            log::warn!("storage unavailable, changes will not be saved: {reason}")
        }
        Some(SyncOutcome::RecoveredEmpty { error }) => {
            log::warn!("stored data could not be read ({error}); run `wipe` to start over")
        }
        _ => {}
    }

    match cli.command {
        Command::List => list(&book)?,
        Command::New => {
            let note = book.create_note()?;
            println!("{}", note.id);
        }
        Command::Send { note_id, text } => {
            let message = book.send_message(&note_id, &text)?;
            println!("{}", message.id);
        }
        Command::Show { note_id } => {
            book.select(&note_id)?;
            let note = book.note(&note_id)?;
            println!("# {}", note.title);
            for message in book.messages(&note_id)? {
                println!("- {}", message.data);
            }
        }
        Command::Wipe => {
            book.document().wipe()?;
            log::info!("room `{}` wiped", cli.room);
        }
    }

    book.document().close();
    Ok(())
}

fn list(book: &Notebook) -> Result<(), NotesError> {
    let room = book.room_name()?.unwrap_or_default();
    println!("room {room}");
    for note in book.notes()? {
        let count = book.messages(&note.id)?.len();
        println!("{}  {}  ({count} messages)", note.id, note.title);
    }
    Ok(())
}
