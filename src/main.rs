use std::path::PathBuf;

use clap::{Parser, Subcommand};

use note_cards::{commands, NotesConfig};

/// note-cards – plain-text note cards with full-text search and link tokens.
///
/// Notes are `*.notes` files in `~/.notes` (or `$NOTE_CARDS_DIR`). The list of
/// cards, their order and colors live in a small SQLite file next to them.
#[derive(Parser)]
#[command(name = "note-cards", version, about = "Plain-text note cards")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Notes directory (overrides $NOTE_CARDS_DIR and ~/.notes)
    #[arg(short, long, global = true)]
    dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered notes
    List,
    /// Create a new note; a numeric suffix is added if the name is taken
    New { name: String },
    /// Unregister a note and delete its file
    Delete { path: String },
    /// Full-text search over all notes
    Search {
        #[arg(required = true)]
        query: Vec<String>,
    },
    /// Suggest completions for the last word of a query
    Complete { prefix: String },
    /// Headings of a note with their byte offsets
    Topics { path: String },
    /// Print a link token pointing at an offset in a note
    Link {
        path: String,
        offset: usize,
        /// Link label; letters and dots only
        #[arg(long)]
        label: Option<String>,
    },
    /// Check a link token and print its target
    Resolve { token: String },
    /// Set a color tag (#RRGGBB); repeating the same color clears it
    Color { path: String, hex: String },
    /// Append a paragraph to a note
    Append { path: String, text: String },
    /// Open a note in the system editor (the last opened note by default)
    Open { path: Option<String> },
    /// Keep the note list and index in sync with the directory until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    note_cards::init_tracing();
    let cli = Cli::parse();

    let config = match cli.dir {
        Some(dir) => NotesConfig::load(&dir),
        None => NotesConfig::detect(),
    };
    let mut session = note_cards::open_session(config)?;

    match cli.command {
        Commands::List => {
            for note in commands::list(&mut session).await? {
                match note.color {
                    Some(color) => println!("{}\t{}\t{color}", note.display_name, note.path),
                    None => println!("{}\t{}", note.display_name, note.path),
                }
            }
        }
        Commands::New { name } => {
            let note = commands::new_note(&mut session, &name).await?;
            println!("{}", note.path);
        }
        Commands::Delete { path } => commands::delete(&mut session, &path).await?,
        Commands::Search { query } => {
            let hits = commands::search(&mut session, &query.join(" ")).await?;
            if hits.is_empty() {
                eprintln!("No matches");
            }
            for (note, term, score) in hits {
                println!("{score:.3}\t{}\t{term}\t{}", note.display_name, note.path);
            }
        }
        Commands::Complete { prefix } => {
            for suggestion in commands::complete(&mut session, &prefix).await? {
                println!("{suggestion}");
            }
        }
        Commands::Topics { path } => {
            for topic in commands::topics(&mut session, &path).await? {
                println!("{}\t{}", topic.offset, topic.heading_text);
            }
        }
        Commands::Link { path, offset, label } => {
            println!("{}", commands::link_to(&session, &path, offset, label.as_deref()));
        }
        Commands::Resolve { token } => {
            let (path, offset) = commands::resolve(&session, &token).await?;
            println!("{path}:{offset}");
        }
        Commands::Color { path, hex } => match commands::color(&session, &path, &hex)? {
            Some(color) => println!("{color}"),
            None => println!("cleared"),
        },
        Commands::Append { path, text } => commands::append(&mut session, &path, &text).await?,
        Commands::Open { path } => commands::open_in_editor(&mut session, path.as_deref()).await?,
        Commands::Watch => commands::watch(&mut session).await?,
    }

    session.shutdown();
    Ok(())
}
