//! Cinedex CLI
//!
//! Command-line front end for the movie catalog:
//! - `serve`: run the REST server over a JSON movie file
//! - `seed`: write the starter catalog
//! - `list`: print movies, optionally filtered or ranked
//! - `show`: fetch movies by id through the batched loader

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

use cinedex_loader::{Loader, LoaderConfig};
use cinedex_storage::{Movie, MovieStore, StoreConfig};

mod logging;
mod sample;
mod server;

#[derive(Parser)]
#[command(name = "cinedex")]
#[command(author, version, about = "Cinedex: a movie and review catalog")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct DataArgs {
    /// Movie data file
    #[arg(long, env = "CINEDEX_DATA", default_value = "movies.json")]
    data: PathBuf,
}

impl DataArgs {
    fn store(&self) -> MovieStore {
        MovieStore::new(StoreConfig {
            data_path: self.data.clone(),
            ..Default::default()
        })
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the REST server.
    Serve {
        #[command(flatten)]
        data: DataArgs,

        /// Address to listen on
        #[arg(long, env = "CINEDEX_LISTEN", default_value = "127.0.0.1:4000")]
        listen: SocketAddr,

        /// Override the port of `--listen`
        #[arg(long, env = "PORT")]
        port: Option<u16>,

        /// Dispatch a loader batch once it holds this many distinct ids
        #[arg(long, default_value_t = 256)]
        max_batch_size: usize,

        /// Extra wait before a loader batch is dispatched
        #[arg(long, default_value_t = 0)]
        batch_delay_ms: u64,

        /// Write `{addr, pid}` here once the listener is bound
        #[arg(long)]
        ready_file: Option<PathBuf>,

        /// Create an admin account with this email at startup
        #[arg(long, env = "CINEDEX_ADMIN_EMAIL", requires = "admin_password")]
        admin_email: Option<String>,

        #[arg(long, env = "CINEDEX_ADMIN_PASSWORD", hide_env_values = true)]
        admin_password: Option<String>,

        /// Minutes a login token stays valid
        #[arg(long, env = "CINEDEX_SESSION_TTL_MINS", default_value_t = 24 * 60)]
        session_ttl_mins: u64,
    },

    /// Write the starter catalog to the data file.
    Seed {
        #[command(flatten)]
        data: DataArgs,

        /// Replace a data file that already holds movies
        #[arg(long)]
        force: bool,
    },

    /// Print movies.
    ///
    /// Without flags every movie is listed. Filters are applied in the order
    /// genre, year, language, search; `--top` and `--recent` rank instead.
    List {
        #[command(flatten)]
        data: DataArgs,

        #[arg(long)]
        genre: Option<String>,

        #[arg(long)]
        year: Option<i32>,

        #[arg(long)]
        language: Option<String>,

        /// Case-insensitive match on title, director or genre
        #[arg(long)]
        search: Option<String>,

        /// Highest rated first, at most N
        #[arg(long, value_name = "N", conflicts_with = "recent")]
        top: Option<usize>,

        /// Newest first, at most N
        #[arg(long, value_name = "N")]
        recent: Option<usize>,
    },

    /// Fetch movies by id in one batch.
    Show {
        #[command(flatten)]
        data: DataArgs,

        #[arg(required = true)]
        ids: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init_logging(logging::LoggingConfig {
        json_format: cli.log_json,
        default_level: match cli.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        },
    });

    match cli.command {
        Commands::Serve {
            data,
            mut listen,
            port,
            max_batch_size,
            batch_delay_ms,
            ready_file,
            admin_email,
            admin_password,
            session_ttl_mins,
        } => {
            if let Some(port) = port {
                listen.set_port(port);
            }
            server::cmd_serve(server::ServerConfig {
                listen,
                data_path: data.data,
                loader: LoaderConfig {
                    max_batch_size,
                    delay: server::batch_delay(batch_delay_ms),
                },
                ready_file,
                admin: admin_email.zip(admin_password),
                session_ttl: Duration::from_secs(session_ttl_mins * 60),
            })
        }
        Commands::Seed { data, force } => cmd_seed(&data, force),
        Commands::List {
            data,
            genre,
            year,
            language,
            search,
            top,
            recent,
        } => {
            let store = data.store();
            let movies = if let Some(genre) = genre {
                store.by_genre(&genre)?
            } else if let Some(year) = year {
                store.by_year(year)?
            } else if let Some(language) = language {
                store.by_language(&language)?
            } else if let Some(query) = search {
                store.search(&query)?
            } else if top.is_some() {
                store.top_rated(top)?
            } else if recent.is_some() {
                store.recent(recent)?
            } else {
                store.all()?
            };

            if movies.is_empty() {
                println!("{}", "No movies.".dimmed());
            }
            for movie in &movies {
                print_movie(movie);
            }
            Ok(())
        }
        Commands::Show { data, ids } => cmd_show(&data, ids),
    }
}

fn cmd_seed(data: &DataArgs, force: bool) -> Result<()> {
    let store = data.store();
    let existing = store.all()?;
    if !existing.is_empty() && !force {
        return Err(anyhow!(
            "{} already holds {} movie(s); pass --force to replace them",
            data.data.display(),
            existing.len()
        ));
    }

    let movies = sample::sample_movies();
    store.seed(&movies)?;
    println!(
        "{} Seeded {} movies into {}",
        "✓".green(),
        movies.len(),
        data.data.display()
    );
    Ok(())
}

fn cmd_show(data: &DataArgs, ids: Vec<String>) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow!("failed to initialize tokio runtime: {e}"))?;

    let loader = Loader::new(data.store());
    let results = rt.block_on(loader.load_many(ids.clone()))?;

    for (id, movie) in ids.iter().zip(&results) {
        match movie {
            Some(movie) => print_movie(movie),
            None => println!("{} {}", id.bold(), "not found".red()),
        }
    }

    let stats = loader.stats();
    tracing::info!(
        requested = stats.loads,
        distinct = stats.keys,
        batches = stats.batches,
        "show finished"
    );
    Ok(())
}

fn print_movie(movie: &Movie) {
    println!(
        "{} {} ({}) {} {}",
        format!("[{}]", movie.id).bold(),
        movie.title.cyan(),
        movie.release_year,
        movie.director.dimmed(),
        format!("★ {:.1}", movie.rating).yellow()
    );
    println!(
        "    {} · {} min · {} · {} review(s)",
        movie.genre,
        movie.duration,
        movie.language.as_deref().unwrap_or("--"),
        movie.reviews.len()
    );
}
